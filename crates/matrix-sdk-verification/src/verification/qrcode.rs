// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use eyeball::SharedObservable;
use futures_core::Stream;
use ruma::{OwnedDeviceId, OwnedUserId, RoomId, UserId};
use tracing::{debug, error, instrument, trace};

use super::{CancelCode, CancelInfo, FlowId};
use crate::{
    engine::{deliver_confirmation, CryptoEngine, FlowInfo},
    error::{VerificationError, VerificationResult},
};

/// An Enum describing the state the QR code verification is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrVerificationState {
    /// No update from the crypto engine arrived yet, or we are the side that
    /// needs to scan a QR code.
    Unknown,
    /// We are showing our QR code and wait for the other side to scan it.
    WaitingOtherConfirm,
    /// The other side scanned our QR code, the user needs to confirm that
    /// this happened.
    QrScannedByOther,
    /// The verification finished successfully.
    Verified,
    /// The other side cancelled the verification.
    Cancelled,
    /// We cancelled the verification.
    CancelledByMe,
}

impl QrVerificationState {
    /// Is this a state the flow will never leave again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Cancelled | Self::CancelledByMe)
    }
}

/// Progress of a QR code verification as reported by the crypto engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrUpdate {
    /// The QR code flow was created.
    Started,
    /// The other side scanned our QR code.
    Scanned,
    /// We scanned the QR code of the other side and sent out the
    /// reciprocation.
    Reciprocated,
    /// The verification finished successfully.
    Done,
    /// The verification was cancelled.
    Cancelled(CancelInfo),
}

#[derive(Debug)]
pub(crate) struct QrIds {
    pub flow_id: FlowId,
    pub other_user_id: OwnedUserId,
    pub we_started: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct QrDetails {
    other_device_id: Option<OwnedDeviceId>,
    cancel_info: Option<CancelInfo>,
}

/// An object controlling QR code style key verification flows.
#[derive(Clone, Debug)]
pub struct QrVerification {
    engine: Arc<dyn CryptoEngine>,
    ids: Arc<QrIds>,
    details: SharedObservable<QrDetails>,
    state: SharedObservable<QrVerificationState>,
}

impl QrVerification {
    pub(crate) fn new(engine: Arc<dyn CryptoEngine>, info: FlowInfo) -> Self {
        let ids = QrIds {
            flow_id: info.flow_id,
            other_user_id: info.other_user_id,
            we_started: info.we_started,
        };

        Self::with_ids(engine, ids, Some(info.other_device_id))
    }

    /// Create a QR code flow the crypto engine doesn't know about yet.
    ///
    /// Used when we can't show a QR code to the other side but might still
    /// scan theirs.
    pub(crate) fn with_ids(
        engine: Arc<dyn CryptoEngine>,
        ids: QrIds,
        other_device_id: Option<OwnedDeviceId>,
    ) -> Self {
        let state = if ids.we_started {
            QrVerificationState::WaitingOtherConfirm
        } else {
            QrVerificationState::Unknown
        };

        Self {
            engine,
            ids: ids.into(),
            details: SharedObservable::new(QrDetails { other_device_id, cancel_info: None }),
            state: SharedObservable::new(state),
        }
    }

    /// Get the unique ID that identifies this QR code verification flow.
    pub fn flow_id(&self) -> &FlowId {
        &self.ids.flow_id
    }

    /// The room of the flow, `None` if the flow uses to-device messages.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.ids.flow_id.room_id()
    }

    /// Get the user id of the other user that is participating in this
    /// verification flow.
    pub fn other_user_id(&self) -> &UserId {
        &self.ids.other_user_id
    }

    /// Get the device ID of the other side, `None` if it's not yet known.
    pub fn other_device_id(&self) -> Option<OwnedDeviceId> {
        self.details.get().other_device_id
    }

    /// Did we initiate the verification flow.
    pub fn we_started(&self) -> bool {
        self.ids.we_started
    }

    /// Get the current state of the verification.
    pub fn state(&self) -> QrVerificationState {
        self.state.get()
    }

    /// Listen for changes in the QR code verification process.
    pub fn changes(&self) -> impl Stream<Item = QrVerificationState> {
        self.state.subscribe()
    }

    /// Is the QR code verification done.
    pub fn is_done(&self) -> bool {
        self.state() == QrVerificationState::Verified
    }

    /// Has the verification flow been cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.state(),
            QrVerificationState::Cancelled | QrVerificationState::CancelledByMe
        )
    }

    /// Get info about the cancellation if the verification flow has been
    /// cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        self.details.get().cancel_info
    }

    /// Get the encoded QR code that should be shown to the other side.
    ///
    /// Returns `None` if the crypto engine can't produce a QR code for this
    /// flow, e.g. because we're the side that needs to scan.
    pub fn qr_code_data(&self) -> Option<Vec<u8>> {
        let data = self.engine.generate_qr_code(self.other_user_id(), self.flow_id().as_str());

        if data.is_none() {
            error!(flow_id = self.flow_id().as_str(), "Cannot generate the QR code");
        }

        data
    }

    /// Tell the crypto engine that we scanned the QR code of the other side.
    ///
    /// On success the reciprocation is sent out and the flow continues with
    /// the device the QR code belongs to.
    #[instrument(skip_all, fields(flow_id = self.flow_id().as_str()))]
    pub async fn user_scanned_other_code(&self, data: &[u8]) {
        let Some(result) =
            self.engine.scan_qr_code(self.other_user_id(), self.flow_id().as_str(), data)
        else {
            error!("Failed scanning the QR code");
            return;
        };

        match self.engine.send_outgoing_request(result.request).await {
            Ok(()) => {
                debug!("Scanned the QR code of the other side");

                let mut details = self.details.get();
                details.other_device_id = Some(result.qr.other_device_id);
                self.details.set(details);
            }
            Err(e) => error!(error = ?e, "Failed scanning the QR code"),
        }
    }

    /// Tell the crypto engine whether the other side scanned our QR code.
    ///
    /// A confirmation sends out the verification messages and signatures, a
    /// denial cancels the flow because the keys didn't match.
    #[instrument(skip_all, fields(flow_id = self.flow_id().as_str()))]
    pub async fn other_user_scanned_my_code(&self, scanned: bool) {
        if !scanned {
            debug!("Cancelling due to mismatched keys");
            self.cancel(CancelCode::KeyMismatch).await;
            return;
        }

        let flow_id = self.flow_id().as_str();

        let result = match self.engine.confirm_verification(self.other_user_id(), flow_id).await {
            Ok(Some(result)) => result,
            Ok(None) => {
                error!("Failed confirming the QR code");
                return;
            }
            Err(e) => {
                error!(error = ?e, "Failed confirming the QR code");
                return;
            }
        };

        match deliver_confirmation(self.engine.as_ref(), result).await {
            Ok(()) => debug!("Verification confirmed"),
            Err(e) => error!(error = ?e, "Failed sending out the QR code confirmation"),
        }
    }

    /// Cancel the verification, failures are only logged.
    pub async fn cancel(&self, code: CancelCode) {
        if let Err(e) = self.cancel_with_result(code).await {
            let flow_id = self.flow_id().as_str();
            error!(flow_id, error = ?e, "Cannot cancel the QR code verification");
        }
    }

    /// Cancel the verification flow.
    #[instrument(skip_all, fields(flow_id = self.flow_id().as_str(), code = code.as_str()))]
    pub async fn cancel_with_result(&self, code: CancelCode) -> VerificationResult<()> {
        if self.state().is_terminal() {
            return Err(VerificationError::CannotCancel);
        }

        let request = self
            .engine
            .cancel_verification(self.other_user_id(), self.flow_id().as_str(), &code)
            .ok_or(VerificationError::CannotCancel)?;

        self.engine.send_outgoing_request(request).await?;
        debug!("Cancelled the QR code verification");

        Ok(())
    }

    /// Apply an update coming from the crypto engine.
    ///
    /// Returns true if the state of the flow changed.
    pub(crate) fn apply_update(&self, update: QrUpdate) -> bool {
        let current = self.state();

        if current.is_terminal() {
            trace!(
                flow_id = self.flow_id().as_str(),
                state = ?current,
                ?update,
                "Ignoring an update for a finished QR code verification"
            );
            return false;
        }

        let new_state = match update {
            QrUpdate::Started | QrUpdate::Reciprocated => {
                if self.we_started() {
                    QrVerificationState::WaitingOtherConfirm
                } else {
                    current
                }
            }
            QrUpdate::Scanned => QrVerificationState::QrScannedByOther,
            QrUpdate::Done => QrVerificationState::Verified,
            QrUpdate::Cancelled(info) => {
                let new_state = if info.cancelled_by_us() {
                    QrVerificationState::CancelledByMe
                } else {
                    QrVerificationState::Cancelled
                };

                let mut details = self.details.get();
                details.cancel_info = Some(info);
                self.details.set(details);

                new_state
            }
        };

        self.state.set_if_not_eq(new_state).is_some()
    }
}
