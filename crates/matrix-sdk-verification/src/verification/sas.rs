// Copyright 2020 The Matrix.org Foundation C.I.C.
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
use ruma::{DeviceId, RoomId, UserId};
use tracing::{debug, error, instrument, trace};

use super::{
    emoji::{decimal_string, emojis_from_indices},
    CancelCode, CancelInfo, Emoji, FlowId,
};
use crate::{
    engine::{deliver_confirmation, ConfirmVerificationResult, CryptoEngine, FlowInfo},
    error::{VerificationError, VerificationResult},
};

/// An Enum describing the state the SAS verification is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasState {
    /// No update from the crypto engine arrived yet.
    Unknown,
    /// The other side started the verification, it's up to us to accept it.
    IncomingShowAccept,
    /// We started the verification and are waiting for the other side to
    /// accept it.
    OutgoingWaitForPartnerToAccept,
    /// The verification was accepted, we're waiting for the public key of the
    /// other side.
    WaitForPartnerKey,
    /// The keys were exchanged, the short auth strings can be presented to the
    /// user.
    ShowSas,
    /// We confirmed that the short auth strings match and are waiting for the
    /// other side to do the same.
    WaitForPartnerToConfirm,
    /// The verification finished successfully.
    Verified,
    /// The other side cancelled the verification.
    Cancelled,
    /// We cancelled the verification.
    CancelledByMe,
}

impl SasState {
    /// Is this a state the flow will never leave again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Cancelled | Self::CancelledByMe)
    }
}

/// Progress of a SAS verification as reported by the crypto engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SasUpdate {
    /// We sent out the `m.key.verification.start` message.
    Created,
    /// The other side sent us an `m.key.verification.start` message.
    Started,
    /// The verification was accepted.
    Accepted,
    /// Both sides exchanged their public keys, the short auth strings are
    /// known.
    KeysExchanged {
        /// The seven indices into the SAS emoji table.
        emoji_indices: Vec<u8>,
        /// The three decimal numbers of the decimal method.
        decimals: Vec<u16>,
    },
    /// We confirmed that the short auth strings match.
    Confirmed,
    /// Both sides confirmed the match, the verification is done.
    Done,
    /// The verification was cancelled.
    Cancelled(CancelInfo),
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ShortAuthStrings {
    emoji: Option<Vec<Emoji>>,
    decimals: Option<String>,
    cancel_info: Option<CancelInfo>,
}

/// Short authentication string object.
///
/// Drives a single SAS verification flow between two devices. The crypto
/// engine computes the short auth strings and reports the progress of the
/// flow, this object translates those reports into a [`SasState`] and
/// forwards the user's decisions back to the engine.
#[derive(Clone, Debug)]
pub struct SasVerification {
    engine: Arc<dyn CryptoEngine>,
    info: Arc<FlowInfo>,
    short_auth_strings: SharedObservable<ShortAuthStrings>,
    state: SharedObservable<SasState>,
}

impl SasVerification {
    pub(crate) fn new(engine: Arc<dyn CryptoEngine>, info: FlowInfo) -> Self {
        Self {
            engine,
            info: info.into(),
            short_auth_strings: Default::default(),
            state: SharedObservable::new(SasState::Unknown),
        }
    }

    /// Get the unique ID that identifies this SAS verification flow.
    pub fn flow_id(&self) -> &FlowId {
        &self.info.flow_id
    }

    /// The room of the flow, `None` if the flow uses to-device messages.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.info.flow_id.room_id()
    }

    /// Get the user id of the other side.
    pub fn other_user_id(&self) -> &UserId {
        &self.info.other_user_id
    }

    /// Get the device ID of the other side.
    pub fn other_device_id(&self) -> &DeviceId {
        &self.info.other_device_id
    }

    /// Was the verification started by the other side.
    pub fn is_incoming(&self) -> bool {
        !self.info.we_started
    }

    /// Get the current state of the verification.
    pub fn state(&self) -> SasState {
        self.state.get()
    }

    /// Listen for changes in the SAS verification.
    ///
    /// The stream yields a new value only when the state actually changes.
    pub fn changes(&self) -> impl Stream<Item = SasState> {
        self.state.subscribe()
    }

    /// Is the SAS flow done.
    pub fn is_done(&self) -> bool {
        self.state() == SasState::Verified
    }

    /// Is the SAS flow cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.state(), SasState::Cancelled | SasState::CancelledByMe)
    }

    /// Get info about the cancellation if the verification flow has been
    /// cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        self.short_auth_strings.get().cancel_info
    }

    /// Get the emoji version of the short auth string.
    ///
    /// `None` until the keys have been exchanged.
    pub fn emoji(&self) -> Option<Vec<Emoji>> {
        self.short_auth_strings.get().emoji
    }

    /// Get the decimal version of the short auth string, three numbers joined
    /// with spaces.
    ///
    /// `None` until the keys have been exchanged.
    pub fn decimals(&self) -> Option<String> {
        self.short_auth_strings.get().decimals
    }

    /// Accept the SAS verification.
    ///
    /// Failures are only logged, the state of the flow tells if the accept
    /// went through.
    #[instrument(skip_all, fields(flow_id = self.flow_id().as_str()))]
    pub async fn accept(&self) {
        let Some(request) =
            self.engine.accept_sas_verification(self.other_user_id(), self.flow_id().as_str())
        else {
            error!("Cannot accept the SAS verification");
            return;
        };

        match self.engine.send_outgoing_request(request).await {
            Ok(()) => debug!("Accepted the SAS verification"),
            Err(e) => error!(error = ?e, "Cannot accept the SAS verification"),
        }
    }

    /// Confirm the SAS verification.
    ///
    /// This confirms that the short auth strings match on both sides. The
    /// messages and signatures the confirmation produced are sent out and
    /// returned, failures are logged and result in `None`.
    #[instrument(skip_all, fields(flow_id = self.flow_id().as_str()))]
    pub async fn confirm_match(&self) -> Option<ConfirmVerificationResult> {
        let flow_id = self.flow_id().as_str();

        let result = match self.engine.confirm_verification(self.other_user_id(), flow_id).await {
            Ok(Some(result)) => result,
            Ok(None) => {
                error!("Cannot confirm the SAS verification");
                return None;
            }
            Err(e) => {
                error!(error = ?e, "Cannot confirm the SAS verification");
                return None;
            }
        };

        match deliver_confirmation(self.engine.as_ref(), result.clone()).await {
            Ok(()) => {
                debug!("Confirmed that the short auth strings match");
                Some(result)
            }
            Err(e) => {
                error!(error = ?e, "Cannot send out the SAS confirmation");
                None
            }
        }
    }

    /// Cancel the verification, failures are only logged.
    pub async fn cancel(&self, code: CancelCode) {
        if let Err(e) = self.cancel_with_result(code).await {
            let flow_id = self.flow_id().as_str();
            error!(flow_id, error = ?e, "Cannot cancel the SAS verification");
        }
    }

    /// Cancel the verification.
    ///
    /// Fails with [`VerificationError::CannotCancel`] if the crypto engine
    /// refuses to produce a cancellation, for example because the flow
    /// already finished.
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
        debug!("Cancelled the SAS verification");

        Ok(())
    }

    /// Apply an update coming from the crypto engine.
    ///
    /// Returns true if the state of the flow changed.
    pub(crate) fn apply_update(&self, update: SasUpdate) -> bool {
        let current = self.state();

        if current.is_terminal() {
            trace!(
                flow_id = self.flow_id().as_str(),
                state = ?current,
                ?update,
                "Ignoring an update for a finished SAS verification"
            );
            return false;
        }

        let new_state = match update {
            SasUpdate::Created => SasState::OutgoingWaitForPartnerToAccept,
            SasUpdate::Started => {
                // Only the side that didn't send the start message is told
                // that the flow started, the other side gets `Created`.
                if !self.is_incoming() {
                    error!(
                        flow_id = self.flow_id().as_str(),
                        "Received a start notification for a SAS verification we started"
                    );
                    return false;
                }

                SasState::IncomingShowAccept
            }
            SasUpdate::Accepted => SasState::WaitForPartnerKey,
            SasUpdate::KeysExchanged { emoji_indices, decimals } => {
                let mut strings = self.short_auth_strings.get();
                strings.emoji = Some(emojis_from_indices(&emoji_indices));
                strings.decimals = Some(decimal_string(&decimals));
                self.short_auth_strings.set(strings);

                SasState::ShowSas
            }
            SasUpdate::Confirmed => SasState::WaitForPartnerToConfirm,
            SasUpdate::Done => SasState::Verified,
            SasUpdate::Cancelled(info) => {
                let new_state = if info.cancelled_by_us() {
                    SasState::CancelledByMe
                } else {
                    SasState::Cancelled
                };

                let mut strings = self.short_auth_strings.get();
                strings.cancel_info = Some(info);
                self.short_auth_strings.set(strings);

                new_state
            }
        };

        let changed = self.state.set_if_not_eq(new_state).is_some();

        if changed {
            trace!(
                flow_id = self.flow_id().as_str(),
                from = ?current,
                to = ?new_state,
                "SAS verification changed state"
            );
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use futures_util::pin_mut;
    use stream_assert::{assert_pending, assert_ready};

    use super::{SasState, SasUpdate, SasVerification};
    use crate::{
        engine::{
            testing::{bob_device_id, bob_id, MockEngine},
            FlowInfo,
        },
        error::VerificationError,
        CancelCode, CancelInfo, FlowId,
    };

    fn sas(engine: &MockEngine, we_started: bool) -> SasVerification {
        let info = FlowInfo {
            flow_id: FlowId::ToDevice("sas-flow".into()),
            other_user_id: bob_id().to_owned(),
            other_device_id: bob_device_id().to_owned(),
            we_started,
        };

        SasVerification::new(Arc::new(engine.clone()), info)
    }

    fn keys_exchanged() -> SasUpdate {
        SasUpdate::KeysExchanged {
            emoji_indices: vec![0, 1, 2, 3, 4, 5, 63],
            decimals: vec![1, 3, 10],
        }
    }

    #[test]
    fn test_incoming_flow_walks_through_all_states() {
        let sas = sas(&MockEngine::new(), false);
        assert_eq!(sas.state(), SasState::Unknown);
        assert!(sas.emoji().is_none());

        sas.apply_update(SasUpdate::Started);
        assert_eq!(sas.state(), SasState::IncomingShowAccept);

        sas.apply_update(SasUpdate::Accepted);
        assert_eq!(sas.state(), SasState::WaitForPartnerKey);

        sas.apply_update(keys_exchanged());
        assert_eq!(sas.state(), SasState::ShowSas);

        let descriptions: Vec<_> =
            sas.emoji().unwrap().into_iter().map(|e| e.description).collect();
        assert_eq!(descriptions, ["Dog", "Cat", "Lion", "Horse", "Unicorn", "Pig", "Pin"]);
        assert_eq!(sas.decimals().as_deref(), Some("1 3 10"));

        sas.apply_update(SasUpdate::Confirmed);
        assert_eq!(sas.state(), SasState::WaitForPartnerToConfirm);

        sas.apply_update(SasUpdate::Done);
        assert_eq!(sas.state(), SasState::Verified);
        assert!(sas.is_done());
    }

    #[test]
    fn test_outgoing_flow_starts_by_waiting_for_the_partner() {
        let sas = sas(&MockEngine::new(), true);

        sas.apply_update(SasUpdate::Created);
        assert_eq!(sas.state(), SasState::OutgoingWaitForPartnerToAccept);

        assert!(!sas.apply_update(SasUpdate::Started));
        assert_eq!(sas.state(), SasState::OutgoingWaitForPartnerToAccept);
    }

    #[test]
    fn test_out_of_range_emoji_indices_are_dropped() {
        let sas = sas(&MockEngine::new(), false);
        sas.apply_update(SasUpdate::KeysExchanged {
            emoji_indices: vec![0, 64, 200, 1],
            decimals: vec![1000, 2000, 3000],
        });

        assert_eq!(sas.emoji().unwrap().len(), 2);
        assert_eq!(sas.decimals().as_deref(), Some("1000 2000 3000"));
    }

    #[test]
    fn test_cancellation_is_final() {
        let sas_with_engine = || sas(&MockEngine::new(), false);
        let sas = sas_with_engine();
        sas.apply_update(SasUpdate::Started);
        sas.apply_update(SasUpdate::Cancelled(CancelInfo::from_code(CancelCode::User, true)));

        assert_eq!(sas.state(), SasState::CancelledByMe);
        assert!(sas.is_cancelled());
        assert!(sas.cancel_info().unwrap().cancelled_by_us());

        assert!(!sas.apply_update(SasUpdate::Done));
        assert_eq!(sas.state(), SasState::CancelledByMe);

        let sas = sas_with_engine();
        sas.apply_update(SasUpdate::Cancelled(CancelInfo::from_code(
            CancelCode::MismatchedSas,
            false,
        )));
        assert_eq!(sas.state(), SasState::Cancelled);
    }

    #[tokio::test]
    async fn test_repeated_updates_do_not_notify() {
        let sas = sas(&MockEngine::new(), false);
        let stream = sas.changes();
        pin_mut!(stream);

        sas.apply_update(SasUpdate::Started);
        assert_eq!(assert_ready!(stream), SasState::IncomingShowAccept);

        sas.apply_update(SasUpdate::Started);
        assert_pending!(stream);
    }

    #[tokio::test]
    async fn test_accept_and_confirm_send_messages() {
        let engine = MockEngine::new();
        let sas = sas(&engine, false);

        sas.accept().await;
        let result = sas.confirm_match().await.unwrap();

        assert_eq!(result.requests.len(), 1);
        assert_eq!(
            engine.sent_event_types(),
            ["m.key.verification.accept", "m.key.verification.mac"]
        );
        assert_eq!(engine.uploaded_signatures(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed_by_fire_and_forget_operations() {
        let engine = MockEngine::new();
        engine.refuse("accept_sas");
        engine.refuse("confirm");
        engine.refuse("cancel");
        let sas = sas(&engine, false);
        sas.apply_update(SasUpdate::Started);

        sas.accept().await;
        assert!(sas.confirm_match().await.is_none());
        sas.cancel(CancelCode::User).await;

        assert!(engine.sent().is_empty());
        assert_eq!(sas.state(), SasState::IncomingShowAccept);

        assert_matches!(
            sas.cancel_with_result(CancelCode::User).await,
            Err(VerificationError::CannotCancel)
        );
    }

    #[tokio::test]
    async fn test_cancelling_a_finished_flow_fails() {
        let engine = MockEngine::new();
        let sas = sas(&engine, true);
        sas.apply_update(SasUpdate::Done);

        assert_matches!(
            sas.cancel_with_result(CancelCode::User).await,
            Err(VerificationError::CannotCancel)
        );
        assert_eq!(engine.calls("cancel"), 0);
        assert_eq!(sas.state(), SasState::Verified);
    }

    #[tokio::test]
    async fn test_cancel_sends_the_cancellation() {
        let engine = MockEngine::new();
        let sas = sas(&engine, true);

        sas.cancel_with_result(CancelCode::User).await.unwrap();
        assert_eq!(engine.sent_event_types(), ["m.key.verification.cancel"]);
    }
}
