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
use ruma::{
    events::key::verification::VerificationMethod, OwnedDeviceId, OwnedUserId, RoomId, UserId,
};
use tracing::{debug, instrument, trace, warn};

use super::{qrcode::QrVerification, sas::SasVerification, CancelCode, CancelInfo, FlowId};
use crate::{
    engine::{CryptoEngine, VerificationRequestInfo},
    error::{VerificationError, VerificationResult},
};

/// An enum describing the different states a verification request can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationRequestState {
    /// The request was sent out or received, nobody answered it yet.
    Pending,
    /// Both sides agreed on the methods that can be used, a concrete
    /// verification flow can be started.
    Ready,
    /// The verification flow that was started from this request finished
    /// successfully.
    Accepted,
    /// The other side cancelled the request.
    Cancelled,
    /// We cancelled the request.
    CancelledByMe,
    /// Nobody answered the request before it timed out.
    Expired,
}

impl VerificationRequestState {
    /// Is this a state the request will never leave again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Cancelled | Self::CancelledByMe | Self::Expired)
    }

    /// The state a request in the `current` state moves to when it gets
    /// cancelled.
    fn cancelled(info: &CancelInfo, current: Self) -> Self {
        if *info.cancel_code() == CancelCode::Timeout && current == Self::Pending {
            Self::Expired
        } else if info.cancelled_by_us() {
            Self::CancelledByMe
        } else {
            Self::Cancelled
        }
    }
}

/// Progress of a verification request as reported by the crypto engine.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationRequestUpdate {
    /// The request was sent out or received.
    Requested,
    /// The request was accepted by one of the sides.
    Ready {
        /// The methods the other side supports.
        their_methods: Vec<VerificationMethod>,
        /// The methods we support.
        our_methods: Vec<VerificationMethod>,
        /// The device that accepted, or sent, the request.
        other_device_id: Option<OwnedDeviceId>,
    },
    /// The verification flow finished successfully.
    Done,
    /// The request was cancelled.
    Cancelled(CancelInfo),
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Negotiation {
    other_device_id: Option<OwnedDeviceId>,
    their_methods: Option<Vec<VerificationMethod>>,
    our_methods: Option<Vec<VerificationMethod>>,
    cancel_info: Option<CancelInfo>,
}

#[derive(Debug)]
struct RequestIds {
    flow_id: FlowId,
    own_user_id: OwnedUserId,
    other_user_id: OwnedUserId,
    we_started: bool,
    supported_methods: Vec<VerificationMethod>,
}

/// An object controlling key verification requests.
///
/// Interactive verification flows usually start with a verification request,
/// this object lets you accept or cancel the request, and once both sides
/// agreed on the methods, start a concrete SAS or QR code flow.
///
/// The state of the request is only ever changed by the crypto engine, the
/// operations of this object merely produce and send out protocol messages.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    engine: Arc<dyn CryptoEngine>,
    ids: Arc<RequestIds>,
    negotiation: SharedObservable<Negotiation>,
    state: SharedObservable<VerificationRequestState>,
}

impl VerificationRequest {
    pub(crate) fn new(
        engine: Arc<dyn CryptoEngine>,
        info: VerificationRequestInfo,
        supported_methods: Vec<VerificationMethod>,
    ) -> Self {
        let negotiated = if info.their_methods.is_some() && info.our_methods.is_some() {
            VerificationRequestState::Ready
        } else {
            VerificationRequestState::Pending
        };

        // The engine may still know about requests that finished a while ago.
        let state = if info.is_done {
            VerificationRequestState::Accepted
        } else if let Some(cancel_info) = &info.cancel_info {
            VerificationRequestState::cancelled(cancel_info, negotiated)
        } else {
            negotiated
        };

        let ids = RequestIds {
            flow_id: info.flow_id,
            own_user_id: engine.user_id().to_owned(),
            other_user_id: info.other_user_id,
            we_started: info.we_started,
            supported_methods,
        };

        let negotiation = Negotiation {
            other_device_id: info.other_device_id,
            their_methods: info.their_methods,
            our_methods: info.our_methods,
            cancel_info: info.cancel_info,
        };

        Self {
            engine,
            ids: ids.into(),
            negotiation: SharedObservable::new(negotiation),
            state: SharedObservable::new(state),
        }
    }

    /// Get the unique ID of this verification request.
    pub fn flow_id(&self) -> &FlowId {
        &self.ids.flow_id
    }

    /// The room this request lives in, `None` for to-device requests.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.ids.flow_id.room_id()
    }

    /// Our own user id.
    pub fn own_user_id(&self) -> &UserId {
        &self.ids.own_user_id
    }

    /// The id of the other user that is participating in this verification
    /// request.
    pub fn other_user(&self) -> &UserId {
        &self.ids.other_user_id
    }

    /// The id of the other device that is participating in this verification.
    ///
    /// `None` until the other side answered a request we sent out.
    pub fn other_device_id(&self) -> Option<OwnedDeviceId> {
        self.negotiation.get().other_device_id
    }

    /// Did we initiate the verification request.
    pub fn we_started(&self) -> bool {
        self.ids.we_started
    }

    /// Is this a verification that is verifying one of our own devices.
    pub fn is_self_verification(&self) -> bool {
        self.ids.own_user_id == self.ids.other_user_id
    }

    /// Get the supported verification methods of the other side.
    pub fn their_supported_methods(&self) -> Option<Vec<VerificationMethod>> {
        self.negotiation.get().their_methods
    }

    /// Get our own supported verification methods that we advertised.
    pub fn our_supported_methods(&self) -> Option<Vec<VerificationMethod>> {
        self.negotiation.get().our_methods
    }

    /// The methods advertised by whoever sent the request.
    pub fn methods(&self) -> Vec<VerificationMethod> {
        let methods = if self.we_started() {
            self.our_supported_methods()
        } else {
            self.their_supported_methods()
        };

        methods.unwrap_or_default()
    }

    /// Get info about the cancellation if the verification request has been
    /// cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        self.negotiation.get().cancel_info
    }

    /// Get the current state of the request.
    pub fn state(&self) -> VerificationRequestState {
        self.state.get()
    }

    /// Listen for changes in the verification request.
    ///
    /// The stream yields a new value only when the state actually changes.
    pub fn changes(&self) -> impl Stream<Item = VerificationRequestState> {
        self.state.subscribe()
    }

    /// Has the verification flow that was started with this request finished.
    pub fn is_done(&self) -> bool {
        self.state() == VerificationRequestState::Accepted
    }

    /// Has the verification request been cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.state(),
            VerificationRequestState::Cancelled | VerificationRequestState::CancelledByMe
        )
    }

    /// Accept the verification request, advertising the default set of
    /// methods.
    pub async fn accept(&self) -> VerificationResult<()> {
        self.accept_with_methods(self.ids.supported_methods.clone()).await
    }

    /// Accept the verification request signaling that our client supports the
    /// given verification methods.
    ///
    /// The state of the request doesn't change until the crypto engine
    /// reports that the `m.key.verification.ready` message went out.
    #[instrument(skip_all, fields(flow_id = self.flow_id().as_str()))]
    pub async fn accept_with_methods(
        &self,
        methods: Vec<VerificationMethod>,
    ) -> VerificationResult<()> {
        if self.state().is_terminal() {
            warn!(state = ?self.state(), "Can't accept a verification request that is finished");
            return Err(VerificationError::CannotAccept);
        }

        let request = self
            .engine
            .accept_verification_request(self.other_user(), self.flow_id().as_str(), &methods)
            .ok_or(VerificationError::CannotAccept)?;

        self.engine.send_outgoing_request(request).await?;
        debug!("Accepted the verification request");

        Ok(())
    }

    /// Cancel the verification request.
    #[instrument(skip_all, fields(flow_id = self.flow_id().as_str(), code = code.as_str()))]
    pub async fn cancel(&self, code: CancelCode) -> VerificationResult<()> {
        if self.state().is_terminal() {
            warn!(state = ?self.state(), "Can't cancel a verification request that is finished");
            return Err(VerificationError::CannotCancel);
        }

        let request = self
            .engine
            .cancel_verification(self.other_user(), self.flow_id().as_str(), &code)
            .ok_or(VerificationError::CannotCancel)?;

        self.engine.send_outgoing_request(request).await?;
        debug!("Cancelled the verification request");

        Ok(())
    }

    /// Transition from this verification request into a SAS verification flow.
    ///
    /// Both sides need to have agreed on the methods first, the crypto engine
    /// refuses to start the flow otherwise.
    #[instrument(skip_all, fields(flow_id = self.flow_id().as_str()))]
    pub async fn start_sas(&self) -> VerificationResult<SasVerification> {
        let result = self
            .engine
            .start_sas_verification(self.other_user(), self.flow_id().as_str())
            .ok_or(VerificationError::CannotStartSasVerification)?;

        self.engine.send_outgoing_request(result.request).await?;
        debug!("Started a new SAS verification");

        Ok(SasVerification::new(self.engine.clone(), result.sas))
    }

    /// Generate a QR code that can be used by another client to start a QR code
    /// based verification.
    #[instrument(skip_all, fields(flow_id = self.flow_id().as_str()))]
    pub fn start_qr(&self) -> VerificationResult<QrVerification> {
        let qr = self
            .engine
            .start_qr_verification(self.other_user(), self.flow_id().as_str())
            .ok_or(VerificationError::CannotStartQrVerification)?;

        debug!("Started a new QR code verification");

        Ok(QrVerification::new(self.engine.clone(), qr))
    }

    /// Apply an update coming from the crypto engine.
    ///
    /// Returns true if the state of the request changed.
    pub(crate) fn apply_update(&self, update: VerificationRequestUpdate) -> bool {
        let current = self.state();

        if current.is_terminal() {
            trace!(
                flow_id = self.flow_id().as_str(),
                state = ?current,
                ?update,
                "Ignoring an update for a finished verification request"
            );
            return false;
        }

        let new_state = match update {
            VerificationRequestUpdate::Requested => VerificationRequestState::Pending,
            VerificationRequestUpdate::Ready { their_methods, our_methods, other_device_id } => {
                let mut negotiation = self.negotiation.get();
                negotiation.their_methods = Some(their_methods);
                negotiation.our_methods = Some(our_methods);

                if other_device_id.is_some() {
                    negotiation.other_device_id = other_device_id;
                }

                self.negotiation.set(negotiation);

                VerificationRequestState::Ready
            }
            VerificationRequestUpdate::Done => VerificationRequestState::Accepted,
            VerificationRequestUpdate::Cancelled(info) => {
                let new_state = VerificationRequestState::cancelled(&info, current);

                let mut negotiation = self.negotiation.get();
                negotiation.cancel_info = Some(info);
                self.negotiation.set(negotiation);

                new_state
            }
        };

        let changed = self.state.set_if_not_eq(new_state).is_some();

        if changed {
            trace!(
                flow_id = self.flow_id().as_str(),
                from = ?current,
                to = ?new_state,
                "Verification request changed state"
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
    use ruma::{events::key::verification::VerificationMethod, TransactionId};
    use stream_assert::{assert_pending, assert_ready};

    use super::{VerificationRequest, VerificationRequestState, VerificationRequestUpdate};
    use crate::{
        engine::{
            testing::{bob_device_id, bob_id, MockEngine},
            VerificationRequestInfo,
        },
        error::{EngineError, VerificationError},
        CancelCode, CancelInfo, FlowId,
    };

    fn request_with(engine: &MockEngine, we_started: bool) -> VerificationRequest {
        let info = VerificationRequestInfo {
            flow_id: FlowId::ToDevice(TransactionId::new()),
            other_user_id: bob_id().to_owned(),
            other_device_id: Some(bob_device_id().to_owned()),
            we_started,
            their_methods: (!we_started).then(|| vec![VerificationMethod::SasV1]),
            our_methods: we_started.then(|| vec![VerificationMethod::SasV1]),
            is_done: false,
            cancel_info: None,
        };

        VerificationRequest::new(
            Arc::new(engine.clone()),
            info,
            vec![VerificationMethod::SasV1, VerificationMethod::QrCodeShowV1],
        )
    }

    fn ready() -> VerificationRequestUpdate {
        VerificationRequestUpdate::Ready {
            their_methods: vec![VerificationMethod::SasV1],
            our_methods: vec![VerificationMethod::SasV1, VerificationMethod::QrCodeShowV1],
            other_device_id: None,
        }
    }

    #[test]
    fn test_engine_updates_drive_the_state() {
        let request = request_with(&MockEngine::new(), false);
        assert_eq!(request.state(), VerificationRequestState::Pending);

        assert!(request.apply_update(ready()));
        assert_eq!(request.state(), VerificationRequestState::Ready);
        assert_eq!(
            request.our_supported_methods(),
            Some(vec![VerificationMethod::SasV1, VerificationMethod::QrCodeShowV1])
        );
        assert_eq!(request.methods(), vec![VerificationMethod::SasV1]);

        assert!(request.apply_update(VerificationRequestUpdate::Done));
        assert_eq!(request.state(), VerificationRequestState::Accepted);
        assert!(request.is_done());
    }

    #[test]
    fn test_cancellations_are_attributed() {
        let request = request_with(&MockEngine::new(), false);
        request.apply_update(ready());
        request.apply_update(VerificationRequestUpdate::Cancelled(CancelInfo::from_code(
            CancelCode::User,
            true,
        )));
        assert_eq!(request.state(), VerificationRequestState::CancelledByMe);
        assert!(request.is_cancelled());

        let request = request_with(&MockEngine::new(), false);
        request.apply_update(VerificationRequestUpdate::Cancelled(CancelInfo::from_code(
            CancelCode::KeyMismatch,
            false,
        )));
        assert_eq!(request.state(), VerificationRequestState::Cancelled);

        let info = request.cancel_info().unwrap();
        assert_eq!(info.cancel_code(), &CancelCode::KeyMismatch);
        assert!(!info.cancelled_by_us());
    }

    #[test]
    fn test_pending_request_times_out() {
        let request = request_with(&MockEngine::new(), true);
        request.apply_update(VerificationRequestUpdate::Cancelled(CancelInfo::from_code(
            CancelCode::Timeout,
            false,
        )));

        assert_eq!(request.state(), VerificationRequestState::Expired);
    }

    #[test]
    fn test_terminal_state_ignores_updates() {
        let request = request_with(&MockEngine::new(), true);
        request.apply_update(VerificationRequestUpdate::Done);

        assert!(!request.apply_update(VerificationRequestUpdate::Requested));
        assert!(!request.apply_update(VerificationRequestUpdate::Cancelled(
            CancelInfo::from_code(CancelCode::User, false)
        )));
        assert_eq!(request.state(), VerificationRequestState::Accepted);
        assert!(request.cancel_info().is_none());
    }

    #[test]
    fn test_finished_requests_are_restored_as_finished() {
        let engine: Arc<MockEngine> = Arc::new(MockEngine::new());
        let info = VerificationRequestInfo {
            flow_id: FlowId::ToDevice(TransactionId::new()),
            other_user_id: bob_id().to_owned(),
            other_device_id: Some(bob_device_id().to_owned()),
            we_started: false,
            their_methods: Some(vec![VerificationMethod::SasV1]),
            our_methods: Some(vec![VerificationMethod::SasV1]),
            is_done: false,
            cancel_info: Some(CancelInfo::from_code(CancelCode::User, true)),
        };

        let cancelled = VerificationRequest::new(engine.clone(), info.clone(), vec![]);
        assert_eq!(cancelled.state(), VerificationRequestState::CancelledByMe);
        assert_eq!(cancelled.cancel_info().unwrap().cancel_code(), &CancelCode::User);
        assert!(!cancelled.apply_update(ready()));

        let expired = VerificationRequest::new(
            engine.clone(),
            VerificationRequestInfo {
                their_methods: None,
                cancel_info: Some(CancelInfo::from_code(CancelCode::Timeout, false)),
                ..info.clone()
            },
            vec![],
        );
        assert_eq!(expired.state(), VerificationRequestState::Expired);

        let done = VerificationRequest::new(
            engine,
            VerificationRequestInfo { is_done: true, cancel_info: None, ..info },
            vec![],
        );
        assert!(done.is_done());
        assert!(!done.apply_update(VerificationRequestUpdate::Requested));
    }

    #[tokio::test]
    async fn test_observers_are_notified_once_per_change() {
        let request = request_with(&MockEngine::new(), false);
        let stream = request.changes();
        pin_mut!(stream);

        assert_pending!(stream);

        assert!(!request.apply_update(VerificationRequestUpdate::Requested));
        assert_pending!(stream);

        assert!(request.apply_update(ready()));
        assert_eq!(assert_ready!(stream), VerificationRequestState::Ready);

        assert!(!request.apply_update(ready()));
        assert_pending!(stream);
    }

    #[tokio::test]
    async fn test_accepting_sends_the_ready_message() {
        let engine = MockEngine::new();
        let request = request_with(&engine, false);

        request.accept().await.unwrap();

        assert_eq!(engine.sent_event_types(), ["m.key.verification.ready"]);
        // Only the engine moves the request forward.
        assert_eq!(request.state(), VerificationRequestState::Pending);
    }

    #[tokio::test]
    async fn test_refused_operations_fail() {
        let engine = MockEngine::new();
        engine.refuse("accept");
        engine.refuse("cancel");
        let request = request_with(&engine, false);

        assert_matches!(request.accept().await, Err(VerificationError::CannotAccept));
        assert_matches!(
            request.cancel(CancelCode::User).await,
            Err(VerificationError::CannotCancel)
        );
        assert!(engine.sent().is_empty());
        assert_eq!(request.state(), VerificationRequestState::Pending);
    }

    #[tokio::test]
    async fn test_finished_requests_cant_be_accepted_or_cancelled() {
        let engine = MockEngine::new();
        let request = request_with(&engine, false);
        request.apply_update(VerificationRequestUpdate::Cancelled(CancelInfo::from_code(
            CancelCode::User,
            false,
        )));

        assert_matches!(request.accept().await, Err(VerificationError::CannotAccept));
        assert_matches!(
            request.cancel(CancelCode::User).await,
            Err(VerificationError::CannotCancel)
        );
        assert_eq!(engine.calls("accept"), 0);
        assert_eq!(engine.calls("cancel"), 0);
        assert_eq!(request.state(), VerificationRequestState::Cancelled);
    }

    #[tokio::test]
    async fn test_delivery_failures_keep_the_state() {
        let engine = MockEngine::new();
        engine.fail_sending();
        let request = request_with(&engine, false);
        request.apply_update(ready());

        assert_matches!(
            request.cancel(CancelCode::User).await,
            Err(VerificationError::Delivery(EngineError::Send(_)))
        );
        assert_eq!(request.state(), VerificationRequestState::Ready);
    }

    #[tokio::test]
    async fn test_starting_flows() {
        let engine = MockEngine::new();
        let request = request_with(&engine, true);
        request.apply_update(ready());

        let sas = request.start_sas().await.unwrap();
        assert_eq!(sas.flow_id().as_str(), request.flow_id().as_str());
        assert!(!sas.is_incoming());
        assert_eq!(engine.sent_event_types(), ["m.key.verification.start"]);

        let qr = request.start_qr().unwrap();
        assert_eq!(qr.flow_id().as_str(), request.flow_id().as_str());

        engine.refuse("start_sas");
        engine.refuse("start_qr");
        assert_matches!(
            request.start_sas().await,
            Err(VerificationError::CannotStartSasVerification)
        );
        assert_matches!(request.start_qr(), Err(VerificationError::CannotStartQrVerification));
    }
}
