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

//! The crypto engine collaborator.
//!
//! The engine owns the Olm machine, it computes the short auth strings,
//! signs the verified keys, and knows which protocol message needs to be sent
//! next. This crate only drives it: every operation asks the engine for the
//! next outgoing message and hands that message back to the engine to be
//! sent out.
//!
//! The engine reports progress of a flow by calling the
//! `receive_*_update()` methods of the [`VerificationManager`].
//!
//! [`VerificationManager`]: crate::VerificationManager

use std::fmt::Debug;

use async_trait::async_trait;
use ruma::{
    events::key::verification::VerificationMethod, DeviceId, OwnedDeviceId, OwnedEventId,
    OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId, UserId,
};
use serde_json::Value;

use crate::{error::EngineError, CancelCode, CancelInfo, FlowId};

/// A verification message that needs to be sent out to the other side of a
/// flow.
#[derive(Clone, Debug, PartialEq)]
pub enum OutgoingVerificationRequest {
    /// The message needs to be sent out as a to-device message.
    ToDevice {
        /// The unique ID of the request.
        request_id: OwnedTransactionId,
        /// The type of the event, e.g. `m.key.verification.ready`.
        event_type: String,
        /// The JSON body of the `/sendToDevice` request.
        body: Value,
    },
    /// The message needs to be sent out as a room message.
    InRoom {
        /// The unique ID of the request.
        request_id: OwnedTransactionId,
        /// The room the message should be sent to.
        room_id: OwnedRoomId,
        /// The type of the event, e.g. `m.key.verification.ready`.
        event_type: String,
        /// The JSON content of the room message.
        content: Value,
    },
}

impl OutgoingVerificationRequest {
    /// The unique ID of the request.
    pub fn request_id(&self) -> &TransactionId {
        match self {
            Self::ToDevice { request_id, .. } | Self::InRoom { request_id, .. } => request_id,
        }
    }

    /// The type of the event this request is sending out.
    pub fn event_type(&self) -> &str {
        match self {
            Self::ToDevice { event_type, .. } | Self::InRoom { event_type, .. } => event_type,
        }
    }

    /// The room this request is sending the message to, `None` for to-device
    /// messages.
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::ToDevice { .. } => None,
            Self::InRoom { room_id, .. } => Some(room_id),
        }
    }
}

/// A request to upload the signatures that were created after a successful
/// verification.
#[derive(Clone, Debug, PartialEq)]
pub struct SignatureUploadRequest {
    /// The JSON body of the `/keys/signatures/upload` request.
    pub body: Value,
}

/// What the crypto engine knows about a verification request.
#[derive(Clone, Debug, PartialEq)]
pub struct VerificationRequestInfo {
    /// The flow id of the request.
    pub flow_id: FlowId,
    /// The user we are verifying with.
    pub other_user_id: OwnedUserId,
    /// The device of the other user, `None` until the other side answered a
    /// request we sent out.
    pub other_device_id: Option<OwnedDeviceId>,
    /// Did we send out the request.
    pub we_started: bool,
    /// The methods the other side advertised, once known.
    pub their_methods: Option<Vec<VerificationMethod>>,
    /// The methods we advertised, once known.
    pub our_methods: Option<Vec<VerificationMethod>>,
    /// Did the verification flow of the request finish successfully.
    pub is_done: bool,
    /// Why the request was cancelled, `None` while it wasn't.
    pub cancel_info: Option<CancelInfo>,
}

/// What the crypto engine knows about a concrete verification flow, SAS or
/// QR code.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowInfo {
    /// The flow id of the verification.
    pub flow_id: FlowId,
    /// The user we are verifying with.
    pub other_user_id: OwnedUserId,
    /// The device we are verifying with.
    pub other_device_id: OwnedDeviceId,
    /// Did we start the flow.
    pub we_started: bool,
}

/// A concrete verification flow as known to the crypto engine.
#[derive(Clone, Debug, PartialEq)]
pub enum VerificationInfo {
    /// A SAS verification.
    Sas(FlowInfo),
    /// A QR code verification.
    Qr(FlowInfo),
}

/// The result of starting a SAS verification from a verification request.
#[derive(Clone, Debug)]
pub struct StartSasResult {
    /// The new SAS flow.
    pub sas: FlowInfo,
    /// The `m.key.verification.start` message that needs to be sent out.
    pub request: OutgoingVerificationRequest,
}

/// The result of scanning the QR code of the other side.
#[derive(Clone, Debug)]
pub struct ScanResult {
    /// The QR code flow that replaces any flow we started ourselves.
    pub qr: FlowInfo,
    /// The `m.key.verification.start` message that needs to be sent out.
    pub request: OutgoingVerificationRequest,
}

/// The result of requesting a new verification.
#[derive(Clone, Debug)]
pub struct RequestVerificationResult {
    /// The new verification request.
    pub verification: VerificationRequestInfo,
    /// The `m.key.verification.request` message that needs to be sent out,
    /// `None` if it was already sent, as is the case for in-room requests.
    pub request: Option<OutgoingVerificationRequest>,
}

/// The result of confirming that the short auth strings match, or that the
/// other side scanned our QR code.
#[derive(Clone, Debug, Default)]
pub struct ConfirmVerificationResult {
    /// Messages that need to be sent out to the other side, usually the
    /// `m.key.verification.mac` and `m.key.verification.done` messages.
    pub requests: Vec<OutgoingVerificationRequest>,
    /// Signatures of the newly verified keys that need to be uploaded.
    pub signature_request: Option<SignatureUploadRequest>,
}

/// Whom a new verification request should be sent to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationTarget {
    /// A specific device of a user, using to-device messages.
    Device {
        /// The owner of the device.
        user_id: OwnedUserId,
        /// The device to verify.
        device_id: OwnedDeviceId,
    },
    /// All of our own other devices, using to-device messages.
    OwnDevices,
    /// Another user through a direct message room.
    ///
    /// The `m.key.verification.request` room message was already sent out,
    /// its event id becomes the flow id.
    Room {
        /// The user to verify.
        user_id: OwnedUserId,
        /// The direct message room.
        room_id: OwnedRoomId,
        /// The event id of the request message.
        event_id: OwnedEventId,
    },
}

/// The cryptographic engine that produces and consumes the verification
/// protocol messages.
#[async_trait]
pub trait CryptoEngine: Debug + Send + Sync {
    /// Our own user id.
    fn user_id(&self) -> &UserId;

    /// Our own device id.
    fn device_id(&self) -> &DeviceId;

    /// Look up a verification request.
    fn get_verification_request(
        &self,
        user_id: &UserId,
        flow_id: &str,
    ) -> Option<VerificationRequestInfo>;

    /// Look up a SAS or QR code verification.
    fn get_verification(&self, user_id: &UserId, flow_id: &str) -> Option<VerificationInfo>;

    /// Create an `m.key.verification.ready` message for the given request,
    /// `None` if the request can't be accepted.
    fn accept_verification_request(
        &self,
        user_id: &UserId,
        flow_id: &str,
        methods: &[VerificationMethod],
    ) -> Option<OutgoingVerificationRequest>;

    /// Create an `m.key.verification.cancel` message for the given flow,
    /// `None` if the flow can't be cancelled anymore.
    fn cancel_verification(
        &self,
        user_id: &UserId,
        flow_id: &str,
        code: &CancelCode,
    ) -> Option<OutgoingVerificationRequest>;

    /// Create an `m.key.verification.accept` message for an incoming SAS
    /// flow.
    fn accept_sas_verification(
        &self,
        user_id: &UserId,
        flow_id: &str,
    ) -> Option<OutgoingVerificationRequest>;

    /// Transition a ready verification request into a SAS flow.
    fn start_sas_verification(&self, user_id: &UserId, flow_id: &str) -> Option<StartSasResult>;

    /// Transition a ready verification request into a QR code flow.
    fn start_qr_verification(&self, user_id: &UserId, flow_id: &str) -> Option<FlowInfo>;

    /// Reciprocate a QR code we scanned from the other side, `None` if the
    /// data isn't a valid QR code for the given flow.
    fn scan_qr_code(&self, user_id: &UserId, flow_id: &str, data: &[u8]) -> Option<ScanResult>;

    /// Encode the QR code of the given flow into bytes.
    fn generate_qr_code(&self, user_id: &UserId, flow_id: &str) -> Option<Vec<u8>>;

    /// Confirm that the short auth strings match, or that the other side
    /// scanned our QR code.
    async fn confirm_verification(
        &self,
        user_id: &UserId,
        flow_id: &str,
    ) -> Result<Option<ConfirmVerificationResult>, EngineError>;

    /// Create a new verification request.
    async fn request_verification(
        &self,
        target: &VerificationTarget,
        methods: &[VerificationMethod],
    ) -> Result<Option<RequestVerificationResult>, EngineError>;

    /// Send out a verification message.
    async fn send_outgoing_request(
        &self,
        request: OutgoingVerificationRequest,
    ) -> Result<(), EngineError>;

    /// Upload signatures created by a successful verification.
    async fn upload_signatures(&self, request: SignatureUploadRequest) -> Result<(), EngineError>;
}

/// Send out everything a successful confirmation produced, the verification
/// messages first and the signatures of the newly verified keys last.
pub(crate) async fn deliver_confirmation(
    engine: &dyn CryptoEngine,
    result: ConfirmVerificationResult,
) -> Result<(), EngineError> {
    for request in result.requests {
        engine.send_outgoing_request(request).await?;
    }

    if let Some(signature_request) = result.signature_request {
        engine.upload_signatures(signature_request).await?;
    }

    Ok(())
}
