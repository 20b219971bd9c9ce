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

pub(crate) mod emoji;
mod manager;
mod qrcode;
mod requests;
mod sas;
mod state_resolver;

use std::fmt;

pub use emoji::{decimal_string, emoji_from_index, emojis_from_indices, format_emojis};
pub use manager::{KeyVerification, VerificationManager, VerificationManagerUpdate};
pub use qrcode::{QrUpdate, QrVerification, QrVerificationState};
use ruma::{
    events::key::verification::cancel::CancelCode as RumaCancelCode, EventId, OwnedEventId,
    OwnedRoomId, OwnedTransactionId, RoomId, UserId,
};
pub use requests::{VerificationRequest, VerificationRequestState, VerificationRequestUpdate};
pub use sas::{SasState, SasUpdate, SasVerification};
use serde::{Deserialize, Serialize};
pub use state_resolver::{
    resolve_related_events, RelatedEvent, RelationsSource, VerificationState,
    VerificationStateResolver,
};

/// An emoji that is used for interactive verification using a short auth
/// string.
///
/// This will contain a single emoji and description from the list of emojis
/// from the [spec].
///
/// [spec]: https://spec.matrix.org/unstable/client-server-api/#sas-method-emoji
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd)]
pub struct Emoji {
    /// The emoji symbol that represents a part of the short auth string, for
    /// example: 🐶
    pub symbol: &'static str,
    /// The description of the emoji, for example 'Dog'.
    pub description: &'static str,
}

/// The machine readable code of an `m.key.verification.cancel` event.
///
/// Only the codes the protocol defines get their own variant, anything else
/// ends up in [`CancelCode::Other`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CancelCode {
    /// The user cancelled the verification.
    User,
    /// The verification process timed out.
    Timeout,
    /// The device does not know about the given transaction ID.
    UnknownTransaction,
    /// The device does not know how to handle the requested method.
    UnknownMethod,
    /// The device received an unexpected message.
    UnexpectedMessage,
    /// The key was not verified.
    KeyMismatch,
    /// The expected user did not match the user verified.
    UserMismatch,
    /// The message received was invalid.
    InvalidMessage,
    /// A request was accepted by a different device.
    Accepted,
    /// The hash commitment of the other side didn't match.
    MismatchedCommitment,
    /// The short auth strings didn't match.
    MismatchedSas,
    /// Any code this crate doesn't know about.
    Other(String),
}

impl CancelCode {
    /// The string token of the code as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            CancelCode::User => "m.user",
            CancelCode::Timeout => "m.timeout",
            CancelCode::UnknownTransaction => "m.unknown_transaction",
            CancelCode::UnknownMethod => "m.unknown_method",
            CancelCode::UnexpectedMessage => "m.unexpected_message",
            CancelCode::KeyMismatch => "m.key_mismatch",
            CancelCode::UserMismatch => "m.user_mismatch",
            CancelCode::InvalidMessage => "m.invalid_message",
            CancelCode::Accepted => "m.accepted",
            CancelCode::MismatchedCommitment => "m.mismatched_commitment",
            CancelCode::MismatchedSas => "m.mismatched_sas",
            CancelCode::Other(code) => code,
        }
    }

    fn default_reason(&self) -> &'static str {
        match self {
            CancelCode::Accepted => {
                "A m.key.verification.request was accepted by a different device."
            }
            CancelCode::InvalidMessage => "The received message was invalid.",
            CancelCode::KeyMismatch => "The expected key did not match the verified one",
            CancelCode::Timeout => "The verification process timed out.",
            CancelCode::UnexpectedMessage => "The device received an unexpected message.",
            CancelCode::UnknownMethod => {
                "The device does not know how to handle the requested method."
            }
            CancelCode::UnknownTransaction => {
                "The device does not know about the given transaction ID."
            }
            CancelCode::User => "The user cancelled the verification.",
            CancelCode::UserMismatch => "The expected user did not match the verified user",
            CancelCode::MismatchedCommitment => "The hash commitment did not match.",
            CancelCode::MismatchedSas => "The short authentication strings did not match.",
            CancelCode::Other(_) => "Unknown cancel reason",
        }
    }
}

impl From<&str> for CancelCode {
    fn from(code: &str) -> Self {
        match code {
            "m.user" => CancelCode::User,
            "m.timeout" => CancelCode::Timeout,
            "m.unknown_transaction" => CancelCode::UnknownTransaction,
            "m.unknown_method" => CancelCode::UnknownMethod,
            "m.unexpected_message" => CancelCode::UnexpectedMessage,
            "m.key_mismatch" => CancelCode::KeyMismatch,
            "m.user_mismatch" => CancelCode::UserMismatch,
            "m.invalid_message" => CancelCode::InvalidMessage,
            "m.accepted" => CancelCode::Accepted,
            "m.mismatched_commitment" => CancelCode::MismatchedCommitment,
            "m.mismatched_sas" => CancelCode::MismatchedSas,
            other => CancelCode::Other(other.to_owned()),
        }
    }
}

impl From<String> for CancelCode {
    fn from(code: String) -> Self {
        code.as_str().into()
    }
}

impl From<CancelCode> for String {
    fn from(code: CancelCode) -> Self {
        code.as_str().to_owned()
    }
}

impl From<&RumaCancelCode> for CancelCode {
    fn from(code: &RumaCancelCode) -> Self {
        code.as_str().into()
    }
}

impl From<&CancelCode> for RumaCancelCode {
    fn from(code: &CancelCode) -> Self {
        code.as_str().into()
    }
}

impl fmt::Display for CancelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Information about the cancellation of a verification request or
/// verification flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelInfo {
    cancelled_by_us: bool,
    cancel_code: CancelCode,
    reason: String,
}

impl CancelInfo {
    /// Create a new `CancelInfo` with an explicit human readable reason.
    pub fn new(cancel_code: CancelCode, reason: impl Into<String>, cancelled_by_us: bool) -> Self {
        Self { cancelled_by_us, cancel_code, reason: reason.into() }
    }

    /// Create a new `CancelInfo`, the reason is picked from the cancel code.
    pub fn from_code(cancel_code: CancelCode, cancelled_by_us: bool) -> Self {
        let reason = cancel_code.default_reason();
        Self::new(cancel_code, reason, cancelled_by_us)
    }

    /// Get the human readable reason of the cancellation.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Get the `CancelCode` that cancelled this verification.
    pub fn cancel_code(&self) -> &CancelCode {
        &self.cancel_code
    }

    /// Was the verification cancelled by us?
    pub fn cancelled_by_us(&self) -> bool {
        self.cancelled_by_us
    }
}

/// The identifier of a verification flow.
///
/// To-device flows are identified by the transaction id of the request,
/// in-room flows by the event id of the `m.key.verification.request` message.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlowId {
    /// A flow that uses to-device messages.
    ToDevice(OwnedTransactionId),
    /// A flow that uses room messages in the given room.
    InRoom(OwnedRoomId, OwnedEventId),
}

impl FlowId {
    /// The room the flow lives in, `None` for to-device flows.
    pub fn room_id(&self) -> Option<&RoomId> {
        if let FlowId::InRoom(r, _) = &self {
            Some(r)
        } else {
            None
        }
    }

    /// The flow id as a string.
    pub fn as_str(&self) -> &str {
        match self {
            FlowId::InRoom(_, r) => r.as_str(),
            FlowId::ToDevice(t) => t.as_str(),
        }
    }
}

impl From<OwnedTransactionId> for FlowId {
    fn from(transaction_id: OwnedTransactionId) -> Self {
        FlowId::ToDevice(transaction_id)
    }
}

impl From<(OwnedRoomId, OwnedEventId)> for FlowId {
    fn from(ids: (OwnedRoomId, OwnedEventId)) -> Self {
        FlowId::InRoom(ids.0, ids.1)
    }
}

impl From<(&RoomId, &EventId)> for FlowId {
    fn from(ids: (&RoomId, &EventId)) -> Self {
        FlowId::InRoom(ids.0.to_owned(), ids.1.to_owned())
    }
}

/// An enum over the different verification types the crate supports.
#[derive(Clone, Debug)]
pub enum Verification {
    /// The `m.sas.v1` verification variant.
    SasV1(SasVerification),
    /// The `m.qr_code.*.v1` verification variant.
    QrV1(QrVerification),
}

impl Verification {
    /// Try to deconstruct this verification enum into a SAS verification.
    pub fn sas_v1(self) -> Option<SasVerification> {
        as_variant::as_variant!(self, Verification::SasV1)
    }

    /// Try to deconstruct this verification enum into a QR code verification.
    pub fn qr_v1(self) -> Option<QrVerification> {
        as_variant::as_variant!(self, Verification::QrV1)
    }

    /// The flow id of the verification.
    pub fn flow_id(&self) -> &FlowId {
        match self {
            Verification::SasV1(s) => s.flow_id(),
            Verification::QrV1(qr) => qr.flow_id(),
        }
    }

    /// Get the ID of the other user.
    pub fn other_user(&self) -> &UserId {
        match self {
            Verification::SasV1(s) => s.other_user_id(),
            Verification::QrV1(qr) => qr.other_user_id(),
        }
    }

    /// Has the verification flow been successfully finished.
    pub fn is_done(&self) -> bool {
        match self {
            Verification::SasV1(s) => s.is_done(),
            Verification::QrV1(qr) => qr.is_done(),
        }
    }

    /// Has the verification flow been cancelled.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Verification::SasV1(s) => s.is_cancelled(),
            Verification::QrV1(qr) => qr.is_cancelled(),
        }
    }

    /// Has the flow reached a state it will never leave again.
    pub fn is_terminal(&self) -> bool {
        self.is_done() || self.is_cancelled()
    }
}

impl From<SasVerification> for Verification {
    fn from(sas: SasVerification) -> Self {
        Self::SasV1(sas)
    }
}

impl From<QrVerification> for Verification {
    fn from(qr: QrVerification) -> Self {
        Self::QrV1(qr)
    }
}
