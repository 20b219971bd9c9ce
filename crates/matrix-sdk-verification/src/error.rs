// Copyright 2022 The Matrix.org Foundation C.I.C.
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

use ruma::events::secret::request::SecretName;
use serde_json::Error as SerdeError;
use thiserror::Error;

/// Result type of the operations on verification flows.
pub type VerificationResult<T> = Result<T, VerificationError>;

/// Error type describing a failure reported by the [`CryptoEngine`].
///
/// [`CryptoEngine`]: crate::CryptoEngine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The outgoing request couldn't be sent out.
    #[error("failed to send the outgoing verification request: {0}")]
    Send(String),

    /// Any other failure of the engine.
    #[error("the crypto engine failed: {0}")]
    Other(String),
}

/// Error type describing why an operation on a verification flow failed.
///
/// None of these errors change the state of the flow, the flow stays in the
/// last state the crypto engine reported for it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// The crypto engine refused to produce an `m.key.verification.ready`
    /// message for the request.
    #[error("the verification request can't be accepted")]
    CannotAccept,

    /// The crypto engine refused to produce an `m.key.verification.cancel`
    /// message, usually because the flow already finished.
    #[error("the verification flow can't be cancelled")]
    CannotCancel,

    /// The crypto engine couldn't transition the request into a SAS flow.
    #[error("a SAS verification can't be started for this request")]
    CannotStartSasVerification,

    /// The crypto engine couldn't transition the request into a QR code flow.
    #[error("a QR code verification can't be started for this request")]
    CannotStartQrVerification,

    /// The crypto engine refused to create a new verification request.
    #[error("a verification request can't be created")]
    CannotRequestVerification,

    /// A device needs to be verified, but no device id was given.
    #[error("verifying another user over to-device messages requires a device id")]
    MissingDeviceId,

    /// The flow id isn't known to the verification manager.
    #[error("no verification flow with the flow id {0} is known")]
    UnknownFlow(String),

    /// The outgoing message was produced but couldn't be delivered.
    #[error(transparent)]
    Delivery(#[from] EngineError),
}

/// Error type describing a failure of the relations transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to fetch the related events: {0}")]
pub struct TransportError(pub String);

/// Error type for the [`VerificationStateResolver`].
///
/// [`VerificationStateResolver`]: crate::VerificationStateResolver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    /// Fetching the events related to the verification request failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Another call resolving the same flow was already in flight and it
    /// failed.
    #[error("a concurrent resolution of the same verification flow failed")]
    ConcurrentResolutionFailed,
}

/// Error type for the [`KeyStore`] collaborator.
///
/// [`KeyStore`]: crate::KeyStore
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoStoreError {
    /// The storage backend failed.
    #[error("the key store failed: {0}")]
    Backend(String),
}

/// Error type describing why an incoming key-sharing event couldn't be
/// classified.
///
/// These errors never reach the decryption pipeline, an event that can't be
/// classified doesn't produce a [`RoomKeyResult`] at all.
///
/// [`RoomKeyResult`]: crate::RoomKeyResult
#[derive(Error, Debug)]
pub enum RoomKeyError {
    /// The event type is neither `m.room_key` nor `m.forwarded_room_key`.
    #[error("the event type {0} doesn't carry a room key")]
    UnknownEventType(String),

    /// The event is missing the Curve25519 key of the sending device.
    #[error("the event is missing the sender key of the sending device")]
    MissingSenderKey,

    /// The event is missing the keys the sender claims to own.
    #[error("the event is missing the claimed keys of the sending device")]
    MissingClaimedKeys,

    /// The event content couldn't be deserialized.
    #[error("the room key content is invalid: {0}")]
    InvalidEvent(#[from] SerdeError),

    /// The key store couldn't be queried.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error type describing why a secret couldn't be imported.
#[derive(Error, Debug)]
pub enum SecretImportError {
    /// The secret isn't a valid private key.
    #[error("the secret {} is not a valid private key: {error}", .name.as_str())]
    Key {
        /// The name of the secret that was being imported.
        name: SecretName,
        /// The error that occurred.
        error: vodozemac::KeyError,
    },

    /// The public half of the imported private key doesn't match the public
    /// key that was uploaded to the server.
    #[error(
        "the public key of the imported secret {} doesn't match the \
        public key that was uploaded to the server",
        .name.as_str()
    )]
    SecretDoesNotMatch {
        /// The name of the secret that was being imported.
        name: SecretName,
    },

    /// The secret isn't one we know how to check.
    #[error("the secret {} can't be imported", .0.as_str())]
    UnsupportedSecret(SecretName),
}
