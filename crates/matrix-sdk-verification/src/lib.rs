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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

mod config;
mod engine;
mod error;
mod room_keys;
mod secrets;
pub mod store;
mod trust;
mod verification;

pub use config::VerificationSettings;
pub use engine::{
    ConfirmVerificationResult, CryptoEngine, FlowInfo, OutgoingVerificationRequest,
    RequestVerificationResult, ScanResult, SignatureUploadRequest, StartSasResult,
    VerificationInfo, VerificationRequestInfo, VerificationTarget,
};
pub use error::{
    CryptoStoreError, EngineError, ResolverError, RoomKeyError, SecretImportError,
    TransportError, VerificationError, VerificationResult,
};
pub use room_keys::{
    Clock, DecryptedRoomKeyEvent, RoomKeyInfo, RoomKeyInfoFactory, RoomKeyResult, RoomKeyType,
    SystemClock, UnrequestedKeyDelegate, UnrequestedRoomKeyManager,
};
pub use secrets::CrossSigningSecrets;
pub use store::{DeviceData, KeyStore, MemoryStore, OutgoingKeyRequest, RoomKeyRequestInfo};
pub use trust::{
    DeviceTrustLevel, DevicesSource, LocalTrust, LocalVerificationStatus, TrustLevelSource,
    TrustSummary, UserIdentitySource, UserTrustLevel, UsersTrustLevelSummary,
};
pub use verification::{
    decimal_string, emoji_from_index, emojis_from_indices, format_emojis, resolve_related_events,
    CancelCode, CancelInfo, Emoji, FlowId, KeyVerification, QrUpdate, QrVerification,
    QrVerificationState, RelatedEvent, RelationsSource, SasState, SasUpdate, SasVerification,
    Verification, VerificationManager, VerificationManagerUpdate, VerificationRequest,
    VerificationRequestState, VerificationRequestUpdate, VerificationState,
    VerificationStateResolver,
};

/// The version of the crate.
pub static VERSION: &str = env!("CARGO_PKG_VERSION");

// Enable tracing for tests in this crate
#[cfg(all(test, not(target_arch = "wasm32")))]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
