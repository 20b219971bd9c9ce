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

//! Classification of incoming room keys.
//!
//! Room keys either arrive directly from the device that created the Megolm
//! session, as an `m.room_key` event, or are forwarded to us by some other
//! device as an `m.forwarded_room_key` event. Direct keys are always safe to
//! use. Forwarded keys are only safe if we asked for them and if they were
//! forwarded by one of our own devices that we verified.

mod unrequested;

use std::{collections::BTreeMap, sync::Arc};

use ruma::{EventEncryptionAlgorithm, OwnedRoomId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, instrument};

pub use self::unrequested::{Clock, SystemClock, UnrequestedKeyDelegate, UnrequestedRoomKeyManager};
use crate::{
    error::RoomKeyError,
    store::{KeyStore, RoomKeyRequestInfo},
};

const ROOM_KEY_EVENT_TYPE: &str = "m.room_key";
const FORWARDED_ROOM_KEY_EVENT_TYPE: &str = "m.forwarded_room_key";

/// A decrypted to-device event that might carry a room key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptedRoomKeyEvent {
    /// The type of the event.
    pub event_type: String,
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The Curve25519 key of the device that encrypted the event.
    pub sender_key: Option<String>,
    /// The keys the sending device claims to own.
    pub keys_claimed: Option<BTreeMap<String, String>>,
    /// The content of the event.
    pub content: Value,
}

#[derive(Deserialize)]
struct RoomKeyContent {
    algorithm: EventEncryptionAlgorithm,
    room_id: OwnedRoomId,
    session_id: String,
    session_key: String,
    #[serde(default, rename = "org.matrix.msc3061.shared_history")]
    shared_history: bool,
}

#[derive(Deserialize)]
struct ForwardedRoomKeyContent {
    algorithm: EventEncryptionAlgorithm,
    room_id: OwnedRoomId,
    sender_key: String,
    session_id: String,
    session_key: String,
    sender_claimed_ed25519_key: String,
    #[serde(default)]
    forwarding_curve25519_key_chain: Vec<String>,
    #[serde(default, rename = "org.matrix.msc3061.shared_history")]
    shared_history: bool,
}

/// A room key together with everything needed to import it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyInfo {
    /// The encryption algorithm of the session.
    pub algorithm: EventEncryptionAlgorithm,
    /// The unique id of the session.
    pub session_id: String,
    /// The exported or raw session key.
    pub session_key: String,
    /// The room the session belongs to.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The chain of Curve25519 keys the key was forwarded through, `None` for
    /// direct keys.
    pub forwarding_key_chain: Option<Vec<String>>,
    /// The keys the creator of the session claims to own.
    pub keys_claimed: BTreeMap<String, String>,
    /// Is the session key in the export format.
    ///
    /// Forwarded keys are always exported, they can't be used to advance the
    /// ratchet of an outbound session.
    pub export_format: bool,
    /// Was the key shared along with the room history.
    pub shared_history: bool,
}

impl RoomKeyInfo {
    fn from_room_key(
        content: RoomKeyContent,
        sender_key: String,
        keys_claimed: BTreeMap<String, String>,
    ) -> Self {
        Self {
            algorithm: content.algorithm,
            session_id: content.session_id,
            session_key: content.session_key,
            room_id: content.room_id,
            sender_key,
            forwarding_key_chain: None,
            keys_claimed,
            export_format: false,
            shared_history: content.shared_history,
        }
    }

    fn from_forwarded_room_key(content: ForwardedRoomKeyContent) -> Self {
        Self {
            algorithm: content.algorithm,
            session_id: content.session_id,
            session_key: content.session_key,
            room_id: content.room_id,
            sender_key: content.sender_key,
            forwarding_key_chain: Some(content.forwarding_curve25519_key_chain),
            keys_claimed: BTreeMap::from([(
                "ed25519".to_owned(),
                content.sender_claimed_ed25519_key,
            )]),
            export_format: true,
            shared_history: content.shared_history,
        }
    }
}

/// How far a room key can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomKeyType {
    /// The key came from the creator of the session, or from one of our own
    /// verified devices after we asked for it.
    Safe,
    /// We asked for the key but it was forwarded by a device we can't vouch
    /// for.
    Unsafe,
    /// We never asked for the key.
    Unrequested,
}

/// The classification of a room key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomKeyResult {
    /// How far the key can be trusted.
    pub key_type: RoomKeyType,
    /// The key itself.
    pub info: RoomKeyInfo,
}

/// Classifies incoming room key events.
#[derive(Debug, Clone)]
pub struct RoomKeyInfoFactory {
    own_user_id: OwnedUserId,
    store: Arc<dyn KeyStore>,
}

impl RoomKeyInfoFactory {
    /// Create a new factory for the given user.
    pub fn new(own_user_id: OwnedUserId, store: Arc<dyn KeyStore>) -> Self {
        Self { own_user_id, store }
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        &self.own_user_id
    }

    /// Extract and classify the room key of the given event.
    ///
    /// Returns `None` if the event doesn't carry a valid room key, such keys
    /// must not be used.
    #[instrument(skip_all, fields(sender = %event.sender, event_type = event.event_type.as_str()))]
    pub async fn room_key(&self, event: &DecryptedRoomKeyEvent) -> Option<RoomKeyResult> {
        match self.classify(event).await {
            Ok(result) => Some(result),
            Err(e) => {
                error!(error = ?e, "Couldn't classify the room key");
                None
            }
        }
    }

    async fn classify(&self, event: &DecryptedRoomKeyEvent) -> Result<RoomKeyResult, RoomKeyError> {
        match event.event_type.as_str() {
            ROOM_KEY_EVENT_TYPE => Self::room_key_info(event),
            FORWARDED_ROOM_KEY_EVENT_TYPE => self.forwarded_room_key_info(event).await,
            other => Err(RoomKeyError::UnknownEventType(other.to_owned())),
        }
    }

    fn room_key_info(event: &DecryptedRoomKeyEvent) -> Result<RoomKeyResult, RoomKeyError> {
        let content: RoomKeyContent = serde_json::from_value(event.content.clone())?;
        let sender_key = event.sender_key.clone().ok_or(RoomKeyError::MissingSenderKey)?;
        let keys_claimed = event.keys_claimed.clone().ok_or(RoomKeyError::MissingClaimedKeys)?;

        Ok(RoomKeyResult {
            key_type: RoomKeyType::Safe,
            info: RoomKeyInfo::from_room_key(content, sender_key, keys_claimed),
        })
    }

    async fn forwarded_room_key_info(
        &self,
        event: &DecryptedRoomKeyEvent,
    ) -> Result<RoomKeyResult, RoomKeyError> {
        let sender_key = event.sender_key.as_deref().ok_or(RoomKeyError::MissingSenderKey)?;
        let mut content: ForwardedRoomKeyContent = serde_json::from_value(event.content.clone())?;

        content.forwarding_curve25519_key_chain.push(sender_key.to_owned());

        let key_type = self.forwarded_key_type(&content, sender_key).await?;

        Ok(RoomKeyResult { key_type, info: RoomKeyInfo::from_forwarded_room_key(content) })
    }

    async fn forwarded_key_type(
        &self,
        content: &ForwardedRoomKeyContent,
        sender_key: &str,
    ) -> Result<RoomKeyType, RoomKeyError> {
        let request_info = RoomKeyRequestInfo {
            room_id: content.room_id.clone(),
            algorithm: content.algorithm.clone(),
            sender_key: content.sender_key.clone(),
            session_id: content.session_id.clone(),
        };

        if self.store.get_outgoing_key_request(&request_info).await?.is_none() {
            debug!("The forwarded room key was not requested");
            Ok(RoomKeyType::Unrequested)
        } else if self.is_own_verified_device(sender_key).await? {
            Ok(RoomKeyType::Safe)
        } else {
            debug!("The forwarded room key doesn't come from one of our verified devices");
            Ok(RoomKeyType::Unsafe)
        }
    }

    async fn is_own_verified_device(&self, identity_key: &str) -> Result<bool, RoomKeyError> {
        Ok(self
            .store
            .get_device_from_curve_key(identity_key)
            .await?
            .is_some_and(|d| *d.user_id() == *self.own_user_id && d.is_locally_trusted()))
    }
}
