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

//! The key store collaborator.
//!
//! Sessions, devices and outgoing key requests are owned by the crypto store
//! of the client, this crate only reads them through the [`KeyStore`] trait.
//! A [`MemoryStore`] is provided for tests and for clients that don't need
//! persistence.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::Debug,
};

use async_trait::async_trait;
use ruma::{
    DeviceId, EventEncryptionAlgorithm, OwnedDeviceId, OwnedRoomId, OwnedTransactionId,
    OwnedUserId, UserId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use vodozemac::Curve25519PublicKey;

use crate::{
    error::CryptoStoreError,
    trust::{DevicesSource, LocalTrust, UserIdentitySource},
};

/// The body of an outgoing `m.room_key_request`, uniquely identifying the
/// room key we asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyRequestInfo {
    /// The room the key belongs to.
    pub room_id: OwnedRoomId,
    /// The encryption algorithm of the session.
    pub algorithm: EventEncryptionAlgorithm,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The unique id of the session.
    pub session_id: String,
}

impl RoomKeyRequestInfo {
    fn as_key(&self) -> String {
        format!("{}{}{}{}", self.room_id, self.algorithm, self.sender_key, self.session_id)
    }
}

/// A room key request we sent out, or are about to send out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingKeyRequest {
    /// The unique id of the request.
    pub request_id: OwnedTransactionId,
    /// The key that was requested.
    pub info: RoomKeyRequestInfo,
    /// Has the request been sent out.
    pub sent_out: bool,
}

/// A device of some user, as known to the key store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceData {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    curve25519_key: Option<Curve25519PublicKey>,
    local_trust: LocalTrust,
    cross_signing_trusted: bool,
}

impl DeviceData {
    /// Create a new device with an unset local trust state.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        curve25519_key: Option<Curve25519PublicKey>,
    ) -> Self {
        Self {
            user_id,
            device_id,
            curve25519_key,
            local_trust: LocalTrust::Unset,
            cross_signing_trusted: false,
        }
    }

    /// Set the local trust state of the device.
    pub fn with_local_trust(mut self, trust: LocalTrust) -> Self {
        self.local_trust = trust;
        self
    }

    /// Set whether the device is signed by a verified cross-signing identity.
    pub fn with_cross_signing_trust(mut self, trusted: bool) -> Self {
        self.cross_signing_trusted = trusted;
        self
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique ID of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the Curve25519 key of the given device.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.curve25519_key
    }

    /// Does the device own the given base64 encoded Curve25519 identity key.
    pub fn has_identity_key(&self, identity_key: &str) -> bool {
        self.curve25519_key.is_some_and(|key| key.to_base64() == identity_key)
    }

    /// Get the trust state of the device.
    pub fn local_trust_state(&self) -> LocalTrust {
        self.local_trust
    }

    /// Is the device locally marked as trusted.
    pub fn is_locally_trusted(&self) -> bool {
        self.local_trust == LocalTrust::Verified
    }

    /// Is the device locally marked as blacklisted.
    pub fn is_blacklisted(&self) -> bool {
        self.local_trust == LocalTrust::BlackListed
    }

    /// Is the device signed by a verified cross-signing identity.
    pub fn is_cross_signing_trusted(&self) -> bool {
        self.cross_signing_trusted
    }
}

/// Read access to the crypto store of the client.
#[async_trait]
pub trait KeyStore: Debug + Send + Sync {
    /// Get the outgoing room key request for the given key, if we ever
    /// requested it.
    async fn get_outgoing_key_request(
        &self,
        info: &RoomKeyRequestInfo,
    ) -> Result<Option<OutgoingKeyRequest>, CryptoStoreError>;

    /// Get the device owning the given base64 encoded Curve25519 identity key.
    async fn get_device_from_curve_key(
        &self,
        identity_key: &str,
    ) -> Result<Option<DeviceData>, CryptoStoreError>;
}

/// An in-memory only store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceData>>>,
    verified_users: RwLock<HashSet<OwnedUserId>>,
    outgoing_key_requests: RwLock<HashMap<OwnedTransactionId, OutgoingKeyRequest>>,
    key_requests_by_info: RwLock<HashMap<String, OwnedTransactionId>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the given devices.
    pub async fn save_devices(&self, devices: Vec<DeviceData>) {
        let mut store = self.devices.write().await;

        for device in devices {
            store
                .entry(device.user_id.clone())
                .or_default()
                .insert(device.device_id.clone(), device);
        }
    }

    /// Mark the identity of the given user as verified or not.
    pub async fn set_user_verified(&self, user_id: &UserId, verified: bool) {
        let mut users = self.verified_users.write().await;

        if verified {
            users.insert(user_id.to_owned());
        } else {
            users.remove(user_id);
        }
    }

    /// Remember an outgoing room key request.
    pub async fn save_outgoing_key_request(&self, request: OutgoingKeyRequest) {
        self.key_requests_by_info
            .write()
            .await
            .insert(request.info.as_key(), request.request_id.clone());
        self.outgoing_key_requests.write().await.insert(request.request_id.clone(), request);
    }

    /// Forget an outgoing room key request, e.g. once the key arrived.
    pub async fn delete_outgoing_key_request(&self, request_id: &OwnedTransactionId) {
        if let Some(request) = self.outgoing_key_requests.write().await.remove(request_id) {
            self.key_requests_by_info.write().await.remove(&request.info.as_key());
        }
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn get_outgoing_key_request(
        &self,
        info: &RoomKeyRequestInfo,
    ) -> Result<Option<OutgoingKeyRequest>, CryptoStoreError> {
        let Some(request_id) = self.key_requests_by_info.read().await.get(&info.as_key()).cloned()
        else {
            return Ok(None);
        };

        Ok(self.outgoing_key_requests.read().await.get(&request_id).cloned())
    }

    async fn get_device_from_curve_key(
        &self,
        identity_key: &str,
    ) -> Result<Option<DeviceData>, CryptoStoreError> {
        Ok(self
            .devices
            .read()
            .await
            .values()
            .flat_map(BTreeMap::values)
            .find(|d| d.has_identity_key(identity_key))
            .cloned())
    }
}

#[async_trait]
impl DevicesSource for MemoryStore {
    async fn user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceData>, CryptoStoreError> {
        Ok(self
            .devices
            .read()
            .await
            .get(user_id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>, CryptoStoreError> {
        Ok(self.devices.read().await.get(user_id).and_then(|d| d.get(device_id)).cloned())
    }
}

#[async_trait]
impl UserIdentitySource for MemoryStore {
    async fn is_user_verified(&self, user_id: &UserId) -> Result<bool, CryptoStoreError> {
        Ok(self.verified_users.read().await.contains(user_id))
    }
}


#[cfg(test)]
mod tests {
    use ruma::{device_id, owned_room_id, user_id, EventEncryptionAlgorithm, OwnedTransactionId};

    use super::{
        testing::{device_with_key, CURVE_KEY_1, CURVE_KEY_2},
        KeyStore, MemoryStore, OutgoingKeyRequest, RoomKeyRequestInfo,
    };
    use crate::trust::{DevicesSource, LocalTrust};

    fn info(session_id: &str) -> RoomKeyRequestInfo {
        RoomKeyRequestInfo {
            room_id: owned_room_id!("!test:localhost"),
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            sender_key: CURVE_KEY_1.to_owned(),
            session_id: session_id.to_owned(),
        }
    }

    #[tokio::test]
    async fn test_outgoing_key_requests() {
        let store = MemoryStore::new();
        let request_id = OwnedTransactionId::from("request");

        assert!(store.get_outgoing_key_request(&info("session")).await.unwrap().is_none());

        let request = OutgoingKeyRequest {
            request_id: request_id.clone(),
            info: info("session"),
            sent_out: true,
        };
        store.save_outgoing_key_request(request.clone()).await;

        assert_eq!(store.get_outgoing_key_request(&info("session")).await.unwrap(), Some(request));
        assert!(store.get_outgoing_key_request(&info("other")).await.unwrap().is_none());

        store.delete_outgoing_key_request(&request_id).await;
        assert!(store.get_outgoing_key_request(&info("session")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_device_from_curve_key() {
        let alice = user_id!("@alice:localhost");
        let store = MemoryStore::new();
        store
            .save_devices(vec![
                device_with_key(alice, "ALICE1", CURVE_KEY_1, LocalTrust::Verified),
                device_with_key(alice, "ALICE2", CURVE_KEY_2, LocalTrust::Unset),
            ])
            .await;

        let device = store.get_device_from_curve_key(CURVE_KEY_2).await.unwrap().unwrap();
        assert_eq!(device.device_id(), device_id!("ALICE2"));
        assert!(!device.is_locally_trusted());

        assert!(store.get_device_from_curve_key("not a key").await.unwrap().is_none());
        assert_eq!(store.user_devices(alice).await.unwrap().len(), 2);
        assert!(store.user_devices(user_id!("@bob:localhost")).await.unwrap().is_empty());
    }
}
