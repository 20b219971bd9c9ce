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

use std::{collections::BTreeMap, fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use ruma::{MilliSecondsSinceUnixEpoch, OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::sync::Mutex;
use tracing::{debug, error, instrument};

use super::RoomKeyInfo;
use crate::{error::CryptoStoreError, store::DeviceData};

/// A source of the current time.
pub trait Clock: Debug + Send + Sync {
    /// The current time.
    fn now(&self) -> MilliSecondsSinceUnixEpoch;
}

/// A [`Clock`] reading the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> MilliSecondsSinceUnixEpoch {
        MilliSecondsSinceUnixEpoch::now()
    }
}

/// The client side of the [`UnrequestedRoomKeyManager`].
#[async_trait]
pub trait UnrequestedKeyDelegate: Debug + Send + Sync {
    /// Download the current device list of the given user.
    async fn download_device_keys(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<DeviceData>, CryptoStoreError>;

    /// Import a room key that turned out to be expected after all.
    async fn accept_room_key(&self, info: RoomKeyInfo);
}

#[derive(Debug)]
struct PendingKey {
    info: RoomKeyInfo,
    received_at: MilliSecondsSinceUnixEpoch,
}

#[derive(Debug)]
struct RoomInvite {
    room_id: OwnedRoomId,
    sender: OwnedUserId,
    received_at: MilliSecondsSinceUnixEpoch,
}

#[derive(Debug, Default)]
struct PendingState {
    keys: BTreeMap<OwnedRoomId, BTreeMap<OwnedUserId, Vec<PendingKey>>>,
    invites: Vec<RoomInvite>,
}

/// Holds on to forwarded room keys we never asked for.
///
/// When a user invites us into a room they usually forward us the room keys
/// for the existing history as well. Those keys arrive unrequested, they are
/// only accepted if an invite from the same user for the same room arrives
/// within a short window of the keys.
#[derive(Debug)]
pub struct UnrequestedRoomKeyManager {
    delegate: Arc<dyn UnrequestedKeyDelegate>,
    clock: Arc<dyn Clock>,
    window: Duration,
    state: Mutex<PendingState>,
}

impl UnrequestedRoomKeyManager {
    /// Create a new manager, pending keys and invites are kept for `window`.
    pub fn new(delegate: Arc<dyn UnrequestedKeyDelegate>, window: Duration) -> Self {
        Self::with_clock(delegate, Arc::new(SystemClock), window)
    }

    /// Create a new manager using the given clock.
    pub fn with_clock(
        delegate: Arc<dyn UnrequestedKeyDelegate>,
        clock: Arc<dyn Clock>,
        window: Duration,
    ) -> Self {
        Self { delegate, clock, window, state: Default::default() }
    }

    /// Forget all the pending keys and invites.
    pub async fn close(&self) {
        *self.state.lock().await = PendingState::default();
    }

    /// Hold on to an unrequested room key.
    ///
    /// The key is dropped unless the device list of `sender` contains a
    /// device owning `sender_key`, the identity key the key was forwarded
    /// with.
    #[instrument(
        skip_all,
        fields(%sender, room_id = %info.room_id, session_id = info.session_id.as_str())
    )]
    pub async fn add_pending_key(&self, info: RoomKeyInfo, sender: &UserId, sender_key: &str) {
        // If we were just invited by the user we may not have their devices yet.
        let devices = match self.delegate.download_device_keys(sender).await {
            Ok(devices) => devices,
            Err(e) => {
                error!(error = ?e, "Couldn't download the devices of the key sender");
                return;
            }
        };

        let Some(device) = devices
            .iter()
            .find(|d| *d.user_id() == *sender && d.has_identity_key(sender_key))
        else {
            error!("The sender of the room key doesn't own the claimed sender key");
            return;
        };

        {
            let mut state = self.state.lock().await;
            let received_at = self.clock.now();

            state
                .keys
                .entry(info.room_id.clone())
                .or_default()
                .entry(device.user_id().to_owned())
                .or_default()
                .push(PendingKey { info, received_at });
        }

        debug!("Stored an unrequested room key");

        self.process().await;
    }

    /// Remember that `sender` invited us into the given room.
    pub async fn on_room_invite(&self, room_id: &RoomId, sender: &UserId) {
        let received_at = self.clock.now();

        self.state.lock().await.invites.push(RoomInvite {
            room_id: room_id.to_owned(),
            sender: sender.to_owned(),
            received_at,
        });
    }

    /// Accept the pending keys of rooms we were invited into by the sender of
    /// the keys.
    ///
    /// Invites older than the window are dropped, and the pending keys of
    /// every room with an invite are cleared, whether they were accepted or
    /// not.
    pub async fn process(&self) {
        let now = self.clock.now();

        let accepted = {
            let mut state = self.state.lock().await;
            let PendingState { keys, invites } = &mut *state;

            invites.retain(|invite| self.is_within_window(invite.received_at, now));

            let mut accepted = Vec::new();

            for invite in invites.iter() {
                let Some(room_keys) = keys.remove(&invite.room_id) else {
                    continue;
                };

                for (sender, pending) in room_keys {
                    if sender != invite.sender {
                        debug!(%sender, "Dropping room keys that weren't sent by the inviter");
                        continue;
                    }

                    accepted.extend(
                        pending
                            .into_iter()
                            .filter(|k| self.is_within_window(k.received_at, invite.received_at))
                            .map(|k| k.info),
                    );
                }
            }

            accepted
        };

        for info in accepted {
            debug!(
                room_id = %info.room_id,
                session_id = %info.session_id,
                "Accepting an unrequested room key"
            );
            self.delegate.accept_room_key(info).await;
        }
    }

    fn is_within_window(
        &self,
        first: MilliSecondsSinceUnixEpoch,
        second: MilliSecondsSinceUnixEpoch,
    ) -> bool {
        let elapsed = u64::from(first.0).abs_diff(u64::from(second.0));
        u128::from(elapsed) < self.window.as_millis()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, BTreeSet},
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use ruma::{
        room_id, user_id, EventEncryptionAlgorithm, MilliSecondsSinceUnixEpoch, OwnedRoomId,
        UInt, UserId,
    };

    use super::{Clock, UnrequestedKeyDelegate, UnrequestedRoomKeyManager};
    use crate::{
        error::CryptoStoreError,
        room_keys::RoomKeyInfo,
        store::{
            testing::{device_with_key, CURVE_KEY_1, CURVE_KEY_2},
            DeviceData,
        },
        trust::LocalTrust,
    };

    const MINUTE: u64 = 60 * 1000;

    #[derive(Debug, Default)]
    struct MockClock(AtomicU64);

    impl MockClock {
        fn advance(&self, millis: u64) {
            self.0.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> MilliSecondsSinceUnixEpoch {
            MilliSecondsSinceUnixEpoch(UInt::new_saturating(self.0.load(Ordering::SeqCst)))
        }
    }

    #[derive(Debug, Default)]
    struct MockDelegate {
        accepted: Mutex<Vec<RoomKeyInfo>>,
    }

    impl MockDelegate {
        fn accepted_sessions(&self) -> BTreeSet<String> {
            self.accepted.lock().unwrap().iter().map(|k| k.session_id.clone()).collect()
        }

        fn take(&self) -> Vec<RoomKeyInfo> {
            std::mem::take(&mut *self.accepted.lock().unwrap())
        }
    }

    #[async_trait]
    impl UnrequestedKeyDelegate for MockDelegate {
        async fn download_device_keys(
            &self,
            user_id: &UserId,
        ) -> Result<Vec<DeviceData>, CryptoStoreError> {
            if user_id == user_id!("@bob:localhost") {
                Ok(vec![device_with_key(user_id, "BOBDEVICE", CURVE_KEY_1, LocalTrust::Unset)])
            } else {
                Ok(vec![device_with_key(user_id, "OTHERDEVICE", CURVE_KEY_2, LocalTrust::Unset)])
            }
        }

        async fn accept_room_key(&self, info: RoomKeyInfo) {
            self.accepted.lock().unwrap().push(info);
        }
    }

    fn key(room_id: &str, session_id: &str) -> RoomKeyInfo {
        RoomKeyInfo {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            session_id: session_id.to_owned(),
            session_key: "<key>".to_owned(),
            room_id: OwnedRoomId::try_from(room_id).unwrap(),
            sender_key: "<sender_key>".to_owned(),
            forwarding_key_chain: Some(vec![]),
            keys_claimed: BTreeMap::new(),
            export_format: true,
            shared_history: true,
        }
    }

    fn manager() -> (UnrequestedRoomKeyManager, Arc<MockDelegate>, Arc<MockClock>) {
        let delegate = Arc::new(MockDelegate::default());
        let clock = Arc::new(MockClock::default());
        let manager = UnrequestedRoomKeyManager::with_clock(
            delegate.clone(),
            clock.clone(),
            Duration::from_secs(10 * 60),
        );

        (manager, delegate, clock)
    }

    fn bob() -> &'static UserId {
        user_id!("@bob:localhost")
    }

    #[tokio::test]
    async fn test_nothing_to_process() {
        let (manager, delegate, _) = manager();

        manager.process().await;
        assert!(delegate.take().is_empty());
    }

    #[tokio::test]
    async fn test_keys_of_invited_rooms_are_accepted() {
        let (manager, delegate, _) = manager();

        let keys = [
            ("!a:localhost", "1"),
            ("!a:localhost", "2"),
            ("!b:localhost", "3"),
            ("!c:localhost", "4"),
        ];

        for (room, session) in keys {
            manager.add_pending_key(key(room, session), bob(), CURVE_KEY_1).await;
        }

        manager.on_room_invite(room_id!("!a:localhost"), bob()).await;
        manager.on_room_invite(room_id!("!c:localhost"), bob()).await;
        manager.process().await;

        assert_eq!(
            delegate.accepted_sessions(),
            BTreeSet::from(["1".into(), "2".into(), "4".into()])
        );
    }

    #[tokio::test]
    async fn test_only_keys_of_the_inviter_are_accepted() {
        let (manager, delegate, _) = manager();
        let alice = user_id!("@alice:localhost");

        manager.add_pending_key(key("!a:localhost", "1"), alice, CURVE_KEY_2).await;
        manager.add_pending_key(key("!a:localhost", "2"), bob(), CURVE_KEY_1).await;
        manager.add_pending_key(key("!b:localhost", "3"), bob(), CURVE_KEY_1).await;

        manager.on_room_invite(room_id!("!a:localhost"), bob()).await;
        manager.process().await;

        assert_eq!(delegate.accepted_sessions(), BTreeSet::from(["2".into()]));
    }

    #[tokio::test]
    async fn test_keys_with_a_mismatched_sender_key_are_dropped() {
        let (manager, delegate, _) = manager();

        manager.add_pending_key(key("!a:localhost", "1"), bob(), CURVE_KEY_2).await;
        manager.on_room_invite(room_id!("!a:localhost"), bob()).await;
        manager.process().await;

        assert!(delegate.take().is_empty());
    }

    #[tokio::test]
    async fn test_processed_keys_are_removed() {
        let (manager, delegate, _) = manager();

        manager.add_pending_key(key("!a:localhost", "1"), bob(), CURVE_KEY_1).await;
        manager.process().await;
        assert_eq!(delegate.take().len(), 0);

        manager.on_room_invite(room_id!("!a:localhost"), bob()).await;
        manager.process().await;
        assert_eq!(delegate.take().len(), 1);

        manager.process().await;
        assert_eq!(delegate.take().len(), 0);
    }

    #[tokio::test]
    async fn test_old_invites_are_dropped() {
        let (manager, delegate, clock) = manager();

        let keys = [("!a:localhost", "A"), ("!b:localhost", "B"), ("!c:localhost", "C")];

        for (room, session) in keys {
            manager.add_pending_key(key(room, session), bob(), CURVE_KEY_1).await;
        }

        // The invite into room A is older than the window once processed.
        manager.on_room_invite(room_id!("!a:localhost"), bob()).await;
        clock.advance(5 * MINUTE);
        manager.on_room_invite(room_id!("!b:localhost"), bob()).await;
        clock.advance(4 * MINUTE);
        manager.on_room_invite(room_id!("!c:localhost"), bob()).await;
        clock.advance(2 * MINUTE);

        manager.process().await;

        assert_eq!(delegate.accepted_sessions(), BTreeSet::from(["B".into(), "C".into()]));
    }

    #[tokio::test]
    async fn test_keys_older_than_the_invite_window_are_dropped() {
        let (manager, delegate, clock) = manager();

        manager.add_pending_key(key("!a:localhost", "1"), bob(), CURVE_KEY_1).await;
        clock.advance(11 * MINUTE);
        manager.add_pending_key(key("!a:localhost", "2"), bob(), CURVE_KEY_1).await;

        manager.on_room_invite(room_id!("!a:localhost"), bob()).await;
        manager.process().await;

        let accepted = delegate.take();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].session_id, "2");
    }

    #[tokio::test]
    async fn test_close_forgets_everything() {
        let (manager, delegate, _) = manager();

        manager.add_pending_key(key("!a:localhost", "1"), bob(), CURVE_KEY_1).await;
        manager.close().await;

        manager.on_room_invite(room_id!("!a:localhost"), bob()).await;
        manager.process().await;

        assert!(delegate.take().is_empty());
    }
}
