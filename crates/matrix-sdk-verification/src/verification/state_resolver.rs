// Copyright 2023 The Matrix.org Foundation C.I.C.
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

//! Computes the outcome of an in-room verification flow from the events that
//! reference its `m.key.verification.request` message.
//!
//! Once the crypto engine forgot about a flow, e.g. after a restart, the
//! relations of the request event in the room are the only record of how the
//! flow ended.

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use ruma::{EventId, MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedUserId, RoomId, UserId};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, trace};

use super::CancelCode;
use crate::error::{ResolverError, TransportError};

/// The outcome of a verification flow as recorded in the room history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    /// The flow was started but nothing else is recorded.
    TransactionStarted,
    /// The request was accepted by the other side.
    RequestReady,
    /// The verification finished successfully.
    Verified,
    /// We cancelled the verification.
    TransactionCancelledByMe,
    /// The other side cancelled the verification.
    TransactionCancelled,
    /// Nobody answered the request in time.
    RequestExpired,
    /// The verification was cancelled because of an error.
    TransactionFailed,
}

/// An event that references the `m.key.verification.request` message of a
/// flow.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedEvent {
    /// The type of the event, e.g. `m.key.verification.done`.
    pub event_type: String,
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The timestamp the homeserver attached to the event.
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    /// The JSON content of the event.
    pub content: Value,
}

enum RelationKind {
    Ready,
    Done,
    Cancel(CancelCode),
    Other,
}

impl RelatedEvent {
    fn kind(&self) -> RelationKind {
        match self.event_type.as_str() {
            "m.key.verification.ready" => RelationKind::Ready,
            "m.key.verification.done" => RelationKind::Done,
            "m.key.verification.cancel" => {
                let code = self.content.get("code").and_then(Value::as_str).unwrap_or_default();
                RelationKind::Cancel(code.into())
            }
            _ => RelationKind::Other,
        }
    }
}

/// The transport that fetches the events related to a room event.
#[async_trait]
pub trait RelationsSource: Debug + Send + Sync {
    /// Fetch every event that references the given event, in the order the
    /// homeserver returns them.
    async fn related_events(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<Vec<RelatedEvent>, TransportError>;
}

/// Fold the events related to a verification request into the outcome of
/// the flow.
///
/// A `done` or `cancel` event ends the flow, later events are ignored. A
/// `ready` event is remembered but can still be overridden.
pub fn resolve_related_events<'a>(
    own_user_id: &UserId,
    events: impl IntoIterator<Item = &'a RelatedEvent>,
) -> VerificationState {
    let mut state = VerificationState::TransactionStarted;

    for event in events {
        match event.kind() {
            RelationKind::Ready => state = VerificationState::RequestReady,
            RelationKind::Done => return VerificationState::Verified,
            RelationKind::Cancel(CancelCode::User) => {
                return if *event.sender == *own_user_id {
                    VerificationState::TransactionCancelledByMe
                } else {
                    VerificationState::TransactionCancelled
                };
            }
            RelationKind::Cancel(CancelCode::Timeout) => {
                return VerificationState::RequestExpired;
            }
            RelationKind::Cancel(_) => return VerificationState::TransactionFailed,
            RelationKind::Other => continue,
        }
    }

    state
}

type InflightMap = Mutex<BTreeMap<OwnedEventId, Arc<Mutex<Result<(), ()>>>>>;

/// Resolves, and remembers, the outcome of in-room verification flows.
///
/// At most one query per flow is ever in flight: concurrent callers for the
/// same flow wait for the first one and share its result. Successful results
/// are cached for the lifetime of the resolver, failures are not.
#[derive(Debug)]
pub struct VerificationStateResolver {
    own_user_id: OwnedUserId,
    relations: Arc<dyn RelationsSource>,
    sort_by_timestamp: bool,
    states: Mutex<BTreeMap<OwnedEventId, VerificationState>>,
    inflight: InflightMap,
}

impl VerificationStateResolver {
    /// Create a new resolver.
    ///
    /// If `sort_by_timestamp` is set the related events are ordered by their
    /// `origin_server_ts` before being folded, otherwise the order of the
    /// transport is trusted.
    pub fn new(
        own_user_id: OwnedUserId,
        relations: Arc<dyn RelationsSource>,
        sort_by_timestamp: bool,
    ) -> Self {
        Self {
            own_user_id,
            relations,
            sort_by_timestamp,
            states: Default::default(),
            inflight: Default::default(),
        }
    }

    /// Get the state of the flow that started with the given request event.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        flow_id: &EventId,
        room_id: &RoomId,
    ) -> Result<VerificationState, ResolverError> {
        loop {
            let mut map = self.inflight.lock().await;

            if let Some(state) = self.states.lock().await.get(flow_id) {
                trace!(?state, "Using the cached verification state");
                return Ok(*state);
            }

            if let Some(mutex) = map.get(flow_id).cloned() {
                // Another call is resolving this flow, wait for it to finish.
                drop(map);

                let result = *mutex.lock().await;
                result.map_err(|()| ResolverError::ConcurrentResolutionFailed)?;

                if let Some(state) = self.states.lock().await.get(flow_id) {
                    return Ok(*state);
                }

                // The other call was dropped before it could finish, take
                // over unless somebody else already did.
                debug!("A concurrent resolution was abandoned, retrying");

                let mut map = self.inflight.lock().await;
                if map.get(flow_id).is_some_and(|m| Arc::ptr_eq(m, &mutex)) {
                    map.remove(flow_id);
                }

                continue;
            }

            let request_mutex = Arc::new(Mutex::new(Ok(())));
            map.insert(flow_id.to_owned(), request_mutex.clone());

            let mut request_guard = request_mutex.lock().await;
            drop(map);

            return match self.fetch_state(flow_id, room_id).await {
                Ok(state) => {
                    debug!(?state, "Computed the verification state");

                    self.states.lock().await.insert(flow_id.to_owned(), state);
                    self.inflight.lock().await.remove(flow_id);

                    Ok(state)
                }
                Err(e) => {
                    error!(error = ?e, "Failed computing the verification state");

                    *request_guard = Err(());
                    self.inflight.lock().await.remove(flow_id);

                    Err(e.into())
                }
            };
        }
    }

    async fn fetch_state(
        &self,
        flow_id: &EventId,
        room_id: &RoomId,
    ) -> Result<VerificationState, TransportError> {
        let mut events = self.relations.related_events(room_id, flow_id).await?;

        if self.sort_by_timestamp {
            events.sort_by_key(|e| e.origin_server_ts);
        }

        Ok(resolve_related_events(&self.own_user_id, &events))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        future::pending,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use ruma::{
        event_id, room_id, EventId, MilliSecondsSinceUnixEpoch, OwnedUserId, RoomId, UInt,
        UserId,
    };
    use serde_json::{json, Value};
    use tokio::{join, sync::Mutex, task::yield_now, time::timeout};

    use super::{
        resolve_related_events, RelatedEvent, RelationsSource, VerificationState,
        VerificationStateResolver,
    };
    use crate::{
        engine::testing::{alice_id, bob_id},
        error::{ResolverError, TransportError},
    };

    pub fn event(event_type: &str, sender: &UserId, ts: u32, content: Value) -> RelatedEvent {
        RelatedEvent {
            event_type: event_type.to_owned(),
            sender: sender.to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch(UInt::from(ts)),
            content,
        }
    }

    pub fn ready(ts: u32) -> RelatedEvent {
        event("m.key.verification.ready", bob_id(), ts, json!({}))
    }

    pub fn done(ts: u32) -> RelatedEvent {
        event("m.key.verification.done", bob_id(), ts, json!({}))
    }

    pub fn cancel(sender: &UserId, code: &str, ts: u32) -> RelatedEvent {
        event(
            "m.key.verification.cancel",
            sender,
            ts,
            json!({ "code": code, "reason": "The user cancelled the verification." }),
        )
    }

    /// A relations transport that counts how often it was queried.
    #[derive(Debug, Default)]
    pub struct MockRelations {
        pub events: Mutex<Vec<RelatedEvent>>,
        pub queries: AtomicUsize,
        pub fail: AtomicBool,
        pub stall: AtomicBool,
    }

    impl MockRelations {
        pub fn with_events(events: Vec<RelatedEvent>) -> Arc<Self> {
            Arc::new(Self { events: Mutex::new(events), ..Default::default() })
        }
    }

    #[async_trait]
    impl RelationsSource for MockRelations {
        async fn related_events(
            &self,
            _: &RoomId,
            _: &EventId,
        ) -> Result<Vec<RelatedEvent>, TransportError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            yield_now().await;

            if self.stall.load(Ordering::SeqCst) {
                pending::<()>().await;
            }

            if self.fail.load(Ordering::SeqCst) {
                Err(TransportError("the homeserver is unreachable".to_owned()))
            } else {
                Ok(self.events.lock().await.clone())
            }
        }
    }

    fn resolve(events: &[RelatedEvent]) -> VerificationState {
        resolve_related_events(alice_id(), events)
    }

    fn resolver(relations: Arc<MockRelations>) -> VerificationStateResolver {
        let own_user_id: OwnedUserId = alice_id().to_owned();
        VerificationStateResolver::new(own_user_id, relations, false)
    }

    #[test]
    fn test_fold_precedence() {
        assert_eq!(resolve(&[]), VerificationState::TransactionStarted);
        assert_eq!(resolve(&[ready(1)]), VerificationState::RequestReady);
        assert_eq!(resolve(&[done(1)]), VerificationState::Verified);
        assert_eq!(
            resolve(&[ready(1), cancel(alice_id(), "m.user", 2)]),
            VerificationState::TransactionCancelledByMe
        );
        assert_eq!(
            resolve(&[cancel(bob_id(), "m.user", 1)]),
            VerificationState::TransactionCancelled
        );
        assert_eq!(
            resolve(&[cancel(bob_id(), "m.timeout", 1)]),
            VerificationState::RequestExpired
        );
        assert_eq!(
            resolve(&[cancel(bob_id(), "m.key_mismatch", 1)]),
            VerificationState::TransactionFailed
        );
        assert_eq!(
            resolve(&[event("m.key.verification.cancel", bob_id(), 1, json!({}))]),
            VerificationState::TransactionFailed
        );
    }

    #[test]
    fn test_terminal_events_short_circuit() {
        assert_eq!(resolve(&[done(1), cancel(bob_id(), "m.user", 2)]), VerificationState::Verified);
        assert_eq!(
            resolve(&[cancel(bob_id(), "m.timeout", 1), ready(2), done(3)]),
            VerificationState::RequestExpired
        );
    }

    #[test]
    fn test_unrelated_events_are_ignored() {
        let events = [
            event("m.key.verification.key", bob_id(), 1, json!({})),
            ready(2),
            event("m.key.verification.mac", bob_id(), 3, json!({})),
        ];

        assert_eq!(resolve(&events), VerificationState::RequestReady);
    }

    #[tokio::test]
    async fn test_results_are_memoized() {
        let relations = MockRelations::with_events(vec![ready(1)]);
        let resolver = resolver(relations.clone());
        let flow_id = event_id!("$request");
        let room_id = room_id!("!123:matrix.org");

        assert_eq!(resolver.resolve(flow_id, room_id).await, Ok(VerificationState::RequestReady));

        // New events don't change an already resolved flow.
        relations.events.lock().await.push(done(2));
        assert_eq!(resolver.resolve(flow_id, room_id).await, Ok(VerificationState::RequestReady));
        assert_eq!(relations.queries.load(Ordering::SeqCst), 1);

        assert_eq!(
            resolver.resolve(event_id!("$other"), room_id).await.unwrap(),
            VerificationState::Verified
        );
        assert_eq!(relations.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_share_one_query() {
        let relations = MockRelations::with_events(vec![done(1)]);
        let resolver = resolver(relations.clone());
        let flow_id = event_id!("$request");
        let room_id = room_id!("!123:matrix.org");

        let (first, second) =
            join!(resolver.resolve(flow_id, room_id), resolver.resolve(flow_id, room_id));

        assert_eq!(first.unwrap(), VerificationState::Verified);
        assert_eq!(second.unwrap(), VerificationState::Verified);
        assert_eq!(relations.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_shared_but_not_cached() {
        let relations = MockRelations::with_events(vec![done(1)]);
        relations.fail.store(true, Ordering::SeqCst);
        let resolver = resolver(relations.clone());
        let flow_id = event_id!("$request");
        let room_id = room_id!("!123:matrix.org");

        let (first, second) =
            join!(resolver.resolve(flow_id, room_id), resolver.resolve(flow_id, room_id));

        assert_matches!(first, Err(ResolverError::Transport(_)));
        assert_matches!(second, Err(ResolverError::ConcurrentResolutionFailed));
        assert_eq!(relations.queries.load(Ordering::SeqCst), 1);

        relations.fail.store(false, Ordering::SeqCst);
        assert_eq!(resolver.resolve(flow_id, room_id).await.unwrap(), VerificationState::Verified);
        assert_eq!(relations.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_resolution_does_not_block_the_flow() {
        let relations = MockRelations::with_events(vec![done(1)]);
        relations.stall.store(true, Ordering::SeqCst);
        let resolver = resolver(relations.clone());
        let flow_id = event_id!("$request");
        let room_id = room_id!("!123:matrix.org");

        let result = timeout(Duration::from_millis(10), resolver.resolve(flow_id, room_id)).await;
        assert!(result.is_err(), "the stalled resolution should time out");

        relations.stall.store(false, Ordering::SeqCst);
        assert_eq!(resolver.resolve(flow_id, room_id).await.unwrap(), VerificationState::Verified);
        assert_eq!(relations.queries.load(Ordering::SeqCst), 2);

        // The result of the retry is cached like any other.
        assert_eq!(resolver.resolve(flow_id, room_id).await.unwrap(), VerificationState::Verified);
        assert_eq!(relations.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_waiters_take_over_a_dropped_resolution() {
        let relations = MockRelations::with_events(vec![ready(1)]);
        relations.stall.store(true, Ordering::SeqCst);
        let resolver = resolver(relations.clone());
        let flow_id = event_id!("$request");
        let room_id = room_id!("!123:matrix.org");

        let (first, second) = join!(
            timeout(Duration::from_millis(10), resolver.resolve(flow_id, room_id)),
            async {
                // Let the first call start the query before we wait for it.
                yield_now().await;
                yield_now().await;
                relations.stall.store(false, Ordering::SeqCst);
                resolver.resolve(flow_id, room_id).await
            },
        );

        assert!(first.is_err());
        assert_eq!(second.unwrap(), VerificationState::RequestReady);
        assert_eq!(relations.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_out_of_order_events_can_be_sorted() {
        let events = vec![cancel(bob_id(), "m.user", 20), done(10)];
        let room_id = room_id!("!123:matrix.org");
        let flow_id = event_id!("$request");

        let unsorted = resolver(MockRelations::with_events(events.clone()));
        assert_eq!(
            unsorted.resolve(flow_id, room_id).await.unwrap(),
            VerificationState::TransactionCancelled
        );

        let sorted = VerificationStateResolver::new(
            alice_id().to_owned(),
            MockRelations::with_events(events),
            true,
        );
        assert_eq!(sorted.resolve(flow_id, room_id).await.unwrap(), VerificationState::Verified);
    }
}
