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

use std::{collections::BTreeMap, sync::Arc};

use futures_core::Stream;
use ruma::{
    events::key::verification::VerificationMethod, EventId, OwnedDeviceId, RoomId, UserId,
};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, error, instrument, trace};

use super::{
    qrcode::{QrIds, QrUpdate, QrVerification},
    requests::{VerificationRequest, VerificationRequestUpdate},
    sas::{SasUpdate, SasVerification},
    state_resolver::{RelationsSource, VerificationState, VerificationStateResolver},
    FlowId, Verification,
};
use crate::{
    config::VerificationSettings,
    engine::{CryptoEngine, VerificationInfo, VerificationRequestInfo, VerificationTarget},
    error::{ResolverError, VerificationError, VerificationResult},
};

/// Notifications about the flows a [`VerificationManager`] tracks.
#[derive(Debug, Clone)]
pub enum VerificationManagerUpdate {
    /// The other side sent us a new verification request.
    NewRequest(VerificationRequest),
    /// The state of a tracked request changed.
    RequestChanged(VerificationRequest),
    /// The request reached a final state and is no longer tracked.
    RequestRemoved(VerificationRequest),
    /// The other side started a new verification flow.
    NewTransaction(Verification),
    /// The state of a tracked verification flow changed.
    TransactionChanged(Verification),
    /// The verification flow reached a final state and is no longer tracked.
    TransactionRemoved(Verification),
}

/// The outcome of looking up a verification flow.
#[derive(Debug, Clone)]
pub enum KeyVerification {
    /// The request is still tracked, its state can be observed.
    Request(VerificationRequest),
    /// The flow finished, its state was reconstructed from the room history.
    Archived(VerificationState),
}

const UPDATE_CHANNEL_CAPACITY: usize = 100;

/// Owns all the verification requests and flows of the client.
///
/// Requests and flows are keyed by their flow id. The crypto engine reports
/// progress through the `receive_*_update` methods, flows that reach a final
/// state are dropped from the manager after the final update was broadcast.
/// Finished requests are remembered in their final state, looking them up
/// again never brings them back to life.
#[derive(Debug, Clone)]
pub struct VerificationManager {
    engine: Arc<dyn CryptoEngine>,
    settings: Arc<VerificationSettings>,
    resolver: Arc<VerificationStateResolver>,
    requests: Arc<RwLock<BTreeMap<String, VerificationRequest>>>,
    finished_requests: Arc<RwLock<BTreeMap<String, VerificationRequest>>>,
    transactions: Arc<RwLock<BTreeMap<String, Verification>>>,
    updates: broadcast::Sender<VerificationManagerUpdate>,
}

impl VerificationManager {
    /// Create a new manager.
    ///
    /// `relations` is used to reconstruct the state of in-room flows that are
    /// no longer tracked.
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        relations: Arc<dyn RelationsSource>,
        settings: VerificationSettings,
    ) -> Self {
        let resolver = VerificationStateResolver::new(
            engine.user_id().to_owned(),
            relations,
            settings.sort_relations_by_timestamp,
        );
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            engine,
            settings: settings.into(),
            resolver: resolver.into(),
            requests: Default::default(),
            finished_requests: Default::default(),
            transactions: Default::default(),
            updates,
        }
    }

    /// The settings of the manager.
    pub fn settings(&self) -> &VerificationSettings {
        &self.settings
    }

    /// Listen for changes of the tracked requests and flows.
    pub fn updates(
        &self,
    ) -> impl Stream<Item = Result<VerificationManagerUpdate, BroadcastStreamRecvError>> {
        BroadcastStream::new(self.updates.subscribe())
    }

    /// All the verification requests that didn't finish yet.
    pub async fn pending_requests(&self) -> Vec<VerificationRequest> {
        self.requests.read().await.values().cloned().collect()
    }

    /// All the verification flows that didn't finish yet.
    pub async fn transactions(&self) -> Vec<Verification> {
        self.transactions.read().await.values().cloned().collect()
    }

    /// Get a tracked verification request.
    pub async fn get_request(&self, flow_id: &str) -> Option<VerificationRequest> {
        self.requests.read().await.get(flow_id).cloned()
    }

    /// Get a tracked or finished verification request.
    async fn known_request(&self, flow_id: &str) -> Option<VerificationRequest> {
        if let Some(request) = self.get_request(flow_id).await {
            Some(request)
        } else {
            self.finished_requests.read().await.get(flow_id).cloned()
        }
    }

    /// Get a tracked verification flow.
    pub async fn get_verification(&self, flow_id: &str) -> Option<Verification> {
        self.transactions.read().await.get(flow_id).cloned()
    }

    /// Request a verification over to-device messages.
    ///
    /// Verifying our own user sends the request to all of our devices,
    /// otherwise the first of `device_ids` is used.
    #[instrument(skip(self, device_ids, methods))]
    pub async fn request_verification_to_device(
        &self,
        user_id: &UserId,
        device_ids: &[OwnedDeviceId],
        methods: Option<Vec<VerificationMethod>>,
    ) -> VerificationResult<VerificationRequest> {
        let target = if user_id == self.engine.user_id() {
            debug!("Requesting a self-verification");
            VerificationTarget::OwnDevices
        } else if let Some(device_id) = device_ids.first() {
            if device_ids.len() > 1 {
                error!(
                    device_count = device_ids.len(),
                    "Verifying more than one device at once is not supported"
                );
            }

            VerificationTarget::Device { user_id: user_id.to_owned(), device_id: device_id.clone() }
        } else {
            return Err(VerificationError::MissingDeviceId);
        };

        self.request_verification(target, methods).await
    }

    /// Request a verification of the given user inside of a room.
    ///
    /// `event_id` is the id of the `m.key.verification.request` message that
    /// was sent into the room.
    #[instrument(skip(self, methods))]
    pub async fn request_verification_in_room(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        event_id: &EventId,
        methods: Option<Vec<VerificationMethod>>,
    ) -> VerificationResult<VerificationRequest> {
        let target = VerificationTarget::Room {
            user_id: user_id.to_owned(),
            room_id: room_id.to_owned(),
            event_id: event_id.to_owned(),
        };

        self.request_verification(target, methods).await
    }

    async fn request_verification(
        &self,
        target: VerificationTarget,
        methods: Option<Vec<VerificationMethod>>,
    ) -> VerificationResult<VerificationRequest> {
        let methods = methods.unwrap_or_else(|| self.settings.supported_methods.clone());

        let result = self
            .engine
            .request_verification(&target, &methods)
            .await?
            .ok_or(VerificationError::CannotRequestVerification)?;

        if let Some(request) = result.request {
            self.engine.send_outgoing_request(request).await?;
        }

        let request = self.add_request(result.verification, false).await;
        debug!(flow_id = request.flow_id().as_str(), "Sent out a verification request");

        Ok(request)
    }

    /// Start tracking a verification request the other side sent us.
    #[instrument(skip(self))]
    pub async fn handle_incoming_request(
        &self,
        sender: &UserId,
        flow_id: &str,
    ) -> Option<VerificationRequest> {
        if let Some(request) = self.known_request(flow_id).await {
            debug!(state = ?request.state(), "The verification request is already known");
            return Some(request);
        }

        let Some(info) = self.engine.get_verification_request(sender, flow_id) else {
            error!("The crypto engine doesn't know about the verification request");
            return None;
        };

        debug!("Tracking a new verification request");

        Some(self.add_request(info, true).await)
    }

    /// Start tracking a verification flow the other side started.
    ///
    /// SAS flows that belong to a tracked request are accepted right away if
    /// [`VerificationSettings::auto_accept_sas_for_known_requests`] is set.
    #[instrument(skip(self))]
    pub async fn handle_incoming_verification(
        &self,
        sender: &UserId,
        flow_id: &str,
    ) -> Option<Verification> {
        let Some(info) = self.engine.get_verification(sender, flow_id) else {
            error!("The crypto engine doesn't know about the verification flow");
            return None;
        };

        match info {
            VerificationInfo::Sas(info) => {
                debug!("Tracking a new SAS verification");

                let sas = SasVerification::new(self.engine.clone(), info);
                self.add_transaction(sas.clone().into(), true).await;

                if self.settings.auto_accept_sas_for_known_requests
                    && self.requests.read().await.contains_key(flow_id)
                {
                    debug!("Accepting a SAS verification that belongs to a known request");
                    sas.accept().await;
                }

                Some(sas.into())
            }
            VerificationInfo::Qr(info) => {
                if let Some(existing @ Verification::QrV1(_)) = self.get_verification(flow_id).await
                {
                    // We scanned the code of the other side while they were
                    // showing ours, the scanned flow takes over.
                    debug!("Updating an existing QR code verification");
                    Some(existing)
                } else {
                    debug!("Tracking a new QR code verification");

                    let qr: Verification = QrVerification::new(self.engine.clone(), info).into();
                    self.add_transaction(qr.clone(), false).await;

                    Some(qr)
                }
            }
        }
    }

    /// Transition a tracked request into a SAS verification.
    #[instrument(skip_all, fields(flow_id = request.flow_id().as_str()))]
    pub async fn begin_sas(
        &self,
        request: &VerificationRequest,
    ) -> VerificationResult<SasVerification> {
        let sas = request.start_sas().await?;
        self.add_transaction(sas.clone().into(), false).await;

        Ok(sas)
    }

    /// Get the QR code verification of a tracked request, starting one if
    /// needed.
    ///
    /// If the crypto engine can't start a QR code flow, because the other
    /// device can't scan codes, a flow is still returned, we might be able to
    /// scan the code of the other side.
    #[instrument(skip(self))]
    pub async fn qr_code_transaction(&self, flow_id: &str) -> Option<QrVerification> {
        if let Some(Verification::QrV1(qr)) = self.get_verification(flow_id).await {
            return Some(qr);
        }

        let Some(request) = self.get_request(flow_id).await else {
            error!("There is no pending verification request");
            return None;
        };

        let qr = match request.start_qr() {
            Ok(qr) => qr,
            Err(e) => {
                debug!(error = ?e, "Adding a placeholder QR code verification");

                let ids = QrIds {
                    flow_id: request.flow_id().clone(),
                    other_user_id: request.other_user().to_owned(),
                    we_started: request.we_started(),
                };

                QrVerification::with_ids(self.engine.clone(), ids, request.other_device_id())
            }
        };

        self.add_transaction(qr.clone().into(), false).await;

        Some(qr)
    }

    /// Stop tracking a QR code verification.
    pub async fn remove_qr_code_transaction(&self, flow_id: &str) {
        let mut transactions = self.transactions.write().await;

        if matches!(transactions.get(flow_id), Some(Verification::QrV1(_))) {
            transactions.remove(flow_id);
            debug!(flow_id, "Removed the QR code verification");
        }
    }

    /// Look up the verification flow the given event belongs to.
    ///
    /// Flows that are no longer tracked, neither by us nor by the crypto
    /// engine, finished a while ago. Their final state is reconstructed from
    /// the events related to the request event.
    #[instrument(skip(self))]
    pub async fn key_verification(
        &self,
        sender: &UserId,
        flow_id: &EventId,
        room_id: &RoomId,
    ) -> Result<KeyVerification, ResolverError> {
        if let Some(request) = self.known_request(flow_id.as_str()).await {
            debug!(state = ?request.state(), "Using the known request");
            return Ok(KeyVerification::Request(request));
        }

        if let Some(info) = self.engine.get_verification_request(sender, flow_id.as_str()) {
            debug!("Using the request of the crypto engine");
            return Ok(KeyVerification::Request(self.add_request(info, false).await));
        }

        debug!("Computing the state of an archived request");

        Ok(KeyVerification::Archived(self.resolver.resolve(flow_id, room_id).await?))
    }

    /// Apply a request update reported by the crypto engine.
    pub async fn receive_request_update(
        &self,
        flow_id: &str,
        update: VerificationRequestUpdate,
    ) -> VerificationResult<()> {
        let request = self
            .get_request(flow_id)
            .await
            .ok_or_else(|| VerificationError::UnknownFlow(flow_id.to_owned()))?;

        if !request.apply_update(update) {
            return Ok(());
        }

        self.notify(VerificationManagerUpdate::RequestChanged(request.clone()));

        if request.state().is_terminal() {
            self.requests.write().await.remove(flow_id);
            self.finished_requests.write().await.insert(flow_id.to_owned(), request.clone());
            trace!(flow_id, "Removed a finished verification request");
            self.notify(VerificationManagerUpdate::RequestRemoved(request));
        }

        Ok(())
    }

    /// Apply a SAS update reported by the crypto engine.
    pub async fn receive_sas_update(
        &self,
        flow_id: &str,
        update: SasUpdate,
    ) -> VerificationResult<()> {
        let Some(Verification::SasV1(sas)) = self.get_verification(flow_id).await else {
            return Err(VerificationError::UnknownFlow(flow_id.to_owned()));
        };

        if sas.apply_update(update) {
            self.transaction_changed(sas.into()).await;
        }

        Ok(())
    }

    /// Apply a QR code update reported by the crypto engine.
    pub async fn receive_qr_update(
        &self,
        flow_id: &str,
        update: QrUpdate,
    ) -> VerificationResult<()> {
        let Some(Verification::QrV1(qr)) = self.get_verification(flow_id).await else {
            return Err(VerificationError::UnknownFlow(flow_id.to_owned()));
        };

        if qr.apply_update(update) {
            self.transaction_changed(qr.into()).await;
        }

        Ok(())
    }

    async fn transaction_changed(&self, verification: Verification) {
        self.notify(VerificationManagerUpdate::TransactionChanged(verification.clone()));

        if verification.is_terminal() {
            let flow_id = verification.flow_id().as_str();
            self.transactions.write().await.remove(flow_id);
            trace!(flow_id, "Removed a finished verification flow");
            self.notify(VerificationManagerUpdate::TransactionRemoved(verification));
        }
    }

    async fn add_request(
        &self,
        info: VerificationRequestInfo,
        notify: bool,
    ) -> VerificationRequest {
        let request = VerificationRequest::new(
            self.engine.clone(),
            info,
            self.settings.supported_methods.clone(),
        );

        let flow_id = request.flow_id().as_str().to_owned();

        if request.state().is_terminal() {
            debug!(
                flow_id = flow_id.as_str(),
                state = ?request.state(),
                "The verification request already finished, not tracking it"
            );
            self.finished_requests.write().await.insert(flow_id, request.clone());
            return request;
        }

        self.requests.write().await.insert(flow_id, request.clone());

        if notify {
            self.notify(VerificationManagerUpdate::NewRequest(request.clone()));
        }

        request
    }

    async fn add_transaction(&self, verification: Verification, notify: bool) {
        self.transactions
            .write()
            .await
            .insert(verification.flow_id().as_str().to_owned(), verification.clone());

        if notify {
            self.notify(VerificationManagerUpdate::NewTransaction(verification));
        }
    }

    fn notify(&self, update: VerificationManagerUpdate) {
        // Nobody might be listening, that's fine.
        let _ = self.updates.send(update);
    }
}
