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

//! Normalized trust levels for users and devices.
//!
//! The crypto store tracks trust as a couple of raw flags per device and a
//! single verified flag per user identity. The types in this module turn those
//! flags into the trust model clients display, together with aggregate
//! summaries over a set of users, e.g. the members of a room.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

use crate::{error::CryptoStoreError, store::DeviceData};

/// The local trust state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified = 0,
    /// The device been blacklisted from communicating.
    BlackListed = 1,
    /// The trust state of the device is being ignored.
    Ignored = 2,
    /// The trust state is unset.
    Unset = 3,
}

impl From<i64> for LocalTrust {
    fn from(state: i64) -> Self {
        match state {
            0 => LocalTrust::Verified,
            1 => LocalTrust::BlackListed,
            2 => LocalTrust::Ignored,
            _ => LocalTrust::Unset,
        }
    }
}

/// How the local user judged a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalVerificationStatus {
    /// The device was never looked at.
    Unset,
    /// The device was verified by us.
    Verified,
    /// We looked at the device and decided not to trust it, without blocking
    /// it.
    Unverified,
    /// The device is blocked from receiving room keys.
    Blocked,
}

impl From<LocalTrust> for LocalVerificationStatus {
    fn from(trust: LocalTrust) -> Self {
        match trust {
            LocalTrust::Verified => Self::Verified,
            LocalTrust::BlackListed => Self::Blocked,
            LocalTrust::Ignored => Self::Unverified,
            LocalTrust::Unset => Self::Unset,
        }
    }
}

/// The trust level of a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTrustLevel {
    /// The local verification status of the device.
    pub local_verification_status: LocalVerificationStatus,
    /// Is the device signed by a verified cross-signing identity.
    pub cross_signing_verified: bool,
}

impl DeviceTrustLevel {
    /// Compute the trust level of the given device.
    pub fn for_device(device: &DeviceData) -> Self {
        Self {
            local_verification_status: device.local_trust_state().into(),
            cross_signing_verified: device.is_cross_signing_trusted(),
        }
    }

    /// Is the device trusted either locally or through cross-signing.
    pub fn is_verified(&self) -> bool {
        self.is_locally_verified() || self.cross_signing_verified
    }

    /// Was the device verified by us directly.
    pub fn is_locally_verified(&self) -> bool {
        self.local_verification_status == LocalVerificationStatus::Verified
    }

    /// Is the device blocked.
    pub fn is_blocked(&self) -> bool {
        self.local_verification_status == LocalVerificationStatus::Blocked
    }
}

/// The trust level of a user identity.
///
/// Identities only carry a single verified flag, both fields are always
/// equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTrustLevel {
    /// Is the identity verified through cross-signing.
    pub cross_signing_verified: bool,
    /// Was the identity verified by us.
    pub locally_verified: bool,
}

impl UserTrustLevel {
    /// Create a trust level out of the verified flag of an identity.
    pub fn from_verified(verified: bool) -> Self {
        Self { cross_signing_verified: verified, locally_verified: verified }
    }

    /// Is the identity verified.
    pub fn is_verified(&self) -> bool {
        self.cross_signing_verified && self.locally_verified
    }
}

/// Progress of trust over a population of users or devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "TrustSummaryHelper")]
pub struct TrustSummary {
    trusted_count: usize,
    total_count: usize,
}

#[derive(Deserialize)]
struct TrustSummaryHelper {
    trusted_count: usize,
    total_count: usize,
}

impl From<TrustSummaryHelper> for TrustSummary {
    fn from(value: TrustSummaryHelper) -> Self {
        Self::new(value.trusted_count, value.total_count)
    }
}

impl TrustSummary {
    /// Create a new summary.
    ///
    /// The total is clamped so it's never smaller than the trusted count.
    pub fn new(trusted_count: usize, total_count: usize) -> Self {
        Self { trusted_count, total_count: total_count.max(trusted_count) }
    }

    /// Summarize a set of trust flags, one per user or device.
    pub fn from_flags(flags: impl IntoIterator<Item = bool>) -> Self {
        let (trusted, total) = flags
            .into_iter()
            .fold((0, 0), |(trusted, total), flag| (trusted + usize::from(flag), total + 1));

        Self::new(trusted, total)
    }

    /// The number of trusted entries.
    pub fn trusted_count(&self) -> usize {
        self.trusted_count
    }

    /// The number of entries.
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    /// Are all the entries trusted, trivially true for an empty population.
    pub fn all_trusted(&self) -> bool {
        self.trusted_count == self.total_count
    }
}

/// Trust summaries for a set of users and all of their devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsersTrustLevelSummary {
    /// How many of the users are verified.
    pub users_trust: TrustSummary,
    /// How many of the devices of those users are verified.
    pub devices_trust: TrustSummary,
}

/// Source of the verified flag of user identities.
#[async_trait]
pub trait UserIdentitySource: Debug + Send + Sync {
    /// Is the identity of the given user verified.
    ///
    /// Users without a known identity are not verified.
    async fn is_user_verified(&self, user_id: &UserId) -> Result<bool, CryptoStoreError>;
}

/// Source of the devices we know about.
#[async_trait]
pub trait DevicesSource: Debug + Send + Sync {
    /// Get all the known devices of the given user.
    async fn user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceData>, CryptoStoreError>;

    /// Get a single device of the given user.
    async fn device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>, CryptoStoreError>;
}

/// Computes trust levels out of the identities and devices of the store.
#[derive(Debug, Clone)]
pub struct TrustLevelSource {
    identities: Arc<dyn UserIdentitySource>,
    devices: Arc<dyn DevicesSource>,
}

impl TrustLevelSource {
    /// Create a new `TrustLevelSource`.
    pub fn new(identities: Arc<dyn UserIdentitySource>, devices: Arc<dyn DevicesSource>) -> Self {
        Self { identities, devices }
    }

    /// Get the trust level of the given user.
    pub async fn user_trust_level(
        &self,
        user_id: &UserId,
    ) -> Result<UserTrustLevel, CryptoStoreError> {
        Ok(UserTrustLevel::from_verified(self.identities.is_user_verified(user_id).await?))
    }

    /// Get the trust level of a single device, `None` if the device is
    /// unknown.
    pub async fn device_trust_level(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceTrustLevel>, CryptoStoreError> {
        let device = self.devices.device(user_id, device_id).await?;
        Ok(device.as_ref().map(DeviceTrustLevel::for_device))
    }

    /// Summarize the trust of the given users and of all their devices.
    #[instrument(skip_all, fields(user_count = user_ids.len()))]
    pub async fn trust_level_summary(
        &self,
        user_ids: &[OwnedUserId],
    ) -> Result<UsersTrustLevelSummary, CryptoStoreError> {
        let mut users = Vec::with_capacity(user_ids.len());
        let mut devices = Vec::new();

        for user_id in user_ids {
            users.push(self.identities.is_user_verified(user_id).await?);
            devices.extend(
                self.devices
                    .user_devices(user_id)
                    .await?
                    .iter()
                    .map(|d| d.is_cross_signing_trusted() || d.is_locally_trusted()),
            );
        }

        let summary = UsersTrustLevelSummary {
            users_trust: TrustSummary::from_flags(users),
            devices_trust: TrustSummary::from_flags(devices),
        };

        trace!(?summary, "Computed the trust level summary");

        Ok(summary)
    }
}
