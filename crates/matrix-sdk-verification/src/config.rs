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

use std::time::Duration;

use ruma::events::key::verification::VerificationMethod;
use serde::{Deserialize, Serialize};

/// Settings for the verification machinery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    /// The methods we advertise when a request is accepted without explicit
    /// methods.
    pub supported_methods: Vec<VerificationMethod>,

    /// Sort the events related to a verification request by their server
    /// timestamp before the state of the request is resolved.
    pub sort_relations_by_timestamp: bool,

    /// Accept incoming SAS verifications which belong to a request we already
    /// track.
    pub auto_accept_sas_for_known_requests: bool,

    /// How long unrequested forwarded room keys, and the room invites that
    /// might make them acceptable, are kept around.
    pub unrequested_key_window: Duration,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            supported_methods: vec![
                VerificationMethod::SasV1,
                VerificationMethod::QrCodeShowV1,
                VerificationMethod::ReciprocateV1,
            ],
            sort_relations_by_timestamp: true,
            auto_accept_sas_for_known_requests: true,
            unrequested_key_window: Duration::from_secs(10 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ruma::events::key::verification::VerificationMethod;
    use serde_json::json;

    use super::VerificationSettings;

    #[test]
    fn test_partial_settings_use_defaults() {
        let settings: VerificationSettings = serde_json::from_value(json!({
            "supported_methods": ["m.sas.v1"],
            "sort_relations_by_timestamp": false,
        }))
        .unwrap();

        assert_eq!(settings.supported_methods, vec![VerificationMethod::SasV1]);
        assert!(!settings.sort_relations_by_timestamp);
        assert!(settings.auto_accept_sas_for_known_requests);
        assert_eq!(settings.unrequested_key_window, Duration::from_secs(600));
    }
}
