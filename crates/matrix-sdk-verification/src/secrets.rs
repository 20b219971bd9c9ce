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
use tracing::{debug, instrument};
use vodozemac::{Ed25519PublicKey, Ed25519SecretKey};

use crate::error::SecretImportError;

/// The public cross-signing keys of our own identity, as uploaded to the
/// server.
///
/// Private cross-signing keys we receive from secret storage or from one of
/// our other devices are checked against these before they are imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossSigningSecrets {
    master_key: Ed25519PublicKey,
    self_signing_key: Ed25519PublicKey,
    user_signing_key: Ed25519PublicKey,
}

impl CrossSigningSecrets {
    /// Create a new checker out of the public cross-signing keys.
    pub fn new(
        master_key: Ed25519PublicKey,
        self_signing_key: Ed25519PublicKey,
        user_signing_key: Ed25519PublicKey,
    ) -> Self {
        Self { master_key, self_signing_key, user_signing_key }
    }

    /// Check that the private key stored in the given secret belongs to the
    /// public key of our identity.
    #[instrument(skip_all, fields(name = name.as_str()))]
    pub fn check_secret(&self, name: &SecretName, secret: &str) -> Result<(), SecretImportError> {
        let expected = match name {
            SecretName::CrossSigningMasterKey => self.master_key,
            SecretName::CrossSigningSelfSigningKey => self.self_signing_key,
            SecretName::CrossSigningUserSigningKey => self.user_signing_key,
            _ => return Err(SecretImportError::UnsupportedSecret(name.clone())),
        };

        Self::check(name, secret, expected)
    }

    /// Check that the base64 encoded, unexpanded, Ed25519 private key
    /// `secret` is the private half of `expected_public_key`.
    pub fn check(
        name: &SecretName,
        secret: &str,
        expected_public_key: Ed25519PublicKey,
    ) -> Result<(), SecretImportError> {
        let key = Ed25519SecretKey::from_base64(secret)
            .map_err(|error| SecretImportError::Key { name: name.clone(), error })?;

        if key.public_key() == expected_public_key {
            debug!("The secret matches the public key");
            Ok(())
        } else {
            Err(SecretImportError::SecretDoesNotMatch { name: name.clone() })
        }
    }
}
