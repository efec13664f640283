#![forbid(unsafe_code)]

use std::fmt;

use sha2::{Digest, Sha256};
use trialgate_kernel_contracts::trial::{
    TrialStorageKeys, RATE_LIMIT_KEY_PREFIX, TRIAL_HW_KEY_PREFIX, TRIAL_IP_KEY_PREFIX,
};
use trialgate_kernel_contracts::ContractViolation;

pub const DEFAULT_FINGERPRINT_SALT: &str = "FTIR_GBM_2025_SECURE";

/// Lowercase hex SHA-256 over the UTF-8 bytes of `identifier + salt`.
pub fn hash_identifier(identifier: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Rate-limit markers are keyed by the raw client address.
pub fn rate_limit_key(client_address: &str) -> String {
    format!("{RATE_LIMIT_KEY_PREFIX}{client_address}")
}

#[derive(Clone)]
pub struct IdentityHasher {
    salt: String,
}

impl IdentityHasher {
    pub fn new(salt: impl Into<String>) -> Result<Self, ContractViolation> {
        let salt = salt.into();
        if salt.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "identity_hasher.salt",
                reason: "must be non-empty",
            });
        }
        Ok(Self { salt })
    }

    pub fn hash_identifier(&self, identifier: &str) -> String {
        hash_identifier(identifier, &self.salt)
    }

    pub fn storage_keys(
        &self,
        client_address: &str,
        hardware_fingerprint: &str,
    ) -> Result<TrialStorageKeys, ContractViolation> {
        let ip_digest = self.hash_identifier(&format!("ip:{client_address}"));
        let hw_digest = self.hash_identifier(&format!("hw:{hardware_fingerprint}"));
        TrialStorageKeys::v1(
            format!("{TRIAL_IP_KEY_PREFIX}{ip_digest}"),
            format!("{TRIAL_HW_KEY_PREFIX}{hw_digest}"),
        )
    }
}

impl fmt::Debug for IdentityHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityHasher")
            .field("salt", &"<redacted>")
            .finish()
    }
}
