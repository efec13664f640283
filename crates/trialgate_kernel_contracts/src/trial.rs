#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, UnixTimeMs, Validate};

pub const MAX_MOVEMENTS: u32 = 10;
pub const MIN_MOVEMENT_COST: u32 = 1;
pub const MAX_MOVEMENT_COST: u32 = 10;

pub const DEFAULT_HARDWARE_FINGERPRINT: &str = "default";
pub const UNKNOWN_CLIENT_ADDRESS: &str = "unknown";
pub const FINGERPRINT_SNAPSHOT_CHARS: usize = 16;

pub const TRIAL_RECORD_TTL_SECS: u64 = 60 * 60 * 24 * 365;
pub const RATE_LIMIT_MARKER_TTL_SECS: u64 = 60;
pub const DEFAULT_RATE_LIMIT_MS: u64 = 1_000;

pub const TRIAL_IP_KEY_PREFIX: &str = "trial:ip:";
pub const TRIAL_HW_KEY_PREFIX: &str = "trial:hw:";
pub const RATE_LIMIT_KEY_PREFIX: &str = "ratelimit:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrialAction {
    Check,
    Use,
}

impl TrialAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "check" => Some(TrialAction::Check),
            "use" => Some(TrialAction::Use),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrialAction::Check => "check",
            TrialAction::Use => "use",
        }
    }
}

/// Number of movements a single `use` consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MovementCost(u32);

impl MovementCost {
    pub const DEFAULT: MovementCost = MovementCost(MIN_MOVEMENT_COST);

    pub fn v1(units: u32) -> Result<Self, ContractViolation> {
        let cost = Self(units);
        cost.validate()?;
        Ok(cost)
    }

    pub fn units(self) -> u32 {
        self.0
    }
}

impl Default for MovementCost {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Validate for MovementCost {
    fn validate(&self) -> Result<(), ContractViolation> {
        if !(MIN_MOVEMENT_COST..=MAX_MOVEMENT_COST).contains(&self.0) {
            return Err(ContractViolation::InvalidRange {
                field: "movement_cost",
                min: MIN_MOVEMENT_COST as u64,
                max: MAX_MOVEMENT_COST as u64,
                got: self.0 as u64,
            });
        }
        Ok(())
    }
}

/// Persisted quota state for one client identity. The same record is written under both the
/// address-derived and the fingerprint-derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialRecord {
    pub remaining: u32,
    pub created: u64,
    pub last_access: u64,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(rename = "clientIP", default)]
    pub client_ip: String,
    #[serde(default)]
    pub hw_fp: String,
}

impl TrialRecord {
    pub fn v1(
        remaining: u32,
        created: UnixTimeMs,
        last_access: UnixTimeMs,
        usage_count: u64,
        client_ip: String,
        hardware_fingerprint: &str,
    ) -> Result<Self, ContractViolation> {
        let record = Self {
            remaining,
            created: created.0,
            last_access: last_access.0,
            usage_count,
            client_ip,
            hw_fp: fingerprint_snapshot(hardware_fingerprint),
        };
        record.validate()?;
        Ok(record)
    }

    pub fn created_at(&self) -> UnixTimeMs {
        UnixTimeMs(self.created)
    }
}

impl Validate for TrialRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.remaining > MAX_MOVEMENTS {
            return Err(ContractViolation::InvalidRange {
                field: "trial_record.remaining",
                min: 0,
                max: MAX_MOVEMENTS as u64,
                got: self.remaining as u64,
            });
        }
        if self.created == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "trial_record.created",
                reason: "must be > 0",
            });
        }
        if self.last_access < self.created {
            return Err(ContractViolation::InvalidValue {
                field: "trial_record.last_access",
                reason: "must be >= created",
            });
        }
        if self.client_ip.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "trial_record.client_ip",
                reason: "must be non-empty",
            });
        }
        if self.hw_fp.chars().count() > FINGERPRINT_SNAPSHOT_CHARS {
            return Err(ContractViolation::InvalidValue {
                field: "trial_record.hw_fp",
                reason: "exceeds snapshot length",
            });
        }
        Ok(())
    }
}

/// The two storage keys one logical trial record lives under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialStorageKeys {
    pub ip_key: String,
    pub hw_key: String,
}

impl TrialStorageKeys {
    pub fn v1(ip_key: String, hw_key: String) -> Result<Self, ContractViolation> {
        let keys = Self { ip_key, hw_key };
        keys.validate()?;
        Ok(keys)
    }
}

impl Validate for TrialStorageKeys {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_storage_key("trial_storage_keys.ip_key", &self.ip_key, TRIAL_IP_KEY_PREFIX)?;
        validate_storage_key("trial_storage_keys.hw_key", &self.hw_key, TRIAL_HW_KEY_PREFIX)?;
        Ok(())
    }
}

pub fn fingerprint_snapshot(hardware_fingerprint: &str) -> String {
    hardware_fingerprint
        .chars()
        .take(FINGERPRINT_SNAPSHOT_CHARS)
        .collect()
}

fn validate_storage_key(
    field: &'static str,
    key: &str,
    prefix: &'static str,
) -> Result<(), ContractViolation> {
    let Some(digest) = key.strip_prefix(prefix) else {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must carry the trial key prefix",
        });
    };
    if digest.len() != 64 || !digest.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must end in a lowercase hex sha-256 digest",
        });
    }
    Ok(())
}
