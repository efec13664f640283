#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{debug, info};
use trialgate_engines::identity_hash::{IdentityHasher, DEFAULT_FINGERPRINT_SALT};
use trialgate_engines::trial_quota::{
    TrialObservation, TrialQuotaConfig, TrialQuotaRuntime, UsePlan,
};
use trialgate_kernel_contracts::trial::{
    MovementCost, TrialAction, TrialRecord, TrialStorageKeys, TRIAL_RECORD_TTL_SECS,
};
use trialgate_kernel_contracts::{ContractViolation, Validate};
use trialgate_storage::{TrialClock, TrialKvStore};

use crate::rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
use crate::TrialGateError;

/// Process-wide gate settings. Built once at startup and never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct TrialGateConfig {
    pub quota: TrialQuotaConfig,
    pub rate_limit: RateLimitConfig,
    pub fingerprint_salt: String,
    pub trial_record_ttl_secs: u64,
}

impl TrialGateConfig {
    pub fn mvp_v1() -> Self {
        Self {
            quota: TrialQuotaConfig::mvp_v1(),
            rate_limit: RateLimitConfig::mvp_v1(),
            fingerprint_salt: DEFAULT_FINGERPRINT_SALT.to_string(),
            trial_record_ttl_secs: TRIAL_RECORD_TTL_SECS,
        }
    }
}

impl Validate for TrialGateConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.quota.validate()?;
        self.rate_limit.validate()?;
        if self.fingerprint_salt.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "trial_gate_config.fingerprint_salt",
                reason: "must be non-empty",
            });
        }
        if self.trial_record_ttl_secs == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "trial_gate_config.trial_record_ttl_secs",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for TrialGateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialGateConfig")
            .field("quota", &self.quota)
            .field("rate_limit", &self.rate_limit)
            .field("fingerprint_salt", &"<redacted>")
            .field("trial_record_ttl_secs", &self.trial_record_ttl_secs)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialGateRequest {
    pub action: TrialAction,
    pub client_address: String,
    pub hardware_fingerprint: String,
    pub cost: MovementCost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialGateOutcome {
    Checked {
        remaining: u32,
        is_new: bool,
    },
    Used {
        remaining: u32,
        used: MovementCost,
        exhausted: bool,
    },
    /// Rejected for lack of quota; nothing was written.
    Exhausted {
        remaining: u32,
    },
    RateLimited {
        retry_after_ms: u64,
    },
}

/// Resolves both identity records, reconciles them into one effective quota and writes the
/// result back under both keys.
pub struct TrialGateRuntime {
    config: TrialGateConfig,
    quota: TrialQuotaRuntime,
    hasher: IdentityHasher,
    rate_limiter: RateLimiter,
    store: Arc<dyn TrialKvStore>,
    clock: Arc<dyn TrialClock>,
}

impl TrialGateRuntime {
    pub fn new(
        config: TrialGateConfig,
        store: Arc<dyn TrialKvStore>,
        clock: Arc<dyn TrialClock>,
    ) -> Result<Self, ContractViolation> {
        config.validate()?;
        let quota = TrialQuotaRuntime::new(config.quota)?;
        let hasher = IdentityHasher::new(config.fingerprint_salt.clone())?;
        let rate_limiter = RateLimiter::new(config.rate_limit, store.clone(), clock.clone())?;
        Ok(Self {
            config,
            quota,
            hasher,
            rate_limiter,
            store,
            clock,
        })
    }

    pub fn config(&self) -> &TrialGateConfig {
        &self.config
    }

    pub fn max_movements(&self) -> u32 {
        self.quota.max_movements()
    }

    pub async fn run(&self, req: &TrialGateRequest) -> Result<TrialGateOutcome, TrialGateError> {
        if req.action == TrialAction::Use {
            if let RateLimitDecision::Limited { retry_after_ms } =
                self.rate_limiter.check_rate_limit(&req.client_address).await?
            {
                return Ok(TrialGateOutcome::RateLimited { retry_after_ms });
            }
        }

        let keys = self
            .hasher
            .storage_keys(&req.client_address, &req.hardware_fingerprint)?;
        let observation = TrialObservation {
            client_address: req.client_address.clone(),
            hardware_fingerprint: req.hardware_fingerprint.clone(),
            now: self.clock.now_ms(),
        };
        match req.action {
            TrialAction::Check => self.check(&keys, &observation).await,
            TrialAction::Use => self.use_movements(&keys, req.cost, &observation).await,
        }
    }

    async fn check(
        &self,
        keys: &TrialStorageKeys,
        observation: &TrialObservation,
    ) -> Result<TrialGateOutcome, TrialGateError> {
        let (ip, hw) = self.load_records(keys).await?;
        let reconciled = self.quota.reconcile(ip.as_ref(), hw.as_ref());
        let record = self.quota.plan_check(&reconciled, observation)?;
        self.store_record(keys, &record).await?;
        debug!(
            remaining = reconciled.effective_remaining,
            is_new = reconciled.is_new,
            "trial check"
        );
        Ok(TrialGateOutcome::Checked {
            remaining: reconciled.effective_remaining,
            is_new: reconciled.is_new,
        })
    }

    async fn use_movements(
        &self,
        keys: &TrialStorageKeys,
        cost: MovementCost,
        observation: &TrialObservation,
    ) -> Result<TrialGateOutcome, TrialGateError> {
        let (ip, hw) = self.load_records(keys).await?;
        let reconciled = self.quota.reconcile(ip.as_ref(), hw.as_ref());
        match self.quota.plan_use(&reconciled, cost, observation)? {
            UsePlan::Exhausted { remaining } => {
                info!(remaining, cost = cost.units(), "trial exhausted");
                Ok(TrialGateOutcome::Exhausted { remaining })
            }
            UsePlan::Commit {
                record,
                used,
                exhausted,
            } => {
                self.store_record(keys, &record).await?;
                info!(
                    remaining = record.remaining,
                    used = used.units(),
                    usage_count = record.usage_count,
                    hw_fp = %record.hw_fp,
                    "trial movements used"
                );
                Ok(TrialGateOutcome::Used {
                    remaining: record.remaining,
                    used,
                    exhausted,
                })
            }
        }
    }

    async fn load_records(
        &self,
        keys: &TrialStorageKeys,
    ) -> Result<(Option<TrialRecord>, Option<TrialRecord>), TrialGateError> {
        let (ip_raw, hw_raw) = tokio::try_join!(
            self.store.get(&keys.ip_key),
            self.store.get(&keys.hw_key)
        )?;
        Ok((
            decode_record(&keys.ip_key, ip_raw)?,
            decode_record(&keys.hw_key, hw_raw)?,
        ))
    }

    async fn store_record(
        &self,
        keys: &TrialStorageKeys,
        record: &TrialRecord,
    ) -> Result<(), TrialGateError> {
        record.validate()?;
        let encoded = serde_json::to_string(record).map_err(TrialGateError::RecordEncode)?;
        let ttl = self.config.trial_record_ttl_secs;
        tokio::try_join!(
            self.store.put(&keys.ip_key, encoded.clone(), ttl),
            self.store.put(&keys.hw_key, encoded, ttl)
        )?;
        Ok(())
    }
}

fn decode_record(key: &str, raw: Option<String>) -> Result<Option<TrialRecord>, TrialGateError> {
    raw.map(|raw| {
        serde_json::from_str::<TrialRecord>(&raw).map_err(|source| TrialGateError::RecordDecode {
            key: key.to_string(),
            source,
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FailingKvStore;
    use trialgate_kernel_contracts::trial::MAX_MOVEMENTS;
    use trialgate_kernel_contracts::UnixTimeMs;
    use trialgate_storage::{InMemoryKvStore, ManualTrialClock};

    struct Harness {
        runtime: TrialGateRuntime,
        store: Arc<InMemoryKvStore>,
        clock: Arc<ManualTrialClock>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualTrialClock::starting_at(UnixTimeMs(1_700_000_000_000)));
        let store = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let runtime =
            TrialGateRuntime::new(TrialGateConfig::mvp_v1(), store.clone(), clock.clone())
                .unwrap();
        Harness {
            runtime,
            store,
            clock,
        }
    }

    fn request(
        action: TrialAction,
        address: &str,
        fingerprint: &str,
        cost: u32,
    ) -> TrialGateRequest {
        TrialGateRequest {
            action,
            client_address: address.to_string(),
            hardware_fingerprint: fingerprint.to_string(),
            cost: MovementCost::v1(cost).unwrap(),
        }
    }

    async fn stored(h: &Harness, address: &str, fingerprint: &str) -> (TrialRecord, TrialRecord) {
        let keys = h
            .runtime
            .hasher
            .storage_keys(address, fingerprint)
            .unwrap();
        let ip = h.store.get(&keys.ip_key).await.unwrap().unwrap();
        let hw = h.store.get(&keys.hw_key).await.unwrap().unwrap();
        (
            serde_json::from_str(&ip).unwrap(),
            serde_json::from_str(&hw).unwrap(),
        )
    }

    #[tokio::test]
    async fn at_gate_01_fresh_check_reports_full_quota_and_persists_both_keys() {
        let h = harness();
        let out = h
            .runtime
            .run(&request(TrialAction::Check, "203.0.113.7", "device-a", 1))
            .await
            .unwrap();
        assert_eq!(
            out,
            TrialGateOutcome::Checked {
                remaining: MAX_MOVEMENTS,
                is_new: true
            }
        );
        let (ip, hw) = stored(&h, "203.0.113.7", "device-a").await;
        assert_eq!(ip, hw);
        assert_eq!(ip.remaining, MAX_MOVEMENTS);
        assert_eq!(ip.usage_count, 0);
        assert_eq!(ip.client_ip, "203.0.113.7");
    }

    #[tokio::test]
    async fn at_gate_02_repeated_check_is_idempotent_on_remaining() {
        let h = harness();
        let req = request(TrialAction::Check, "203.0.113.7", "device-a", 1);
        h.runtime.run(&req).await.unwrap();
        h.clock.advance_ms(5_000);
        let second = h.runtime.run(&req).await.unwrap();
        assert_eq!(
            second,
            TrialGateOutcome::Checked {
                remaining: MAX_MOVEMENTS,
                is_new: false
            }
        );
        let (ip, _) = stored(&h, "203.0.113.7", "device-a").await;
        assert_eq!(ip.created, 1_700_000_000_000);
        assert_eq!(ip.last_access, 1_700_000_005_000);
    }

    #[tokio::test]
    async fn at_gate_03_use_sequence_then_exhausted_without_state_change() {
        let h = harness();
        let first = h
            .runtime
            .run(&request(TrialAction::Use, "203.0.113.7", "device-a", 3))
            .await
            .unwrap();
        assert_eq!(
            first,
            TrialGateOutcome::Used {
                remaining: 7,
                used: MovementCost::v1(3).unwrap(),
                exhausted: false
            }
        );

        h.clock.advance_ms(1_500);
        let second = h
            .runtime
            .run(&request(TrialAction::Use, "203.0.113.7", "device-a", 5))
            .await
            .unwrap();
        assert_eq!(
            second,
            TrialGateOutcome::Used {
                remaining: 2,
                used: MovementCost::v1(5).unwrap(),
                exhausted: false
            }
        );
        let before = stored(&h, "203.0.113.7", "device-a").await;

        h.clock.advance_ms(1_500);
        let third = h
            .runtime
            .run(&request(TrialAction::Use, "203.0.113.7", "device-a", 5))
            .await
            .unwrap();
        assert_eq!(third, TrialGateOutcome::Exhausted { remaining: 2 });
        assert_eq!(stored(&h, "203.0.113.7", "device-a").await, before);
        assert_eq!(before.0.usage_count, 2);
    }

    #[tokio::test]
    async fn at_gate_04_rotating_fingerprint_keeps_address_quota() {
        let h = harness();
        h.runtime
            .run(&request(TrialAction::Use, "203.0.113.7", "device-a", 6))
            .await
            .unwrap();
        let out = h
            .runtime
            .run(&request(TrialAction::Check, "203.0.113.7", "device-b", 1))
            .await
            .unwrap();
        assert_eq!(
            out,
            TrialGateOutcome::Checked {
                remaining: 4,
                is_new: false
            }
        );
        // The new fingerprint inherits the tightened quota.
        let (_, hw_b) = stored(&h, "203.0.113.7", "device-b").await;
        assert_eq!(hw_b.remaining, 4);
        assert_eq!(hw_b.usage_count, 1);
    }

    #[tokio::test]
    async fn at_gate_05_rotating_address_keeps_fingerprint_quota() {
        let h = harness();
        h.runtime
            .run(&request(TrialAction::Use, "203.0.113.7", "device-a", 8))
            .await
            .unwrap();
        let out = h
            .runtime
            .run(&request(TrialAction::Check, "198.51.100.4", "device-a", 1))
            .await
            .unwrap();
        assert_eq!(
            out,
            TrialGateOutcome::Checked {
                remaining: 2,
                is_new: false
            }
        );
    }

    #[tokio::test]
    async fn at_gate_06_second_use_inside_window_is_rate_limited() {
        let h = harness();
        h.runtime
            .run(&request(TrialAction::Use, "203.0.113.7", "device-a", 1))
            .await
            .unwrap();
        h.clock.advance_ms(250);
        let out = h
            .runtime
            .run(&request(TrialAction::Use, "203.0.113.7", "device-a", 1))
            .await
            .unwrap();
        assert_eq!(
            out,
            TrialGateOutcome::RateLimited {
                retry_after_ms: 750
            }
        );
        let (ip, _) = stored(&h, "203.0.113.7", "device-a").await;
        assert_eq!(ip.remaining, 9);
    }

    #[tokio::test]
    async fn at_gate_07_check_is_never_rate_limited() {
        let h = harness();
        h.runtime
            .run(&request(TrialAction::Use, "203.0.113.7", "device-a", 1))
            .await
            .unwrap();
        let out = h
            .runtime
            .run(&request(TrialAction::Check, "203.0.113.7", "device-a", 1))
            .await
            .unwrap();
        assert_eq!(
            out,
            TrialGateOutcome::Checked {
                remaining: 9,
                is_new: false
            }
        );
    }

    #[tokio::test]
    async fn at_gate_08_records_written_with_year_ttl() {
        let h = harness();
        h.runtime
            .run(&request(TrialAction::Check, "203.0.113.7", "device-a", 1))
            .await
            .unwrap();
        let keys = h
            .runtime
            .hasher
            .storage_keys("203.0.113.7", "device-a")
            .unwrap();
        let expected = UnixTimeMs(1_700_000_000_000 + TRIAL_RECORD_TTL_SECS * 1_000);
        assert_eq!(h.store.expires_at(&keys.ip_key).unwrap(), Some(expected));
        assert_eq!(h.store.expires_at(&keys.hw_key).unwrap(), Some(expected));
    }

    #[tokio::test]
    async fn at_gate_09_corrupt_record_surfaces_decode_error() {
        let h = harness();
        let keys = h
            .runtime
            .hasher
            .storage_keys("203.0.113.7", "device-a")
            .unwrap();
        h.store
            .put(&keys.hw_key, "{not json".to_string(), 60)
            .await
            .unwrap();
        let err = h
            .runtime
            .run(&request(TrialAction::Check, "203.0.113.7", "device-a", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TrialGateError::RecordDecode { .. }));
    }

    #[tokio::test]
    async fn at_gate_10_store_failure_surfaces_storage_error() {
        let clock = Arc::new(ManualTrialClock::starting_at(UnixTimeMs(1)));
        let runtime =
            TrialGateRuntime::new(TrialGateConfig::mvp_v1(), Arc::new(FailingKvStore), clock)
                .unwrap();
        let err = runtime
            .run(&request(TrialAction::Check, "203.0.113.7", "device-a", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TrialGateError::Storage(_)));
    }

    #[tokio::test]
    async fn at_gate_11_expired_records_reset_the_trial() {
        let h = harness();
        h.runtime
            .run(&request(TrialAction::Use, "203.0.113.7", "device-a", 10))
            .await
            .unwrap();
        h.clock.advance_ms(TRIAL_RECORD_TTL_SECS * 1_000);
        let out = h
            .runtime
            .run(&request(TrialAction::Check, "203.0.113.7", "device-a", 1))
            .await
            .unwrap();
        assert_eq!(
            out,
            TrialGateOutcome::Checked {
                remaining: MAX_MOVEMENTS,
                is_new: true
            }
        );
    }

    #[test]
    fn at_gate_12_config_validation_and_debug_redaction() {
        let mut config = TrialGateConfig::mvp_v1();
        assert!(config.validate().is_ok());
        assert!(!format!("{config:?}").contains(DEFAULT_FINGERPRINT_SALT));
        config.fingerprint_salt = String::new();
        assert!(config.validate().is_err());
    }
}
