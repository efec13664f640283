#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::debug;
use trialgate_engines::identity_hash::rate_limit_key;
use trialgate_kernel_contracts::trial::{DEFAULT_RATE_LIMIT_MS, RATE_LIMIT_MARKER_TTL_SECS};
use trialgate_kernel_contracts::ContractViolation;
use trialgate_storage::{TrialClock, TrialKvStore};

use crate::TrialGateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub interval_ms: u64,
    pub marker_ttl_secs: u64,
}

impl RateLimitConfig {
    pub fn mvp_v1() -> Self {
        Self {
            interval_ms: DEFAULT_RATE_LIMIT_MS,
            marker_ttl_secs: RATE_LIMIT_MARKER_TTL_SECS,
        }
    }

    pub fn validate(&self) -> Result<(), ContractViolation> {
        if !(100..=60_000).contains(&self.interval_ms) {
            return Err(ContractViolation::InvalidRange {
                field: "rate_limit_config.interval_ms",
                min: 100,
                max: 60_000,
                got: self.interval_ms,
            });
        }
        // The marker has to outlive the window or the limiter silently stops limiting.
        if self.marker_ttl_secs.saturating_mul(1_000) < self.interval_ms {
            return Err(ContractViolation::InvalidValue {
                field: "rate_limit_config.marker_ttl_secs",
                reason: "must cover interval_ms",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after_ms: u64 },
}

/// One permitted `use` per client address per interval.
///
/// The read and the write are separate store calls, so simultaneous requests from one address can
/// both be allowed.
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn TrialKvStore>,
    clock: Arc<dyn TrialClock>,
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        store: Arc<dyn TrialKvStore>,
        clock: Arc<dyn TrialClock>,
    ) -> Result<Self, ContractViolation> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            clock,
        })
    }

    pub async fn check_rate_limit(
        &self,
        client_address: &str,
    ) -> Result<RateLimitDecision, TrialGateError> {
        let key = rate_limit_key(client_address);
        let now = self.clock.now_ms();

        let last_permitted = self
            .store
            .get(&key)
            .await?
            .and_then(|raw| raw.trim().parse::<u64>().ok());
        if let Some(last_permitted) = last_permitted {
            let elapsed = now.0.saturating_sub(last_permitted);
            if elapsed < self.config.interval_ms {
                let retry_after_ms = self.config.interval_ms - elapsed;
                debug!(retry_after_ms, "trial use rate limited");
                return Ok(RateLimitDecision::Limited { retry_after_ms });
            }
        }

        self.store
            .put(&key, now.0.to_string(), self.config.marker_ttl_secs)
            .await?;
        Ok(RateLimitDecision::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FailingKvStore;
    use trialgate_kernel_contracts::UnixTimeMs;
    use trialgate_storage::{InMemoryKvStore, ManualTrialClock};

    fn limiter_at(start_ms: u64) -> (RateLimiter, Arc<InMemoryKvStore>, Arc<ManualTrialClock>) {
        let clock = Arc::new(ManualTrialClock::starting_at(UnixTimeMs(start_ms)));
        let store = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let limiter =
            RateLimiter::new(RateLimitConfig::mvp_v1(), store.clone(), clock.clone()).unwrap();
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn at_rate_01_first_use_is_allowed_and_marks() {
        let (limiter, store, _) = limiter_at(50_000);
        assert_eq!(
            limiter.check_rate_limit("203.0.113.7").await.unwrap(),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            store.get("ratelimit:203.0.113.7").await.unwrap().as_deref(),
            Some("50000")
        );
        assert_eq!(
            store.expires_at("ratelimit:203.0.113.7").unwrap(),
            Some(UnixTimeMs(110_000))
        );
    }

    #[tokio::test]
    async fn at_rate_02_second_use_inside_window_reports_wait() {
        let (limiter, store, clock) = limiter_at(50_000);
        limiter.check_rate_limit("203.0.113.7").await.unwrap();
        clock.advance_ms(300);
        assert_eq!(
            limiter.check_rate_limit("203.0.113.7").await.unwrap(),
            RateLimitDecision::Limited {
                retry_after_ms: 700
            }
        );
        // Limited path leaves the original marker in place.
        assert_eq!(
            store.get("ratelimit:203.0.113.7").await.unwrap().as_deref(),
            Some("50000")
        );
    }

    #[tokio::test]
    async fn at_rate_03_window_reopens_after_interval() {
        let (limiter, _, clock) = limiter_at(50_000);
        limiter.check_rate_limit("203.0.113.7").await.unwrap();
        clock.advance_ms(1_000);
        assert_eq!(
            limiter.check_rate_limit("203.0.113.7").await.unwrap(),
            RateLimitDecision::Allowed
        );
    }

    #[tokio::test]
    async fn at_rate_04_addresses_are_limited_independently() {
        let (limiter, _, _) = limiter_at(50_000);
        limiter.check_rate_limit("203.0.113.7").await.unwrap();
        assert_eq!(
            limiter.check_rate_limit("198.51.100.4").await.unwrap(),
            RateLimitDecision::Allowed
        );
    }

    #[tokio::test]
    async fn at_rate_05_unparsable_marker_is_ignored() {
        let (limiter, store, _) = limiter_at(50_000);
        store
            .put("ratelimit:203.0.113.7", "garbage".to_string(), 60)
            .await
            .unwrap();
        assert_eq!(
            limiter.check_rate_limit("203.0.113.7").await.unwrap(),
            RateLimitDecision::Allowed
        );
    }

    #[tokio::test]
    async fn at_rate_06_store_failure_propagates() {
        let clock = Arc::new(ManualTrialClock::starting_at(UnixTimeMs(1)));
        let limiter = RateLimiter::new(
            RateLimitConfig::mvp_v1(),
            Arc::new(FailingKvStore),
            clock,
        )
        .unwrap();
        assert!(matches!(
            limiter.check_rate_limit("203.0.113.7").await,
            Err(TrialGateError::Storage(_))
        ));
    }

    #[test]
    fn at_rate_07_config_bounds() {
        assert!(RateLimitConfig::mvp_v1().validate().is_ok());
        let too_short = RateLimitConfig {
            interval_ms: 10,
            ..RateLimitConfig::mvp_v1()
        };
        assert!(too_short.validate().is_err());
        let marker_too_short = RateLimitConfig {
            interval_ms: 5_000,
            marker_ttl_secs: 1,
        };
        assert!(marker_too_short.validate().is_err());
    }
}
