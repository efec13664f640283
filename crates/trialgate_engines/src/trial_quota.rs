#![forbid(unsafe_code)]

use serde_json::Value;
use trialgate_kernel_contracts::trial::{
    MovementCost, TrialRecord, MAX_MOVEMENTS, MAX_MOVEMENT_COST, MIN_MOVEMENT_COST,
};
use trialgate_kernel_contracts::{ContractViolation, UnixTimeMs, Validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialQuotaConfig {
    pub max_movements: u32,
}

impl TrialQuotaConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_movements: MAX_MOVEMENTS,
        }
    }
}

impl Validate for TrialQuotaConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.max_movements == 0 || self.max_movements > MAX_MOVEMENTS {
            return Err(ContractViolation::InvalidRange {
                field: "trial_quota_config.max_movements",
                min: 1,
                max: MAX_MOVEMENTS as u64,
                got: self.max_movements as u64,
            });
        }
        Ok(())
    }
}

/// Quota state after folding the address-keyed and fingerprint-keyed records together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciledQuota {
    pub effective_remaining: u32,
    pub is_new: bool,
    pub created: Option<UnixTimeMs>,
    pub usage_count: u64,
}

/// Who is being observed, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialObservation {
    pub client_address: String,
    pub hardware_fingerprint: String,
    pub now: UnixTimeMs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsePlan {
    /// Not enough quota left; nothing is written.
    Exhausted { remaining: u32 },
    Commit {
        record: TrialRecord,
        used: MovementCost,
        exhausted: bool,
    },
}

#[derive(Debug, Clone)]
pub struct TrialQuotaRuntime {
    config: TrialQuotaConfig,
}

impl TrialQuotaRuntime {
    pub fn new(config: TrialQuotaConfig) -> Result<Self, ContractViolation> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn max_movements(&self) -> u32 {
        self.config.max_movements
    }

    /// Start from the full quota and tighten to the lowest value any known identity reports.
    pub fn reconcile(&self, ip: Option<&TrialRecord>, hw: Option<&TrialRecord>) -> ReconciledQuota {
        let known = [ip, hw];
        let effective_remaining = known
            .iter()
            .flatten()
            .map(|r| r.remaining)
            .fold(self.config.max_movements, u32::min);
        let created = known.iter().flatten().map(|r| r.created_at()).min();
        let usage_count = known
            .iter()
            .flatten()
            .map(|r| r.usage_count)
            .max()
            .unwrap_or(0);
        ReconciledQuota {
            effective_remaining,
            is_new: ip.is_none() && hw.is_none(),
            created,
            usage_count,
        }
    }

    /// Record to persist for a `check`: quota untouched, access time refreshed.
    pub fn plan_check(
        &self,
        reconciled: &ReconciledQuota,
        observation: &TrialObservation,
    ) -> Result<TrialRecord, ContractViolation> {
        self.record_for(
            reconciled.effective_remaining,
            reconciled,
            reconciled.usage_count,
            observation,
        )
    }

    pub fn plan_use(
        &self,
        reconciled: &ReconciledQuota,
        cost: MovementCost,
        observation: &TrialObservation,
    ) -> Result<UsePlan, ContractViolation> {
        cost.validate()?;
        let Some(new_remaining) = reconciled.effective_remaining.checked_sub(cost.units()) else {
            return Ok(UsePlan::Exhausted {
                remaining: reconciled.effective_remaining,
            });
        };
        let record = self.record_for(
            new_remaining,
            reconciled,
            reconciled.usage_count.saturating_add(1),
            observation,
        )?;
        Ok(UsePlan::Commit {
            record,
            used: cost,
            exhausted: new_remaining == 0,
        })
    }

    fn record_for(
        &self,
        remaining: u32,
        reconciled: &ReconciledQuota,
        usage_count: u64,
        observation: &TrialObservation,
    ) -> Result<TrialRecord, ContractViolation> {
        let now = observation.now;
        // A stored creation time ahead of our clock is pulled back so created <= lastAccess.
        let created = reconciled.created.map_or(now, |c| c.min(now));
        TrialRecord::v1(
            remaining.min(self.config.max_movements),
            created,
            now,
            usage_count,
            observation.client_address.clone(),
            &observation.hardware_fingerprint,
        )
    }
}

/// Normalizes a client-supplied `cost`. Anything that is not an integer in
/// `MIN_MOVEMENT_COST..=MAX_MOVEMENT_COST` after integer parsing falls back to the default cost.
pub fn normalize_cost(raw: Option<&Value>) -> MovementCost {
    let parsed = match raw {
        None => return MovementCost::DEFAULT,
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Some(Value::String(s)) => parse_leading_integer(s),
        Some(_) => None,
    };
    parsed
        .filter(|units| (MIN_MOVEMENT_COST as i64..=MAX_MOVEMENT_COST as i64).contains(units))
        .and_then(|units| MovementCost::v1(units as u32).ok())
        .unwrap_or(MovementCost::DEFAULT)
}

// Leading optional sign followed by decimal digits; trailing garbage is ignored ("5abc" -> 5).
fn parse_leading_integer(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let digits_len = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits_len == 0 {
        return None;
    }
    // Long digit runs saturate; they are out of range either way.
    let magnitude = rest[..digits_len].parse::<i64>().unwrap_or(i64::MAX);
    Some(if negative { -magnitude } else { magnitude })
}
