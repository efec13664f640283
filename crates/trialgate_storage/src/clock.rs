#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use trialgate_kernel_contracts::UnixTimeMs;

pub trait TrialClock: Send + Sync {
    fn now_ms(&self) -> UnixTimeMs;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTrialClock;

impl TrialClock for SystemTrialClock {
    fn now_ms(&self) -> UnixTimeMs {
        // A clock before the epoch is treated as the epoch itself.
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
            .unwrap_or(0);
        UnixTimeMs(ms)
    }
}

/// Clock that only moves when told to. Used to drive expiry and rate-limit windows
/// deterministically.
#[derive(Debug, Default)]
pub struct ManualTrialClock {
    now_ms: AtomicU64,
}

impl ManualTrialClock {
    pub fn starting_at(now: UnixTimeMs) -> Self {
        Self {
            now_ms: AtomicU64::new(now.0),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, now: UnixTimeMs) {
        self.now_ms.store(now.0, Ordering::SeqCst);
    }
}

impl TrialClock for ManualTrialClock {
    fn now_ms(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}
