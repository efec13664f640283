#![forbid(unsafe_code)]

pub mod clock;
pub mod kv;

pub use clock::{ManualTrialClock, SystemTrialClock, TrialClock};
pub use kv::{InMemoryKvStore, StorageError, TrialKvStore};
