#![forbid(unsafe_code)]

pub mod error;
pub mod rate_limit;
pub mod trial_gate;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::TrialGateError;
