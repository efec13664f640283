#![forbid(unsafe_code)]

pub mod common;
pub mod trial;

pub use common::{ContractViolation, UnixTimeMs, Validate};
