#![forbid(unsafe_code)]

pub mod identity_hash;
pub mod trial_quota;
