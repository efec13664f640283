#![forbid(unsafe_code)]

use async_trait::async_trait;
use trialgate_storage::{StorageError, TrialKvStore};

/// Backend that refuses every call.
pub(crate) struct FailingKvStore;

#[async_trait]
impl TrialKvStore for FailingKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Backend {
            op: "get",
            key: key.to_string(),
            reason: "backend offline".to_string(),
        })
    }

    async fn put(&self, key: &str, _value: String, _ttl_secs: u64) -> Result<(), StorageError> {
        Err(StorageError::Backend {
            op: "put",
            key: key.to_string(),
            reason: "backend offline".to_string(),
        })
    }
}
