#![forbid(unsafe_code)]

use trialgate_kernel_contracts::ContractViolation;
use trialgate_storage::StorageError;

/// Failures the gate does not know how to answer. The HTTP boundary degrades all of them to the
/// fail-open fallback response.
#[derive(Debug, thiserror::Error)]
pub enum TrialGateError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("trial record at {key} could not be decoded: {source}")]
    RecordDecode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("trial record could not be encoded: {0}")]
    RecordEncode(#[source] serde_json::Error),
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),
}
