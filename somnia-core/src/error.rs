use thiserror::Error;

use crate::inference::InferenceError;
use crate::ledger::LedgerError;
use crate::storage::StorageError;

/// Failure to assemble the live collaborators for a session.
#[derive(Error, Debug)]
pub enum SomniaError {
    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}
