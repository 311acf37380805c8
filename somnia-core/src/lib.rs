pub mod analysis;
pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod inference;
pub mod ledger;
pub mod models;
pub mod retry;
pub mod selection;
pub mod storage;
pub mod validate;

pub use config::SomniaConfig;
pub use error::SomniaError;
pub use inference::{
    HttpInferenceClient, InferenceError, InferenceGateway, InferenceRequest, InferenceResponse,
    ModelDescriptor, ModelRegistry,
};
pub use ledger::{
    FundingAccount, FundingLedger, HttpLedgerClient, Ledger, LedgerError, LedgerReceipt,
    LedgerWrite,
};
pub use selection::{FileSelectionStore, SelectionError, SelectionStore};
pub use storage::{ContentStore, HttpContentStore, StorageError, StoredBlob};
pub use validate::{validate_dream, FieldError, ValidatedDream, ValidationError, ValidationInput};
