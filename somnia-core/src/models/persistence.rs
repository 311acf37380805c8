use serde::{Deserialize, Serialize};
use std::fmt;

use super::evolution::EvolutionImpact;
use crate::validate::FieldError;

/// Stages of the persistence pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceStage {
    Validating,
    Merging,
    Uploading,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for PersistenceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PersistenceStage::Validating => "validating",
            PersistenceStage::Merging => "merging",
            PersistenceStage::Uploading => "uploading",
            PersistenceStage::Committing => "committing",
            PersistenceStage::Done => "done",
            PersistenceStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceStatus {
    /// Stored and recorded on-ledger.
    Success,
    /// Stored, but the ledger update failed.
    Partial,
    /// Validation or storage never completed.
    Failed,
}

impl fmt::Display for PersistenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PersistenceStatus::Success => "success",
            PersistenceStatus::Partial => "partial",
            PersistenceStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: PersistenceStage,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub file_name: String,
    pub entries: usize,
    /// False when this upload starts a fresh log.
    pub continued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSummary {
    pub content_address: String,
    pub transaction_ref: Option<String>,
    pub verified: bool,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub transaction_ref: String,
    pub confirmed_block: u64,
    pub is_evolution: bool,
}

/// Aggregated outcome of one submission through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceResult {
    pub record_id: Option<u64>,
    pub validation_errors: Vec<FieldError>,
    pub evolution: Option<EvolutionImpact>,
    pub merge: Option<MergeSummary>,
    pub upload: Option<UploadSummary>,
    pub ledger: Option<LedgerSummary>,
    pub timings: Vec<StageTiming>,
    pub status: PersistenceStatus,
    pub failed_stage: Option<PersistenceStage>,
    pub error: Option<String>,
}

impl Default for PersistenceResult {
    fn default() -> Self {
        Self {
            record_id: None,
            validation_errors: Vec::new(),
            evolution: None,
            merge: None,
            upload: None,
            ledger: None,
            timings: Vec::new(),
            status: PersistenceStatus::Failed,
            failed_stage: None,
            error: None,
        }
    }
}

impl PersistenceResult {
    pub fn content_address(&self) -> Option<&str> {
        self.upload.as_ref().map(|u| u.content_address.as_str())
    }

    /// Ledger transaction reference, present only when the ledger update
    /// confirmed.
    pub fn transaction_ref(&self) -> Option<&str> {
        self.ledger.as_ref().map(|l| l.transaction_ref.as_str())
    }

    pub fn total_ms(&self) -> u64 {
        self.timings.iter().map(|t| t.elapsed_ms).sum()
    }

    /// Single line describing the outcome for the session output.
    pub fn summary_line(&self) -> String {
        let id = self
            .record_id
            .map(|id| format!("Dream #{}", id))
            .unwrap_or_else(|| "Dream".to_string());
        match self.status {
            PersistenceStatus::Success => {
                let address = self.content_address().unwrap_or("?");
                let tx = self.transaction_ref().unwrap_or("?");
                let verified = match self.upload.as_ref().map(|u| u.verified) {
                    Some(true) => ", verified",
                    _ => "",
                };
                let evolution = match (&self.ledger, &self.evolution) {
                    (Some(l), Some(e)) if l.is_evolution => format!("; evolved: {}", e.describe()),
                    _ => String::new(),
                };
                format!(
                    "{} saved: stored at {}{} and recorded on-ledger (tx {}) in {}ms{}",
                    id,
                    address,
                    verified,
                    tx,
                    self.total_ms(),
                    evolution
                )
            }
            PersistenceStatus::Partial => format!(
                "{} stored at {}, ledger update failed: {}",
                id,
                self.content_address().unwrap_or("?"),
                self.error.as_deref().unwrap_or("unknown error")
            ),
            PersistenceStatus::Failed => {
                if !self.validation_errors.is_empty() {
                    let fields: Vec<String> =
                        self.validation_errors.iter().map(|e| e.to_string()).collect();
                    format!("{} not saved: validation failed: {}", id, fields.join("; "))
                } else {
                    format!(
                        "{} not saved: {} failed: {}",
                        id,
                        self.failed_stage.unwrap_or(PersistenceStage::Failed),
                        self.error.as_deref().unwrap_or("unknown error")
                    )
                }
            }
        }
    }
}
