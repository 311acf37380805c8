//! In-memory collaborators for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use somnia_core::inference::{
    InferenceError, InferenceGateway, InferenceRequest, InferenceResponse, ModelDescriptor,
    ModelRegistry,
};
use somnia_core::ledger::{FundingAccount, FundingLedger, Ledger, LedgerError, LedgerWrite};
use somnia_core::models::AgentMemory;
use somnia_core::selection::{SelectionError, SelectionStore};
use somnia_core::storage::{ContentStore, StorageError, StoredBlob};

// ============================================================================
// Storage
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Bytes>>,
    pub puts: AtomicUsize,
    pub gets: AtomicUsize,
    /// Number of upcoming puts that fail.
    pub failing_puts: AtomicUsize,
    pub failing_gets: AtomicBool,
    /// Serve a different payload on get.
    pub corrupt_reads: AtomicBool,
}

impl MemoryStore {
    pub fn insert(&self, address: &str, bytes: Vec<u8>) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(address.to_string(), Bytes::from(bytes));
        }
    }

    pub fn blob(&self, address: &str) -> Option<Bytes> {
        self.blobs.lock().ok().and_then(|b| b.get(address).cloned())
    }

    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn put(&self, name: &str, bytes: Bytes) -> Result<StoredBlob, StorageError> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self.failing_puts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_puts.store(failing - 1, Ordering::SeqCst);
            return Err(StorageError::Api {
                code: 503,
                message: "gateway busy".into(),
            });
        }
        let address = format!("0xblob{}", n);
        self.insert(&address, bytes.to_vec());
        Ok(StoredBlob {
            content_address: address,
            transaction_ref: Some(format!("upload-{}", name)),
        })
    }

    async fn get(&self, content_address: &str) -> Result<Bytes, StorageError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.failing_gets.load(Ordering::SeqCst) {
            return Err(StorageError::Api {
                code: 500,
                message: "read failed".into(),
            });
        }
        if self.corrupt_reads.load(Ordering::SeqCst) {
            return Ok(Bytes::from_static(b"[]"));
        }
        self.blob(content_address).ok_or_else(|| StorageError::NotFound {
            address: content_address.to_string(),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Clone)]
pub enum ConfirmMode {
    Confirm,
    Revert(String),
    /// Fail this many polls, then stay pending forever.
    ErrorsThenPending(usize),
}

pub struct MockLedger {
    memory: Mutex<AgentMemory>,
    pub writes: Mutex<Vec<LedgerWrite>>,
    mode: Mutex<ConfirmMode>,
    polls: AtomicUsize,
    pub reads: AtomicUsize,
    /// Number of upcoming reads that fail.
    pub failing_reads: AtomicUsize,
}

impl MockLedger {
    pub fn new(memory: AgentMemory) -> Self {
        Self {
            memory: Mutex::new(memory),
            writes: Mutex::new(Vec::new()),
            mode: Mutex::new(ConfirmMode::Confirm),
            polls: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            failing_reads: AtomicUsize::new(0),
        }
    }

    pub fn with_count(identity_id: u64, dream_count: u64) -> Self {
        Self::new(AgentMemory {
            identity_id,
            dream_count,
            ..AgentMemory::default()
        })
    }

    pub fn set_mode(&self, mode: ConfirmMode) {
        if let Ok(mut m) = self.mode.lock() {
            *m = mode;
        }
    }

    pub fn memory(&self) -> AgentMemory {
        self.memory.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().map(|w| w.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn submit_memory_update(&self, update: &LedgerWrite) -> Result<String, LedgerError> {
        let mut writes = self.writes.lock().map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
        writes.push(update.clone());
        Ok(format!("0xtx{}", writes.len()))
    }

    async fn confirmation(&self, transaction_ref: &str) -> Result<Option<u64>, LedgerError> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        let mode = self.mode.lock().map(|m| m.clone()).unwrap_or(ConfirmMode::Confirm);
        match mode {
            ConfirmMode::Confirm => {
                let last = self.writes.lock().ok().and_then(|w| w.last().cloned());
                if let (Some(write), Ok(mut memory)) = (last, self.memory.lock()) {
                    memory.content_address = Some(write.content_address);
                    memory.dream_count += 1;
                }
                Ok(Some(100 + poll as u64))
            }
            ConfirmMode::Revert(reason) => Err(LedgerError::Reverted { reason }),
            ConfirmMode::ErrorsThenPending(n) if poll < n => Err(LedgerError::Api {
                code: 502,
                message: format!("rpc unavailable for {}", transaction_ref),
            }),
            ConfirmMode::ErrorsThenPending(_) => Ok(None),
        }
    }

    async fn read_memory(&self, _identity_id: u64) -> Result<AgentMemory, LedgerError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_reads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_reads.store(failing - 1, Ordering::SeqCst);
            return Err(LedgerError::Api {
                code: 502,
                message: "rpc unavailable".into(),
            });
        }
        Ok(self.memory())
    }

    fn name(&self) -> &str {
        "mock-ledger"
    }
}

#[derive(Default)]
pub struct MockFunding {
    pub account: Mutex<Option<FundingAccount>>,
    pub fail: AtomicBool,
}

impl MockFunding {
    pub fn with_balance(owner: &str, balance: f64) -> Self {
        Self {
            account: Mutex::new(Some(FundingAccount {
                owner: owner.to_string(),
                balance,
            })),
            fail: AtomicBool::new(false),
        }
    }

    fn check_failure(&self) -> Result<(), LedgerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(LedgerError::Api {
                code: 500,
                message: "funding ledger down".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FundingLedger for MockFunding {
    async fn account(&self, _owner: &str) -> Result<Option<FundingAccount>, LedgerError> {
        self.check_failure()?;
        Ok(self.account.lock().ok().and_then(|a| a.clone()))
    }

    async fn create_account(&self, owner: &str, amount: f64) -> Result<FundingAccount, LedgerError> {
        self.check_failure()?;
        let account = FundingAccount {
            owner: owner.to_string(),
            balance: amount,
        };
        if let Ok(mut slot) = self.account.lock() {
            *slot = Some(account.clone());
        }
        Ok(account)
    }

    async fn deposit(&self, owner: &str, amount: f64) -> Result<FundingAccount, LedgerError> {
        self.check_failure()?;
        let mut slot = self
            .account
            .lock()
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
        let account = slot.get_or_insert_with(|| FundingAccount {
            owner: owner.to_string(),
            balance: 0.0,
        });
        account.balance += amount;
        Ok(account.clone())
    }
}

// ============================================================================
// Inference
// ============================================================================

pub struct MockInference {
    text: Mutex<String>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<InferenceRequest>>,
    pub fail: AtomicBool,
}

impl MockInference {
    pub fn answering(text: impl Into<String>) -> Self {
        Self {
            text: Mutex::new(text.into()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl InferenceGateway for MockInference {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut r) = self.requests.lock() {
            r.push(request.clone());
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(InferenceError::Api {
                code: 503,
                message: "provider offline".into(),
            });
        }
        Ok(InferenceResponse {
            text: self.text.lock().map(|t| t.clone()).unwrap_or_default(),
        })
    }

    fn name(&self) -> &str {
        "mock-inference"
    }
}

pub struct MockModels {
    pub models: Mutex<Vec<ModelDescriptor>>,
    pub fail: AtomicBool,
}

impl MockModels {
    pub fn with_ids(ids: &[&str]) -> Self {
        Self {
            models: Mutex::new(
                ids.iter()
                    .map(|id| ModelDescriptor {
                        id: id.to_string(),
                        name: None,
                        provider: None,
                    })
                    .collect(),
            ),
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ModelRegistry for MockModels {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, InferenceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(InferenceError::Api {
                code: 503,
                message: "registry offline".into(),
            });
        }
        Ok(self.models.lock().map(|m| m.clone()).unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemorySelection {
    pub saved: Mutex<Option<String>>,
}

#[async_trait]
impl SelectionStore for MemorySelection {
    async fn load(&self) -> Result<Option<String>, SelectionError> {
        Ok(self.saved.lock().ok().and_then(|s| s.clone()))
    }

    async fn save(&self, model_id: &str) -> Result<(), SelectionError> {
        if let Ok(mut s) = self.saved.lock() {
            *s = Some(model_id.to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn dream_data() -> serde_json::Value {
    serde_json::json!({
        "emotions": ["wonder", "fear", "calm"],
        "symbols": ["ocean", "key"],
        "intensity": 8,
        "lucidity": 3,
        "themes": ["journey"],
        "dream_type": "lucid"
    })
}

pub fn personality_impact() -> serde_json::Value {
    serde_json::json!({
        "creativityChange": 4,
        "analyticalChange": -2,
        "empathyChange": 1,
        "intuitionChange": 3,
        "resilienceChange": 0,
        "curiosityChange": 5,
        "moodShift": "inspired",
        "evolutionWeight": 60,
        "newFeatures": [
            { "name": "Tide Reading", "description": "Reads moods like tides", "intensity": 40 }
        ]
    })
}

/// A model answer with both fenced blocks.
pub fn analysis_text(with_impact: bool) -> String {
    let mut structured = serde_json::json!({
        "analysis": "A lucid voyage across a calm ocean.",
        "dreamData": dream_data(),
    });
    if with_impact {
        structured["personalityImpact"] = personality_impact();
    }
    format!(
        "```full_analysis\nThe ocean stands for the unconscious; the key for a new insight.\n```\n\n```json\n{}\n```",
        structured
    )
}
