//! Record merger
//!
//! Builds the next version of an agent's dream log: the new record first,
//! followed by every entry of the previously published log in its existing
//! order. Published blobs are never touched; each merge gets a fresh file
//! name.

use chrono::{DateTime, Utc};

use somnia_core::codec::{decode_log, log_file_name};
use somnia_core::models::{is_empty_address, DreamRecord, MergeSummary};
use somnia_core::storage::ContentStore;

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Newest first.
    pub records: Vec<DreamRecord>,
    pub file_name: String,
    /// False when the previous log could not be used and a fresh one starts.
    pub continued: bool,
}

impl MergeOutcome {
    pub fn summary(&self) -> MergeSummary {
        MergeSummary {
            file_name: self.file_name.clone(),
            entries: self.records.len(),
            continued: self.continued,
        }
    }
}

/// Prepend `record` to the log stored at `previous_address`.
///
/// A failed download or an undecodable blob degrades to a fresh log rather
/// than failing the merge.
pub async fn merge_record(
    store: &dyn ContentStore,
    record: DreamRecord,
    previous_address: Option<&str>,
    identity_name: &str,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let previous = match previous_address.filter(|a| !is_empty_address(a)) {
        Some(address) => load_previous(store, address).await,
        None => None,
    };

    let continued = previous.is_some();
    let previous = previous.unwrap_or_default();
    let mut records = Vec::with_capacity(previous.len() + 1);
    records.push(record);
    records.extend(previous);

    let file_name = log_file_name(identity_name, now);
    tracing::info!(
        file = %file_name,
        entries = records.len(),
        continued,
        "Dream log merged"
    );

    MergeOutcome {
        records,
        file_name,
        continued,
    }
}

async fn load_previous(store: &dyn ContentStore, address: &str) -> Option<Vec<DreamRecord>> {
    let bytes = match store.get(address).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(address, error = %e, "Previous dream log unavailable, starting a fresh log");
            return None;
        }
    };

    match decode_log(&bytes) {
        Ok(records) => Some(records),
        Err(e) => {
            tracing::warn!(address, error = %e, "Previous dream log is not decodable, starting a fresh log");
            None
        }
    }
}
