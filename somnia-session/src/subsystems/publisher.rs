//! Durable storage publisher
//!
//! Uploads a merged dream log with bounded linear backoff, then optionally
//! reads it back by content address and compares it to what was sent. A
//! failed or mismatching read-back is only logged: the upload already
//! happened and its content address is what the ledger records.

use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::Retry;

use somnia_core::codec::{decode_log, encode_log, normalized_eq};
use somnia_core::config::StorageConfig;
use somnia_core::models::{DreamRecord, UploadSummary};
use somnia_core::retry::linear_backoff;
use somnia_core::storage::{ContentStore, StorageError};

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub verify: bool,
    /// Total upload attempts, including the first.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub verify_timeout: Duration,
}

impl From<&StorageConfig> for PublishOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            verify: config.verify,
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay(),
            verify_timeout: config.verify_timeout(),
        }
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to encode dream log: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Upload failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StorageError,
    },
}

/// Outcome of the optional read-back check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Skipped,
    Matched,
    Mismatched,
    Unavailable,
}

pub async fn publish(
    store: &dyn ContentStore,
    records: &[DreamRecord],
    file_name: &str,
    options: &PublishOptions,
) -> Result<UploadSummary, PublishError> {
    let payload = Bytes::from(encode_log(records)?);
    let attempts = AtomicU32::new(0);

    let upload = Retry::spawn(
        linear_backoff(options.retry_base_delay, options.max_retries),
        || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let bytes = payload.clone();
            async move {
                match store.put(file_name, bytes).await {
                    Ok(blob) => Ok(blob),
                    Err(e) => {
                        tracing::warn!(attempt, file = file_name, error = %e, "Upload attempt failed");
                        Err(e)
                    }
                }
            }
        },
    )
    .await;

    let attempts = attempts.load(Ordering::SeqCst);
    let blob = match upload {
        Ok(blob) => blob,
        Err(source) => {
            tracing::error!(attempts, file = file_name, error = %source, "All upload attempts failed");
            return Err(PublishError::Exhausted { attempts, source });
        }
    };
    tracing::info!(
        attempts,
        address = %blob.content_address,
        bytes = payload.len(),
        store = store.name(),
        "Dream log uploaded"
    );

    let verification = if options.verify {
        verify_upload(store, &blob.content_address, records, options.verify_timeout).await
    } else {
        Verification::Skipped
    };

    Ok(UploadSummary {
        content_address: blob.content_address,
        transaction_ref: blob.transaction_ref,
        verified: verification == Verification::Matched,
        attempts,
    })
}

/// Re-download by content address and compare after order normalisation.
pub async fn verify_upload(
    store: &dyn ContentStore,
    content_address: &str,
    expected: &[DreamRecord],
    timeout: Duration,
) -> Verification {
    let bytes = match tokio::time::timeout(timeout, store.get(content_address)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            tracing::warn!(address = content_address, error = %e, "Verification download failed");
            return Verification::Unavailable;
        }
        Err(_) => {
            tracing::warn!(
                address = content_address,
                timeout_ms = timeout.as_millis() as u64,
                "Verification download timed out"
            );
            return Verification::Unavailable;
        }
    };

    match decode_log(&bytes) {
        Ok(downloaded) if normalized_eq(&downloaded, expected) => {
            tracing::debug!(address = content_address, "Upload verified");
            Verification::Matched
        }
        Ok(downloaded) => {
            tracing::warn!(
                address = content_address,
                expected = expected.len(),
                downloaded = downloaded.len(),
                "Verification mismatch"
            );
            Verification::Mismatched
        }
        Err(e) => {
            tracing::warn!(address = content_address, error = %e, "Verification payload not decodable");
            Verification::Mismatched
        }
    }
}
