//! Content-addressed storage client
//!
//! - put: `POST {base}/v1/blobs?name={file}` with the blob bytes, answering
//!   `{contentAddress, transactionRef?}`
//! - get: `GET {base}/v1/blobs/{contentAddress}`, answering the bytes or 404

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::StorageConfig;

/// Immutable blob storage addressed by content hash.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, name: &str, bytes: Bytes) -> Result<StoredBlob, StorageError>;

    async fn get(&self, content_address: &str) -> Result<Bytes, StorageError>;

    /// Store name for logging.
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBlob {
    pub content_address: String,
    #[serde(default)]
    pub transaction_ref: Option<String>,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Blob not found: {address}")]
    NotFound { address: String },

    #[error("Storage request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Invalid storage response: {0}")]
    InvalidResponse(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

#[derive(Debug, Clone)]
pub struct HttpContentStore {
    client: Client,
    base_url: String,
}

impl HttpContentStore {
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        Self::with_base_url(config.base_url.clone())
    }

    pub fn with_base_url(base_url: String) -> Result<Self, StorageError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn api_error(response: reqwest::Response) -> StorageError {
        let code = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        tracing::warn!(code, message = %message, "Storage API error");
        StorageError::Api { code, message }
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn put(&self, name: &str, bytes: Bytes) -> Result<StoredBlob, StorageError> {
        let url = format!("{}/v1/blobs", self.base_url);
        let size = bytes.len();
        let response = self
            .client
            .post(&url)
            .query(&[("name", name)])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let blob: StoredBlob = response
            .json()
            .await
            .map_err(|e| StorageError::InvalidResponse(e.to_string()))?;
        if blob.content_address.trim().is_empty() {
            return Err(StorageError::InvalidResponse(
                "empty content address".to_string(),
            ));
        }

        tracing::debug!(name, size, address = %blob.content_address, "Blob uploaded");
        Ok(blob)
    }

    async fn get(&self, content_address: &str) -> Result<Bytes, StorageError> {
        let url = format!("{}/v1/blobs/{}", self.base_url, content_address);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(StorageError::NotFound {
                address: content_address.to_string(),
            }),
            s if s.is_success() => Ok(response.bytes().await?),
            _ => Err(Self::api_error(response).await),
        }
    }

    fn name(&self) -> &str {
        "http-storage"
    }
}
