//! On-chain ledger gateway
//!
//! Two contracts sit behind the same gateway:
//! - the agent memory contract, recording the newest dream-log content
//!   address and the evolutionary state per identity
//! - the compute funding ledger, holding the balance that pays for inference
//!
//! Contract responses come back in either named or positional form; they are
//! normalised here, at the boundary, and nowhere else.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::LedgerConfig;
use crate::models::{AgentMemory, EvolutionImpact};

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Submit a memory update, returning the transaction reference.
    async fn submit_memory_update(&self, update: &LedgerWrite) -> Result<String, LedgerError>;

    /// Block number once the transaction is mined, `None` while pending.
    async fn confirmation(&self, transaction_ref: &str) -> Result<Option<u64>, LedgerError>;

    async fn read_memory(&self, identity_id: u64) -> Result<AgentMemory, LedgerError>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait FundingLedger: Send + Sync {
    /// `None` when the owner has no funding account yet.
    async fn account(&self, owner: &str) -> Result<Option<FundingAccount>, LedgerError>;

    async fn create_account(&self, owner: &str, amount: f64) -> Result<FundingAccount, LedgerError>;

    async fn deposit(&self, owner: &str, amount: f64) -> Result<FundingAccount, LedgerError>;
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerWrite {
    pub identity_id: u64,
    pub content_address: String,
    pub evolution_impact: EvolutionImpact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub transaction_ref: String,
    pub confirmed_block: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingAccount {
    pub owner: String,
    pub balance: f64,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Transaction reverted: {reason}")]
    Reverted { reason: String },

    #[error("No confirmation for {transaction_ref} after {seconds}s")]
    ConfirmationTimeout { transaction_ref: String, seconds: u64 },

    #[error("Invalid ledger response: {0}")]
    InvalidResponse(String),
}

/// Submit an update and wait for it to be mined.
///
/// The write itself is never retried. A failed status poll is logged and
/// polling continues until the timeout; a revert ends the wait at once.
pub async fn write_and_confirm(
    ledger: &dyn Ledger,
    update: &LedgerWrite,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<LedgerReceipt, LedgerError> {
    let transaction_ref = ledger.submit_memory_update(update).await?;
    tracing::info!(tx = %transaction_ref, identity = update.identity_id, "Ledger update submitted");

    let wait = async {
        let mut polls = 0u32;
        loop {
            polls += 1;
            match ledger.confirmation(&transaction_ref).await {
                Ok(Some(block)) => return Ok::<u64, LedgerError>(block),
                Ok(None) => {}
                Err(e @ LedgerError::Reverted { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(tx = %transaction_ref, polls, error = %e, "Confirmation poll failed");
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(Ok(confirmed_block)) => Ok(LedgerReceipt {
            transaction_ref,
            confirmed_block,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(LedgerError::ConfirmationTimeout {
            transaction_ref,
            seconds: timeout.as_secs(),
        }),
    }
}

// ============================================================================
// HTTP wire types (private)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    transaction_ref: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionStatus {
    status: String,
    #[serde(default)]
    block_number: Option<u64>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct FundingRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    owner: Option<&'a str>,
    amount: f64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

// ============================================================================
// HttpLedgerClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    client: Client,
    base_url: String,
}

impl HttpLedgerClient {
    pub fn new(config: &LedgerConfig) -> Result<Self, LedgerError> {
        Self::with_base_url(config.base_url.clone())
    }

    pub fn with_base_url(base_url: String) -> Result<Self, LedgerError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn error_message(response: reqwest::Response) -> (u16, String) {
        let code = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.error)
            .map(|d| d.message)
            .unwrap_or(body);
        (code, message)
    }

    async fn funding_call(&self, url: String, body: FundingRequest<'_>) -> Result<FundingAccount, LedgerError> {
        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let (code, message) = Self::error_message(response).await;
            return Err(LedgerError::Api { code, message });
        }
        response
            .json::<FundingAccount>()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl Ledger for HttpLedgerClient {
    async fn submit_memory_update(&self, update: &LedgerWrite) -> Result<String, LedgerError> {
        let url = format!("{}/v1/agents/{}/memory", self.base_url, update.identity_id);
        let response = self.client.post(&url).json(update).send().await?;

        match response.status() {
            s if s.is_success() => {
                let body: SubmitResponse = response
                    .json()
                    .await
                    .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
                Ok(body.transaction_ref)
            }
            // The gateway simulates the call first; a simulated revert comes
            // back as a client error.
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                let (_, reason) = Self::error_message(response).await;
                Err(LedgerError::Reverted { reason })
            }
            _ => {
                let (code, message) = Self::error_message(response).await;
                Err(LedgerError::Api { code, message })
            }
        }
    }

    async fn confirmation(&self, transaction_ref: &str) -> Result<Option<u64>, LedgerError> {
        let url = format!("{}/v1/transactions/{}", self.base_url, transaction_ref);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let (code, message) = Self::error_message(response).await;
            return Err(LedgerError::Api { code, message });
        }

        let status: TransactionStatus = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
        match status.status.as_str() {
            "pending" => Ok(None),
            "confirmed" => status.block_number.map(Some).ok_or_else(|| {
                LedgerError::InvalidResponse("confirmed transaction without block".to_string())
            }),
            "reverted" => Err(LedgerError::Reverted {
                reason: status.reason.unwrap_or_else(|| "unknown".to_string()),
            }),
            other => Err(LedgerError::InvalidResponse(format!(
                "unknown transaction status '{}'",
                other
            ))),
        }
    }

    async fn read_memory(&self, identity_id: u64) -> Result<AgentMemory, LedgerError> {
        let url = format!("{}/v1/agents/{}/memory", self.base_url, identity_id);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let (code, message) = Self::error_message(response).await;
            return Err(LedgerError::Api { code, message });
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
        AgentMemory::from_contract_value(identity_id, &value).map_err(LedgerError::InvalidResponse)
    }

    fn name(&self) -> &str {
        "http-ledger"
    }
}

#[async_trait]
impl FundingLedger for HttpLedgerClient {
    async fn account(&self, owner: &str) -> Result<Option<FundingAccount>, LedgerError> {
        let url = format!("{}/v1/accounts/{}", self.base_url, owner);
        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => response
                .json::<FundingAccount>()
                .await
                .map(Some)
                .map_err(|e| LedgerError::InvalidResponse(e.to_string())),
            _ => {
                let (code, message) = Self::error_message(response).await;
                Err(LedgerError::Api { code, message })
            }
        }
    }

    async fn create_account(&self, owner: &str, amount: f64) -> Result<FundingAccount, LedgerError> {
        let url = format!("{}/v1/accounts", self.base_url);
        self.funding_call(
            url,
            FundingRequest {
                owner: Some(owner),
                amount,
            },
        )
        .await
    }

    async fn deposit(&self, owner: &str, amount: f64) -> Result<FundingAccount, LedgerError> {
        let url = format!("{}/v1/accounts/{}/deposit", self.base_url, owner);
        self.funding_call(url, FundingRequest { owner: None, amount }).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn update() -> LedgerWrite {
        LedgerWrite {
            identity_id: 7,
            content_address: "0xroot".into(),
            evolution_impact: EvolutionImpact::neutral(),
        }
    }

    #[tokio::test]
    async fn test_write_and_confirm_polls_until_mined() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/agents/7/memory"))
            .and(body_json(serde_json::json!({
                "identityId": 7,
                "contentAddress": "0xroot",
                "evolutionImpact": {
                    "creativityChange": 0, "analyticalChange": 0, "empathyChange": 0,
                    "intuitionChange": 0, "resilienceChange": 0, "curiosityChange": 0,
                    "moodShift": "neutral", "evolutionWeight": 1, "newFeatures": []
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "transactionRef": "0xtx"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/transactions/0xtx"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "pending"
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/transactions/0xtx"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "confirmed", "blockNumber": 1234
            })))
            .mount(&server)
            .await;

        let ledger = HttpLedgerClient::with_base_url(server.uri()).unwrap();
        let receipt = write_and_confirm(
            &ledger,
            &update(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
        .expect("should confirm");
        assert_eq!(receipt.transaction_ref, "0xtx");
        assert_eq!(receipt.confirmed_block, 1234);
    }

    #[tokio::test]
    async fn test_simulated_revert_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "error": { "message": "cooldown active" }
            })))
            .mount(&server)
            .await;

        let ledger = HttpLedgerClient::with_base_url(server.uri()).unwrap();
        match ledger.submit_memory_update(&update()).await {
            Err(LedgerError::Reverted { reason }) => assert_eq!(reason, "cooldown active"),
            other => panic!("Expected Reverted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_confirmation_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "transactionRef": "0xslow"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "pending"
            })))
            .mount(&server)
            .await;

        let ledger = HttpLedgerClient::with_base_url(server.uri()).unwrap();
        let result = write_and_confirm(
            &ledger,
            &update(),
            Duration::from_millis(100),
            Duration::from_millis(20),
        )
        .await;
        assert!(
            matches!(result, Err(LedgerError::ConfirmationTimeout { ref transaction_ref, .. }) if transaction_ref == "0xslow"),
            "{:?}",
            result
        );
    }

    #[tokio::test]
    async fn test_read_memory_normalises_positional_shape() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/agents/7/memory"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                "0xroot", 9, 1700000000, [50, 50, 50, 50, 50, 50], []
            ])))
            .mount(&server)
            .await;

        let ledger = HttpLedgerClient::with_base_url(server.uri()).unwrap();
        let memory = ledger.read_memory(7).await.unwrap();
        assert_eq!(memory.identity_id, 7);
        assert_eq!(memory.dream_count, 9);
        assert_eq!(memory.content_address.as_deref(), Some("0xroot"));
    }

    #[tokio::test]
    async fn test_funding_account_lifecycle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/accounts/0xowner"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/accounts"))
            .and(body_json(serde_json::json!({ "owner": "0xowner", "amount": 0.5 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "owner": "0xowner", "balance": 0.5
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/accounts/0xowner/deposit"))
            .and(body_json(serde_json::json!({ "amount": 0.25 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "owner": "0xowner", "balance": 0.75
            })))
            .mount(&server)
            .await;

        let ledger = HttpLedgerClient::with_base_url(server.uri()).unwrap();
        assert!(ledger.account("0xowner").await.unwrap().is_none());
        assert_eq!(ledger.create_account("0xowner", 0.5).await.unwrap().balance, 0.5);
        assert_eq!(ledger.deposit("0xowner", 0.25).await.unwrap().balance, 0.75);
    }
}
