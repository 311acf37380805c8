//! Inference gateway client
//!
//! The analysis itself is produced by an external inference service. This
//! module only knows the request/response contract:
//! - `POST {base}/v1/inference` with `{prompt, modelId, callerIdentity?}`,
//!   answering `{text}`
//! - `GET {base}/v1/models`, answering `{models: [...]}` or a bare array

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::InferenceConfig;

// ============================================================================
// Traits
// ============================================================================

/// Turns a prompt into model output.
#[async_trait]
pub trait InferenceGateway: Send + Sync {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError>;

    /// Gateway name for logging.
    fn name(&self) -> &str;
}

/// Lists the models the inference service can run.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, InferenceError>;
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub prompt: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_identity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

impl ModelDescriptor {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Inference timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Inference returned an empty response")]
    EmptyResponse,

    #[error("Unknown model '{0}'")]
    UnknownModel(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelList {
    Wrapped { models: Vec<ModelDescriptor> },
    Bare(Vec<ModelDescriptor>),
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    code: Option<u16>,
    message: String,
}

// ============================================================================
// HttpInferenceClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self, InferenceError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        Self::with_base_url(config.base_url.clone(), api_key, config.timeout())
    }

    /// Create a client against an explicit base URL (tests / integration).
    pub fn with_base_url(
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn api_error(response: reqwest::Response) -> InferenceError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ApiErrorBody>(&body)
            .ok()
            .and_then(|e| e.error);
        let (code, message) = detail
            .map(|d| (d.code.unwrap_or(status), d.message))
            .unwrap_or((status, body));
        tracing::error!(code, message = %message, "Inference API error");
        InferenceError::Api { code, message }
    }

    fn map_transport(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                seconds: self.timeout.as_secs(),
            }
        } else {
            InferenceError::Http(e)
        }
    }
}

#[async_trait]
impl InferenceGateway for HttpInferenceClient {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let url = format!("{}/v1/inference", self.base_url);
        let response = self
            .authorized(self.client.post(&url).json(request))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let body: InferenceResponse = response.json().await.map_err(|e| self.map_transport(e))?;
        if body.text.trim().is_empty() {
            return Err(InferenceError::EmptyResponse);
        }

        tracing::debug!(model = %request.model_id, chars = body.text.len(), "Inference completed");
        Ok(body)
    }

    fn name(&self) -> &str {
        "http-inference"
    }
}

#[async_trait]
impl ModelRegistry for HttpInferenceClient {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, InferenceError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let models = match response.json::<ModelList>().await? {
            ModelList::Wrapped { models } => models,
            ModelList::Bare(models) => models,
        };
        Ok(models)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, key: Option<&str>) -> HttpInferenceClient {
        HttpInferenceClient::with_base_url(
            server.uri(),
            key.map(str::to_string),
            Duration::from_millis(500),
        )
        .expect("Failed to create client")
    }

    #[tokio::test]
    async fn test_infer_posts_contract_and_returns_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/inference"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(serde_json::json!({
                "prompt": "analyze",
                "modelId": "dream-model",
                "callerIdentity": "agent-7"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "```json\n{}\n```"
            })))
            .mount(&server)
            .await;

        let request = InferenceRequest {
            prompt: "analyze".into(),
            model_id: "dream-model".into(),
            caller_identity: Some("agent-7".into()),
        };
        let response = client(&server, Some("secret")).infer(&request).await.unwrap();
        assert_eq!(response.text, "```json\n{}\n```");
    }

    #[tokio::test]
    async fn test_infer_maps_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "error": { "code": 503, "message": "provider offline" }
            })))
            .mount(&server)
            .await;

        let request = InferenceRequest {
            prompt: "p".into(),
            model_id: "m".into(),
            caller_identity: None,
        };
        match client(&server, None).infer(&request).await {
            Err(InferenceError::Api { code, message }) => {
                assert_eq!(code, 503);
                assert_eq!(message, "provider offline");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_infer_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "text": "late" }))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let request = InferenceRequest {
            prompt: "p".into(),
            model_id: "m".into(),
            caller_identity: None,
        };
        let result = client(&server, None).infer(&request).await;
        assert!(matches!(result, Err(InferenceError::Timeout { .. })), "{:?}", result);
    }

    #[tokio::test]
    async fn test_blank_text_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "text": "  " })))
            .mount(&server)
            .await;

        let request = InferenceRequest {
            prompt: "p".into(),
            model_id: "m".into(),
            caller_identity: None,
        };
        let result = client(&server, None).infer(&request).await;
        assert!(matches!(result, Err(InferenceError::EmptyResponse)));
    }

    #[tokio::test]
    async fn test_list_models_accepts_both_shapes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{ "id": "a", "name": "Model A" }, { "id": "b" }]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "id": "c", "provider": "0xprov" }
            ])))
            .mount(&server)
            .await;

        let c = client(&server, None);
        let first = c.list_models().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].display_name(), "Model A");
        assert_eq!(first[1].display_name(), "b");

        let second = c.list_models().await.unwrap();
        assert_eq!(second[0].provider.as_deref(), Some("0xprov"));
    }
}
