use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SomniaConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub history_limit: usize,
    /// File holding the remembered model selection (`~` is expanded).
    pub selection_path: String,
    pub prompt: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            selection_path: "~/.somnia/selection.json".to_string(),
            prompt: "somnia> ".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IdentityConfig {
    pub agent_id: u64,
    pub agent_name: String,
    pub owner: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            agent_id: 1,
            agent_name: "Dreamer".to_string(),
            owner: "0x0000000000000000000000000000000000000000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InferenceConfig {
    pub base_url: String,
    pub default_model: String,
    pub timeout_seconds: u64,
    /// Name of the environment variable carrying the API key.
    pub api_key_env: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090".to_string(),
            default_model: "llama-3.3-70b-instruct".to_string(),
            timeout_seconds: 120,
            api_key_env: "SOMNIA_INFERENCE_KEY".to_string(),
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub base_url: String,
    pub verify: bool,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub verify_timeout_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5678".to_string(),
            verify: true,
            max_retries: 3,
            retry_base_delay_ms: 2000,
            verify_timeout_seconds: 30,
        }
    }
}

impl StorageConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    pub base_url: String,
    pub confirmation_timeout_seconds: u64,
    pub poll_interval_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8545".to_string(),
            confirmation_timeout_seconds: 90,
            poll_interval_ms: 1500,
        }
    }
}

impl LedgerConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ContextConfig {
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// How many of the newest stored dreams are quoted in the prompt.
    pub recent_dreams: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            recent_dreams: 3,
        }
    }
}

impl ContextConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkersConfig {
    pub identity_sync_interval_seconds: u64,
    /// Balance below which the funding worker warns after a check.
    pub funding_minimum_balance: f64,
    pub command_buffer: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            identity_sync_interval_seconds: 300,
            funding_minimum_balance: 0.01,
            command_buffer: 32,
        }
    }
}

impl SomniaConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("SOMNIA").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    /// Parse a configuration from an inline TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        s.try_deserialize()
    }
}
