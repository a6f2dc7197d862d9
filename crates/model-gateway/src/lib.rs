pub mod endpoint;
pub mod error;
pub mod gateway;
pub mod retry;
pub mod structured;

pub use endpoint::{HttpModelEndpoint, ModelEndpoint, ModelRequest, ModelResponse};
pub use error::{ConfigError, ModelError, ModelResult};
pub use gateway::{ModelCall, ModelGateway, Prompt, RoleEndpoints};
pub use retry::RetryPolicy;

use signal_core::ModelRole;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the reasoning-model endpoints
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub screening_model: String,
    pub research_model: String,
    pub synthesis_model: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("MODEL_API_KEY")
            .map_err(|_| ConfigError::MissingVar("MODEL_API_KEY".to_string()))?;
        let defaults = RetryPolicy::default();

        let config = Self {
            base_url: std::env::var("MODEL_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
            api_key,
            screening_model: std::env::var("SCREENING_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4o-mini".to_string()),
            research_model: std::env::var("RESEARCH_MODEL")
                .unwrap_or_else(|_| "perplexity/sonar".to_string()),
            synthesis_model: std::env::var("SYNTHESIS_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4.1".to_string()),
            timeout: Duration::from_secs(env_or("MODEL_TIMEOUT_SECS", 60u64)?),
            retry: RetryPolicy {
                max_retries: env_or("MODEL_MAX_RETRIES", defaults.max_retries)?,
                base_delay: Duration::from_millis(env_or("MODEL_BACKOFF_BASE_MS", 500u64)?),
                factor: env_or("MODEL_BACKOFF_FACTOR", defaults.factor)?,
                jitter: env_or("MODEL_BACKOFF_JITTER", defaults.jitter)?,
                max_delay: defaults.max_delay,
            },
        };
        config.retry.check().map_err(ConfigError::InvalidRetry)?;
        Ok(config)
    }

    pub fn model(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Screening => &self.screening_model,
            ModelRole::Research => &self.research_model,
            ModelRole::Synthesis => &self.synthesis_model,
        }
    }
}

fn env_or<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidVar {
            var: var.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}
