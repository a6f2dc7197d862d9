use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Model request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Model client error ({status}): {message}")]
    ClientError { status: u16, message: String },

    #[error("Model server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Model transport error: {0}")]
    Transport(String),

    #[error("Unparseable model output: {reason}")]
    Parse { reason: String, raw: String },
}

impl ModelError {
    /// Map a non-success HTTP status to the matching variant.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => ModelError::RateLimited { retry_after },
            408 => ModelError::Timeout(Duration::ZERO),
            400..=499 => ModelError::ClientError { status, message },
            _ => ModelError::ServerError { status, message },
        }
    }

    /// Timeouts, rate limits, 5xx and dropped connections are retried; everything else surfaces.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModelError::Timeout(_)
                | ModelError::RateLimited { .. }
                | ModelError::ServerError { .. }
                | ModelError::Transport(_)
        )
    }

    /// Short label used in logs and stored diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelError::Timeout(_) => "model_timeout",
            ModelError::RateLimited { .. } => "model_rate_limited",
            ModelError::ClientError { .. } => "model_client_error",
            ModelError::ServerError { .. } => "model_server_error",
            ModelError::Transport(_) => "model_transport_error",
            ModelError::Parse { .. } => "parse_error",
        }
    }
}

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: '{value}'")]
    InvalidVar { var: String, value: String },

    #[error("Invalid retry policy: {0}")]
    InvalidRetry(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ModelError::from_status(429, String::new(), None),
            ModelError::RateLimited { retry_after: None }
        ));
        assert!(matches!(
            ModelError::from_status(404, "nope".into(), None),
            ModelError::ClientError { status: 404, .. }
        ));
        assert!(matches!(
            ModelError::from_status(503, "down".into(), None),
            ModelError::ServerError { status: 503, .. }
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(ModelError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ModelError::ServerError { status: 502, message: String::new() }.is_retryable());
        assert!(!ModelError::ClientError { status: 400, message: String::new() }.is_retryable());
        assert!(!ModelError::Parse { reason: String::new(), raw: String::new() }.is_retryable());
    }
}
