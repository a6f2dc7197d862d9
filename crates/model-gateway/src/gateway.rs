use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use signal_core::{ModelRole, TokenUsage};

use crate::endpoint::{HttpModelEndpoint, ModelEndpoint, ModelRequest};
use crate::error::{ModelError, ModelResult};
use crate::retry::RetryPolicy;
use crate::structured::parse_structured;
use crate::GatewayConfig;

/// System + user prompt pair
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Outcome of one logical gateway call. Usage is always present so billed
/// but unusable answers still reach the cost ledger.
#[derive(Debug, Clone)]
pub struct ModelCall<T> {
    pub role: ModelRole,
    pub usage: TokenUsage,
    pub attempts: u32,
    pub outcome: ModelResult<T>,
}

impl<T> ModelCall<T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    fn and_then<U>(self, f: impl FnOnce(T) -> ModelResult<U>) -> ModelCall<U> {
        ModelCall {
            role: self.role,
            usage: self.usage,
            attempts: self.attempts,
            outcome: self.outcome.and_then(f),
        }
    }
}

/// One endpoint per model role
#[derive(Clone)]
pub struct RoleEndpoints {
    pub screening: Arc<dyn ModelEndpoint>,
    pub research: Arc<dyn ModelEndpoint>,
    pub synthesis: Arc<dyn ModelEndpoint>,
}

impl RoleEndpoints {
    pub fn get(&self, role: ModelRole) -> &Arc<dyn ModelEndpoint> {
        match role {
            ModelRole::Screening => &self.screening,
            ModelRole::Research => &self.research,
            ModelRole::Synthesis => &self.synthesis,
        }
    }
}

/// Uniform call/retry/parse wrapper around the three reasoning models
#[derive(Clone)]
pub struct ModelGateway {
    endpoints: RoleEndpoints,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ModelGateway {
    pub fn new(endpoints: RoleEndpoints, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            endpoints,
            retry,
            timeout,
        }
    }

    /// HTTP endpoints for all three roles sharing one connection pool.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let endpoint = |role: ModelRole| -> Arc<dyn ModelEndpoint> {
            Arc::new(HttpModelEndpoint::new(
                client.clone(),
                config.base_url.clone(),
                config.api_key.clone(),
                config.model(role).to_string(),
            ))
        };

        Self::new(
            RoleEndpoints {
                screening: endpoint(ModelRole::Screening),
                research: endpoint(ModelRole::Research),
                synthesis: endpoint(ModelRole::Synthesis),
            },
            config.retry.clone(),
            config.timeout,
        )
    }

    /// Send a prompt and return the raw text, retrying transient failures.
    pub async fn call(&self, role: ModelRole, prompt: &Prompt, max_output_tokens: u32) -> ModelCall<String> {
        let endpoint = self.endpoints.get(role);
        let request = ModelRequest {
            role,
            system_prompt: prompt.system.clone(),
            user_prompt: prompt.user.clone(),
            max_output_tokens,
        };

        let mut usage = TokenUsage::default();
        let mut attempt = 0u32;

        loop {
            let result = match tokio::time::timeout(self.timeout, endpoint.complete(&request)).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(ModelError::Timeout(_))) | Err(_) => Err(ModelError::Timeout(self.timeout)),
                Ok(Err(e)) => Err(e),
            };

            match result {
                Ok(response) => {
                    usage += response.usage;
                    tracing::debug!(
                        role = %role,
                        model = endpoint.model_name(),
                        attempt = attempt + 1,
                        input_tokens = response.usage.input_tokens,
                        output_tokens = response.usage.output_tokens,
                        "Model call succeeded"
                    );
                    return ModelCall {
                        role,
                        usage,
                        attempts: attempt + 1,
                        outcome: Ok(response.text),
                    };
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let wait = match &e {
                        ModelError::RateLimited {
                            retry_after: Some(hint),
                        } => self.retry.retry_after(*hint),
                        _ => self.retry.delay(attempt),
                    };
                    tracing::warn!(
                        role = %role,
                        attempt = attempt + 1,
                        error = %e,
                        "Model call failed, retrying in {}ms",
                        wait.as_millis()
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        role = %role,
                        attempts = attempt + 1,
                        kind = e.kind(),
                        error = %e,
                        "Model call failed"
                    );
                    return ModelCall {
                        role,
                        usage,
                        attempts: attempt + 1,
                        outcome: Err(e),
                    };
                }
            }
        }
    }

    /// `call` followed by JSON recovery and validation into `T`.
    pub async fn call_structured<T: DeserializeOwned>(
        &self,
        role: ModelRole,
        prompt: &Prompt,
        max_output_tokens: u32,
    ) -> ModelCall<T> {
        let call = self.call(role, prompt, max_output_tokens).await;
        call.and_then(|text| parse_structured::<T>(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ModelResponse;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Endpoint that replays a fixed script of results
    struct ScriptedEndpoint {
        script: Mutex<VecDeque<ModelResult<ModelResponse>>>,
        calls: Mutex<u32>,
        delay: Option<Duration>,
    }

    impl ScriptedEndpoint {
        fn new(script: Vec<ModelResult<ModelResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
                delay: None,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(0),
                delay: Some(delay),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ModelEndpoint for ScriptedEndpoint {
        async fn complete(&self, _request: &ModelRequest) -> ModelResult<ModelResponse> {
            *self.calls.lock().unwrap() += 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(ModelError::ServerError { status: 500, message: "script exhausted".into() }))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn ok(text: &str, input: u64, output: u64) -> ModelResult<ModelResponse> {
        Ok(ModelResponse {
            text: text.to_string(),
            usage: TokenUsage::new(input, output),
        })
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    fn gateway_with(endpoint: Arc<ScriptedEndpoint>, timeout: Duration) -> ModelGateway {
        let endpoints = RoleEndpoints {
            screening: endpoint.clone(),
            research: endpoint.clone(),
            synthesis: endpoint,
        };
        ModelGateway::new(endpoints, fast_retry(), timeout)
    }

    fn prompt() -> Prompt {
        Prompt::new("system", "user")
    }

    #[derive(Debug, Deserialize)]
    struct Answer {
        ok: bool,
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let endpoint = ScriptedEndpoint::new(vec![
            Err(ModelError::ServerError { status: 502, message: "bad gateway".into() }),
            Err(ModelError::Timeout(Duration::ZERO)),
            ok("hello", 10, 5),
        ]);
        let gateway = gateway_with(endpoint.clone(), Duration::from_secs(5));

        let call = gateway.call(ModelRole::Screening, &prompt(), 100).await;
        assert_eq!(call.outcome.unwrap(), "hello");
        assert_eq!(call.attempts, 3);
        assert_eq!(call.usage, TokenUsage::new(10, 5));
        assert_eq!(endpoint.calls(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let endpoint = ScriptedEndpoint::new(vec![
            Err(ModelError::ServerError { status: 500, message: String::new() }),
            Err(ModelError::ServerError { status: 500, message: String::new() }),
            Err(ModelError::ServerError { status: 500, message: String::new() }),
            ok("never reached", 1, 1),
        ]);
        let gateway = gateway_with(endpoint.clone(), Duration::from_secs(5));

        let call = gateway.call(ModelRole::Research, &prompt(), 100).await;
        assert!(matches!(call.outcome, Err(ModelError::ServerError { .. })));
        assert_eq!(call.attempts, 3);
        assert!(call.usage.is_zero());
        assert_eq!(endpoint.calls(), 3);
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let endpoint = ScriptedEndpoint::new(vec![
            Err(ModelError::ClientError { status: 400, message: "bad request".into() }),
            ok("never reached", 1, 1),
        ]);
        let gateway = gateway_with(endpoint.clone(), Duration::from_secs(5));

        let call = gateway.call(ModelRole::Synthesis, &prompt(), 100).await;
        assert!(matches!(call.outcome, Err(ModelError::ClientError { status: 400, .. })));
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_honors_retry_after() {
        let endpoint = ScriptedEndpoint::new(vec![
            Err(ModelError::RateLimited { retry_after: Some(Duration::from_millis(20)) }),
            ok("{\"ok\":true}", 3, 2),
        ]);
        let gateway = gateway_with(endpoint.clone(), Duration::from_secs(5));

        let started = std::time::Instant::now();
        let call = gateway.call(ModelRole::Screening, &prompt(), 100).await;
        assert!(call.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_without_hint_backs_off_like_server_error() {
        let endpoint = ScriptedEndpoint::new(vec![
            Err(ModelError::RateLimited { retry_after: None }),
            Err(ModelError::RateLimited { retry_after: None }),
            ok("{\"ok\":true}", 3, 2),
        ]);
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(20),
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        let gateway = ModelGateway::new(
            RoleEndpoints {
                screening: endpoint.clone(),
                research: endpoint.clone(),
                synthesis: endpoint.clone(),
            },
            policy,
            Duration::from_secs(5),
        );

        let started = std::time::Instant::now();
        let call = gateway.call(ModelRole::Screening, &prompt(), 100).await;
        assert!(call.is_ok());
        assert_eq!(call.attempts, 3);
        // 20ms then 40ms, exactly the server-error schedule
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(endpoint.calls(), 3);
    }

    #[tokio::test]
    async fn test_timeout_enforced_by_gateway() {
        let endpoint = ScriptedEndpoint::slow(Duration::from_secs(30));
        let gateway = ModelGateway::new(
            RoleEndpoints {
                screening: endpoint.clone(),
                research: endpoint.clone(),
                synthesis: endpoint.clone(),
            },
            RetryPolicy::none(),
            Duration::from_millis(20),
        );

        let call = gateway.call(ModelRole::Screening, &prompt(), 100).await;
        assert_eq!(call.outcome.unwrap_err(), ModelError::Timeout(Duration::from_millis(20)));
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn test_structured_parse_error_keeps_usage() {
        let endpoint = ScriptedEndpoint::new(vec![ok("definitely not json", 120, 40)]);
        let gateway = gateway_with(endpoint, Duration::from_secs(5));

        let call: ModelCall<Answer> = gateway.call_structured(ModelRole::Screening, &prompt(), 100).await;
        assert!(matches!(call.outcome, Err(ModelError::Parse { .. })));
        assert_eq!(call.usage, TokenUsage::new(120, 40));
    }

    #[tokio::test]
    async fn test_structured_recovers_embedded_json() {
        let endpoint = ScriptedEndpoint::new(vec![ok("Result follows: {\"ok\": true} -- end", 7, 3)]);
        let gateway = gateway_with(endpoint, Duration::from_secs(5));

        let call: ModelCall<Answer> = gateway.call_structured(ModelRole::Synthesis, &prompt(), 100).await;
        assert!(call.outcome.unwrap().ok);
    }
}
