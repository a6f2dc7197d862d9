//! Scripted in-process fakes for pipeline tests, here and in downstream crates.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use cost_ledger::{ModelPrice, PriceTable};
use model_gateway::{
    ModelEndpoint, ModelError, ModelGateway, ModelRequest, ModelResponse, ModelResult, RetryPolicy,
    RoleEndpoints,
};
use rust_decimal::Decimal;
use signal_core::{
    MarketDataProvider, NewsItem, PriceSnapshot, SignalError, SignalResult, TokenUsage,
};

use crate::pipeline::{PipelineConfig, StagePipeline};

/// Replays queued answers; prompts matching a failure rule always fail, and
/// an optional fallback answers once the queue is empty.
#[derive(Default)]
pub struct ScriptedEndpoint {
    script: Mutex<VecDeque<ModelResult<ModelResponse>>>,
    failures: Mutex<Vec<(String, ModelError)>>,
    panics: Mutex<Vec<String>>,
    latency: Mutex<Duration>,
    fallback: Mutex<Option<ModelResponse>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedEndpoint {
    pub fn fail_when(&self, prompt_contains: &str, err: ModelError) {
        self.failures.lock().unwrap().push((prompt_contains.to_string(), err));
    }

    /// Every call sleeps this long before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Prompts containing `prompt_contains` panic inside the endpoint.
    pub fn panic_when(&self, prompt_contains: &str) {
        self.panics.lock().unwrap().push(prompt_contains.to_string());
    }

    pub fn set_fallback(&self, text: &str, input: u64, output: u64) {
        *self.fallback.lock().unwrap() = Some(ModelResponse {
            text: text.to_string(),
            usage: TokenUsage::new(input, output),
        });
    }

    pub fn push_ok(&self, text: &str, input: u64, output: u64) {
        self.script.lock().unwrap().push_back(Ok(ModelResponse {
            text: text.to_string(),
            usage: TokenUsage::new(input, output),
        }));
    }

    pub fn push_err(&self, err: ModelError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn last_prompt(&self) -> String {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ModelEndpoint for ScriptedEndpoint {
    async fn complete(&self, request: &ModelRequest) -> ModelResult<ModelResponse> {
        self.prompts.lock().unwrap().push(request.user_prompt.clone());
        // Let concurrent callers interleave
        let latency = *self.latency.lock().unwrap();
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }

        let panics = self
            .panics
            .lock()
            .unwrap()
            .iter()
            .any(|marker| request.user_prompt.contains(marker.as_str()));
        if panics {
            panic!("scripted endpoint panic");
        }

        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(marker, _)| request.user_prompt.contains(marker.as_str()))
            .map(|(_, err)| err.clone());
        if let Some(err) = failure {
            return Err(err);
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(answer) => answer,
            None => self.fallback.lock().unwrap().clone().ok_or_else(|| ModelError::ServerError {
                status: 503,
                message: "script exhausted".to_string(),
            }),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[derive(Default)]
pub struct FakeMarket {
    answers: Mutex<HashMap<String, Result<Option<PriceSnapshot>, String>>>,
}

impl FakeMarket {
    pub fn set(&self, symbol: &str, answer: Result<Option<PriceSnapshot>, String>) {
        self.answers.lock().unwrap().insert(symbol.to_string(), answer);
    }
}

#[async_trait]
impl MarketDataProvider for FakeMarket {
    async fn get_snapshot(
        &self,
        symbol: &str,
        _at_or_after: chrono::DateTime<Utc>,
    ) -> SignalResult<Option<PriceSnapshot>> {
        match self.answers.lock().unwrap().get(symbol).cloned() {
            Some(Ok(snapshot)) => Ok(snapshot),
            Some(Err(e)) => Err(SignalError::MarketDataError(e)),
            None => Ok(None),
        }
    }
}

/// Prices that keep the expected figures in tests readable
pub fn test_prices() -> PriceTable {
    PriceTable {
        screening: ModelPrice::new(Decimal::new(1, 7), Decimal::new(4, 7)),
        research: ModelPrice::new(Decimal::new(6, 7), Decimal::new(6, 7)),
        synthesis: ModelPrice::new(Decimal::new(5, 7), Decimal::new(3, 6)),
    }
}

#[derive(Default)]
pub struct Harness {
    pub screening: Arc<ScriptedEndpoint>,
    pub research: Arc<ScriptedEndpoint>,
    pub synthesis: Arc<ScriptedEndpoint>,
    pub market: Arc<FakeMarket>,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipeline(&self) -> StagePipeline {
        let gateway = ModelGateway::new(
            RoleEndpoints {
                screening: self.screening.clone(),
                research: self.research.clone(),
                synthesis: self.synthesis.clone(),
            },
            RetryPolicy::none(),
            Duration::from_secs(5),
        );
        StagePipeline::new(gateway, self.market.clone(), test_prices(), PipelineConfig::default())
    }

    /// Every call on every role succeeds with an accepted, tradeable answer.
    pub fn accept_everything(&self) {
        self.screening.set_fallback(&screening_json(true, &[]), 100, 20);
        self.research.set_fallback("Impact narrative", 100, 50);
        self.synthesis.set_fallback(&decision_json("BUY", true, false), 100, 30);
    }

    /// Script one full accepted run: screen, research, decide.
    pub fn script_completed(&self, decision: &str) {
        self.screening.push_ok(&screening_json(true, &[]), 100, 20);
        self.research.push_ok("Impact narrative", 100, 50);
        self.synthesis.push_ok(&decision_json(decision, true, false), 100, 30);
    }
}

/// Non-retryable failure, for forcing an item into `Error`.
pub fn client_error() -> ModelError {
    ModelError::ClientError {
        status: 400,
        message: "rejected by test".to_string(),
    }
}

pub fn item(id: &str, title: &str, tickers: &[&str]) -> NewsItem {
    NewsItem {
        id: id.to_string(),
        title: title.to_string(),
        body: format!("{} Full story follows.", title),
        source: "test".to_string(),
        published_at: Utc.with_ymd_and_hms(2024, 3, 20, 18, 0, 0).unwrap(),
        tickers: tickers.iter().map(|t| t.to_string()).collect(),
    }
}

pub fn snapshot(symbol: &str, change_pct: f64) -> PriceSnapshot {
    PriceSnapshot {
        symbol: symbol.to_string(),
        price_at_news: 100.0,
        latest_price: 100.0 * (1.0 + change_pct / 100.0),
        change_pct,
        observed_at: Utc.with_ymd_and_hms(2024, 3, 20, 18, 30, 0).unwrap(),
        reacted: change_pct.abs() >= 1.0,
    }
}

pub fn screening_json(should_deepen: bool, assets: &[&str]) -> String {
    serde_json::json!({
        "title": "Screened headline",
        "analysisText": "Screening notes",
        "shouldDeepen": should_deepen,
        "category": "macro",
        "affectedAssets": assets,
        "requiredDataRequests": []
    })
    .to_string()
}

pub fn decision_json(decision: &str, would_trade: bool, blocked: bool) -> String {
    // Wrapped in a fence to exercise response cleanup
    format!(
        "```json\n{}\n```",
        serde_json::json!({
            "tradeDecision": decision,
            "importanceScore": 7,
            "signalBlocked": blocked,
            "blockReason": if blocked { Some("already priced in") } else { None },
            "wouldTrade": would_trade,
            "timeHorizon": "swing",
            "riskMode": "normal"
        })
    )
}
