use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use cost_ledger::{CostLedger, PriceTable};
use futures_util::future::join_all;
use model_gateway::structured::parse_structured;
use model_gateway::ModelGateway;
use signal_core::{
    AnalysisRecord, AnalysisStatus, CostBreakdown, DecisionResult, EnrichmentResult,
    MarketDataProvider, ModelRole, NewsItem, PriceSnapshot, ScreeningResult, TradeDecision,
};
use tracing::{debug, info, warn};

use crate::prompts;
use crate::schema::{DecisionWire, ResearchWire, ScreeningWire};

/// Per-item pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ingested,
    Screening,
    Enriching,
    Deciding,
    Rejected,
    Completed,
    Error,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Ingested => "ingested",
            Stage::Screening => "screening",
            Stage::Enriching => "enriching",
            Stage::Deciding => "deciding",
            Stage::Rejected => "rejected",
            Stage::Completed => "completed",
            Stage::Error => "error",
        };
        f.write_str(name)
    }
}

/// Output token caps per model role
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub screening_max_tokens: u32,
    pub research_max_tokens: u32,
    pub synthesis_max_tokens: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            screening_max_tokens: 600,
            research_max_tokens: 1200,
            synthesis_max_tokens: 500,
        }
    }
}

/// Screen, then conditionally enrich, then decide.
///
/// `run` never fails: every model or validation failure is folded into an
/// `Error` record carrying whatever stages completed and the cost spent so far.
pub struct StagePipeline {
    gateway: ModelGateway,
    market_data: Arc<dyn MarketDataProvider>,
    prices: PriceTable,
    config: PipelineConfig,
}

/// Working state for one item
struct Run<'a> {
    item: &'a NewsItem,
    ledger: CostLedger,
    stage: Stage,
    stage1: Option<ScreeningResult>,
    stage2: Option<EnrichmentResult>,
    stage3: Option<DecisionResult>,
    started_at: chrono::DateTime<Utc>,
}

impl<'a> Run<'a> {
    fn enter(&mut self, next: Stage) {
        debug!(news_id = %self.item.id, from = %self.stage, to = %next, "Stage transition");
        self.stage = next;
    }

    fn finish(mut self, status: AnalysisStatus, error: Option<String>) -> AnalysisRecord {
        let terminal = match status {
            AnalysisStatus::Rejected => Stage::Rejected,
            AnalysisStatus::Completed => Stage::Completed,
            AnalysisStatus::Error => Stage::Error,
        };
        self.enter(terminal);

        let costs: CostBreakdown = self.ledger.breakdown();
        AnalysisRecord {
            news_id: self.item.id.clone(),
            title: self.item.title.clone(),
            body: self.item.body.clone(),
            tickers: self.item.tickers.clone(),
            source: self.item.source.clone(),
            published_at: self.item.published_at,
            stage1: self.stage1,
            stage2: self.stage2,
            stage3: self.stage3,
            costs,
            status,
            error,
            created_at: self.started_at,
            updated_at: Utc::now(),
        }
    }

    fn fail(self, reason: String) -> AnalysisRecord {
        let message = format!("{} failed: {}", self.stage, reason);
        warn!(news_id = %self.item.id, stage = %self.stage, error = %reason, "Pipeline stage failed");
        self.finish(AnalysisStatus::Error, Some(message))
    }
}

impl StagePipeline {
    pub fn new(
        gateway: ModelGateway,
        market_data: Arc<dyn MarketDataProvider>,
        prices: PriceTable,
        config: PipelineConfig,
    ) -> Self {
        Self {
            gateway,
            market_data,
            prices,
            config,
        }
    }

    /// Analyse one item to a terminal record. The caller must already hold the claim.
    pub async fn run(&self, item: &NewsItem) -> AnalysisRecord {
        let mut run = Run {
            item,
            ledger: CostLedger::new(self.prices.clone()),
            stage: Stage::Ingested,
            stage1: None,
            stage2: None,
            stage3: None,
            started_at: Utc::now(),
        };

        // Screen
        run.enter(Stage::Screening);
        let call = self
            .gateway
            .call_structured::<ScreeningWire>(
                ModelRole::Screening,
                &prompts::screening(item),
                self.config.screening_max_tokens,
            )
            .await;
        run.ledger.add_usage(ModelRole::Screening, call.usage);

        let screening = match call.outcome.map_err(|e| e.to_string()).and_then(|w| w.validate(&item.title)) {
            Ok(s) => s,
            Err(reason) => return run.fail(reason),
        };
        run.stage1 = Some(screening.clone());

        if !screening.should_deepen {
            info!(news_id = %item.id, category = %screening.category, "Screened out");
            return run.finish(AnalysisStatus::Rejected, None);
        }

        // Enrich
        run.enter(Stage::Enriching);
        run.stage2 = self.enrich(&mut run.ledger, item, &screening).await;

        // Decide
        run.enter(Stage::Deciding);
        let call = self
            .gateway
            .call_structured::<DecisionWire>(
                ModelRole::Synthesis,
                &prompts::synthesis(item, &screening, run.stage2.as_ref()),
                self.config.synthesis_max_tokens,
            )
            .await;
        run.ledger.add_usage(ModelRole::Synthesis, call.usage);

        let decision = match call.outcome.map_err(|e| e.to_string()).and_then(|w| w.validate()) {
            Ok(d) => normalize(d),
            Err(reason) => return run.fail(reason),
        };

        info!(
            news_id = %item.id,
            decision = %decision.trade_decision,
            importance = decision.importance_score,
            blocked = decision.signal_blocked,
            cost = %run.ledger.total(),
            "Signal decided"
        );
        run.stage3 = Some(decision);
        run.finish(AnalysisStatus::Completed, None)
    }

    /// Market snapshots plus one research call. Lookup misses and research
    /// failures degrade the result instead of failing the item; `None` means
    /// nothing usable came back at all.
    async fn enrich(
        &self,
        ledger: &mut CostLedger,
        item: &NewsItem,
        screening: &ScreeningResult,
    ) -> Option<EnrichmentResult> {
        let symbols = lookup_symbols(item, screening);

        let lookups = symbols.iter().map(|symbol| async move {
            let result = self.market_data.get_snapshot(symbol, item.published_at).await;
            (symbol.clone(), result)
        });

        let mut market_reaction: Vec<PriceSnapshot> = Vec::new();
        let mut missing_symbols = Vec::new();
        for (symbol, result) in join_all(lookups).await {
            match result {
                Ok(Some(snapshot)) => market_reaction.push(snapshot),
                Ok(None) => {
                    debug!(news_id = %item.id, symbol = %symbol, "No market data");
                    missing_symbols.push(symbol);
                }
                Err(e) => {
                    warn!(news_id = %item.id, symbol = %symbol, error = %e, "Market data lookup failed");
                    missing_symbols.push(symbol);
                }
            }
        }

        let mut enrichment = EnrichmentResult {
            market_reaction,
            missing_symbols,
            external_impact: String::new(),
            raw_research_text: String::new(),
            research_available: false,
        };

        let call = self
            .gateway
            .call(
                ModelRole::Research,
                &prompts::research(item, screening, &enrichment),
                self.config.research_max_tokens,
            )
            .await;
        ledger.add_usage(ModelRole::Research, call.usage);

        match call.outcome {
            Ok(text) => {
                enrichment.external_impact = research_impact(&text);
                enrichment.raw_research_text = text;
                enrichment.research_available = true;
            }
            Err(e) => {
                warn!(news_id = %item.id, error = %e, "Research unavailable, deciding without it");
                if enrichment.market_reaction.is_empty() {
                    return None;
                }
            }
        }

        Some(enrichment)
    }
}

/// NO_TRADE never trades, whatever the model claimed.
fn normalize(mut decision: DecisionResult) -> DecisionResult {
    if decision.trade_decision == TradeDecision::NoTrade && decision.would_trade {
        debug!("Forcing wouldTrade=false for NO_TRADE decision");
        decision.would_trade = false;
    }
    decision
}

/// Prefer the JSON `externalImpact`; fall back to the whole answer as prose.
fn research_impact(text: &str) -> String {
    match parse_structured::<ResearchWire>(text) {
        Ok(wire) if !wire.external_impact.trim().is_empty() => wire.external_impact,
        _ => text.trim().to_string(),
    }
}

fn as_ticker(raw: &str) -> Option<String> {
    let s = raw.trim().trim_start_matches('$');
    let valid = !s.is_empty()
        && s.len() <= 12
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '/'));
    valid.then(|| s.to_ascii_uppercase())
}

/// Tickers to look up: affected assets and explicit price requests, falling
/// back to the item's own tags when the model named none.
fn lookup_symbols(item: &NewsItem, screening: &ScreeningResult) -> Vec<String> {
    let mut symbols: BTreeSet<String> = screening
        .affected_assets
        .iter()
        .filter_map(|a| as_ticker(a))
        .chain(
            screening
                .required_data_requests
                .iter()
                .filter_map(|r| r.price_symbol())
                .filter_map(as_ticker),
        )
        .collect();

    if symbols.is_empty() {
        symbols = item.tickers.iter().filter_map(|t| as_ticker(t)).collect();
    }
    symbols.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use model_gateway::ModelError;
    use rust_decimal_macros::dec;
    use signal_core::{Category, DataRequest};

    #[tokio::test]
    async fn test_screened_out_item_is_rejected() {
        let h = Harness::new();
        h.screening.push_ok(&screening_json(false, &[]), 1000, 200);

        let record = h.pipeline().run(&item("n:1", "Minor retailer opens new store", &[])).await;

        assert_eq!(record.status, AnalysisStatus::Rejected);
        assert!(record.stage1.is_some());
        assert!(record.stage2.is_none());
        assert!(record.stage3.is_none());
        assert_eq!(record.costs.total, record.costs.screening.cost);
        assert_eq!(record.costs.research.request_count, 0);
        assert_eq!(record.costs.synthesis.request_count, 0);
        assert_eq!(h.research.calls(), 0);
        assert_eq!(h.synthesis.calls(), 0);
        // 1000 * 0.0000001 + 200 * 0.0000004
        assert_eq!(record.costs.total, dec!(0.00018));
    }

    #[tokio::test]
    async fn test_full_path_completes() {
        let h = Harness::new();
        h.market.set("SPY", Ok(Some(snapshot("SPY", 1.2))));
        h.screening.push_ok(&screening_json(true, &["SPY"]), 1000, 200);
        h.research.push_ok(r#"{"externalImpact": "Broad risk-on move"}"#, 500, 800);
        h.synthesis.push_ok(&decision_json("BUY", true, false), 1500, 300);

        let record = h.pipeline().run(&item("n:2", "Fed cuts rates by 50bp", &["SPY"])).await;

        assert_eq!(record.status, AnalysisStatus::Completed);
        let stage2 = record.stage2.as_ref().unwrap();
        assert_eq!(stage2.market_reaction.len(), 1);
        assert_eq!(stage2.external_impact, "Broad risk-on move");
        assert!(stage2.research_available);
        let stage3 = record.stage3.as_ref().unwrap();
        assert_eq!(stage3.trade_decision, TradeDecision::Buy);
        assert!(record.costs.total > record.costs.screening.cost);
        assert!(record.costs.is_consistent());
        assert_eq!(record.costs.total, dec!(0.00018) + dec!(0.00078) + dec!(0.00165));
        assert!(record.is_actionable());
    }

    #[tokio::test]
    async fn test_no_trade_forces_would_trade_false() {
        let h = Harness::new();
        h.screening.push_ok(&screening_json(true, &[]), 10, 10);
        h.research.push_ok("Nothing material.", 10, 10);
        h.synthesis.push_ok(&decision_json("NO_TRADE", true, false), 10, 10);

        let record = h.pipeline().run(&item("n:3", "Headline", &[])).await;

        let stage3 = record.stage3.unwrap();
        assert_eq!(stage3.trade_decision, TradeDecision::NoTrade);
        assert!(!stage3.would_trade);
    }

    #[tokio::test]
    async fn test_market_data_outage_still_completes() {
        let h = Harness::new();
        h.market.set("AAPL", Err("provider down".to_string()));
        h.screening.push_ok(&screening_json(true, &["AAPL"]), 10, 10);
        h.research.push_ok("Impact narrative", 10, 10);
        h.synthesis.push_ok(&decision_json("SELL", true, false), 10, 10);

        let record = h.pipeline().run(&item("n:4", "Apple recall", &["AAPL"])).await;

        assert_eq!(record.status, AnalysisStatus::Completed);
        let stage2 = record.stage2.unwrap();
        assert!(stage2.market_reaction.is_empty());
        assert_eq!(stage2.missing_symbols, vec!["AAPL".to_string()]);
        assert_eq!(stage2.external_impact, "Impact narrative");
    }

    #[tokio::test]
    async fn test_screening_parse_failure_is_error_with_cost() {
        let h = Harness::new();
        h.screening.push_ok("I cannot answer that.", 400, 20);

        let record = h.pipeline().run(&item("n:5", "Headline", &[])).await;

        assert_eq!(record.status, AnalysisStatus::Error);
        assert!(record.stage1.is_none());
        assert!(record.error.as_deref().unwrap().starts_with("screening failed"));
        assert!(record.costs.screening.cost > dec!(0));
        assert_eq!(record.costs.screening.request_count, 1);
        assert!(record.costs.is_consistent());
    }

    #[tokio::test]
    async fn test_decide_failure_keeps_partial_stages() {
        let h = Harness::new();
        h.screening.push_ok(&screening_json(true, &[]), 10, 10);
        h.research.push_ok("Impact", 10, 10);
        h.synthesis.push_err(ModelError::ClientError { status: 400, message: "bad".into() });

        let record = h.pipeline().run(&item("n:6", "Headline", &[])).await;

        assert_eq!(record.status, AnalysisStatus::Error);
        assert!(record.stage1.is_some());
        assert!(record.stage2.is_some());
        assert!(record.stage3.is_none());
        assert!(record.error.as_deref().unwrap().starts_with("deciding failed"));
        assert_eq!(record.costs.synthesis.request_count, 1);
        assert_eq!(record.costs.synthesis.cost, dec!(0));
    }

    #[tokio::test]
    async fn test_research_failure_without_data_decides_without_enrichment() {
        let h = Harness::new();
        h.screening.push_ok(&screening_json(true, &[]), 10, 10);
        h.research.push_err(ModelError::ClientError { status: 403, message: "denied".into() });
        h.synthesis.push_ok(&decision_json("BUY", true, true), 10, 10);

        let record = h.pipeline().run(&item("n:7", "Headline", &[])).await;

        assert_eq!(record.status, AnalysisStatus::Completed);
        assert!(record.stage2.is_none());
        assert!(h.synthesis.last_prompt().contains(prompts::NO_ENRICHMENT));
        // Blocked signals persist but are not actionable
        assert!(record.stage3.as_ref().unwrap().signal_blocked);
        assert!(!record.is_actionable());
    }

    #[test]
    fn test_lookup_symbols() {
        let screening = ScreeningResult {
            title: "t".into(),
            analysis_text: String::new(),
            should_deepen: true,
            category: Category::Stocks,
            affected_assets: vec!["aapl".into(), "Apple supply chain".into(), "$MSFT".into()],
            required_data_requests: vec![DataRequest {
                kind: "price".into(),
                symbol: Some("NVDA".into()),
                description: None,
            }],
        };
        let symbols = lookup_symbols(&item("x", "t", &["TSLA"]), &screening);
        assert_eq!(symbols, vec!["AAPL", "MSFT", "NVDA"]);

        let empty = ScreeningResult { affected_assets: vec![], required_data_requests: vec![], ..screening };
        assert_eq!(lookup_symbols(&item("x", "t", &["TSLA"]), &empty), vec!["TSLA"]);
    }
}
