//! Wire shapes returned by the reasoning models.
//!
//! Model output is untrusted: it is deserialized into these loose structs
//! first, then validated and coerced into the strongly typed stage results.
//! Anything that fails validation is reported as a schema violation and the
//! item ends in `Error`.

use serde::Deserialize;
use signal_core::{
    Category, DataRequest, DecisionResult, RiskMode, ScreeningResult, TimeHorizon, TradeDecision,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningWire {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "analysis_text", alias = "analysis")]
    pub analysis_text: String,
    #[serde(alias = "should_deepen")]
    pub should_deepen: bool,
    pub category: String,
    #[serde(default, alias = "affected_assets")]
    pub affected_assets: Vec<String>,
    #[serde(default, alias = "required_data_requests")]
    pub required_data_requests: Vec<DataRequestWire>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataRequestWire {
    #[serde(alias = "type")]
    pub kind: String,
    #[serde(default, alias = "ticker")]
    pub symbol: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ScreeningWire {
    /// Validate into a `ScreeningResult`, using `fallback_title` when the model omitted one.
    pub fn validate(self, fallback_title: &str) -> Result<ScreeningResult, String> {
        let category: Category = self.category.parse()?;

        let title = self
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| fallback_title.to_string());

        let affected_assets = self
            .affected_assets
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        let required_data_requests = self
            .required_data_requests
            .into_iter()
            .map(|r| DataRequest {
                kind: r.kind,
                symbol: r.symbol.map(|s| s.trim().to_ascii_uppercase()),
                description: r.description,
            })
            .collect();

        Ok(ScreeningResult {
            title,
            analysis_text: self.analysis_text,
            should_deepen: self.should_deepen,
            category,
            affected_assets,
            required_data_requests,
        })
    }
}

/// Research answers are free text with an optional JSON envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchWire {
    #[serde(alias = "external_impact", alias = "impact")]
    pub external_impact: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionWire {
    #[serde(alias = "trade_decision")]
    pub trade_decision: String,
    #[serde(alias = "importance_score")]
    pub importance_score: f64,
    #[serde(default, alias = "signal_blocked")]
    pub signal_blocked: bool,
    #[serde(default, alias = "block_reason")]
    pub block_reason: Option<String>,
    #[serde(alias = "would_trade")]
    pub would_trade: bool,
    #[serde(alias = "time_horizon")]
    pub time_horizon: String,
    #[serde(alias = "risk_mode")]
    pub risk_mode: String,
}

impl DecisionWire {
    pub fn validate(self) -> Result<DecisionResult, String> {
        let trade_decision: TradeDecision = self.trade_decision.parse()?;
        let time_horizon: TimeHorizon = self.time_horizon.parse()?;
        let risk_mode: RiskMode = self.risk_mode.parse()?;

        if !self.importance_score.is_finite() {
            return Err("importanceScore is not a number".to_string());
        }
        let score = self.importance_score.round();
        if !(0.0..=10.0).contains(&score) {
            return Err(format!("importanceScore {} outside 0..=10", self.importance_score));
        }

        let block_reason = self
            .block_reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        Ok(DecisionResult {
            trade_decision,
            importance_score: score as u8,
            signal_blocked: self.signal_blocked,
            block_reason,
            would_trade: self.would_trade,
            time_horizon,
            risk_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_screening_accepts_snake_case_and_defaults() {
        let wire: ScreeningWire = serde_json::from_value(json!({
            "analysis_text": "Rate cut priced in",
            "should_deepen": true,
            "category": "Macro",
            "affected_assets": [" SPY ", ""],
            "required_data_requests": [{"type": "price", "ticker": "spy"}]
        }))
        .unwrap();

        let result = wire.validate("Fallback").unwrap();
        assert_eq!(result.title, "Fallback");
        assert_eq!(result.category, Category::Macro);
        assert_eq!(result.affected_assets, vec!["SPY".to_string()]);
        assert_eq!(result.required_data_requests[0].price_symbol(), Some("SPY"));
    }

    #[test]
    fn test_screening_rejects_unknown_category() {
        let wire: ScreeningWire = serde_json::from_value(json!({
            "title": "x",
            "analysisText": "y",
            "shouldDeepen": false,
            "category": "sports"
        }))
        .unwrap();
        assert!(wire.validate("x").is_err());
    }

    #[test]
    fn test_decision_rounds_score_and_parses_enums() {
        let wire: DecisionWire = serde_json::from_value(json!({
            "tradeDecision": "strong sell",
            "importanceScore": 7.6,
            "signalBlocked": true,
            "blockReason": "  ",
            "wouldTrade": false,
            "timeHorizon": "Intraday",
            "riskMode": "conservative"
        }))
        .unwrap();

        let decision = wire.validate().unwrap();
        assert_eq!(decision.trade_decision, TradeDecision::StrongSell);
        assert_eq!(decision.importance_score, 8);
        assert_eq!(decision.block_reason, None);
        assert_eq!(decision.time_horizon, TimeHorizon::Intraday);
    }

    #[test]
    fn test_decision_rejects_out_of_range_score() {
        let wire: DecisionWire = serde_json::from_value(json!({
            "tradeDecision": "BUY",
            "importanceScore": 14,
            "wouldTrade": true,
            "timeHorizon": "swing",
            "riskMode": "normal"
        }))
        .unwrap();
        assert!(wire.validate().is_err());
    }

    #[test]
    fn test_decision_rejects_hold() {
        let wire: DecisionWire = serde_json::from_value(json!({
            "tradeDecision": "HOLD",
            "importanceScore": 3,
            "wouldTrade": false,
            "timeHorizon": "swing",
            "riskMode": "normal"
        }))
        .unwrap();
        assert!(wire.validate().is_err());
    }
}
