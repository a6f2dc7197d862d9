//! Token usage to monetary cost accounting.
//!
//! All arithmetic is done in `rust_decimal::Decimal`; per-token prices are
//! parsed from strings so no float ever touches a cost figure. Line costs and
//! totals are kept at `COST_SCALE` (10) decimal places, which makes the
//! stored total always equal to the sum of its lines.

pub mod prices;

pub use prices::{ModelPrice, PriceTable, PriceTableError};

use rust_decimal::Decimal;
use signal_core::{CostBreakdown, CostLine, ModelRole, TokenUsage, COST_SCALE};

/// Cost of a single call at the given price.
pub fn cost_of(price: &ModelPrice, usage: TokenUsage) -> Decimal {
    let input = Decimal::from(usage.input_tokens) * price.input_per_token;
    let output = Decimal::from(usage.output_tokens) * price.output_per_token;
    (input + output).round_dp(COST_SCALE)
}

/// Total of a breakdown's three lines.
pub fn total(costs: &CostBreakdown) -> Decimal {
    costs.sum_of_lines()
}

/// Per-item accumulator. One ledger lives for the duration of one pipeline run.
#[derive(Debug, Clone)]
pub struct CostLedger {
    prices: PriceTable,
    screening: CostLine,
    research: CostLine,
    synthesis: CostLine,
}

impl CostLedger {
    pub fn new(prices: PriceTable) -> Self {
        Self {
            prices,
            screening: CostLine::default(),
            research: CostLine::default(),
            synthesis: CostLine::default(),
        }
    }

    /// Account one model call for `role`. Zero-usage calls still count as a request.
    pub fn add_usage(&mut self, role: ModelRole, usage: TokenUsage) -> CostLine {
        let cost = cost_of(self.prices.price(role), usage);
        let line = self.line_mut(role);
        line.input_tokens += usage.input_tokens;
        line.output_tokens += usage.output_tokens;
        line.request_count += 1;
        line.cost = (line.cost + cost).round_dp(COST_SCALE);

        tracing::debug!(
            role = %role,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost = %cost,
            "Recorded model usage"
        );

        line.clone()
    }

    pub fn line(&self, role: ModelRole) -> &CostLine {
        match role {
            ModelRole::Screening => &self.screening,
            ModelRole::Research => &self.research,
            ModelRole::Synthesis => &self.synthesis,
        }
    }

    fn line_mut(&mut self, role: ModelRole) -> &mut CostLine {
        match role {
            ModelRole::Screening => &mut self.screening,
            ModelRole::Research => &mut self.research,
            ModelRole::Synthesis => &mut self.synthesis,
        }
    }

    pub fn total(&self) -> Decimal {
        (self.screening.cost + self.research.cost + self.synthesis.cost).round_dp(COST_SCALE)
    }

    /// Snapshot suitable for attaching to a record.
    pub fn breakdown(&self) -> CostBreakdown {
        CostBreakdown {
            screening: self.screening.clone(),
            research: self.research.clone(),
            synthesis: self.synthesis.clone(),
            total: self.total(),
        }
    }
}
