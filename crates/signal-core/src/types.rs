use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Decimal places kept for every monetary cost figure.
pub const COST_SCALE: u32 = 10;

/// Raw news article as handed over by the ingestion side. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    /// Stable, source-qualified id (e.g. `polygon:abc123`)
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub tickers: BTreeSet<String>,
}

impl NewsItem {
    /// Body text, falling back to the title when the body is blank.
    pub fn text(&self) -> &str {
        if self.body.trim().is_empty() {
            &self.title
        } else {
            &self.body
        }
    }
}

/// Market category assigned by the screening model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Stocks,
    Forex,
    Crypto,
    Commodities,
    Indices,
    Macro,
    Earnings,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Stocks => "stocks",
            Category::Forex => "forex",
            Category::Crypto => "crypto",
            Category::Commodities => "commodities",
            Category::Indices => "indices",
            Category::Macro => "macro",
            Category::Earnings => "earnings",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stocks" | "stock" | "equities" | "equity" => Ok(Category::Stocks),
            "forex" | "fx" | "currencies" | "currency" => Ok(Category::Forex),
            "crypto" | "cryptocurrency" | "cryptocurrencies" => Ok(Category::Crypto),
            "commodities" | "commodity" => Ok(Category::Commodities),
            "indices" | "index" | "indexes" => Ok(Category::Indices),
            "macro" | "macroeconomic" | "macroeconomics" => Ok(Category::Macro),
            "earnings" => Ok(Category::Earnings),
            other => Err(format!("unknown category '{}'", other)),
        }
    }
}

/// Extra data the screening model asks for before a decision is made
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub kind: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl DataRequest {
    /// Symbol of a price/quote request, if this is one.
    pub fn price_symbol(&self) -> Option<&str> {
        let kind = self.kind.to_ascii_lowercase();
        if kind.contains("price") || kind.contains("quote") {
            self.symbol.as_deref().filter(|s| !s.trim().is_empty())
        } else {
            None
        }
    }
}

/// Stage 1 output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningResult {
    pub title: String,
    pub analysis_text: String,
    pub should_deepen: bool,
    pub category: Category,
    pub affected_assets: Vec<String>,
    pub required_data_requests: Vec<DataRequest>,
}

/// Price observation for one symbol at/after the publication time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub symbol: String,
    /// First traded price at or after publication
    pub price_at_news: f64,
    pub latest_price: f64,
    pub change_pct: f64,
    pub observed_at: DateTime<Utc>,
    /// The move since publication already exceeds the reaction threshold
    pub reacted: bool,
}

/// Stage 2 output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub market_reaction: Vec<PriceSnapshot>,
    /// Symbols whose snapshot lookup failed or returned nothing
    #[serde(default)]
    pub missing_symbols: Vec<String>,
    pub external_impact: String,
    pub raw_research_text: String,
    /// False when the research call itself failed and only market data is present
    #[serde(default = "default_true")]
    pub research_available: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeDecision {
    Buy,
    StrongBuy,
    Sell,
    StrongSell,
    NoTrade,
}

impl TradeDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDecision::Buy => "BUY",
            TradeDecision::StrongBuy => "STRONG_BUY",
            TradeDecision::Sell => "SELL",
            TradeDecision::StrongSell => "STRONG_SELL",
            TradeDecision::NoTrade => "NO_TRADE",
        }
    }

    pub fn is_trade(&self) -> bool {
        !matches!(self, TradeDecision::NoTrade)
    }
}

impl fmt::Display for TradeDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        match normalized.as_str() {
            "BUY" => Ok(TradeDecision::Buy),
            "STRONG_BUY" | "STRONGBUY" => Ok(TradeDecision::StrongBuy),
            "SELL" => Ok(TradeDecision::Sell),
            "STRONG_SELL" | "STRONGSELL" => Ok(TradeDecision::StrongSell),
            "NO_TRADE" | "NOTRADE" => Ok(TradeDecision::NoTrade),
            _ => Err(format!("unknown trade decision '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeHorizon {
    Intraday,
    Swing,
    Position,
}

impl FromStr for TimeHorizon {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "intraday" | "intra-day" | "day" => Ok(TimeHorizon::Intraday),
            "swing" => Ok(TimeHorizon::Swing),
            "position" | "long" => Ok(TimeHorizon::Position),
            other => Err(format!("unknown time horizon '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskMode {
    Conservative,
    Normal,
    Aggressive,
}

impl FromStr for RiskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(RiskMode::Conservative),
            "normal" | "moderate" => Ok(RiskMode::Normal),
            "aggressive" => Ok(RiskMode::Aggressive),
            other => Err(format!("unknown risk mode '{}'", other)),
        }
    }
}

/// Stage 3 output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResult {
    pub trade_decision: TradeDecision,
    /// 0 to 10
    pub importance_score: u8,
    pub signal_blocked: bool,
    pub block_reason: Option<String>,
    pub would_trade: bool,
    pub time_horizon: TimeHorizon,
    pub risk_mode: RiskMode,
}

/// Which reasoning model a call goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Screening,
    Research,
    Synthesis,
}

impl ModelRole {
    pub const ALL: [ModelRole; 3] = [ModelRole::Screening, ModelRole::Research, ModelRole::Synthesis];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Screening => "screening",
            ModelRole::Research => "research",
            ModelRole::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counters reported by a model endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self { input_tokens, output_tokens }
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

impl std::ops::Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

/// Accumulated spend for one model role
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostLine {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub request_count: u32,
    pub cost: Decimal,
}

/// Per-role cost lines plus their total
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub screening: CostLine,
    pub research: CostLine,
    pub synthesis: CostLine,
    pub total: Decimal,
}

impl CostBreakdown {
    pub fn line(&self, role: ModelRole) -> &CostLine {
        match role {
            ModelRole::Screening => &self.screening,
            ModelRole::Research => &self.research,
            ModelRole::Synthesis => &self.synthesis,
        }
    }

    /// Sum of the three line costs at `COST_SCALE` decimal places.
    pub fn sum_of_lines(&self) -> Decimal {
        (self.screening.cost + self.research.cost + self.synthesis.cost).round_dp(COST_SCALE)
    }

    /// True when the stored total equals the sum of its parts.
    pub fn is_consistent(&self) -> bool {
        self.total == self.sum_of_lines()
    }
}

/// Terminal classification of an analysed item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Rejected,
    Error,
    Completed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Rejected => "rejected",
            AnalysisStatus::Error => "error",
            AnalysisStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rejected" => Ok(AnalysisStatus::Rejected),
            "error" => Ok(AnalysisStatus::Error),
            "completed" => Ok(AnalysisStatus::Completed),
            other => Err(format!("unknown analysis status '{}'", other)),
        }
    }
}

/// One persisted analysis per news id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub news_id: String,
    pub title: String,
    /// Input text and tags, kept so `Error` records can be reprocessed
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub tickers: BTreeSet<String>,
    pub source: String,
    pub published_at: DateTime<Utc>,
    /// Absent only when screening itself failed
    pub stage1: Option<ScreeningResult>,
    pub stage2: Option<EnrichmentResult>,
    pub stage3: Option<DecisionResult>,
    pub costs: CostBreakdown,
    pub status: AnalysisStatus,
    /// Diagnostic message for `Error` records
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisRecord {
    /// `Error` record for an item whose run was lost before any stage result
    /// or cost could be collected.
    pub fn failed(item: &NewsItem, error: String) -> Self {
        let now = Utc::now();
        Self {
            news_id: item.id.clone(),
            title: item.title.clone(),
            body: item.body.clone(),
            tickers: item.tickers.clone(),
            source: item.source.clone(),
            published_at: item.published_at,
            stage1: None,
            stage2: None,
            stage3: None,
            costs: CostBreakdown::default(),
            status: AnalysisStatus::Error,
            error: Some(error),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild the news item this record was produced from.
    pub fn news_item(&self) -> NewsItem {
        NewsItem {
            id: self.news_id.clone(),
            title: self.title.clone(),
            body: self.body.clone(),
            source: self.source.clone(),
            published_at: self.published_at,
            tickers: self.tickers.clone(),
        }
    }

    pub fn trade_decision(&self) -> Option<TradeDecision> {
        self.stage3.as_ref().map(|d| d.trade_decision)
    }

    /// Completed, not blocked, and the synthesis model would trade on it.
    pub fn is_actionable(&self) -> bool {
        self.status == AnalysisStatus::Completed
            && self
                .stage3
                .as_ref()
                .map(|d| !d.signal_blocked && d.would_trade)
                .unwrap_or(false)
    }
}

/// Event emitted after a fresh record has been persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalProduced {
    pub news_id: String,
    pub status: AnalysisStatus,
    pub trade_decision: Option<TradeDecision>,
    pub importance_score: Option<u8>,
    pub signal_blocked: bool,
    pub actionable: bool,
    pub total_cost: Decimal,
    pub produced_at: DateTime<Utc>,
}

impl SignalProduced {
    pub fn from_record(record: &AnalysisRecord) -> Self {
        Self {
            news_id: record.news_id.clone(),
            status: record.status,
            trade_decision: record.trade_decision(),
            importance_score: record.stage3.as_ref().map(|d| d.importance_score),
            signal_blocked: record.stage3.as_ref().map(|d| d.signal_blocked).unwrap_or(false),
            actionable: record.is_actionable(),
            total_cost: record.costs.total,
            produced_at: record.updated_at,
        }
    }
}

/// Result of trying to claim a news id before any model spend
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller owns the item now
    Claimed,
    /// Someone else analysed it (`Some`) or is analysing it right now (`None`)
    AlreadyExists { existing: Option<AnalysisRecord> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Filter for listing stored records
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFilter {
    pub status: Option<AnalysisStatus>,
    pub actionable_only: bool,
    pub limit: usize,
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self {
            status: None,
            actionable_only: false,
            limit: 100,
        }
    }
}
