use model_gateway::Prompt;
use signal_core::{EnrichmentResult, NewsItem, ScreeningResult};

const SCREENING_SYSTEM: &str = r#"You are a financial news screener. Decide quickly whether a news item can move liquid markets and deserves deeper analysis.
Respond with a single JSON object and nothing else:
{
  "title": "short neutral headline",
  "analysisText": "two or three sentences on why this matters or not",
  "shouldDeepen": true | false,
  "category": "stocks" | "forex" | "crypto" | "commodities" | "indices" | "macro" | "earnings",
  "affectedAssets": ["TICKER", ...],
  "requiredDataRequests": [{"kind": "price", "symbol": "TICKER", "description": "why"}]
}
Set shouldDeepen to false for routine corporate updates, local business news, opinion pieces and anything already widely known."#;

const RESEARCH_SYSTEM: &str = r#"You are a markets research analyst with access to current information.
Given a screened news item and the observed price reaction, explain the likely external impact: who is affected, second-order effects, and whether the market has already priced it in.
Respond with a JSON object {"externalImpact": "..."}; plain prose is accepted if JSON is not possible."#;

const SYNTHESIS_SYSTEM: &str = r#"You are a senior trader producing a final trading signal from prior analysis.
Respond with a single JSON object and nothing else:
{
  "tradeDecision": "BUY" | "STRONG_BUY" | "SELL" | "STRONG_SELL" | "NO_TRADE",
  "importanceScore": 0-10,
  "signalBlocked": true | false,
  "blockReason": "why the signal is blocked, or null",
  "wouldTrade": true | false,
  "timeHorizon": "intraday" | "swing" | "position",
  "riskMode": "conservative" | "normal" | "aggressive"
}
Block the signal when the move has already happened, the information is stale, or liquidity is insufficient."#;

/// Marker sent to the synthesis model when enrichment did not run or failed.
pub const NO_ENRICHMENT: &str = "No enrichment available.";

fn tickers(item: &NewsItem) -> String {
    if item.tickers.is_empty() {
        "none".to_string()
    } else {
        item.tickers.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

pub fn screening(item: &NewsItem) -> Prompt {
    let user = format!(
        "Published: {}\nSource: {}\nTickers: {}\n\nTitle: {}\n\n{}",
        item.published_at.to_rfc3339(),
        item.source,
        tickers(item),
        item.title,
        item.text()
    );
    Prompt::new(SCREENING_SYSTEM, user)
}

fn screening_summary(item: &NewsItem, screening: &ScreeningResult) -> String {
    format!(
        "Published: {}\nHeadline: {}\nCategory: {}\nAffected assets: {}\nScreening notes: {}",
        item.published_at.to_rfc3339(),
        screening.title,
        screening.category,
        screening.affected_assets.join(", "),
        screening.analysis_text
    )
}

pub fn research(item: &NewsItem, screening: &ScreeningResult, market: &EnrichmentResult) -> Prompt {
    let mut user = screening_summary(item, screening);
    user.push_str("\n\nPrice reaction since publication:\n");
    user.push_str(&market_section(market));
    Prompt::new(RESEARCH_SYSTEM, user)
}

fn market_section(enrichment: &EnrichmentResult) -> String {
    let mut out = String::new();
    if enrichment.market_reaction.is_empty() {
        out.push_str("- no price data\n");
    }
    for snap in &enrichment.market_reaction {
        out.push_str(&format!(
            "- {}: {:.4} -> {:.4} ({:+.2}%){}\n",
            snap.symbol,
            snap.price_at_news,
            snap.latest_price,
            snap.change_pct,
            if snap.reacted { ", already reacted" } else { "" }
        ));
    }
    if !enrichment.missing_symbols.is_empty() {
        out.push_str(&format!("- missing: {}\n", enrichment.missing_symbols.join(", ")));
    }
    out
}

pub fn synthesis(item: &NewsItem, screening: &ScreeningResult, enrichment: Option<&EnrichmentResult>) -> Prompt {
    let mut user = screening_summary(item, screening);
    user.push_str("\n\n");
    match enrichment {
        Some(e) => {
            user.push_str("Market reaction:\n");
            user.push_str(&market_section(e));
            if e.research_available {
                user.push_str("\nExternal impact:\n");
                user.push_str(&e.external_impact);
            } else {
                user.push_str("\nExternal research unavailable.");
            }
        }
        None => user.push_str(NO_ENRICHMENT),
    }
    Prompt::new(SYNTHESIS_SYSTEM, user)
}
