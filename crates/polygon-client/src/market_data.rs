use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use signal_core::{MarketDataProvider, PriceSnapshot, SignalError};

use crate::{AggregateBar, PolygonClient};

/// How far past publication we look for the first trade
const LOOKAHEAD_DAYS: i64 = 4;

/// Minute-aggregate backed price snapshots
#[derive(Clone)]
pub struct PolygonMarketData {
    client: PolygonClient,
    reaction_threshold_pct: f64,
}

impl PolygonMarketData {
    pub fn new(client: PolygonClient, reaction_threshold_pct: f64) -> Self {
        Self {
            client,
            reaction_threshold_pct,
        }
    }
}

/// Build a snapshot from ascending bars: first open at/after publication vs last close.
pub fn snapshot_from_bars(
    symbol: &str,
    at_or_after: DateTime<Utc>,
    bars: &[AggregateBar],
    reaction_threshold_pct: f64,
) -> Option<PriceSnapshot> {
    let cutoff = at_or_after.timestamp_millis();
    let mut after = bars.iter().filter(|b| b.t >= cutoff);
    let first = after.next()?;
    let last = after.last().unwrap_or(first);

    if first.o <= 0.0 {
        return None;
    }

    let change_pct = (last.c - first.o) / first.o * 100.0;
    let observed_at = DateTime::from_timestamp_millis(last.t).unwrap_or(at_or_after);

    Some(PriceSnapshot {
        symbol: symbol.to_string(),
        price_at_news: first.o,
        latest_price: last.c,
        change_pct,
        observed_at,
        reacted: change_pct.abs() >= reaction_threshold_pct,
    })
}

#[async_trait]
impl MarketDataProvider for PolygonMarketData {
    async fn get_snapshot(
        &self,
        symbol: &str,
        at_or_after: DateTime<Utc>,
    ) -> Result<Option<PriceSnapshot>, SignalError> {
        let now = Utc::now();
        let to = (at_or_after + Duration::days(LOOKAHEAD_DAYS)).min(now);
        if to < at_or_after {
            return Ok(None);
        }

        let bars = self.client.get_minute_bars(symbol, at_or_after, to).await?;
        let snapshot = snapshot_from_bars(symbol, at_or_after, &bars, self.reaction_threshold_pct);

        if snapshot.is_none() {
            tracing::debug!(symbol, "No bars at or after {}", at_or_after);
        }
        Ok(snapshot)
    }
}
