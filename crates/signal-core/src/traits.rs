use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    AnalysisRecord, ClaimOutcome, NewsItem, PriceSnapshot, RecordFilter, SignalProduced,
    SignalResult, UpsertOutcome,
};

/// Pull-based source of raw news
#[async_trait]
pub trait NewsSource: Send + Sync {
    /// Items published at or after `cursor`, oldest first.
    async fn fetch_since(
        &self,
        cursor: Option<DateTime<Utc>>,
        limit: usize,
    ) -> SignalResult<Vec<NewsItem>>;
}

/// Price lookups used by enrichment
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Snapshot for `symbol` at or after `at_or_after`; `Ok(None)` when nothing traded.
    async fn get_snapshot(
        &self,
        symbol: &str,
        at_or_after: DateTime<Utc>,
    ) -> SignalResult<Option<PriceSnapshot>>;
}

/// Keyed store of analysis records, one per news id
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Claim `news_id` for processing. Must happen before any model call.
    async fn try_claim(&self, news_id: &str) -> SignalResult<ClaimOutcome>;

    /// Insert-or-update the record on its news id.
    async fn upsert(&self, record: &AnalysisRecord) -> SignalResult<UpsertOutcome>;

    /// Drop an in-flight claim that never produced a record.
    async fn release(&self, news_id: &str) -> SignalResult<()>;

    async fn get(&self, news_id: &str) -> SignalResult<Option<AnalysisRecord>>;

    /// Ids from `news_ids` that already have a stored record.
    async fn existing_ids(&self, news_ids: &[String]) -> SignalResult<HashSet<String>>;

    /// Remove an `Error` record so it can be analysed again. Returns false for any other status.
    async fn delete_errored(&self, news_id: &str) -> SignalResult<bool>;

    async fn list(&self, filter: &RecordFilter) -> SignalResult<Vec<AnalysisRecord>>;

    async fn save_state(&self, key: &str, value: &str) -> SignalResult<()>;

    async fn load_state(&self, key: &str) -> SignalResult<Option<String>>;
}

/// Consumer of produced signals (notification fan-out, UI push, ...)
pub trait SignalSink: Send + Sync {
    fn emit(&self, event: &SignalProduced);
}
