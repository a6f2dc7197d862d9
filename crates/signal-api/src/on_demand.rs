use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use news_pipeline::{AnalysisOutcome, AnalysisService};
use serde::Serialize;
use signal_core::{AnalysisRecord, NewsItem, SignalError};
use thiserror::Error;
use tracing::{info, warn};

use crate::quota::QuotaLimiter;

/// Largest number of items accepted in one on-demand request
pub const MAX_ITEMS_PER_REQUEST: usize = 20;

#[derive(Error, Debug)]
pub enum OnDemandError {
    #[error("Quota exceeded, retry in {}s", .retry_after.as_secs())]
    QuotaExceeded { retry_after: Duration },

    #[error("Analysis of {0} is already in progress")]
    InProgress(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] SignalError),
}

/// Per-item result of a multi-item request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemAnalysis {
    pub news_id: String,
    /// `fresh`, `existing` or `in_progress`
    pub outcome: &'static str,
    pub record: Option<AnalysisRecord>,
}

impl ItemAnalysis {
    fn from_outcome(news_id: String, outcome: AnalysisOutcome) -> Self {
        let label = match &outcome {
            AnalysisOutcome::Fresh { .. } => "fresh",
            AnalysisOutcome::Existing(_) => "existing",
            AnalysisOutcome::InFlight { .. } => "in_progress",
        };
        Self {
            news_id,
            outcome: label,
            record: outcome.into_record(),
        }
    }
}

/// Synchronous, quota-protected entry point to the stage pipeline.
///
/// Bypasses the batch budget; the per-caller quota is the only throttle.
pub struct OnDemandGateway {
    service: Arc<AnalysisService>,
    quota: QuotaLimiter,
}

impl OnDemandGateway {
    pub fn new(service: Arc<AnalysisService>, quota: QuotaLimiter) -> Self {
        Self { service, quota }
    }

    pub fn service(&self) -> &Arc<AnalysisService> {
        &self.service
    }

    fn take_quota(&self, caller: &str) -> Result<(), OnDemandError> {
        self.quota.check(caller).map_err(|retry_after| {
            warn!(caller, retry_after_secs = retry_after.as_secs(), "On-demand quota exceeded");
            OnDemandError::QuotaExceeded { retry_after }
        })
    }

    /// Analyse a single item, returning its (new or existing) record.
    pub async fn analyze(&self, caller: &str, item: NewsItem) -> Result<AnalysisRecord, OnDemandError> {
        validate(&item)?;
        self.take_quota(caller)?;

        info!(caller, news_id = %item.id, "On-demand analysis");
        match self.service.analyze(&item).await? {
            AnalysisOutcome::Fresh { record, .. } | AnalysisOutcome::Existing(record) => Ok(record),
            AnalysisOutcome::InFlight { news_id } => Err(OnDemandError::InProgress(news_id)),
        }
    }

    /// Analyse several items under one unit of quota.
    pub async fn analyze_many(
        &self,
        caller: &str,
        items: Vec<NewsItem>,
    ) -> Result<Vec<ItemAnalysis>, OnDemandError> {
        if items.is_empty() {
            return Err(OnDemandError::InvalidRequest("no items given".to_string()));
        }
        if items.len() > MAX_ITEMS_PER_REQUEST {
            return Err(OnDemandError::InvalidRequest(format!(
                "at most {} items per request, got {}",
                MAX_ITEMS_PER_REQUEST,
                items.len()
            )));
        }
        for item in &items {
            validate(item)?;
        }
        self.take_quota(caller)?;

        info!(caller, items = items.len(), "On-demand batch analysis");
        let results = join_all(items.iter().map(|item| self.service.analyze(item))).await;

        items
            .into_iter()
            .zip(results)
            .map(|(item, result)| Ok(ItemAnalysis::from_outcome(item.id, result?)))
            .collect()
    }

    /// Re-run an errored record. Counts against the caller's quota like a new analysis.
    pub async fn reprocess(&self, caller: &str, news_id: &str) -> Result<Option<AnalysisRecord>, OnDemandError> {
        self.take_quota(caller)?;

        match self.service.reprocess(news_id).await? {
            None => Ok(None),
            Some(AnalysisOutcome::InFlight { news_id }) => Err(OnDemandError::InProgress(news_id)),
            Some(outcome) => Ok(outcome.into_record()),
        }
    }
}

fn validate(item: &NewsItem) -> Result<(), OnDemandError> {
    if item.id.trim().is_empty() {
        return Err(OnDemandError::InvalidRequest("news id is empty".to_string()));
    }
    if item.title.trim().is_empty() && item.body.trim().is_empty() {
        return Err(OnDemandError::InvalidRequest(format!("news item {} has no text", item.id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use news_pipeline::testing::{item, Harness};
    use signal_core::AnalysisStatus;
    use signal_store::MemoryAnalysisStore;

    fn gateway(h: &Harness, limit: u32) -> OnDemandGateway {
        let store = Arc::new(MemoryAnalysisStore::new());
        let service = Arc::new(AnalysisService::new(h.pipeline(), store));
        OnDemandGateway::new(service, QuotaLimiter::new(limit, Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_quota_exceeded_carries_retry_after() {
        let h = Harness::new();
        h.accept_everything();
        let gateway = gateway(&h, 1);

        let record = gateway.analyze("alice", item("n:1", "Fed cuts", &[])).await.unwrap();
        assert_eq!(record.status, AnalysisStatus::Completed);

        match gateway.analyze("alice", item("n:2", "ECB holds", &[])).await {
            Err(OnDemandError::QuotaExceeded { retry_after }) => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected quota error, got {:?}", other),
        }

        // Another caller is unaffected
        assert!(gateway.analyze("bob", item("n:2", "ECB holds", &[])).await.is_ok());
    }

    #[tokio::test]
    async fn test_resubmission_returns_existing_record() {
        let h = Harness::new();
        h.accept_everything();
        let gateway = gateway(&h, 10);

        let first = gateway.analyze("alice", item("n:1", "Fed cuts", &[])).await.unwrap();
        let calls = h.screening.calls();
        let second = gateway.analyze("alice", item("n:1", "Fed cuts", &[])).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.screening.calls(), calls);
    }

    #[tokio::test]
    async fn test_many_uses_one_quota_unit() {
        let h = Harness::new();
        h.accept_everything();
        let gateway = gateway(&h, 1);

        let results = gateway
            .analyze_many("alice", vec![item("a", "One", &[]), item("b", "Two", &[]), item("a", "One", &[])])
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].news_id, "a");
        assert_eq!(results[1].outcome, "fresh");
        // The duplicate is still being analysed by the first entry
        assert_eq!(results[2].outcome, "in_progress");
        assert!(results[2].record.is_none());
        assert_eq!(h.screening.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_requests_do_not_consume_quota() {
        let h = Harness::new();
        h.accept_everything();
        let gateway = gateway(&h, 1);

        let empty = gateway.analyze_many("alice", vec![]).await;
        assert!(matches!(empty, Err(OnDemandError::InvalidRequest(_))));

        let mut blank = item("", "x", &[]);
        blank.id = "  ".to_string();
        assert!(matches!(gateway.analyze("alice", blank).await, Err(OnDemandError::InvalidRequest(_))));

        assert!(gateway.analyze("alice", item("n:1", "Fed cuts", &[])).await.is_ok());
    }
}
