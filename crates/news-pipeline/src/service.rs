use std::sync::Arc;

use signal_core::{
    AnalysisRecord, AnalysisStatus, AnalysisStore, ClaimOutcome, NewsItem, SignalProduced,
    SignalResult, SignalSink, UpsertOutcome,
};
use tracing::{debug, info, warn};

use crate::pipeline::StagePipeline;

/// Result of pushing one item through claim, pipeline and persistence
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    /// Analysed now and persisted
    Fresh {
        record: AnalysisRecord,
        upsert: UpsertOutcome,
    },
    /// Already analysed earlier; returned unchanged with no model spend
    Existing(AnalysisRecord),
    /// Another worker holds the claim right now
    InFlight { news_id: String },
}

impl AnalysisOutcome {
    pub fn record(&self) -> Option<&AnalysisRecord> {
        match self {
            AnalysisOutcome::Fresh { record, .. } | AnalysisOutcome::Existing(record) => Some(record),
            AnalysisOutcome::InFlight { .. } => None,
        }
    }

    pub fn into_record(self) -> Option<AnalysisRecord> {
        match self {
            AnalysisOutcome::Fresh { record, .. } | AnalysisOutcome::Existing(record) => Some(record),
            AnalysisOutcome::InFlight { .. } => None,
        }
    }
}

/// Claim -> run -> upsert -> emit. Shared by the batch and on-demand paths.
pub struct AnalysisService {
    pipeline: StagePipeline,
    store: Arc<dyn AnalysisStore>,
    sinks: Vec<Arc<dyn SignalSink>>,
}

impl AnalysisService {
    pub fn new(pipeline: StagePipeline, store: Arc<dyn AnalysisStore>) -> Self {
        Self {
            pipeline,
            store,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn store(&self) -> &Arc<dyn AnalysisStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &StagePipeline {
        &self.pipeline
    }

    /// Analyse `item` unless it already has (or is getting) a record.
    ///
    /// Errors only come from the store; model failures end up in the record.
    pub async fn analyze(&self, item: &NewsItem) -> SignalResult<AnalysisOutcome> {
        match self.store.try_claim(&item.id).await? {
            ClaimOutcome::AlreadyExists { existing: Some(record) } => {
                debug!(news_id = %item.id, status = %record.status, "Already analysed");
                Ok(AnalysisOutcome::Existing(record))
            }
            ClaimOutcome::AlreadyExists { existing: None } => {
                debug!(news_id = %item.id, "Claimed by another worker");
                Ok(AnalysisOutcome::InFlight {
                    news_id: item.id.clone(),
                })
            }
            ClaimOutcome::Claimed => self.run_claimed(item).await,
        }
    }

    /// Run the pipeline for an item this caller has already claimed.
    pub async fn run_claimed(&self, item: &NewsItem) -> SignalResult<AnalysisOutcome> {
        let record = self.pipeline.run(item).await;
        let upsert = self.persist(&record).await?;
        Ok(AnalysisOutcome::Fresh { record, upsert })
    }

    /// Upsert a finished record and emit its signal. On failure the claim is
    /// released so a later run can pick the item up again.
    pub async fn persist(&self, record: &AnalysisRecord) -> SignalResult<UpsertOutcome> {
        let upsert = match self.store.upsert(record).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(news_id = %record.news_id, error = %e, "Failed to persist analysis");
                if let Err(release_err) = self.store.release(&record.news_id).await {
                    warn!(news_id = %record.news_id, error = %release_err, "Failed to release claim");
                }
                return Err(e);
            }
        };

        info!(
            news_id = %record.news_id,
            status = %record.status,
            total_cost = %record.costs.total,
            "Analysis persisted"
        );

        let event = SignalProduced::from_record(record);
        for sink in &self.sinks {
            sink.emit(&event);
        }

        Ok(upsert)
    }

    /// Drop a claim without running (e.g. the batch deadline passed).
    pub async fn release(&self, news_id: &str) -> SignalResult<()> {
        self.store.release(news_id).await
    }

    /// Re-run an `Error` record. Other records come back unchanged; `None` if unknown.
    pub async fn reprocess(&self, news_id: &str) -> SignalResult<Option<AnalysisOutcome>> {
        let Some(existing) = self.store.get(news_id).await? else {
            return Ok(None);
        };

        if existing.status != AnalysisStatus::Error {
            return Ok(Some(AnalysisOutcome::Existing(existing)));
        }

        if !self.store.delete_errored(news_id).await? {
            // Someone else reprocessed it first
            let current = self.store.get(news_id).await?;
            return Ok(current.map(AnalysisOutcome::Existing));
        }

        info!(news_id, previous_error = ?existing.error, "Reprocessing errored analysis");
        self.analyze(&existing.news_item()).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastSink;
    use crate::testing::*;
    use signal_store::MemoryAnalysisStore;

    fn service(h: &Harness, store: Arc<MemoryAnalysisStore>) -> AnalysisService {
        AnalysisService::new(h.pipeline(), store)
    }

    #[tokio::test]
    async fn test_second_submission_is_free_noop() {
        let h = Harness::new();
        h.script_completed("BUY");
        let store = Arc::new(MemoryAnalysisStore::new());
        let service = service(&h, store.clone());
        let news = item("n:1", "Fed cuts rates", &["SPY"]);

        let first = service.analyze(&news).await.unwrap();
        let calls_after_first = h.screening.calls() + h.research.calls() + h.synthesis.calls();
        let second = service.analyze(&news).await.unwrap();

        assert!(matches!(first, AnalysisOutcome::Fresh { upsert: UpsertOutcome::Inserted, .. }));
        assert_eq!(second, AnalysisOutcome::Existing(first.record().unwrap().clone()));
        assert_eq!(h.screening.calls() + h.research.calls() + h.synthesis.calls(), calls_after_first);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_bill_once() {
        let h = Harness::new();
        h.script_completed("SELL");
        let store = Arc::new(MemoryAnalysisStore::new());
        let service = Arc::new(service(&h, store.clone()));
        let news = item("n:2", "Oil supply shock", &[]);

        let (a, b) = tokio::join!(service.analyze(&news), service.analyze(&news));
        let outcomes = [a.unwrap(), b.unwrap()];

        let fresh = outcomes
            .iter()
            .filter(|o| matches!(o, AnalysisOutcome::Fresh { .. }))
            .count();
        assert_eq!(fresh, 1);
        assert_eq!(h.screening.calls(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_emits_signal_after_persisting() {
        let h = Harness::new();
        h.script_completed("STRONG_BUY");
        let sink = Arc::new(BroadcastSink::new(4));
        let mut rx = sink.subscribe();
        let store = Arc::new(MemoryAnalysisStore::new());
        let service = service(&h, store.clone()).with_sink(sink);

        service.analyze(&item("n:3", "Chipmaker beats", &["NVDA"])).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.news_id, "n:3");
        assert!(event.actionable);
        assert!(store.get("n:3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reprocess_only_reruns_errors() {
        let h = Harness::new();
        h.screening.push_ok("garbage", 10, 10);
        let store = Arc::new(MemoryAnalysisStore::new());
        let service = service(&h, store.clone());
        let news = item("n:4", "Central bank surprise", &[]);

        let first = service.analyze(&news).await.unwrap().into_record().unwrap();
        assert_eq!(first.status, AnalysisStatus::Error);

        h.script_completed("BUY");
        let again = service.reprocess("n:4").await.unwrap().unwrap();
        let record = again.into_record().unwrap();
        assert_eq!(record.status, AnalysisStatus::Completed);
        assert_eq!(record.body, news.body);

        // Completed records are left alone
        let unchanged = service.reprocess("n:4").await.unwrap().unwrap();
        assert_eq!(unchanged, AnalysisOutcome::Existing(record));

        assert!(service.reprocess("unknown").await.unwrap().is_none());
    }
}
