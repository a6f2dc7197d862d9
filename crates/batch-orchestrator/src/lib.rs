//! Scheduled batch analysis.
//!
//! A run pulls the oldest unanalysed items from the news source, fans them out
//! over a bounded worker pool and stops admitting work once the cost budget or
//! the deadline would be exceeded. In-flight items always finish. One item's
//! failure never fails the batch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use news_pipeline::AnalysisService;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use signal_core::{
    AnalysisRecord, AnalysisStatus, AnalysisStore, ClaimOutcome, NewsItem, NewsSource, SignalResult,
    UpsertOutcome,
};
use signal_store::NEWS_CURSOR_KEY;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How far back the first run reaches when no cursor has been stored yet
pub const DEFAULT_LOOKBACK_HOURS: i64 = 24;

/// Operator limits for one run
#[derive(Debug, Clone, PartialEq)]
pub struct BatchLimits {
    pub max_items: usize,
    pub max_concurrency: usize,
    pub max_cost_budget: Decimal,
    pub deadline: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_items: 50,
            max_concurrency: 4,
            max_cost_budget: Decimal::ONE,
            deadline: Duration::from_secs(240),
        }
    }
}

/// Why a run stopped admitting items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Every candidate was admitted
    Exhausted,
    Budget,
    Deadline,
    /// The process is shutting down
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub analyzed: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub errors: usize,
    pub total_cost: Decimal,
    pub stop_reason: StopReason,
    pub duration_ms: u64,
}

/// What happened to one admitted item
#[derive(Debug, Clone, PartialEq)]
enum ItemResult {
    Analyzed {
        status: AnalysisStatus,
        inserted: bool,
        persisted: bool,
    },
    /// Already analysed, claimed elsewhere, or the claim itself failed
    Skipped { done: bool },
    /// Claimed after the deadline and released untouched
    Released,
    /// Worker panicked and its `Error` record could not be stored
    Crashed,
}

/// Running spend shared by all workers of one run
#[derive(Debug, Default)]
struct Budget {
    spent: Decimal,
    completed: u32,
}

impl Budget {
    /// Mean cost of the items finished so far; zero before the first one.
    fn projected(&self) -> Decimal {
        if self.completed == 0 {
            Decimal::ZERO
        } else {
            self.spent / Decimal::from(self.completed)
        }
    }

    fn admits(&self, limit: Decimal) -> bool {
        self.spent + self.projected() <= limit
    }

    fn record(&mut self, cost: Decimal) {
        self.spent += cost;
        self.completed += 1;
    }
}

fn lock(budget: &Mutex<Budget>) -> std::sync::MutexGuard<'_, Budget> {
    budget.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Position of a fetched item in the run
enum Entry {
    /// Already had a record before the run started
    Stored,
    /// Candidate #i
    Candidate(usize),
}

pub struct BatchOrchestrator {
    source: Arc<dyn NewsSource>,
    service: Arc<AnalysisService>,
    lookback: chrono::Duration,
}

impl BatchOrchestrator {
    pub fn new(source: Arc<dyn NewsSource>, service: Arc<AnalysisService>) -> Self {
        Self {
            source,
            service,
            lookback: chrono::Duration::hours(DEFAULT_LOOKBACK_HOURS),
        }
    }

    /// Window fetched on the first run, before any cursor exists.
    pub fn with_lookback(mut self, lookback: chrono::Duration) -> Self {
        self.lookback = lookback;
        self
    }

    async fn load_cursor(&self) -> Option<DateTime<Utc>> {
        match self.service.store().load_state(NEWS_CURSOR_KEY).await {
            Ok(Some(raw)) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(ts) => Some(ts.with_timezone(&Utc)),
                Err(e) => {
                    warn!(cursor = %raw, error = %e, "Ignoring unparseable news cursor");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to load news cursor, using the lookback window");
                None
            }
        }
    }

    async fn save_cursor(&self, cursor: DateTime<Utc>) {
        if let Err(e) = self
            .service
            .store()
            .save_state(NEWS_CURSOR_KEY, &cursor.to_rfc3339())
            .await
        {
            warn!(error = %e, "Failed to save news cursor");
        }
    }

    /// Run one batch. Only the initial fetch can fail the whole run.
    pub async fn run_batch(&self, limits: &BatchLimits) -> SignalResult<BatchReport> {
        self.run(limits, None).await
    }

    /// Like `run_batch`, but admission also stops once `shutdown` reads true.
    /// Items already admitted still finish.
    pub async fn run_batch_until(
        &self,
        limits: &BatchLimits,
        shutdown: watch::Receiver<bool>,
    ) -> SignalResult<BatchReport> {
        self.run(limits, Some(shutdown)).await
    }

    async fn run(
        &self,
        limits: &BatchLimits,
        mut shutdown: Option<watch::Receiver<bool>>,
    ) -> SignalResult<BatchReport> {
        let started = Instant::now();
        let deadline_at = started + limits.deadline;

        let cursor = match self.load_cursor().await {
            Some(cursor) => cursor,
            None => Utc::now() - self.lookback,
        };
        // Over-fetch so items already stored at the cursor do not eat the item budget
        let fetched = self
            .source
            .fetch_since(Some(cursor), limits.max_items.saturating_mul(2).max(1))
            .await?;

        let ids: Vec<String> = fetched.iter().map(|item| item.id.clone()).collect();
        let stored = self.service.store().existing_ids(&ids).await?;

        let mut entries: Vec<(DateTime<Utc>, Option<Entry>)> = Vec::with_capacity(fetched.len());
        let mut candidates: Vec<NewsItem> = Vec::new();
        for item in fetched {
            let entry = if stored.contains(&item.id) {
                Some(Entry::Stored)
            } else if candidates.len() < limits.max_items {
                candidates.push(item.clone());
                Some(Entry::Candidate(candidates.len() - 1))
            } else {
                None
            };
            entries.push((item.published_at, entry));
        }

        info!(
            cursor = %cursor,
            candidates = candidates.len(),
            already_stored = stored.len(),
            max_concurrency = limits.max_concurrency,
            budget = %limits.max_cost_budget,
            "Starting batch"
        );

        let semaphore = Arc::new(Semaphore::new(limits.max_concurrency.max(1)));
        let budget = Arc::new(Mutex::new(Budget::default()));
        let mut stop_reason = StopReason::Exhausted;
        let mut handles = Vec::new();

        for (index, item) in candidates.into_iter().enumerate() {
            if is_shutting_down(&shutdown) {
                stop_reason = StopReason::Shutdown;
                break;
            }
            if Instant::now() >= deadline_at {
                stop_reason = StopReason::Deadline;
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    stop_reason = StopReason::Shutdown;
                    break;
                }
                acquired = tokio::time::timeout_at(deadline_at, semaphore.clone().acquire_owned()) => {
                    match acquired {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) | Err(_) => {
                            stop_reason = StopReason::Deadline;
                            break;
                        }
                    }
                }
            };

            // Checked with the permit held so every earlier worker that could
            // have freed it has already booked its cost
            {
                let budget = lock(&budget);
                if !budget.admits(limits.max_cost_budget) {
                    warn!(
                        spent = %budget.spent,
                        projected = %budget.projected(),
                        limit = %limits.max_cost_budget,
                        "Cost budget reached, admitting no more items"
                    );
                    stop_reason = StopReason::Budget;
                    break;
                }
            }

            let service = Arc::clone(&self.service);
            let budget = Arc::clone(&budget);
            let news = item.clone();
            handles.push((
                index,
                news,
                tokio::spawn(async move {
                    let result = process_item(&service, &item, deadline_at, &budget).await;
                    drop(permit);
                    result
                }),
            ));
        }

        match stop_reason {
            StopReason::Deadline => {
                warn!(admitted = handles.len(), "Batch deadline reached, admitting no more items")
            }
            StopReason::Shutdown => {
                info!(admitted = handles.len(), "Shutdown requested, admitting no more items")
            }
            _ => {}
        }

        let mut results: Vec<Option<ItemResult>> = Vec::new();
        let mut report = BatchReport {
            analyzed: 0,
            inserted: 0,
            skipped: 0,
            errors: 0,
            total_cost: Decimal::ZERO,
            stop_reason,
            duration_ms: 0,
        };

        for (index, news, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(news_id = %news.id, error = %e, "Batch worker crashed");
                    record_crash(&self.service, &news, &e.to_string()).await
                }
            };

            match &result {
                ItemResult::Analyzed {
                    status,
                    inserted,
                    persisted,
                } => {
                    report.analyzed += 1;
                    if *inserted {
                        report.inserted += 1;
                    }
                    if *status == AnalysisStatus::Error || !persisted {
                        report.errors += 1;
                    }
                }
                ItemResult::Skipped { .. } => report.skipped += 1,
                ItemResult::Released => {}
                ItemResult::Crashed => {
                    report.analyzed += 1;
                    report.errors += 1;
                }
            }

            if results.len() <= index {
                results.resize(index + 1, None);
            }
            results[index] = Some(result);
        }

        if let Some(next) = next_cursor(&entries, &results) {
            self.save_cursor(next).await;
        }

        report.total_cost = lock(&budget).spent;
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            analyzed = report.analyzed,
            inserted = report.inserted,
            skipped = report.skipped,
            errors = report.errors,
            total_cost = %report.total_cost,
            stop_reason = ?report.stop_reason,
            duration_ms = report.duration_ms,
            "Batch complete"
        );

        Ok(report)
    }
}

async fn process_item(
    service: &AnalysisService,
    item: &NewsItem,
    deadline_at: Instant,
    budget: &Mutex<Budget>,
) -> ItemResult {
    match service.store().try_claim(&item.id).await {
        Ok(ClaimOutcome::Claimed) => {}
        Ok(ClaimOutcome::AlreadyExists { existing }) => {
            debug!(news_id = %item.id, "Skipping already claimed item");
            return ItemResult::Skipped {
                done: existing.is_some(),
            };
        }
        Err(e) => {
            warn!(news_id = %item.id, error = %e, "Claim failed, skipping");
            return ItemResult::Skipped { done: false };
        }
    }

    if Instant::now() >= deadline_at {
        if let Err(e) = service.release(&item.id).await {
            warn!(news_id = %item.id, error = %e, "Failed to release claim after deadline");
        }
        return ItemResult::Released;
    }

    let record = service.pipeline().run(item).await;
    lock(budget).record(record.costs.total);

    match service.persist(&record).await {
        Ok(upsert) => ItemResult::Analyzed {
            status: record.status,
            inserted: upsert == UpsertOutcome::Inserted,
            persisted: true,
        },
        Err(_) => ItemResult::Analyzed {
            status: record.status,
            inserted: false,
            persisted: false,
        },
    }
}

/// Store an `Error` record for an item whose worker died so the claim does not
/// linger until its TTL. `persist` releases the claim when the write fails.
async fn record_crash(service: &AnalysisService, item: &NewsItem, reason: &str) -> ItemResult {
    let record = AnalysisRecord::failed(item, format!("worker crashed: {}", reason));
    match service.persist(&record).await {
        Ok(upsert) => ItemResult::Analyzed {
            status: AnalysisStatus::Error,
            inserted: upsert == UpsertOutcome::Inserted,
            persisted: true,
        },
        Err(_) => ItemResult::Crashed,
    }
}

fn is_shutting_down(shutdown: &Option<watch::Receiver<bool>>) -> bool {
    shutdown.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Resolves once shutdown reads true; never without a receiver or after the
/// sender is gone.
async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        let stopped = rx.wait_for(|stop| *stop).await.is_ok();
        if stopped {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// The cursor only moves over the contiguous prefix of finished items; the
/// first unfinished one is fetched again next run.
fn next_cursor(
    entries: &[(DateTime<Utc>, Option<Entry>)],
    results: &[Option<ItemResult>],
) -> Option<DateTime<Utc>> {
    let finished = |entry: &Option<Entry>| match entry {
        Some(Entry::Stored) => true,
        Some(Entry::Candidate(i)) => match results.get(*i).and_then(|r| r.as_ref()) {
            Some(ItemResult::Analyzed { persisted, .. }) => *persisted,
            Some(ItemResult::Skipped { done }) => *done,
            _ => false,
        },
        None => false,
    };

    entries
        .iter()
        .find(|(_, entry)| !finished(entry))
        .or_else(|| entries.last())
        .map(|(published_at, _)| *published_at)
}
