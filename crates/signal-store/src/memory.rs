use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use signal_core::{
    AnalysisRecord, AnalysisStatus, AnalysisStore, ClaimOutcome, RecordFilter, SignalResult,
    UpsertOutcome,
};

use crate::{check_costs, DEFAULT_CLAIM_TTL_SECS};

#[derive(Debug, Clone)]
enum Slot {
    Claimed(DateTime<Utc>),
    Stored(AnalysisRecord),
}

/// Process-local store, used by tests and single-node runs without a database.
pub struct MemoryAnalysisStore {
    slots: DashMap<String, Slot>,
    state: DashMap<String, String>,
    claim_ttl: Duration,
}

impl MemoryAnalysisStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            state: DashMap::new(),
            claim_ttl: Duration::seconds(DEFAULT_CLAIM_TTL_SECS),
        }
    }

    pub fn with_claim_ttl(mut self, claim_ttl: Duration) -> Self {
        self.claim_ttl = claim_ttl;
        self
    }

    /// Number of stored (non-pending) records
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Stored(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryAnalysisStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalysisStore for MemoryAnalysisStore {
    async fn try_claim(&self, news_id: &str) -> SignalResult<ClaimOutcome> {
        let now = Utc::now();
        match self.slots.entry(news_id.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Claimed(now));
                Ok(ClaimOutcome::Claimed)
            }
            Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::Claimed(at) if now - *at > self.claim_ttl => {
                    tracing::warn!(news_id, claimed_at = %at, "Taking over stale claim");
                    occupied.insert(Slot::Claimed(now));
                    Ok(ClaimOutcome::Claimed)
                }
                Slot::Claimed(_) => Ok(ClaimOutcome::AlreadyExists { existing: None }),
                Slot::Stored(record) => Ok(ClaimOutcome::AlreadyExists {
                    existing: Some(record.clone()),
                }),
            },
        }
    }

    async fn upsert(&self, record: &AnalysisRecord) -> SignalResult<UpsertOutcome> {
        check_costs(record)?;

        let previous = self
            .slots
            .insert(record.news_id.clone(), Slot::Stored(record.clone()));

        Ok(match previous {
            Some(Slot::Stored(_)) => UpsertOutcome::Updated,
            _ => UpsertOutcome::Inserted,
        })
    }

    async fn release(&self, news_id: &str) -> SignalResult<()> {
        self.slots
            .remove_if(news_id, |_, slot| matches!(slot, Slot::Claimed(_)));
        Ok(())
    }

    async fn get(&self, news_id: &str) -> SignalResult<Option<AnalysisRecord>> {
        Ok(self.slots.get(news_id).and_then(|slot| match slot.value() {
            Slot::Stored(record) => Some(record.clone()),
            Slot::Claimed(_) => None,
        }))
    }

    async fn existing_ids(&self, news_ids: &[String]) -> SignalResult<HashSet<String>> {
        Ok(news_ids
            .iter()
            .filter(|id| {
                self.slots
                    .get(id.as_str())
                    .map(|slot| matches!(slot.value(), Slot::Stored(_)))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn delete_errored(&self, news_id: &str) -> SignalResult<bool> {
        let removed = self.slots.remove_if(news_id, |_, slot| {
            matches!(slot, Slot::Stored(record) if record.status == AnalysisStatus::Error)
        });
        Ok(removed.is_some())
    }

    async fn list(&self, filter: &RecordFilter) -> SignalResult<Vec<AnalysisRecord>> {
        let mut records: Vec<AnalysisRecord> = self
            .slots
            .iter()
            .filter_map(|slot| match slot.value() {
                Slot::Stored(record) => Some(record.clone()),
                Slot::Claimed(_) => None,
            })
            .filter(|r| filter.status.map(|s| r.status == s).unwrap_or(true))
            .filter(|r| !filter.actionable_only || r.is_actionable())
            .collect();

        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records.truncate(filter.limit);
        Ok(records)
    }

    async fn save_state(&self, key: &str, value: &str) -> SignalResult<()> {
        self.state.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn load_state(&self, key: &str) -> SignalResult<Option<String>> {
        Ok(self.state.get(key).map(|v| v.value().clone()))
    }
}
