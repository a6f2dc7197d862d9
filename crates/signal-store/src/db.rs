use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use signal_core::{
    AnalysisRecord, AnalysisStore, ClaimOutcome, RecordFilter, SignalError, SignalResult,
    UpsertOutcome,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};

use crate::{check_costs, store_err, DEFAULT_CLAIM_TTL_SECS};

const PENDING: &str = "pending";

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed-width UTC form so string comparison orders correctly
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite-backed analysis store
#[derive(Clone)]
pub struct SqliteAnalysisStore {
    pool: SqlitePool,
    claim_ttl: Duration,
}

impl SqliteAnalysisStore {
    /// Open (or create) the database and initialise the schema.
    pub async fn new(database_url: &str) -> SignalResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(store_err)?
            .create_if_missing(true);

        // Every connection to an in-memory database is a separate database
        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(store_err)?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> SignalResult<Self> {
        let store = Self {
            pool,
            claim_ttl: Duration::seconds(DEFAULT_CLAIM_TTL_SECS),
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn with_claim_ttl(mut self, claim_ttl: Duration) -> Self {
        self.claim_ttl = claim_ttl;
        self
    }

    /// Get the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> SignalResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS news_analysis (
                news_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                record_json TEXT,
                total_cost TEXT,
                trade_decision TEXT,
                signal_blocked INTEGER,
                actionable INTEGER NOT NULL DEFAULT 0,
                published_at TEXT,
                claimed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_news_analysis_status ON news_analysis(status)")
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_news_analysis_actionable ON news_analysis(actionable, updated_at)",
        )
        .execute(&self.pool)
        .await
        .ok();

        Ok(())
    }

    fn decode(news_id: &str, json: Option<String>) -> SignalResult<AnalysisRecord> {
        let json = json.ok_or_else(|| store_err(format!("record {} has no body", news_id)))?;
        serde_json::from_str(&json).map_err(|e| store_err(format!("record {} is corrupt: {}", news_id, e)))
    }
}

#[async_trait]
impl AnalysisStore for SqliteAnalysisStore {
    async fn try_claim(&self, news_id: &str) -> SignalResult<ClaimOutcome> {
        let now = Utc::now();
        let stale_before = timestamp(now - self.claim_ttl);
        let now = timestamp(now);

        let result = sqlx::query(
            "INSERT INTO news_analysis (news_id, status, claimed_at, created_at, updated_at)
             VALUES (?, 'pending', ?, ?, ?)
             ON CONFLICT(news_id) DO UPDATE SET
                claimed_at = excluded.claimed_at,
                updated_at = excluded.updated_at
             WHERE news_analysis.status = 'pending' AND news_analysis.claimed_at < ?",
        )
        .bind(news_id)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .bind(&stale_before)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() > 0 {
            return Ok(ClaimOutcome::Claimed);
        }

        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT status, record_json FROM news_analysis WHERE news_id = ?")
                .bind(news_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;

        match row {
            Some((status, _)) if status == PENDING => Ok(ClaimOutcome::AlreadyExists { existing: None }),
            Some((_, json)) => Ok(ClaimOutcome::AlreadyExists {
                existing: Some(Self::decode(news_id, json)?),
            }),
            // Released between our insert attempt and the read; let the caller retry later
            None => Ok(ClaimOutcome::AlreadyExists { existing: None }),
        }
    }

    async fn upsert(&self, record: &AnalysisRecord) -> SignalResult<UpsertOutcome> {
        check_costs(record)?;

        let json = serde_json::to_string(record).map_err(store_err)?;
        let decision = record.stage3.as_ref();
        let now = timestamp(Utc::now());

        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let prior: Option<(String,)> = sqlx::query_as("SELECT status FROM news_analysis WHERE news_id = ?")
            .bind(&record.news_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;

        sqlx::query(
            "INSERT INTO news_analysis
             (news_id, status, record_json, total_cost, trade_decision, signal_blocked, actionable,
              published_at, claimed_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
             ON CONFLICT(news_id) DO UPDATE SET
                status = excluded.status,
                record_json = excluded.record_json,
                total_cost = excluded.total_cost,
                trade_decision = excluded.trade_decision,
                signal_blocked = excluded.signal_blocked,
                actionable = excluded.actionable,
                published_at = excluded.published_at,
                claimed_at = NULL,
                updated_at = excluded.updated_at",
        )
        .bind(&record.news_id)
        .bind(record.status.as_str())
        .bind(&json)
        .bind(record.costs.total.to_string())
        .bind(decision.map(|d| d.trade_decision.as_str()))
        .bind(decision.map(|d| d.signal_blocked as i64))
        .bind(record.is_actionable() as i64)
        .bind(timestamp(record.published_at))
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;

        let outcome = match prior {
            None => UpsertOutcome::Inserted,
            Some((status,)) if status == PENDING => UpsertOutcome::Inserted,
            Some(_) => UpsertOutcome::Updated,
        };

        tracing::debug!(news_id = %record.news_id, status = %record.status, ?outcome, "Upserted analysis record");
        Ok(outcome)
    }

    async fn release(&self, news_id: &str) -> SignalResult<()> {
        sqlx::query("DELETE FROM news_analysis WHERE news_id = ? AND status = 'pending'")
            .bind(news_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, news_id: &str) -> SignalResult<Option<AnalysisRecord>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT record_json FROM news_analysis WHERE news_id = ? AND status != 'pending'",
        )
        .bind(news_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.map(|(json,)| Self::decode(news_id, json)).transpose()
    }

    async fn existing_ids(&self, news_ids: &[String]) -> SignalResult<HashSet<String>> {
        let mut found = HashSet::new();

        // Stay well under SQLite's bound-parameter limit
        for chunk in news_ids.chunks(500) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT news_id FROM news_analysis WHERE status != 'pending' AND news_id IN (",
            );
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");

            let rows: Vec<(String,)> = builder
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;
            found.extend(rows.into_iter().map(|(id,)| id));
        }

        Ok(found)
    }

    async fn delete_errored(&self, news_id: &str) -> SignalResult<bool> {
        let result = sqlx::query("DELETE FROM news_analysis WHERE news_id = ? AND status = 'error'")
            .bind(news_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, filter: &RecordFilter) -> SignalResult<Vec<AnalysisRecord>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT news_id, record_json FROM news_analysis WHERE status != 'pending'");
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if filter.actionable_only {
            builder.push(" AND actionable = 1");
        }
        builder
            .push(" ORDER BY updated_at DESC LIMIT ")
            .push_bind(filter.limit as i64);

        let rows: Vec<(String, Option<String>)> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        rows.into_iter()
            .map(|(id, json)| Self::decode(&id, json))
            .collect()
    }

    async fn save_state(&self, key: &str, value: &str) -> SignalResult<()> {
        sqlx::query(
            "INSERT INTO agent_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn load_state(&self, key: &str) -> SignalResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM agent_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(|(v,)| v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::record;
    use rust_decimal_macros::dec;
    use signal_core::AnalysisStatus;
    use std::sync::Arc;

    async fn store() -> SqliteAnalysisStore {
        SqliteAnalysisStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_claim_then_duplicate_claim() {
        let store = store().await;

        assert_eq!(store.try_claim("n:1").await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            store.try_claim("n:1").await.unwrap(),
            ClaimOutcome::AlreadyExists { existing: None }
        );
    }

    #[tokio::test]
    async fn test_claim_returns_existing_record() {
        let store = store().await;
        let rec = record("n:2", AnalysisStatus::Completed);

        assert_eq!(store.try_claim("n:2").await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(store.upsert(&rec).await.unwrap(), UpsertOutcome::Inserted);

        match store.try_claim("n:2").await.unwrap() {
            ClaimOutcome::AlreadyExists { existing: Some(existing) } => assert_eq!(existing, rec),
            other => panic!("unexpected claim outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_on_news_id() {
        let store = store().await;
        let rec = record("n:3", AnalysisStatus::Rejected);

        assert_eq!(store.upsert(&rec).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&rec).await.unwrap(), UpsertOutcome::Updated);

        let all = store.list(&RecordFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_rejects_inconsistent_costs() {
        let store = store().await;
        let mut rec = record("n:4", AnalysisStatus::Completed);
        rec.costs.total = dec!(1.0);

        assert!(matches!(store.upsert(&rec).await, Err(SignalError::InvalidData(_))));
        assert!(store.get("n:4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_claim_can_be_taken_over() {
        let store = store().await.with_claim_ttl(Duration::zero());

        assert_eq!(store.try_claim("n:5").await.unwrap(), ClaimOutcome::Claimed);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(store.try_claim("n:5").await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn test_release_frees_claim() {
        let store = store().await;

        assert_eq!(store.try_claim("n:6").await.unwrap(), ClaimOutcome::Claimed);
        store.release("n:6").await.unwrap();
        assert_eq!(store.try_claim("n:6").await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let store = Arc::new(store().await);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.try_claim("n:7").await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() == ClaimOutcome::Claimed {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_delete_errored_only_touches_errors() {
        let store = store().await;
        store.upsert(&record("n:8", AnalysisStatus::Error)).await.unwrap();
        store.upsert(&record("n:9", AnalysisStatus::Completed)).await.unwrap();

        assert!(store.delete_errored("n:8").await.unwrap());
        assert!(!store.delete_errored("n:9").await.unwrap());
        assert!(store.get("n:8").await.unwrap().is_none());
        assert!(store.get("n:9").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = store().await;
        store.upsert(&record("a", AnalysisStatus::Completed)).await.unwrap();
        store.upsert(&record("b", AnalysisStatus::Rejected)).await.unwrap();
        store.upsert(&record("c", AnalysisStatus::Error)).await.unwrap();
        store.try_claim("d").await.unwrap();

        let errors = store
            .list(&RecordFilter { status: Some(AnalysisStatus::Error), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].news_id, "c");

        let actionable = store
            .list(&RecordFilter { actionable_only: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(actionable.len(), 1);
        assert_eq!(actionable[0].news_id, "a");

        let all = store.list(&RecordFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_existing_ids_ignores_pending_claims() {
        let store = store().await;
        store.upsert(&record("x", AnalysisStatus::Rejected)).await.unwrap();
        store.try_claim("y").await.unwrap();

        let ids = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        let found = store.existing_ids(&ids).await.unwrap();
        assert_eq!(found, HashSet::from(["x".to_string()]));
    }

    #[tokio::test]
    async fn test_state_roundtrip() {
        let store = store().await;
        assert_eq!(store.load_state("news_cursor").await.unwrap(), None);
        store.save_state("news_cursor", "2024-01-01T00:00:00Z").await.unwrap();
        store.save_state("news_cursor", "2024-01-02T00:00:00Z").await.unwrap();
        assert_eq!(
            store.load_state("news_cursor").await.unwrap().as_deref(),
            Some("2024-01-02T00:00:00Z")
        );
    }
}
