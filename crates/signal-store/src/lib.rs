//! Dedup & persistence for analysis records.
//!
//! Both stores implement `signal_core::AnalysisStore` with the same contract:
//! a news id is claimed (atomically) before any model spend, a claim that
//! outlives `claim_ttl` without producing a record may be taken over, and
//! records are upserted on the news id so concurrent writers converge on a
//! single row.

pub mod db;
pub mod memory;

pub use db::SqliteAnalysisStore;
pub use memory::MemoryAnalysisStore;

use signal_core::{AnalysisRecord, SignalError};

/// State key holding the news source cursor
pub const NEWS_CURSOR_KEY: &str = "news_cursor";

/// Default age after which an unfinished claim is considered abandoned
pub const DEFAULT_CLAIM_TTL_SECS: i64 = 900;

/// Reject records whose stored total diverges from the sum of their lines.
pub(crate) fn check_costs(record: &AnalysisRecord) -> Result<(), SignalError> {
    if record.costs.is_consistent() {
        Ok(())
    } else {
        Err(SignalError::InvalidData(format!(
            "cost total {} for {} does not match line sum {}",
            record.costs.total,
            record.news_id,
            record.costs.sum_of_lines()
        )))
    }
}

pub(crate) fn store_err(e: impl std::fmt::Display) -> SignalError {
    SignalError::StoreError(e.to_string())
}
