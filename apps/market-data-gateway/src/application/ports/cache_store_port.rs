//! Cache Store Port (Driven Port)
//!
//! The persistent cache tier.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::cache_record::{CacheRecord, SeriesKey};

/// Persistent tier errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
    /// A stored row could not be mapped back to a record.
    #[error("corrupt cache row: {0}")]
    Corrupt(String),
}

/// Persists cache records keyed by (symbol, timeframe, timestamp).
///
/// Implementations apply the same non-regression rule as
/// [`CacheRecord::accepts`], so replaying an upsert is harmless.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Records of `key` with `start <= timestamp <= end`, oldest first.
    async fn load_range(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CacheRecord>, StoreError>;

    /// Insert or update records. Returns the number of rows written.
    async fn upsert(&self, records: &[CacheRecord]) -> Result<usize, StoreError>;
}
