//! In-process cache store.
//!
//! Backs the `memory` store setting and the test suite. Applies the same
//! non-regression rule as the SQLite store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::application::ports::{CacheStore, StoreError};
use crate::domain::cache_record::{CacheRecord, SeriesKey};

/// Cache store held in a sorted map.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    rows: RwLock<BTreeMap<SeriesKey, BTreeMap<DateTime<Utc>, CacheRecord>>>,
}

impl InMemoryCacheStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().values().map(BTreeMap::len).sum()
    }

    /// Whether the store holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn load_range(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CacheRecord>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self
            .rows
            .read()
            .get(key)
            .map(|series| series.range(start..=end).map(|(_, r)| r.clone()).collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, records: &[CacheRecord]) -> Result<usize, StoreError> {
        let mut rows = self.rows.write();
        let mut written = 0;
        for record in records {
            let series = rows.entry(record.key()).or_default();
            if let Some(merged) = CacheRecord::merge(series.get(&record.timestamp), record.clone()) {
                series.insert(record.timestamp, merged);
                written += 1;
            }
        }
        Ok(written)
    }
}
