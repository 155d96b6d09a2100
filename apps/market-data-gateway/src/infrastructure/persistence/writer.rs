//! Background persistence of streamed cache records.
//!
//! Stream ingestion must not wait on disk, so the cache hands changed records
//! to this task through a queue. Writes are batched: whatever is queued when
//! the task wakes goes out in one upsert.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::CacheStore;
use crate::domain::cache_record::CacheRecord;

/// Drain `rx` into `store` until cancelled, then flush what is left.
///
/// Returns the number of records handed to the store.
pub async fn run_persist_writer(
    store: Arc<dyn CacheStore>,
    mut rx: mpsc::UnboundedReceiver<Vec<CacheRecord>>,
    cancel: CancellationToken,
) -> usize {
    let mut total = 0;
    loop {
        let first = tokio::select! {
            () = cancel.cancelled() => break,
            batch = rx.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };
        let mut pending = first;
        while let Ok(more) = rx.try_recv() {
            pending.extend(more);
        }
        total += flush(store.as_ref(), &pending).await;
    }

    let mut rest = Vec::new();
    while let Ok(more) = rx.try_recv() {
        rest.extend(more);
    }
    if !rest.is_empty() {
        tracing::debug!(records = rest.len(), "Flushing queued cache writes");
        total += flush(store.as_ref(), &rest).await;
    }
    tracing::info!(records = total, "Persist writer stopped");
    total
}

async fn flush(store: &dyn CacheStore, records: &[CacheRecord]) -> usize {
    match store.upsert(records).await {
        Ok(_) => records.len(),
        Err(e) => {
            tracing::warn!(records = records.len(), error = %e, "Cache write failed; records stay in memory only");
            0
        }
    }
}
