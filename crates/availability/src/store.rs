//! Store abstractions consumed by the reconciler.
//!
//! Upstream summaries and segments are read-only; the view store is the only
//! thing this crate writes to.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::{StreamExt, TryStreamExt};
use uuid::Uuid;

use crate::error::StoreError;
use crate::scope::Scope;
use crate::types::{AvailabilityViewRow, SegmentRecord, SummaryRecord};

/// Lazy sequence of records. Errors are yielded per item.
pub type RecordStream<T> = BoxStream<'static, Result<T, StoreError>>;

/// Source of per-day summary records
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Stream every summary record matching `scope`.
    ///
    /// Implementations must apply the scope at the source so that
    /// out-of-scope records are never read.
    async fn read_summaries(&self, scope: &Scope) -> Result<RecordStream<SummaryRecord>, StoreError>;
}

/// Source of raw continuous segments
#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Stream all segments referencing `stream_id`, in no particular order.
    async fn read_segments(&self, stream_id: Uuid) -> Result<RecordStream<SegmentRecord>, StoreError>;
}

/// Destination of materialized rows
#[async_trait]
pub trait ViewStore: Send + Sync {
    /// Insert `row`, or replace the existing row with the same id entirely.
    ///
    /// Must be atomic per row.
    async fn upsert(&self, row: &AvailabilityViewRow) -> Result<(), StoreError>;
}

/// Bound a store call by `timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Bound the wait for each item of `records` by `timeout`.
///
/// A timed-out stream yields one `Timeout` error and then ends.
pub fn with_item_timeout<T: Send + 'static>(records: RecordStream<T>, timeout: Duration) -> RecordStream<T> {
    Box::pin(stream::unfold(Some(records), move |state| async move {
        let mut inner = state?;
        match tokio::time::timeout(timeout, inner.next()).await {
            Ok(Some(item)) => Some((item, Some(inner))),
            Ok(None) => None,
            Err(_) => Some((
                Err(StoreError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
                None,
            )),
        }
    }))
}

/// Reads every segment of one channel-day, bounded by a timeout.
#[derive(Clone)]
pub struct SegmentReader {
    store: Arc<dyn SegmentStore>,
    timeout: Duration,
}

impl SegmentReader {
    pub fn new(store: Arc<dyn SegmentStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Drain the segment stream for `stream_id`.
    ///
    /// The deadline covers opening the stream and reading it to the end.
    pub async fn read_all(&self, stream_id: Uuid) -> Result<Vec<SegmentRecord>, StoreError> {
        with_timeout(self.timeout, async {
            let stream = self.store.read_segments(stream_id).await?;
            stream.try_collect::<Vec<_>>().await
        })
        .await
    }
}
