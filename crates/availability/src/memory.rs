//! In-memory stores for tests and dry runs.
//!
//! Implements all three store traits over shared maps, with knobs for
//! injecting read and write failures.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::StoreError;
use crate::scope::Scope;
use crate::store::{RecordStream, SegmentStore, SummaryStore, ViewStore};
use crate::types::{AvailabilityViewRow, SegmentRecord, SummaryRecord};

#[derive(Debug, Default)]
struct Faults {
    summary_read_failures: u32,
    summary_stream_errors: Vec<StoreError>,
    segment_read_failures: HashMap<Uuid, u32>,
    write_failures: u32,
    writes_down: bool,
    write_conflicts: u32,
    rejected_rows: HashSet<Uuid>,
}

pub struct InMemoryStore {
    summaries: RwLock<Vec<SummaryRecord>>,
    segments: RwLock<HashMap<Uuid, Vec<SegmentRecord>>>,
    view: RwLock<BTreeMap<Uuid, AvailabilityViewRow>>,
    faults: Mutex<Faults>,
    summary_reads: AtomicU64,
    segment_reads: AtomicU64,
    upserts: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            summaries: RwLock::new(Vec::new()),
            segments: RwLock::new(HashMap::new()),
            view: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            summary_reads: AtomicU64::new(0),
            segment_reads: AtomicU64::new(0),
            upserts: AtomicU64::new(0),
        }
    }

    pub async fn insert_summary(&self, summary: SummaryRecord) {
        self.summaries.write().await.push(summary);
    }

    pub async fn insert_segment(&self, segment: SegmentRecord) {
        self.segments
            .write()
            .await
            .entry(segment.stream_id)
            .or_default()
            .push(segment);
    }

    /// Fail the next `count` summary stream opens with `Unavailable`
    pub async fn fail_summary_reads(&self, count: u32) {
        self.faults.lock().await.summary_read_failures = count;
    }

    /// Yield `err` after the last summary of every summary stream
    pub async fn push_summary_stream_error(&self, err: StoreError) {
        self.faults.lock().await.summary_stream_errors.push(err);
    }

    /// Fail the next `count` segment reads of `stream_id` with `Unavailable`
    pub async fn fail_segment_reads(&self, stream_id: Uuid, count: u32) {
        self.faults
            .lock()
            .await
            .segment_read_failures
            .insert(stream_id, count);
    }

    /// Fail the next `count` upserts with `Unavailable`
    pub async fn fail_writes(&self, count: u32) {
        self.faults.lock().await.write_failures = count;
    }

    /// Make every upsert fail with `Unavailable` until switched back
    pub async fn set_writes_unavailable(&self, down: bool) {
        self.faults.lock().await.writes_down = down;
    }

    /// Fail the next `count` upserts with `Conflict`
    pub async fn conflict_writes(&self, count: u32) {
        self.faults.lock().await.write_conflicts = count;
    }

    /// Every write of the row with `id` fails as unavailable
    pub async fn reject_row(&self, id: Uuid) {
        self.faults.lock().await.rejected_rows.insert(id);
    }

    pub fn summary_reads(&self) -> u64 {
        self.summary_reads.load(Ordering::Relaxed)
    }

    pub fn segment_reads(&self) -> u64 {
        self.segment_reads.load(Ordering::Relaxed)
    }

    /// Upsert attempts, including failed ones
    pub fn upserts(&self) -> u64 {
        self.upserts.load(Ordering::Relaxed)
    }

    /// Snapshot of the view ordered by stream id, quality and start
    pub async fn view_rows(&self) -> Vec<AvailabilityViewRow> {
        let mut rows: Vec<_> = self.view.read().await.values().cloned().collect();
        rows.sort_by(|a, b| {
            a.seed_id()
                .cmp(&b.seed_id())
                .then(a.quality.cmp(&b.quality))
                .then(a.start.cmp(&b.start))
                .then(a.end.cmp(&b.end))
                .then(a.sample_rate.total_cmp(&b.sample_rate))
        });
        rows
    }

    pub async fn view_row(&self, id: Uuid) -> Option<AvailabilityViewRow> {
        self.view.read().await.get(&id).cloned()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SummaryStore for InMemoryStore {
    async fn read_summaries(&self, scope: &Scope) -> Result<RecordStream<SummaryRecord>, StoreError> {
        self.summary_reads.fetch_add(1, Ordering::Relaxed);
        let trailing_errors = {
            let mut faults = self.faults.lock().await;
            if faults.summary_read_failures > 0 {
                faults.summary_read_failures -= 1;
                return Err(StoreError::Unavailable("injected summary read failure".into()));
            }
            faults.summary_stream_errors.clone()
        };

        let items: Vec<Result<SummaryRecord, StoreError>> = self
            .summaries
            .read()
            .await
            .iter()
            .filter(|s| scope.matches(s))
            .cloned()
            .map(Ok)
            .chain(trailing_errors.into_iter().map(Err))
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

#[async_trait]
impl SegmentStore for InMemoryStore {
    async fn read_segments(&self, stream_id: Uuid) -> Result<RecordStream<SegmentRecord>, StoreError> {
        self.segment_reads.fetch_add(1, Ordering::Relaxed);
        {
            let mut faults = self.faults.lock().await;
            if let Some(remaining) = faults.segment_read_failures.get_mut(&stream_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Unavailable(format!(
                        "injected segment read failure for {}",
                        stream_id
                    )));
                }
            }
        }

        let items: Vec<Result<SegmentRecord, StoreError>> = self
            .segments
            .read()
            .await
            .get(&stream_id)
            .map(|segs| segs.iter().cloned().map(Ok).collect())
            .unwrap_or_default();
        Ok(Box::pin(stream::iter(items)))
    }
}

#[async_trait]
impl ViewStore for InMemoryStore {
    async fn upsert(&self, row: &AvailabilityViewRow) -> Result<(), StoreError> {
        self.upserts.fetch_add(1, Ordering::Relaxed);
        {
            let mut faults = self.faults.lock().await;
            if faults.writes_down {
                return Err(StoreError::Unavailable("view store down".into()));
            }
            if faults.rejected_rows.contains(&row.id) {
                return Err(StoreError::Unavailable(format!("row {} rejected", row.id)));
            }
            if faults.write_failures > 0 {
                faults.write_failures -= 1;
                return Err(StoreError::Unavailable("injected write failure".into()));
            }
            if faults.write_conflicts > 0 {
                faults.write_conflicts -= 1;
                return Err(StoreError::Conflict(format!("injected conflict on {}", row.id)));
            }
        }

        self.view.write().await.insert(row.id, row.clone());
        Ok(())
    }
}
