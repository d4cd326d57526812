//! Reconciliation driver.
//!
//! Streams the summaries matching a scope, runs each channel-day through
//! classify, project and materialize, and collects per-unit failures into a
//! report. Channel-days are processed concurrently up to a fixed bound.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classify::{AvailabilityClassifier, Classified, DayKind};
use crate::config::{RetryConfig, TuningConfig};
use crate::error::{ChannelDayError, Error, MalformedRecord, RecordKind, StoreError};
use crate::materialize::{PartialWrite, ViewMaterializer};
use crate::metrics::ReconcileMetrics;
use crate::project::project;
use crate::scope::Scope;
use crate::store::{
    with_item_timeout, with_timeout, RecordStream, SegmentReader, SegmentStore, SummaryStore, ViewStore,
};
use crate::types::{ChannelDayKey, SummaryRecord};
use crate::Result;

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Channel-days in flight at once
    pub concurrency: usize,
    /// Deadline for every individual store call
    pub store_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self::from(&TuningConfig::default())
    }
}

impl From<&TuningConfig> for ReconcileOptions {
    fn from(tuning: &TuningConfig) -> Self {
        Self {
            concurrency: tuning.concurrency,
            store_timeout: tuning.store_timeout(),
            retry: tuning.retry.clone(),
        }
    }
}

/// One channel-day (or one undecodable summary) that did not reconcile cleanly
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDayFailure {
    /// Summary id, when the summary could be decoded
    pub stream_id: Option<Uuid>,
    pub channel_day: Option<ChannelDayKey>,
    pub error: ChannelDayError,
    pub attempts: u32,
}

impl ChannelDayFailure {
    fn for_summary(summary: &SummaryRecord, error: ChannelDayError, attempts: u32) -> Self {
        Self {
            stream_id: Some(summary.id),
            channel_day: Some(summary.key.clone()),
            error,
            attempts,
        }
    }
}

impl std::fmt::Display for ChannelDayFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.channel_day {
            Some(key) => write!(f, "{}: {}", key, self.error),
            None => write!(f, "<undecodable summary>: {}", self.error),
        }
    }
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub rows_written: u64,
    pub channel_days: u64,
    pub complete_days: u64,
    pub partial_days: u64,
    pub failures: Vec<ChannelDayFailure>,
    /// The run stopped early on cancellation
    pub cancelled: bool,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

enum UnitOutcome {
    Done {
        kind: DayKind,
        rows_written: usize,
        skipped: Vec<ChannelDayFailure>,
    },
    Failed {
        rows_written: usize,
        failure: ChannelDayFailure,
    },
    /// The summary stream itself yielded an error
    SummaryStream(StoreError),
}

struct Attempt {
    classified: Classified,
    rows_written: usize,
}

pub struct Reconciler {
    summaries: Arc<dyn SummaryStore>,
    classifier: AvailabilityClassifier,
    materializer: ViewMaterializer,
    options: ReconcileOptions,
    metrics: ReconcileMetrics,
}

impl Reconciler {
    pub fn new(
        summaries: Arc<dyn SummaryStore>,
        segments: Arc<dyn SegmentStore>,
        view: Arc<dyn ViewStore>,
        options: ReconcileOptions,
        metrics: ReconcileMetrics,
    ) -> Self {
        let classifier = AvailabilityClassifier::new(SegmentReader::new(segments, options.store_timeout));
        let materializer = ViewMaterializer::new(view, options.store_timeout);
        Self {
            summaries,
            classifier,
            materializer,
            options,
            metrics,
        }
    }

    /// Reconcile every channel-day in `scope` into the view.
    ///
    /// Per-unit failures are collected in the report. The run itself fails
    /// only when the summary source cannot be read or when the view store
    /// rejects writes before any write of this run has succeeded.
    pub async fn reconcile(&self, scope: &Scope, cancel: &CancellationToken) -> Result<ReconcileReport> {
        info!(
            networks = scope.networks.as_str(),
            stations = scope.stations.as_str(),
            start = %scope.start(),
            end = ?scope.end(),
            concurrency = self.options.concurrency,
            "reconciliation started"
        );

        let writes_before = self.materializer.writes_succeeded();
        let summaries = self.open_summaries(scope).await?;

        let mut units = std::pin::pin!(summaries
            .take_until(cancel.cancelled())
            .map(|item| self.run_unit(item, scope))
            .buffer_unordered(self.options.concurrency.max(1)));

        let mut report = ReconcileReport::default();
        while let Some(outcome) = units.next().await {
            match outcome {
                UnitOutcome::Done {
                    kind,
                    rows_written,
                    skipped,
                } => {
                    report.channel_days += 1;
                    report.rows_written += rows_written as u64;
                    match kind {
                        DayKind::Complete => report.complete_days += 1,
                        DayKind::Partial => report.partial_days += 1,
                    }
                    report.failures.extend(skipped);
                }
                UnitOutcome::Failed {
                    rows_written,
                    failure,
                } => {
                    report.channel_days += 1;
                    report.rows_written += rows_written as u64;
                    if failure.error.is_write_unavailable()
                        && self.materializer.writes_succeeded() == writes_before
                    {
                        error!(error = %failure.error, "view store unreachable, aborting run");
                        return Err(Error::DestinationUnreachable(failure.error.to_string()));
                    }
                    report.failures.push(failure);
                }
                UnitOutcome::SummaryStream(err) => match err {
                    StoreError::Malformed(reason) => {
                        warn!(reason = %reason, "skipping undecodable summary record");
                        self.metrics.malformed_records.inc();
                        report.failures.push(ChannelDayFailure {
                            stream_id: None,
                            channel_day: None,
                            error: ChannelDayError::Malformed(MalformedRecord {
                                kind: RecordKind::Summary,
                                id: None,
                                reason,
                            }),
                            attempts: 1,
                        });
                    }
                    other => {
                        error!(error = %other, "summary stream failed mid-run");
                        return Err(Error::summary_read(other));
                    }
                },
            }
        }

        report.cancelled = cancel.is_cancelled();
        if report.cancelled {
            warn!(
                channel_days = report.channel_days,
                rows_written = report.rows_written,
                "reconciliation cancelled"
            );
        }
        info!(
            channel_days = report.channel_days,
            complete_days = report.complete_days,
            partial_days = report.partial_days,
            rows_written = report.rows_written,
            failures = report.failures.len(),
            "reconciliation completed"
        );
        Ok(report)
    }

    async fn open_summaries(&self, scope: &Scope) -> Result<RecordStream<SummaryRecord>> {
        let retry = &self.options.retry;
        let mut attempt = 1;
        loop {
            match with_timeout(self.options.store_timeout, self.summaries.read_summaries(scope)).await {
                Ok(stream) => return Ok(with_item_timeout(stream, self.options.store_timeout)),
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    let delay = retry.delay_for(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "summary read failed, retrying");
                    self.metrics.retries.inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempts = attempt, error = %e, "summary source unreadable");
                    return Err(Error::summary_read(e));
                }
            }
        }
    }

    async fn run_unit(&self, item: std::result::Result<SummaryRecord, StoreError>, scope: &Scope) -> UnitOutcome {
        let summary = match item {
            Ok(summary) => summary,
            Err(e) => return UnitOutcome::SummaryStream(e),
        };
        self.metrics.channel_days.inc();

        let retry = &self.options.retry;
        let mut attempt = 1;
        // Rows stay written when a later attempt fails
        let mut max_written = 0;
        loop {
            match self.attempt(&summary, scope).await {
                Ok(mut done) => {
                    done.rows_written = done.rows_written.max(max_written);
                    return self.finish(&summary, done, attempt);
                }
                Err(partial) if partial.error.is_transient() && attempt < retry.max_attempts => {
                    let delay = retry.delay_for(attempt);
                    debug!(
                        channel_day = %summary.key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %partial.error,
                        "retrying channel-day"
                    );
                    max_written = max_written.max(partial.written);
                    self.metrics.retries.inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(partial) => {
                    let rows_written = max_written.max(partial.written);
                    warn!(
                        channel_day = %summary.key,
                        attempts = attempt,
                        rows_written,
                        error = %partial.error,
                        "channel-day failed"
                    );
                    self.metrics.channel_day_failures.inc();
                    if matches!(partial.error, ChannelDayError::Malformed(_)) {
                        self.metrics.malformed_records.inc();
                    }
                    self.metrics.rows_written.inc_by(rows_written as u64);
                    return UnitOutcome::Failed {
                        rows_written,
                        failure: ChannelDayFailure::for_summary(&summary, partial.error, attempt),
                    };
                }
            }
        }
    }

    /// Classify, project and write one channel-day.
    async fn attempt(&self, summary: &SummaryRecord, scope: &Scope) -> std::result::Result<Attempt, PartialWrite> {
        let classified = self
            .classifier
            .classify(summary, scope)
            .await
            .map_err(|error| PartialWrite { written: 0, error })?;
        let rows = project(summary, &classified).map_err(|e| PartialWrite {
            written: 0,
            error: e.into(),
        })?;
        let rows_written = self.materializer.upsert_all(&rows).await?;
        Ok(Attempt {
            classified,
            rows_written,
        })
    }

    fn finish(&self, summary: &SummaryRecord, done: Attempt, attempts: u32) -> UnitOutcome {
        let kind = done.classified.kind();
        self.metrics.rows_written.inc_by(done.rows_written as u64);

        let skipped = match done.classified {
            Classified::CompleteDay => {
                self.metrics.complete_days.inc();
                Vec::new()
            }
            Classified::PartialDay(partial) => {
                self.metrics.partial_days.inc();
                self.metrics.segments_read.inc_by(partial.segments_read as u64);
                self.metrics.intervals_merged.inc_by(partial.intervals.len() as u64);
                self.metrics.malformed_records.inc_by(partial.malformed.len() as u64);
                partial
                    .malformed
                    .into_iter()
                    .map(|record| {
                        warn!(
                            channel_day = %summary.key,
                            segment_id = ?record.id,
                            reason = %record.reason,
                            "skipped malformed segment"
                        );
                        ChannelDayFailure::for_summary(summary, record.into(), attempts)
                    })
                    .collect()
            }
        };

        debug!(
            channel_day = %summary.key,
            kind = %kind,
            rows = done.rows_written,
            attempts,
            "channel-day reconciled"
        );
        UnitOutcome::Done {
            kind,
            rows_written: done.rows_written,
            skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::scope::ScopeParams;
    use crate::test_helpers::{day, segment, summary, ts};

    fn scope() -> Scope {
        ScopeParams {
            start: Some(day("2020-06-01")),
            end: Some(day("2020-06-30")),
            ..Default::default()
        }
        .resolve(ts("2020-07-01T00:00:00Z"))
        .unwrap()
    }

    fn options() -> ReconcileOptions {
        ReconcileOptions {
            concurrency: 4,
            store_timeout: Duration::from_secs(5),
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
        }
    }

    fn reconciler(store: &Arc<InMemoryStore>) -> Reconciler {
        Reconciler::new(
            store.clone(),
            store.clone(),
            store.clone(),
            options(),
            ReconcileMetrics::unregistered().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_mixed_days() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_summary(summary("NL", "HGN", "2020-06-05", 100.0)).await;
        let partial = summary("NL", "HGN", "2020-06-06", 50.0);
        store
            .insert_segment(segment(partial.id, 200.0, "2020-06-06T00:00:00Z", "2020-06-06T06:00:00Z"))
            .await;
        store
            .insert_segment(segment(partial.id, 200.0, "2020-06-06T12:00:00Z", "2020-06-06T18:00:00Z"))
            .await;
        store.insert_summary(partial).await;

        let report = reconciler(&store)
            .reconcile(&scope(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(report.channel_days, 2);
        assert_eq!(report.complete_days, 1);
        assert_eq!(report.partial_days, 1);
        assert_eq!(report.rows_written, 3);
        assert_eq!(store.view_rows().await.len(), 3);
        assert_eq!(store.segment_reads(), 1);
    }

    #[tokio::test]
    async fn test_summary_open_retried() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_summary(summary("NL", "HGN", "2020-06-05", 100.0)).await;
        store.fail_summary_reads(2).await;

        let report = reconciler(&store)
            .reconcile(&scope(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.rows_written, 1);
        assert_eq!(store.summary_reads(), 3);
    }

    #[tokio::test]
    async fn test_summary_source_down_fails_run() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_summary_reads(10).await;

        let err = reconciler(&store)
            .reconcile(&scope(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SummaryRead(StoreError::Unavailable(_))));
        assert_eq!(store.summary_reads(), 3);
    }

    #[tokio::test]
    async fn test_undecodable_summary_reported() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_summary(summary("NL", "HGN", "2020-06-05", 100.0)).await;
        store
            .push_summary_stream_error(StoreError::Malformed("bad srate column".into()))
            .await;

        let report = reconciler(&store)
            .reconcile(&scope(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.rows_written, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].channel_day.is_none());
    }

    #[tokio::test]
    async fn test_summary_stream_unavailable_fails_run() {
        let store = Arc::new(InMemoryStore::new());
        store
            .push_summary_stream_error(StoreError::Unavailable("connection reset".into()))
            .await;

        let err = reconciler(&store)
            .reconcile(&scope(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SummaryRead(_)));
    }

    #[tokio::test]
    async fn test_pattern_rejected_by_store_is_scope_error() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_summary(summary("NL", "HGN", "2020-06-05", 100.0)).await;
        store
            .push_summary_stream_error(StoreError::InvalidPattern(
                "2201B: invalid regular expression: quantifier operand invalid".into(),
            ))
            .await;

        let err = reconciler(&store)
            .reconcile(&scope(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Scope(ref reason) if reason.contains("quantifier operand invalid")));
        assert_eq!(store.summary_reads(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_summary(summary("NL", "HGN", "2020-06-05", 100.0)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = reconciler(&store).reconcile(&scope(), &cancel).await.unwrap();
        assert!(report.cancelled);
        assert!(!report.is_clean());
        assert_eq!(report.channel_days, 0);
        assert_eq!(store.upserts(), 0);
    }

    #[tokio::test]
    async fn test_metrics_follow_report() {
        let store = Arc::new(InMemoryStore::new());
        let partial = summary("NL", "HGN", "2020-06-06", 50.0);
        store
            .insert_segment(segment(partial.id, 200.0, "2020-06-06T00:00:00Z", "2020-06-06T06:00:00Z"))
            .await;
        store
            .insert_segment(segment(partial.id, 200.0, "2020-06-06T03:00:00Z", "2020-06-06T09:00:00Z"))
            .await;
        store.insert_summary(partial).await;

        let metrics = ReconcileMetrics::unregistered().unwrap();
        let r = Reconciler::new(store.clone(), store.clone(), store.clone(), options(), metrics.clone());
        r.reconcile(&scope(), &CancellationToken::new()).await.unwrap();

        assert_eq!(metrics.channel_days.get(), 1);
        assert_eq!(metrics.partial_days.get(), 1);
        assert_eq!(metrics.segments_read.get(), 2);
        assert_eq!(metrics.intervals_merged.get(), 1);
        assert_eq!(metrics.rows_written.get(), 1);
    }
}
