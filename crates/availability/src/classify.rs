//! Availability classifier.
//!
//! Routes each summary record down exactly one path: complete days are
//! projected whole without touching segments, partial days have their
//! segments read and merged.

use tracing::debug;

use crate::error::{ChannelDayError, MalformedRecord};
use crate::merge::{merge_segments, MergedInterval};
use crate::scope::Scope;
use crate::store::SegmentReader;
use crate::types::{SegmentRecord, SummaryRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayKind {
    Complete,
    Partial,
}

impl std::fmt::Display for DayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DayKind::Complete => write!(f, "complete"),
            DayKind::Partial => write!(f, "partial"),
        }
    }
}

pub fn day_kind(summary: &SummaryRecord) -> DayKind {
    if summary.is_complete() {
        DayKind::Complete
    } else {
        DayKind::Partial
    }
}

/// Outcome of classifying one summary record
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    CompleteDay,
    PartialDay(PartialDay),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartialDay {
    pub intervals: Vec<MergedInterval>,
    pub segments_read: usize,
    /// Dropped for falling below the minimum segment length
    pub too_short: usize,
    /// Skipped and reported, never merged
    pub malformed: Vec<MalformedRecord>,
}

impl Classified {
    pub fn kind(&self) -> DayKind {
        match self {
            Classified::CompleteDay => DayKind::Complete,
            Classified::PartialDay(_) => DayKind::Partial,
        }
    }
}

/// Check the invariants a summary must hold before it can be projected.
pub fn validate_summary(summary: &SummaryRecord) -> Result<(), MalformedRecord> {
    if summary.day_end <= summary.day_start() {
        return Err(MalformedRecord::summary(summary.id, "day end is not after day start"));
    }
    if !summary.completeness_percent.is_finite() || summary.completeness_percent < 0.0 {
        return Err(MalformedRecord::summary(
            summary.id,
            format!("invalid completeness {}", summary.completeness_percent),
        ));
    }
    if summary.is_complete() && summary.canonical_sample_rate().is_none() {
        return Err(MalformedRecord::summary(summary.id, "no sample rates"));
    }
    Ok(())
}

/// Zero-length segments are valid; they are dropped by the merger.
pub fn validate_segment(segment: &SegmentRecord) -> Result<(), MalformedRecord> {
    if !segment.sample_rate.is_finite() || segment.sample_rate <= 0.0 {
        return Err(MalformedRecord::segment(
            segment.id,
            format!("invalid sample rate {}", segment.sample_rate),
        ));
    }
    if segment.end < segment.start {
        return Err(MalformedRecord::segment(segment.id, "interval ends before it starts"));
    }
    Ok(())
}

/// Validate raw segments and apply the scope's minimum length, then merge.
pub fn reconcile_segments(segments: Vec<SegmentRecord>, scope: &Scope) -> PartialDay {
    let segments_read = segments.len();
    let mut kept = Vec::with_capacity(segments.len());
    let mut malformed = Vec::new();
    let mut too_short = 0;

    for segment in segments {
        if let Err(e) = validate_segment(&segment) {
            malformed.push(e);
        } else if !scope.keeps_segment(&segment) {
            too_short += 1;
        } else {
            kept.push(segment);
        }
    }

    PartialDay {
        intervals: merge_segments(&kept),
        segments_read,
        too_short,
        malformed,
    }
}

/// Classifies summary records, reading segments only for partial days.
#[derive(Clone)]
pub struct AvailabilityClassifier {
    segments: SegmentReader,
}

impl AvailabilityClassifier {
    pub fn new(segments: SegmentReader) -> Self {
        Self { segments }
    }

    pub async fn classify(
        &self,
        summary: &SummaryRecord,
        scope: &Scope,
    ) -> Result<Classified, ChannelDayError> {
        validate_summary(summary)?;

        match day_kind(summary) {
            DayKind::Complete => Ok(Classified::CompleteDay),
            DayKind::Partial => {
                let segments = self
                    .segments
                    .read_all(summary.id)
                    .await
                    .map_err(ChannelDayError::on_read)?;
                let partial = reconcile_segments(segments, scope);
                debug!(
                    channel_day = %summary.key,
                    segments = partial.segments_read,
                    merged = partial.intervals.len(),
                    too_short = partial.too_short,
                    malformed = partial.malformed.len(),
                    "merged partial day"
                );
                Ok(Classified::PartialDay(partial))
            }
        }
    }
}
