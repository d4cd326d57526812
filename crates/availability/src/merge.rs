//! Segment merger.
//!
//! Collapses the raw segments of one channel-day into the minimal set of
//! disjoint, maximal half-open intervals covering the same time. Segments
//! with different sample rates never merge: a rate change is a real
//! discontinuity. Comparisons are exact; adjacency means `start == end`.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::types::SegmentRecord;

/// A maximal interval produced by [`merge_segments`]
#[derive(Debug, Clone, PartialEq)]
pub struct MergedInterval {
    /// Owning summary record
    pub stream_id: Uuid,
    pub sample_rate: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Number of raw segments folded into this interval
    pub segment_count: usize,
}

impl MergedInterval {
    fn open(seg: &SegmentRecord) -> Self {
        Self {
            stream_id: seg.stream_id,
            sample_rate: seg.sample_rate,
            start: seg.start,
            end: seg.end,
            segment_count: 1,
        }
    }

    fn same_partition(&self, seg: &SegmentRecord) -> bool {
        self.stream_id == seg.stream_id
            && self.sample_rate.total_cmp(&seg.sample_rate) == Ordering::Equal
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

fn sweep_order(a: &SegmentRecord, b: &SegmentRecord) -> Ordering {
    a.stream_id
        .cmp(&b.stream_id)
        .then(a.sample_rate.total_cmp(&b.sample_rate))
        .then(a.start.cmp(&b.start))
        .then(a.end.cmp(&b.end))
}

/// Merge overlapping, adjacent and duplicate segments.
///
/// Zero-length segments are dropped before sorting. The output is ordered by
/// start, then end, then sample rate.
pub fn merge_segments(segments: &[SegmentRecord]) -> Vec<MergedInterval> {
    let mut spans: Vec<&SegmentRecord> = segments.iter().filter(|s| s.end > s.start).collect();
    spans.sort_by(|a, b| sweep_order(a, b));

    let mut merged = Vec::new();
    let mut current: Option<MergedInterval> = None;

    for seg in spans {
        match current.as_mut() {
            Some(cur) if cur.same_partition(seg) && seg.start <= cur.end => {
                cur.end = cur.end.max(seg.end);
                cur.segment_count += 1;
            }
            _ => {
                if let Some(done) = current.replace(MergedInterval::open(seg)) {
                    merged.push(done);
                }
            }
        }
    }
    merged.extend(current);

    merged.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then(a.end.cmp(&b.end))
            .then(a.sample_rate.total_cmp(&b.sample_rate))
    });
    merged
}

/// Total time covered by a set of disjoint intervals
pub fn covered(intervals: &[MergedInterval]) -> Duration {
    intervals
        .iter()
        .fold(Duration::zero(), |acc, i| acc + i.duration())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{segment, ts};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn spans(merged: &[MergedInterval]) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        merged.iter().map(|m| (m.start, m.end)).collect()
    }

    #[test]
    fn test_overlapping_segments_collapse() {
        // 5ms overlap between consecutive re-ingested segments
        let stream = Uuid::new_v4();
        let a = segment(stream, 200.0, "2020-06-05T00:00:00.000Z", "2020-06-05T17:26:59.005Z");
        let b = segment(stream, 200.0, "2020-06-05T17:26:59.000Z", "2020-06-05T17:32:09.005Z");

        let merged = merge_segments(&[b, a]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start, ts("2020-06-05T00:00:00.000Z"));
        assert_eq!(merged[0].end, ts("2020-06-05T17:32:09.005Z"));
        assert_eq!(merged[0].segment_count, 2);
        assert_eq!(merged[0].stream_id, stream);
        assert_eq!(merged[0].sample_rate, 200.0);
    }

    #[test]
    fn test_exactly_adjacent_segments_join() {
        let stream = Uuid::new_v4();
        let merged = merge_segments(&[
            segment(stream, 100.0, "2020-06-05T00:00:00Z", "2020-06-05T01:00:00Z"),
            segment(stream, 100.0, "2020-06-05T01:00:00Z", "2020-06-05T02:00:00Z"),
        ]);
        assert_eq!(
            spans(&merged),
            vec![(ts("2020-06-05T00:00:00Z"), ts("2020-06-05T02:00:00Z"))]
        );
    }

    #[test]
    fn test_one_millisecond_gap_is_kept() {
        let stream = Uuid::new_v4();
        let merged = merge_segments(&[
            segment(stream, 100.0, "2020-06-05T00:00:00.000Z", "2020-06-05T01:00:00.000Z"),
            segment(stream, 100.0, "2020-06-05T01:00:00.001Z", "2020-06-05T02:00:00.000Z"),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].end, ts("2020-06-05T01:00:00.000Z"));
        assert_eq!(merged[1].start, ts("2020-06-05T01:00:00.001Z"));
    }

    #[test]
    fn test_duplicates_and_contained_segments() {
        let stream = Uuid::new_v4();
        let outer = segment(stream, 50.0, "2020-06-05T03:00:00Z", "2020-06-05T09:00:00Z");
        let merged = merge_segments(&[
            outer.clone(),
            outer.clone(),
            segment(stream, 50.0, "2020-06-05T04:00:00Z", "2020-06-05T05:00:00Z"),
            outer,
        ]);
        assert_eq!(
            spans(&merged),
            vec![(ts("2020-06-05T03:00:00Z"), ts("2020-06-05T09:00:00Z"))]
        );
        assert_eq!(merged[0].segment_count, 4);
    }

    #[test]
    fn test_zero_length_segments_dropped() {
        let stream = Uuid::new_v4();
        let merged = merge_segments(&[
            segment(stream, 100.0, "2020-06-05T00:00:00Z", "2020-06-05T01:00:00Z"),
            // Sits in the gap; must not bridge or split anything
            segment(stream, 100.0, "2020-06-05T01:30:00Z", "2020-06-05T01:30:00Z"),
            segment(stream, 100.0, "2020-06-05T02:00:00Z", "2020-06-05T03:00:00Z"),
        ]);
        assert_eq!(
            spans(&merged),
            vec![
                (ts("2020-06-05T00:00:00Z"), ts("2020-06-05T01:00:00Z")),
                (ts("2020-06-05T02:00:00Z"), ts("2020-06-05T03:00:00Z")),
            ]
        );

        let only_empty = merge_segments(&[segment(
            stream,
            100.0,
            "2020-06-05T01:30:00Z",
            "2020-06-05T01:30:00Z",
        )]);
        assert!(only_empty.is_empty());
    }

    #[test]
    fn test_zero_length_at_boundary_does_not_split() {
        let stream = Uuid::new_v4();
        let merged = merge_segments(&[
            segment(stream, 100.0, "2020-06-05T00:00:00Z", "2020-06-05T01:00:00Z"),
            segment(stream, 100.0, "2020-06-05T01:00:00Z", "2020-06-05T01:00:00Z"),
            segment(stream, 100.0, "2020-06-05T01:00:00Z", "2020-06-05T02:00:00Z"),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].segment_count, 2);
    }

    #[test]
    fn test_sample_rates_never_merge() {
        let stream = Uuid::new_v4();
        let merged = merge_segments(&[
            segment(stream, 100.0, "2020-06-05T00:00:00Z", "2020-06-05T06:00:00Z"),
            segment(stream, 40.0, "2020-06-05T00:00:00Z", "2020-06-05T06:00:00Z"),
            segment(stream, 100.0, "2020-06-05T05:00:00Z", "2020-06-05T07:00:00Z"),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].sample_rate, 40.0);
        assert_eq!(merged[0].end, ts("2020-06-05T06:00:00Z"));
        assert_eq!(merged[1].sample_rate, 100.0);
        assert_eq!(merged[1].end, ts("2020-06-05T07:00:00Z"));
    }

    #[test]
    fn test_output_is_chronological() {
        let stream = Uuid::new_v4();
        let merged = merge_segments(&[
            segment(stream, 20.0, "2020-06-05T20:00:00Z", "2020-06-05T21:00:00Z"),
            segment(stream, 20.0, "2020-06-05T02:00:00Z", "2020-06-05T03:00:00Z"),
            segment(stream, 20.0, "2020-06-05T10:00:00Z", "2020-06-05T11:00:00Z"),
        ]);
        let starts: Vec<_> = merged.iter().map(|m| m.start).collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn test_empty_input() {
        assert!(merge_segments(&[]).is_empty());
    }

    #[test]
    fn test_random_segments_cover_span_exactly() {
        // Disjoint output: covered time plus gaps equals min-start..max-end
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let stream = Uuid::new_v4();
        let day = ts("2020-06-05T00:00:00Z");

        for _ in 0..200 {
            let n = rng.random_range(1..40);
            let segments: Vec<SegmentRecord> = (0..n)
                .map(|_| {
                    let start = rng.random_range(0..86_400_000i64);
                    let len = rng.random_range(0..3_600_000i64);
                    let mut seg = segment(stream, 100.0, "2020-06-05T00:00:00Z", "2020-06-05T00:00:00Z");
                    seg.start = day + Duration::milliseconds(start);
                    seg.end = day + Duration::milliseconds(start + len);
                    seg
                })
                .collect();

            let merged = merge_segments(&segments);
            let non_empty: Vec<_> = segments.iter().filter(|s| s.end > s.start).collect();
            if non_empty.is_empty() {
                assert!(merged.is_empty());
                continue;
            }

            for pair in merged.windows(2) {
                assert!(pair[0].end < pair[1].start, "intervals overlap or touch");
            }
            let gaps = merged
                .windows(2)
                .fold(Duration::zero(), |acc, p| acc + (p[1].start - p[0].end));
            let min_start = non_empty.iter().map(|s| s.start).min().unwrap();
            let max_end = non_empty.iter().map(|s| s.end).max().unwrap();
            assert_eq!(covered(&merged) + gaps, max_end - min_start);

            // Every input moment is covered by exactly one output interval
            for seg in &non_empty {
                let containing = merged
                    .iter()
                    .filter(|m| m.start <= seg.start && seg.end <= m.end)
                    .count();
                assert_eq!(containing, 1);
            }
        }
    }
}
