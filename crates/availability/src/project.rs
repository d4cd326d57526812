//! View projector: turns classified summaries into view rows.

use uuid::Uuid;

use crate::classify::Classified;
use crate::error::MalformedRecord;
use crate::merge::MergedInterval;
use crate::types::{AvailabilityViewRow, ChannelDayKey, RestrictionLevel, SummaryRecord};

/// Namespace for merged-interval row ids
const MERGED_INTERVAL_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_43c2_9a7e_4b05_b1c8_2f3e_7a90_d514);

/// Stable id of a merged interval.
///
/// Derived from the natural channel-day key rather than the summary id, so
/// the same physical interval keeps its id when the day is re-ingested.
pub fn merged_interval_id(key: &ChannelDayKey, interval: &MergedInterval) -> Uuid {
    let name = format!(
        "{}.{}|{}|{:016x}|{}|{}",
        key.seed_id(),
        key.quality,
        key.day_start.timestamp_millis(),
        interval.sample_rate.to_bits(),
        interval.start.timestamp_millis(),
        interval.end.timestamp_millis(),
    );
    Uuid::new_v5(&MERGED_INTERVAL_NAMESPACE, name.as_bytes())
}

fn base_row(summary: &SummaryRecord) -> AvailabilityViewRow {
    AvailabilityViewRow {
        id: summary.id,
        network: summary.key.network.clone(),
        station: summary.key.station.clone(),
        location: summary.key.location.clone(),
        channel: summary.key.channel.clone(),
        quality: summary.key.quality.clone(),
        sample_rate: 0.0,
        start: summary.day_start(),
        end: summary.day_end,
        created_at: summary.created_at,
        restriction: RestrictionLevel::Open,
        record_count: 1,
    }
}

/// The whole day as one row, keyed by the summary's own id.
pub fn project_complete_day(summary: &SummaryRecord) -> Result<AvailabilityViewRow, MalformedRecord> {
    let sample_rate = summary
        .canonical_sample_rate()
        .ok_or_else(|| MalformedRecord::summary(summary.id, "no sample rates"))?;
    Ok(AvailabilityViewRow {
        sample_rate,
        ..base_row(summary)
    })
}

pub fn project_merged_interval(summary: &SummaryRecord, interval: &MergedInterval) -> AvailabilityViewRow {
    AvailabilityViewRow {
        id: merged_interval_id(&summary.key, interval),
        sample_rate: interval.sample_rate,
        start: interval.start,
        end: interval.end,
        ..base_row(summary)
    }
}

/// Rows for one classified summary: one for a complete day, one per merged
/// interval for a partial day (possibly none).
pub fn project(
    summary: &SummaryRecord,
    classified: &Classified,
) -> Result<Vec<AvailabilityViewRow>, MalformedRecord> {
    match classified {
        Classified::CompleteDay => Ok(vec![project_complete_day(summary)?]),
        Classified::PartialDay(partial) => Ok(partial
            .intervals
            .iter()
            .map(|interval| project_merged_interval(summary, interval))
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::PartialDay;
    use crate::merge::merge_segments;
    use crate::test_helpers::{segment, summary, ts};

    #[test]
    fn test_complete_day_covers_exact_day() {
        let s = summary("NL", "HGN", "2020-06-05", 100.0);
        let rows = project(&s, &Classified::CompleteDay).unwrap();

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.id, s.id);
        assert_eq!(row.start, ts("2020-06-05T00:00:00Z"));
        assert_eq!(row.end, ts("2020-06-06T00:00:00Z"));
        assert_eq!(row.sample_rate, 200.0);
        assert_eq!(row.restriction, RestrictionLevel::Open);
        assert_eq!(row.record_count, 1);
        assert_eq!(row.created_at, s.created_at);
    }

    #[test]
    fn test_complete_day_without_rates_is_malformed() {
        let mut s = summary("NL", "HGN", "2020-06-05", 100.0);
        s.sample_rates.clear();
        assert!(project_complete_day(&s).is_err());
    }

    #[test]
    fn test_partial_rows_inherit_channel_fields() {
        let s = summary("NL", "HGN", "2020-06-05", 30.0);
        let intervals = merge_segments(&[
            segment(s.id, 40.0, "2020-06-05T01:00:00Z", "2020-06-05T02:00:00Z"),
            segment(s.id, 40.0, "2020-06-05T05:00:00Z", "2020-06-05T06:00:00Z"),
        ]);
        let classified = Classified::PartialDay(PartialDay {
            intervals,
            ..Default::default()
        });

        let rows = project(&s, &classified).unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.seed_id(), "NL.HGN.02.BHZ");
            assert_eq!(row.quality, "D");
            assert_eq!(row.sample_rate, 40.0);
            assert_eq!(row.created_at, s.created_at);
            assert_ne!(row.id, s.id);
        }
        assert_ne!(rows[0].id, rows[1].id);
    }

    #[test]
    fn test_partial_day_with_no_intervals_projects_nothing() {
        let s = summary("NL", "HGN", "2020-06-05", 0.0);
        let rows = project(&s, &Classified::PartialDay(PartialDay::default())).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_merged_id_survives_reingestion() {
        // Same physical interval, different summary and segment ids
        let first = summary("NL", "HGN", "2020-06-05", 30.0);
        let mut second = first.clone();
        second.id = uuid::Uuid::new_v4();

        let a = merge_segments(&[segment(first.id, 40.0, "2020-06-05T01:00:00Z", "2020-06-05T02:00:00Z")]);
        let b = merge_segments(&[
            segment(second.id, 40.0, "2020-06-05T01:00:00Z", "2020-06-05T01:30:00Z"),
            segment(second.id, 40.0, "2020-06-05T01:30:00Z", "2020-06-05T02:00:00Z"),
        ]);

        assert_eq!(
            merged_interval_id(&first.key, &a[0]),
            merged_interval_id(&second.key, &b[0])
        );
    }

    #[test]
    fn test_merged_id_distinguishes_rate_and_bounds() {
        let s = summary("NL", "HGN", "2020-06-05", 30.0);
        let base = merge_segments(&[segment(s.id, 40.0, "2020-06-05T01:00:00Z", "2020-06-05T02:00:00Z")]);
        let other_rate = merge_segments(&[segment(s.id, 20.0, "2020-06-05T01:00:00Z", "2020-06-05T02:00:00Z")]);
        let other_end = merge_segments(&[segment(s.id, 40.0, "2020-06-05T01:00:00Z", "2020-06-05T02:00:00.001Z")]);

        let id = merged_interval_id(&s.key, &base[0]);
        assert_ne!(id, merged_interval_id(&s.key, &other_rate[0]));
        assert_ne!(id, merged_interval_id(&s.key, &other_end[0]));
    }
}
