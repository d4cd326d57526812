use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one channel on one day.
///
/// Correlates a summary record with the raw segments recorded for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelDayKey {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub quality: String,
    pub day_start: DateTime<Utc>,
}

impl ChannelDayKey {
    /// SEED-style stream identifier, e.g. `NL.HGN.02.BHZ`
    pub fn seed_id(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }
}

impl fmt::Display for ChannelDayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}@{}",
            self.seed_id(),
            self.quality,
            self.day_start.format("%Y-%m-%d")
        )
    }
}

/// Per-day summary of one channel, as written by the ingestion pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub id: Uuid,
    pub key: ChannelDayKey,
    /// Exclusive end of the day, `day_start + 24h` by convention
    pub day_end: DateTime<Utc>,
    /// Reported coverage in percent, possibly rounded
    pub completeness_percent: f64,
    /// Observed sample rates in order of observation
    pub sample_rates: Vec<f64>,
    pub created_at: DateTime<Utc>,
}

impl SummaryRecord {
    pub fn day_start(&self) -> DateTime<Utc> {
        self.key.day_start
    }

    /// Days reporting 100% (or more, after rounding) are projected whole
    pub fn is_complete(&self) -> bool {
        self.completeness_percent >= 100.0
    }

    /// First-observed rate wins; later rates in the list are ignored.
    pub fn canonical_sample_rate(&self) -> Option<f64> {
        self.sample_rates.first().copied()
    }
}

/// One contiguous physical recording interval, half-open `[start, end)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: Uuid,
    /// Id of the owning summary record
    pub stream_id: Uuid,
    pub sample_rate: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sample_count: i64,
}

impl SegmentRecord {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_zero_length(&self) -> bool {
        self.start == self.end
    }
}

/// Access policy attached to a view row.
///
/// Projection always yields `Open`. `Restricted` and `Partial` are the
/// access-policy extension point: rows carrying them decode and upsert
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RestrictionLevel {
    Open,
    Restricted,
    Partial,
}

impl RestrictionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestrictionLevel::Open => "OPEN",
            RestrictionLevel::Restricted => "RESTRICTED",
            RestrictionLevel::Partial => "PARTIAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(RestrictionLevel::Open),
            "RESTRICTED" => Some(RestrictionLevel::Restricted),
            "PARTIAL" => Some(RestrictionLevel::Partial),
            _ => None,
        }
    }
}

impl fmt::Display for RestrictionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A materialized availability row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityViewRow {
    pub id: Uuid,
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub quality: String,
    pub sample_rate: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub restriction: RestrictionLevel,
    /// Always 1 today; reserved for aggregated rows
    pub record_count: i32,
}

impl AvailabilityViewRow {
    pub fn seed_id(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{summary, ts};

    #[test]
    fn test_key_display() {
        let s = summary("NL", "HGN", "2020-06-05", 50.0);
        assert_eq!(s.key.seed_id(), "NL.HGN.02.BHZ");
        assert_eq!(s.key.to_string(), "NL.HGN.02.BHZ.D@2020-06-05");
    }

    #[test]
    fn test_completeness_threshold() {
        assert!(summary("NL", "HGN", "2020-06-05", 100.0).is_complete());
        assert!(summary("NL", "HGN", "2020-06-05", 100.2).is_complete());
        assert!(!summary("NL", "HGN", "2020-06-05", 99.999).is_complete());
    }

    #[test]
    fn test_first_sample_rate_is_canonical() {
        let mut s = summary("NL", "HGN", "2020-06-05", 100.0);
        s.sample_rates = vec![40.0, 20.0];
        assert_eq!(s.canonical_sample_rate(), Some(40.0));
        s.sample_rates.clear();
        assert_eq!(s.canonical_sample_rate(), None);
    }

    #[test]
    fn test_restriction_round_trip_strings() {
        assert_eq!(RestrictionLevel::Open.as_str(), "OPEN");
        assert_eq!(RestrictionLevel::parse("PARTIAL"), Some(RestrictionLevel::Partial));
        assert_eq!(RestrictionLevel::parse("open"), None);
        for level in [RestrictionLevel::Open, RestrictionLevel::Restricted, RestrictionLevel::Partial] {
            assert_eq!(RestrictionLevel::parse(level.as_str()), Some(level));
        }
    }

    #[test]
    fn test_segment_duration() {
        let seg = SegmentRecord {
            id: Uuid::new_v4(),
            stream_id: Uuid::new_v4(),
            sample_rate: 200.0,
            start: ts("2020-06-05T17:26:59.000Z"),
            end: ts("2020-06-05T17:26:59.005Z"),
            sample_count: 1,
        };
        assert_eq!(seg.duration(), Duration::milliseconds(5));
        assert!(!seg.is_zero_length());
    }
}
