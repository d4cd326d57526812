//! Selection filter: resolves which summary records a run touches.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;

use crate::types::{SegmentRecord, SummaryRecord};
use crate::{Error, Result};

const MATCH_ALL: &str = "^.*$";

/// A regular expression anchored to the whole field.
///
/// `NL` matches the network `NL` but not `NLX`; alternations such as
/// `NL|BE` are grouped before anchoring.
#[derive(Debug, Clone)]
pub struct NamePattern {
    anchored: String,
    regex: Regex,
}

impl NamePattern {
    /// Anchor and compile a user-supplied pattern. `None` or blank matches all.
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw.map(str::trim) {
            None | Some("") => Self::compile(MATCH_ALL.to_string()),
            Some(p) => Self::compile(format!("^(?:{})$", p)),
        }
    }

    fn compile(anchored: String) -> Result<Self> {
        let regex = Regex::new(&anchored)
            .map_err(|e| Error::Scope(format!("invalid pattern {}: {}", anchored, e)))?;
        Ok(Self { anchored, regex })
    }

    /// Anchored source, suitable for server-side regex operators
    pub fn as_str(&self) -> &str {
        &self.anchored
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

/// Time window of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBounds {
    /// Days with `day_start >= start` and `day_end <= end`
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Everything from `start` onward
    OpenEnded { start: DateTime<Utc> },
}

/// Resolved scope of one reconciliation run
#[derive(Debug, Clone)]
pub struct Scope {
    pub networks: NamePattern,
    pub stations: NamePattern,
    pub bounds: TimeBounds,
    /// Raw segments shorter than this are ignored on the partial-day path
    pub min_segment_length: Option<Duration>,
}

impl Scope {
    pub fn start(&self) -> DateTime<Utc> {
        match self.bounds {
            TimeBounds::Range { start, .. } | TimeBounds::OpenEnded { start } => start,
        }
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        match self.bounds {
            TimeBounds::Range { end, .. } => Some(end),
            TimeBounds::OpenEnded { .. } => None,
        }
    }

    pub fn matches(&self, summary: &SummaryRecord) -> bool {
        self.networks.is_match(&summary.key.network)
            && self.stations.is_match(&summary.key.station)
            && summary.day_start() >= self.start()
            && self.end().map_or(true, |end| summary.day_end <= end)
    }

    pub fn keeps_segment(&self, segment: &SegmentRecord) -> bool {
        self.min_segment_length
            .map_or(true, |min| segment.duration() >= min)
    }
}

/// Externally supplied run parameters, before defaulting and validation
#[derive(Debug, Clone, Default)]
pub struct ScopeParams {
    pub networks: Option<String>,
    pub stations: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Overrides `start` with midnight UTC this many days before today
    pub days_back: Option<u32>,
    /// Open-ended run: ignore `end` and take everything from `start` onward
    pub incremental: bool,
    pub min_segment_length: Option<Duration>,
}

impl ScopeParams {
    /// Apply defaults relative to `now` and validate.
    ///
    /// Without an explicit range the scope is yesterday through today.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<Scope> {
        let today = midnight(now);

        let start = match self.days_back {
            Some(days) => today - Duration::days(i64::from(days)),
            None => self.start.unwrap_or(today - Duration::days(1)),
        };

        let bounds = if self.incremental {
            TimeBounds::OpenEnded { start }
        } else {
            let end = self.end.unwrap_or(today);
            if end <= start {
                return Err(Error::Scope(format!(
                    "end {} is not after start {}",
                    end.to_rfc3339(),
                    start.to_rfc3339()
                )));
            }
            TimeBounds::Range { start, end }
        };

        if let Some(min) = self.min_segment_length {
            if min < Duration::zero() {
                return Err(Error::Scope("minimum segment length is negative".into()));
            }
        }

        Ok(Scope {
            networks: NamePattern::parse(self.networks.as_deref())?,
            stations: NamePattern::parse(self.stations.as_deref())?,
            bounds,
            min_segment_length: self.min_segment_length,
        })
    }
}

fn midnight(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Parse `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS[.fff]` (UTC) or RFC 3339.
pub fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    Err(format!("invalid timestamp '{}': expected YYYY-MM-DD or RFC 3339", s))
}
