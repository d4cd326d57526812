//! availability: materializes the waveform availability view
//!
//! Reads per-day stream summaries and raw continuous segments, merges
//! overlapping or duplicated segments into disjoint intervals and upserts one
//! view row per physically distinct interval.

pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod materialize;
pub mod memory;
pub mod merge;
pub mod metrics;
pub mod project;
pub mod reconcile;
pub mod scope;
pub mod store;
pub mod test_helpers;
pub mod types;

pub use config::{RetryConfig, TuningConfig};
pub use error::{ChannelDayError, Error, MalformedRecord, StoreError};
pub use reconcile::{ChannelDayFailure, ReconcileReport, Reconciler};
pub use scope::{Scope, ScopeParams};
pub use types::{AvailabilityViewRow, ChannelDayKey, RestrictionLevel, SegmentRecord, SummaryRecord};

pub type Result<T> = std::result::Result<T, Error>;
