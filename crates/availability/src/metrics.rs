//! Prometheus counters for reconciliation runs.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub channel_days: IntCounter,
    pub complete_days: IntCounter,
    pub partial_days: IntCounter,
    pub segments_read: IntCounter,
    pub intervals_merged: IntCounter,
    pub rows_written: IntCounter,
    pub channel_day_failures: IntCounter,
    pub malformed_records: IntCounter,
    pub retries: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl ReconcileMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            channel_days: counter(
                registry,
                "availability_channel_days_total",
                "Channel-days processed",
            )?,
            complete_days: counter(
                registry,
                "availability_complete_days_total",
                "Channel-days projected as complete days",
            )?,
            partial_days: counter(
                registry,
                "availability_partial_days_total",
                "Channel-days reconciled from segments",
            )?,
            segments_read: counter(
                registry,
                "availability_segments_read_total",
                "Raw continuous segments read",
            )?,
            intervals_merged: counter(
                registry,
                "availability_intervals_merged_total",
                "Merged intervals produced",
            )?,
            rows_written: counter(
                registry,
                "availability_rows_written_total",
                "View rows upserted",
            )?,
            channel_day_failures: counter(
                registry,
                "availability_channel_day_failures_total",
                "Channel-days that failed after retries",
            )?,
            malformed_records: counter(
                registry,
                "availability_malformed_records_total",
                "Upstream records skipped as malformed",
            )?,
            retries: counter(
                registry,
                "availability_retries_total",
                "Channel-day retries after transient failures",
            )?,
        })
    }

    /// Metrics on a private registry, for tests and embedding
    pub fn unregistered() -> prometheus::Result<Self> {
        Self::new(&Registry::new())
    }
}

/// Render a registry in the text exposition format
pub fn encode_text(registry: &Registry) -> prometheus::Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
