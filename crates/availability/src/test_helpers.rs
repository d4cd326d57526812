//! Builders for summary and segment records used across tests, plus
//! database fixtures for the PostgreSQL integration tests.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use deadpool_postgres::Pool;
use uuid::Uuid;

use crate::db;
use crate::types::{ChannelDayKey, SegmentRecord, SummaryRecord};

/// Parse an RFC 3339 timestamp, panicking on bad input.
pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .unwrap_or_else(|e| panic!("bad test timestamp {}: {}", s, e))
        .with_timezone(&Utc)
}

/// Midnight UTC of a `YYYY-MM-DD` day.
pub fn day(s: &str) -> DateTime<Utc> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .unwrap_or_else(|e| panic!("bad test day {}: {}", s, e))
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid")
        .and_utc()
}

/// A 200Hz `BHZ` summary for `network.station` on `day_str`.
pub fn summary(network: &str, station: &str, day_str: &str, completeness: f64) -> SummaryRecord {
    let start = day(day_str);
    SummaryRecord {
        id: Uuid::new_v4(),
        key: ChannelDayKey {
            network: network.to_string(),
            station: station.to_string(),
            location: "02".to_string(),
            channel: "BHZ".to_string(),
            quality: "D".to_string(),
            day_start: start,
        },
        day_end: start + Duration::days(1),
        completeness_percent: completeness,
        sample_rates: vec![200.0],
        created_at: ts("2020-06-07T08:00:00Z"),
    }
}

/// A raw segment `[start, end)` belonging to `stream_id`.
pub fn segment(stream_id: Uuid, sample_rate: f64, start: &str, end: &str) -> SegmentRecord {
    let start = ts(start);
    let end = ts(end);
    let millis = (end - start).num_milliseconds().max(0);
    SegmentRecord {
        id: Uuid::new_v4(),
        stream_id,
        sample_rate,
        start,
        end,
        sample_count: (millis as f64 * sample_rate / 1000.0) as i64,
    }
}

/// Create a test pool and run migrations. Requires DATABASE_URL env var.
pub async fn setup_test_db() -> Result<Pool, String> {
    let url = std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL not set".to_string())?;
    let pool = db::create_pool(&url, crate::config::DEFAULT_POOL_SIZE).map_err(|e| e.to_string())?;
    db::run_migrations(&pool).await.map_err(|e| e.to_string())?;
    Ok(pool)
}

/// Insert an upstream summary row.
pub async fn insert_summary_row(pool: &Pool, summary: &SummaryRecord) -> Result<(), String> {
    let client = pool.get().await.map_err(|e| format!("pool error: {}", e))?;
    client
        .execute(
            "INSERT INTO daily_streams (id, net, sta, loc, cha, qlt, ts, te, avail, srate, created) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            &[
                &summary.id,
                &summary.key.network,
                &summary.key.station,
                &summary.key.location,
                &summary.key.channel,
                &summary.key.quality,
                &summary.key.day_start,
                &summary.day_end,
                &summary.completeness_percent,
                &summary.sample_rates,
                &summary.created_at,
            ],
        )
        .await
        .map_err(|e| format!("insert summary: {}", e))?;
    Ok(())
}

/// Insert an upstream segment row. Its summary must exist.
pub async fn insert_segment_row(pool: &Pool, segment: &SegmentRecord) -> Result<(), String> {
    let client = pool.get().await.map_err(|e| format!("pool error: {}", e))?;
    client
        .execute(
            "INSERT INTO c_segments (id, stream_id, srate, ts, te, num_samples) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &segment.id,
                &segment.stream_id,
                &segment.sample_rate,
                &segment.start,
                &segment.end,
                &segment.sample_count,
            ],
        )
        .await
        .map_err(|e| format!("insert segment: {}", e))?;
    Ok(())
}

/// Unique network code so concurrent test runs do not see each other's rows.
pub fn unique_network() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("T{}", &id[..7]).to_uppercase()
}
