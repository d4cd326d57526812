//! PostgreSQL adapter for the summary, segment and view stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, PoolConfig, PoolError, Runtime};
use futures_util::StreamExt;
use regex::Regex;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, StoreError};
use crate::scope::Scope;
use crate::store::{RecordStream, SegmentStore, SummaryStore, ViewStore};
use crate::types::{AvailabilityViewRow, ChannelDayKey, RestrictionLevel, SegmentRecord, SummaryRecord};
use crate::Result;

pub const DEFAULT_VIEW_TABLE: &str = "availability";

/// Create a connection pool from a database URL
pub fn create_pool(database_url: &str, max_size: usize) -> Result<Pool> {
    let pg_config: tokio_postgres::Config = database_url
        .parse()
        .map_err(|e: tokio_postgres::Error| Error::Config(format!("invalid database URL: {}", e)))?;

    let mut cfg = Config::new();
    if let Some(host) = pg_config.get_hosts().first() {
        match host {
            tokio_postgres::config::Host::Tcp(h) => cfg.host = Some(h.clone()),
            #[cfg(unix)]
            tokio_postgres::config::Host::Unix(p) => cfg.host = Some(p.to_string_lossy().to_string()),
        }
    }
    if let Some(port) = pg_config.get_ports().first() {
        cfg.port = Some(*port);
    }
    if let Some(user) = pg_config.get_user() {
        cfg.user = Some(user.to_string());
    }
    if let Some(password) = pg_config.get_password() {
        cfg.password = Some(String::from_utf8_lossy(password).to_string());
    }
    if let Some(dbname) = pg_config.get_dbname() {
        cfg.dbname = Some(dbname.to_string());
    }
    cfg.pool = Some(PoolConfig::new(max_size.max(1)));

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| Error::Pool(format!("failed to create pool: {}", e)))
}

/// Run database migrations
pub async fn run_migrations(pool: &Pool) -> Result<()> {
    let client = pool
        .get()
        .await
        .map_err(|e| Error::Pool(format!("failed to get connection: {}", e)))?;

    client
        .batch_execute(include_str!("../migrations/001_initial.sql"))
        .await?;

    info!("database migrations applied successfully");
    Ok(())
}

/// Classify a driver error. Errors without a server response (closed
/// connection, I/O) mean the store could not serve the call.
pub fn map_pg_error(e: tokio_postgres::Error) -> StoreError {
    match e.as_db_error() {
        Some(db_err) => classify_sqlstate(db_err.code(), db_err.message()),
        None => StoreError::Unavailable(e.to_string()),
    }
}

/// Map a server-reported SQLSTATE onto a store error
pub fn classify_sqlstate(code: &SqlState, message: &str) -> StoreError {
    let detail = format!("{}: {}", code.code(), message);
    if *code == SqlState::UNIQUE_VIOLATION
        || *code == SqlState::T_R_SERIALIZATION_FAILURE
        || *code == SqlState::T_R_DEADLOCK_DETECTED
    {
        StoreError::Conflict(detail)
    } else if *code == SqlState::INVALID_REGULAR_EXPRESSION {
        StoreError::InvalidPattern(detail)
    } else if code.code().starts_with("08")
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
        || *code == SqlState::TOO_MANY_CONNECTIONS
        || *code == SqlState::QUERY_CANCELED
    {
        StoreError::Unavailable(detail)
    } else {
        StoreError::Rejected(detail)
    }
}

fn map_pool_error(e: PoolError) -> StoreError {
    StoreError::Unavailable(format!("pool error: {}", e))
}

fn params<'a>(s: &'a [&'a (dyn ToSql + Sync)]) -> impl ExactSizeIterator<Item = &'a dyn ToSql> + 'a {
    s.iter().map(|p| *p as _)
}

fn decode_summary(row: &Row) -> std::result::Result<SummaryRecord, tokio_postgres::Error> {
    Ok(SummaryRecord {
        id: row.try_get("id")?,
        key: ChannelDayKey {
            network: row.try_get("net")?,
            station: row.try_get("sta")?,
            location: row.try_get("loc")?,
            channel: row.try_get("cha")?,
            quality: row.try_get("qlt")?,
            day_start: row.try_get("ts")?,
        },
        day_end: row.try_get("te")?,
        completeness_percent: row.try_get("avail")?,
        sample_rates: row.try_get("srate")?,
        created_at: row.try_get("created")?,
    })
}

fn decode_segment(row: &Row) -> std::result::Result<SegmentRecord, tokio_postgres::Error> {
    Ok(SegmentRecord {
        id: row.try_get("id")?,
        stream_id: row.try_get("stream_id")?,
        sample_rate: row.try_get("srate")?,
        start: row.try_get("ts")?,
        end: row.try_get("te")?,
        sample_count: row.try_get("num_samples")?,
    })
}

fn decode_view_row(row: &Row) -> std::result::Result<AvailabilityViewRow, StoreError> {
    let malformed = |e: tokio_postgres::Error| StoreError::Malformed(e.to_string());
    let restr: String = row.try_get("restr").map_err(malformed)?;
    Ok(AvailabilityViewRow {
        id: row.try_get("id").map_err(malformed)?,
        network: row.try_get("net").map_err(malformed)?,
        station: row.try_get("sta").map_err(malformed)?,
        location: row.try_get("loc").map_err(malformed)?,
        channel: row.try_get("cha").map_err(malformed)?,
        quality: row.try_get("qlt").map_err(malformed)?,
        sample_rate: row.try_get("srate").map_err(malformed)?,
        start: row.try_get("ts").map_err(malformed)?,
        end: row.try_get("te").map_err(malformed)?,
        created_at: row.try_get("created").map_err(malformed)?,
        restriction: RestrictionLevel::parse(&restr)
            .ok_or_else(|| StoreError::Malformed(format!("unknown restriction level {:?}", restr)))?,
        record_count: row.try_get("count").map_err(malformed)?,
    })
}

/// Summary, segment and view stores backed by one PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
    view_table: String,
}

impl PgStore {
    /// `view_table` must be a plain SQL identifier.
    pub fn new(pool: Pool, view_table: &str) -> Result<Self> {
        let ident = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(|e| Error::Config(e.to_string()))?;
        if !ident.is_match(view_table) {
            return Err(Error::Config(format!("invalid view table name {:?}", view_table)));
        }
        Ok(Self {
            pool,
            view_table: view_table.to_string(),
        })
    }

    pub fn view_table(&self) -> &str {
        &self.view_table
    }

    /// Create the view table as a copy of `availability` if it is missing.
    pub async fn ensure_view_table(&self) -> Result<()> {
        if self.view_table == DEFAULT_VIEW_TABLE {
            return Ok(());
        }
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| Error::Pool(format!("failed to get connection: {}", e)))?;
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {} (LIKE {} INCLUDING ALL)",
                self.view_table, DEFAULT_VIEW_TABLE
            ))
            .await?;
        info!(table = %self.view_table, "view table ready");
        Ok(())
    }

    /// Check that the pool can hand out a working connection.
    pub async fn ping(&self) -> std::result::Result<(), StoreError> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        client.simple_query("SELECT 1").await.map_err(map_pg_error)?;
        Ok(())
    }

    pub async fn fetch_view_row(&self, id: Uuid) -> std::result::Result<Option<AvailabilityViewRow>, StoreError> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let sql = format!(
            "SELECT id, net, sta, loc, cha, qlt, srate, ts, te, created, restr, count \
             FROM {} WHERE id = $1",
            self.view_table
        );
        let row = client
            .query_opt(sql.as_str(), &[&id])
            .await
            .map_err(map_pg_error)?;
        row.as_ref().map(decode_view_row).transpose()
    }

    /// View rows of one network and station, ordered by start.
    pub async fn fetch_view_rows(
        &self,
        network: &str,
        station: &str,
    ) -> std::result::Result<Vec<AvailabilityViewRow>, StoreError> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let sql = format!(
            "SELECT id, net, sta, loc, cha, qlt, srate, ts, te, created, restr, count \
             FROM {} WHERE net = $1 AND sta = $2 ORDER BY ts, te, srate",
            self.view_table
        );
        let rows = client
            .query(sql.as_str(), &[&network, &station])
            .await
            .map_err(map_pg_error)?;
        rows.iter().map(decode_view_row).collect()
    }
}

#[async_trait]
impl SummaryStore for PgStore {
    async fn read_summaries(&self, scope: &Scope) -> std::result::Result<RecordStream<SummaryRecord>, StoreError> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let networks = scope.networks.as_str().to_string();
        let stations = scope.stations.as_str().to_string();
        let start: DateTime<Utc> = scope.start();
        let end: Option<DateTime<Utc>> = scope.end();
        debug!(networks = %networks, stations = %stations, %start, ?end, "querying daily streams");

        let rows = client
            .query_raw(
                "SELECT id, net, sta, loc, cha, qlt, ts, te, avail, srate, created \
                 FROM daily_streams \
                 WHERE net ~ $1 AND sta ~ $2 AND ts >= $3 \
                   AND ($4::timestamptz IS NULL OR te <= $4)",
                params(&[&networks, &stations, &start, &end]),
            )
            .await
            .map_err(map_pg_error)?;

        // The pooled connection stays checked out until the stream is dropped.
        let stream = rows.map(move |row| {
            let _conn = &client;
            let row = row.map_err(map_pg_error)?;
            decode_summary(&row).map_err(|e| StoreError::Malformed(e.to_string()))
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl SegmentStore for PgStore {
    async fn read_segments(&self, stream_id: Uuid) -> std::result::Result<RecordStream<SegmentRecord>, StoreError> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let rows = client
            .query_raw(
                "SELECT id, stream_id, srate, ts, te, num_samples FROM c_segments WHERE stream_id = $1",
                params(&[&stream_id]),
            )
            .await
            .map_err(map_pg_error)?;

        let stream = rows.map(move |row| {
            let _conn = &client;
            let row = row.map_err(map_pg_error)?;
            decode_segment(&row).map_err(|e| StoreError::Malformed(e.to_string()))
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ViewStore for PgStore {
    async fn upsert(&self, row: &AvailabilityViewRow) -> std::result::Result<(), StoreError> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        let sql = format!(
            "INSERT INTO {} (id, net, sta, loc, cha, qlt, srate, ts, te, created, restr, count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (id) DO UPDATE SET \
               net = EXCLUDED.net, sta = EXCLUDED.sta, loc = EXCLUDED.loc, \
               cha = EXCLUDED.cha, qlt = EXCLUDED.qlt, srate = EXCLUDED.srate, \
               ts = EXCLUDED.ts, te = EXCLUDED.te, created = EXCLUDED.created, \
               restr = EXCLUDED.restr, count = EXCLUDED.count",
            self.view_table
        );
        let restriction = row.restriction.as_str();
        client
            .execute(
                sql.as_str(),
                &[
                    &row.id,
                    &row.network,
                    &row.station,
                    &row.location,
                    &row.channel,
                    &row.quality,
                    &row.sample_rate,
                    &row.start,
                    &row.end,
                    &row.created_at,
                    &restriction,
                    &row.record_count,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_pool_rejects_bad_url() {
        let err = create_pool("not a url ::", 4).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_view_table_must_be_identifier() {
        let pool = create_pool("postgres://user@localhost/availability", 2).unwrap();
        assert!(PgStore::new(pool.clone(), "availability_test").is_ok());
        assert!(PgStore::new(pool.clone(), "availability; DROP TABLE x").is_err());
        assert!(PgStore::new(pool, "1st").is_err());
    }

    #[test]
    fn test_sqlstate_classification() {
        let err = classify_sqlstate(&SqlState::INVALID_REGULAR_EXPRESSION, "quantifier operand invalid");
        assert_eq!(
            err,
            StoreError::InvalidPattern("2201B: quantifier operand invalid".into())
        );
        assert!(!err.is_transient());

        let err = classify_sqlstate(&SqlState::UNDEFINED_TABLE, "relation \"availability\" does not exist");
        assert!(matches!(err, StoreError::Rejected(ref m) if m.starts_with("42P01") && m.contains("does not exist")));
        assert!(!err.is_transient());

        assert!(matches!(
            classify_sqlstate(&SqlState::UNIQUE_VIOLATION, "duplicate key"),
            StoreError::Conflict(_)
        ));
        assert!(classify_sqlstate(&SqlState::ADMIN_SHUTDOWN, "terminating connection").is_transient());
        assert!(classify_sqlstate(&SqlState::CONNECTION_FAILURE, "lost").is_transient());
    }
}
