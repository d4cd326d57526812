//! Error types for the availability view materializer

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by summary, segment and view store adapters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Connectivity failure (pool exhausted, connection closed, I/O)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The caller-supplied deadline elapsed
    #[error("store call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The destination refused the write due to a concurrent update
    #[error("write conflict: {0}")]
    Conflict(String),

    /// A row could not be decoded into a record
    #[error("malformed row: {0}")]
    Malformed(String),

    /// The server accepted the connection but refused the statement
    #[error("store rejected statement: {0}")]
    Rejected(String),

    /// The server could not compile a network or station pattern
    #[error("pattern rejected by store: {0}")]
    InvalidPattern(String),
}

impl StoreError {
    /// Transient errors are retried at channel-day granularity
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Summary,
    Segment,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Summary => write!(f, "summary"),
            RecordKind::Segment => write!(f, "segment"),
        }
    }
}

/// An upstream record that violates a required invariant.
///
/// Malformed records are skipped and reported, never merged.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("malformed {kind} record: {reason}")]
pub struct MalformedRecord {
    pub kind: RecordKind,
    /// Record id, when the record could be decoded far enough to know it
    pub id: Option<Uuid>,
    pub reason: String,
}

impl MalformedRecord {
    pub fn summary(id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            kind: RecordKind::Summary,
            id: Some(id),
            reason: reason.into(),
        }
    }

    pub fn segment(id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            kind: RecordKind::Segment,
            id: Some(id),
            reason: reason.into(),
        }
    }
}

/// Which side of a channel-day unit a store failure happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSide {
    Read,
    Write,
}

impl fmt::Display for StoreSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreSide::Read => write!(f, "read"),
            StoreSide::Write => write!(f, "write"),
        }
    }
}

/// Failure of a single channel-day unit. Never aborts other channel-days.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelDayError {
    #[error("store unavailable on {side}: {source}")]
    StoreUnavailable {
        side: StoreSide,
        #[source]
        source: StoreError,
    },

    #[error("write conflict persisted after retry: {0}")]
    WriteConflict(String),

    #[error("store rejected {side}: {source}")]
    Rejected {
        side: StoreSide,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Malformed(#[from] MalformedRecord),
}

impl ChannelDayError {
    /// Classify a store error raised while reading upstream records
    pub fn on_read(err: StoreError) -> Self {
        match err {
            StoreError::Malformed(reason) => ChannelDayError::Malformed(MalformedRecord {
                kind: RecordKind::Segment,
                id: None,
                reason,
            }),
            other @ (StoreError::Rejected(_) | StoreError::InvalidPattern(_)) => ChannelDayError::Rejected {
                side: StoreSide::Read,
                source: other,
            },
            other => ChannelDayError::StoreUnavailable {
                side: StoreSide::Read,
                source: other,
            },
        }
    }

    /// Classify a store error raised while upserting view rows
    pub fn on_write(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(reason) => ChannelDayError::WriteConflict(reason),
            other @ (StoreError::Rejected(_) | StoreError::InvalidPattern(_)) => ChannelDayError::Rejected {
                side: StoreSide::Write,
                source: other,
            },
            other => ChannelDayError::StoreUnavailable {
                side: StoreSide::Write,
                source: other,
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ChannelDayError::StoreUnavailable { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether the failure means the destination view could not be written
    pub fn is_write_unavailable(&self) -> bool {
        matches!(
            self,
            ChannelDayError::StoreUnavailable {
                side: StoreSide::Write,
                ..
            }
        )
    }
}

/// Run-level errors. Only these abort a reconciliation run.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid scope: {0}")]
    Scope(String),

    #[error("destination view unreachable, no row could be written: {0}")]
    DestinationUnreachable(String),

    #[error("summary read failed: {0}")]
    SummaryRead(#[source] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("pool error: {0}")]
    Pool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Run-level error for a summary source that could not be read.
    /// A pattern the server refuses to compile is a scope error.
    pub fn summary_read(err: StoreError) -> Self {
        match err {
            StoreError::InvalidPattern(reason) => Error::Scope(reason),
            other => Error::SummaryRead(other),
        }
    }
}
