//! View materializer: idempotent replace-on-id writes into the view.
//!
//! Rows that a run no longer produces are left in place.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ChannelDayError, StoreError};
use crate::store::{with_timeout, ViewStore};
use crate::types::AvailabilityViewRow;

/// Rows of one channel-day were only partly written
#[derive(Debug, Clone, PartialEq)]
pub struct PartialWrite {
    pub written: usize,
    pub error: ChannelDayError,
}

pub struct ViewMaterializer {
    store: Arc<dyn ViewStore>,
    timeout: Duration,
    succeeded: AtomicU64,
}

impl ViewMaterializer {
    pub fn new(store: Arc<dyn ViewStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            succeeded: AtomicU64::new(0),
        }
    }

    /// Successful upserts since construction
    pub fn writes_succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Acquire)
    }

    async fn try_upsert(&self, row: &AvailabilityViewRow) -> Result<(), StoreError> {
        with_timeout(self.timeout, self.store.upsert(row)).await
    }

    /// Upsert one row. A write conflict is retried once before failing.
    pub async fn upsert(&self, row: &AvailabilityViewRow) -> Result<(), ChannelDayError> {
        let result = match self.try_upsert(row).await {
            Err(StoreError::Conflict(reason)) => {
                debug!(row_id = %row.id, reason = %reason, "write conflict, retrying once");
                self.try_upsert(row).await
            }
            other => other,
        };

        match result {
            Ok(()) => {
                self.succeeded.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(e) => {
                warn!(row_id = %row.id, error = %e, "view upsert failed");
                Err(ChannelDayError::on_write(e))
            }
        }
    }

    /// Upsert rows in order, stopping at the first failure.
    ///
    /// Rows written before the failure stay written; re-running the
    /// channel-day replaces them with identical content.
    pub async fn upsert_all(&self, rows: &[AvailabilityViewRow]) -> Result<usize, PartialWrite> {
        for (written, row) in rows.iter().enumerate() {
            if let Err(error) = self.upsert(row).await {
                return Err(PartialWrite { written, error });
            }
        }
        Ok(rows.len())
    }
}
