//! Per-query execution context.
//!
//! Created when a query starts and handed to every component that buffers
//! that query's rows. Closing (or dropping) it releases whatever the query
//! still has accounted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use shardcollect_common::config::MemoryConfig;

use crate::accounting::{RowAccountant, RowAccounting};

/// Global monotonic query ID counter.
static GLOBAL_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a new unique query ID.
pub fn next_query_id() -> u64 {
    GLOBAL_QUERY_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub struct QueryContext {
    query_id: u64,
    accountant: Arc<RowAccountant>,
    started_at: Instant,
    closed: AtomicBool,
}

impl QueryContext {
    /// Start a query with a memory ceiling of `memory_limit_bytes`
    /// (0 = unlimited).
    pub fn new(memory_limit_bytes: u64) -> Self {
        let query_id = next_query_id();
        Self {
            query_id,
            accountant: Arc::new(RowAccountant::new(
                format!("query-{query_id}"),
                memory_limit_bytes,
            )),
            started_at: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.query_memory_limit_bytes)
    }

    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    pub fn accountant(&self) -> &Arc<RowAccountant> {
        &self.accountant
    }

    pub fn row_accounting(&self) -> RowAccounting {
        RowAccounting::new(Arc::clone(&self.accountant))
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// End the query: drop every byte still accounted. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(
            query_id = self.query_id,
            used_bytes = self.accountant.used_bytes(),
            peak_bytes = self.accountant.peak_bytes(),
            elapsed_ms = self.elapsed_ms(),
            "query context released"
        );
        self.accountant.reset();
    }
}

impl Drop for QueryContext {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_ids_are_unique() {
        let a = QueryContext::new(0);
        let b = QueryContext::new(0);
        assert_ne!(a.query_id(), b.query_id());
        assert!(a.accountant().label().starts_with("query-"));
    }

    #[test]
    fn test_close_releases_accounted_bytes() {
        let ctx = QueryContext::new(1024);
        let accounting = ctx.row_accounting();
        accounting
            .account_row(&shardcollect_common::Row::new(vec![shardcollect_common::Datum::Int64(1)]))
            .unwrap();
        assert!(ctx.accountant().used_bytes() > 0);
        ctx.close();
        ctx.close();
        assert_eq!(ctx.accountant().used_bytes(), 0);
    }

    #[test]
    fn test_batch_outliving_close_leaves_no_deficit() {
        use shardcollect_common::{Datum, Row};

        let ctx = QueryContext::new(1024);
        let accounting = ctx.row_accounting();
        let rows = vec![Row::new(vec![Datum::Int64(1)]); 4];
        let batch = accounting.account_batch(rows).unwrap();
        ctx.close();
        drop(batch);
        assert_eq!(ctx.accountant().used_bytes(), 0);

        let row = Row::new(vec![Datum::Int64(2)]);
        let bytes = accounting.account_row(&row).unwrap();
        assert_eq!(ctx.accountant().used_bytes(), bytes as u64);
    }

    #[test]
    fn test_from_config_uses_memory_limit() {
        let ctx = QueryContext::from_config(&MemoryConfig {
            query_memory_limit_bytes: 4096,
        });
        assert_eq!(ctx.accountant().limit_bytes(), 4096);
    }
}
