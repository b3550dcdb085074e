//! Collaborator interfaces of the collect engine: shard cursors produced by
//! the storage layer, per-shard providers, and the registry that resolves a
//! shard id to a live provider.

use std::sync::Arc;

use shardcollect_common::datum::{Datum, Row};
use shardcollect_common::error::{CollectError, CollectResult};
use shardcollect_common::types::{RowId, ShardId};

use crate::ordering::OrderingSpec;

/// Row filter pushed down to a shard cursor.
pub type RowPredicate = Arc<dyn Fn(&Row) -> bool + Send + Sync>;

pub fn match_all() -> RowPredicate {
    Arc::new(|_| true)
}

/// A row with its stable per-shard identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRow {
    pub row_id: RowId,
    pub row: Row,
}

/// Low-water mark of a sorted read: only rows strictly after
/// `(sort_key, row_id)` in the requested ordering are returned.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchAfter {
    pub sort_key: Vec<Datum>,
    pub row_id: RowId,
}

/// One page request against a sorted shard cursor.
pub struct SortedRequest<'a> {
    pub ordering: &'a OrderingSpec,
    pub predicate: &'a RowPredicate,
    pub search_after: Option<&'a SearchAfter>,
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SortedChunk {
    pub rows: Vec<KeyedRow>,
    /// No matching rows remain after this chunk.
    pub exhausted: bool,
}

/// Read access to one shard's rows.
pub trait ShardCursor: Send {
    /// The next `limit` matching rows after `search_after`, sorted by the
    /// ordering with the row id as final tie-break.
    fn next_sorted(&mut self, request: SortedRequest<'_>) -> CollectResult<SortedChunk>;

    /// The next at most `batch_size` matching rows in storage order. A short
    /// result means the cursor is exhausted.
    fn next_unordered(
        &mut self,
        predicate: &RowPredicate,
        batch_size: usize,
    ) -> CollectResult<Vec<Row>>;

    fn close(&mut self) {}
}

/// Live per-shard handle that opens cursors.
pub trait ShardProvider: Send + Sync {
    fn shard_id(&self) -> &ShardId;

    fn open_cursor(&self) -> CollectResult<Box<dyn ShardCursor>>;
}

/// Resolves shard ids to providers, or to a missing-source error:
/// `ShardUnavailable` for topology races, `ShardNotFound` / `IndexNotFound`
/// for permanent absence.
pub trait SourceRegistry: Send + Sync {
    fn resolve(&self, shard: &ShardId) -> CollectResult<Arc<dyn ShardProvider>>;
}

/// Run `open`, re-running it up to `retries` times while it fails with a
/// transient missing-source error.
pub fn open_with_retry<T>(
    shard: &ShardId,
    retries: u32,
    mut open: impl FnMut() -> CollectResult<T>,
) -> CollectResult<T> {
    let mut attempt = 0;
    loop {
        match open() {
            Err(e) if e.is_transient_missing() && attempt < retries => {
                attempt += 1;
                tracing::warn!(shard = %shard, attempt, error = %e, "shard unavailable, re-resolving");
            }
            other => return other,
        }
    }
}

/// Resolve `shard` through `registry` and open a cursor on it, retrying
/// transient races.
pub fn resolve_cursor(
    registry: &dyn SourceRegistry,
    shard: &ShardId,
    retries: u32,
) -> CollectResult<Box<dyn ShardCursor>> {
    open_with_retry(shard, retries, || registry.resolve(shard)?.open_cursor())
}

/// Decide whether a failure to open `shard` may be ignored: only
/// missing-source conditions on droppable shards are. A missing required
/// shard becomes a fatal `RequiredSourceMissing`; other errors pass through.
pub fn tolerate_missing(shard: &ShardId, err: CollectError) -> CollectResult<()> {
    match err {
        CollectError::Source(cause) if cause.is_missing() => {
            if shard.is_droppable() {
                tracing::debug!(shard = %shard, error = %cause, "skipping missing droppable shard");
                Ok(())
            } else {
                Err(CollectError::RequiredSourceMissing {
                    shard: shard.clone(),
                    cause,
                })
            }
        }
        other => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardcollect_common::error::SourceError;
    use shardcollect_common::types::IndexName;

    fn unavailable(shard: &ShardId) -> CollectError {
        SourceError::ShardUnavailable {
            shard: shard.clone(),
            reason: "relocating".into(),
        }
        .into()
    }

    #[test]
    fn test_transient_missing_retried_once() {
        let shard = ShardId::new(IndexName::new("t"), 0);
        let mut calls = 0;
        let result = open_with_retry(&shard, 1, || {
            calls += 1;
            if calls == 1 {
                Err(unavailable(&shard))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);

        let mut calls = 0;
        let result: CollectResult<()> = open_with_retry(&shard, 1, || {
            calls += 1;
            Err(unavailable(&shard))
        });
        assert!(result.unwrap_err().is_transient_missing());
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_permanent_missing_not_retried() {
        let shard = ShardId::new(IndexName::new("t"), 0);
        let mut calls = 0;
        let result: CollectResult<()> = open_with_retry(&shard, 3, || {
            calls += 1;
            Err(SourceError::ShardNotFound(shard.clone()).into())
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_missing_tolerated_only_for_partitions() {
        let plain = ShardId::new(IndexName::new("t"), 0);
        let part = ShardId::new(IndexName::partition("t", "p0"), 0);
        let not_found = |s: &ShardId| CollectError::from(SourceError::ShardNotFound(s.clone()));
        assert!(tolerate_missing(&part, not_found(&part)).is_ok());
        let err = tolerate_missing(&plain, not_found(&plain)).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, CollectError::RequiredSourceMissing { .. }));

        // Still unavailable after re-resolving: as fatal as a missing shard.
        let err = tolerate_missing(&plain, unavailable(&plain)).unwrap_err();
        assert!(err.is_fatal());
        assert!(!err.is_transient());

        let failed = CollectError::from(SourceError::Failed {
            shard: part.clone(),
            reason: "io".into(),
        });
        let err = tolerate_missing(&part, failed).unwrap_err();
        assert!(matches!(err, CollectError::Source(SourceError::Failed { .. })));
    }
}
