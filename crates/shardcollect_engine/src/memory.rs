//! In-memory sources: a restartable row iterator and an in-memory shard
//! usable wherever a storage-backed shard is expected (node-local virtual
//! tables, tests).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use shardcollect_common::datum::Row;
use shardcollect_common::error::{CollectError, CollectResult, SourceError};
use shardcollect_common::types::{RowId, ShardId};

use crate::batch_iterator::BatchIterator;
use crate::load::BatchLoad;
use crate::source::{
    KeyedRow, RowPredicate, ShardCursor, ShardProvider, SortedChunk, SortedRequest,
};

/// Iterator over rows that are already in memory. Always `all_loaded`.
#[derive(Debug, Default)]
pub struct InMemoryBatchIterator {
    rows: Vec<Row>,
    current: Option<usize>,
    next: usize,
    closed: bool,
}

impl InMemoryBatchIterator {
    pub fn of(rows: Vec<Row>) -> Self {
        Self {
            rows,
            current: None,
            next: 0,
            closed: false,
        }
    }

    pub fn empty() -> Self {
        Self::of(Vec::new())
    }
}

impl BatchIterator for InMemoryBatchIterator {
    fn load_next_batch(&mut self) -> BatchLoad {
        if self.closed {
            return BatchLoad::failed(CollectError::closed("in-memory iterator"));
        }
        BatchLoad::completed()
    }

    fn move_next(&mut self) -> bool {
        if self.closed || self.next >= self.rows.len() {
            self.current = None;
            return false;
        }
        self.current = Some(self.next);
        self.next += 1;
        true
    }

    fn current_row(&self) -> Option<&Row> {
        self.current.and_then(|i| self.rows.get(i))
    }

    fn all_loaded(&self) -> bool {
        true
    }

    fn close(&mut self) {
        self.closed = true;
        self.current = None;
        self.rows = Vec::new();
    }

    fn try_move_to_start(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.current = None;
        self.next = 0;
        true
    }
}

/// Call counters of an `InMemoryShard`.
#[derive(Debug, Default)]
pub struct ShardStats {
    sorted_reads: AtomicU64,
    unordered_reads: AtomicU64,
    cursors_opened: AtomicU64,
    cursors_closed: AtomicU64,
}

impl ShardStats {
    pub fn sorted_reads(&self) -> u64 {
        self.sorted_reads.load(Ordering::Relaxed)
    }

    pub fn unordered_reads(&self) -> u64 {
        self.unordered_reads.load(Ordering::Relaxed)
    }

    pub fn cursors_opened(&self) -> u64 {
        self.cursors_opened.load(Ordering::Relaxed)
    }

    pub fn cursors_closed(&self) -> u64 {
        self.cursors_closed.load(Ordering::Relaxed)
    }
}

/// A shard whose rows live in memory. Row ids are the insertion positions
/// unless given explicitly.
pub struct InMemoryShard {
    shard_id: ShardId,
    rows: Arc<Vec<KeyedRow>>,
    stats: Arc<ShardStats>,
    /// Remaining `open_cursor` calls that fail with `ShardUnavailable`.
    unavailable: AtomicU32,
}

impl InMemoryShard {
    pub fn new(shard_id: ShardId, rows: Vec<Row>) -> Self {
        let keyed = rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| KeyedRow {
                row_id: RowId(i as u64),
                row,
            })
            .collect();
        Self::with_keyed_rows(shard_id, keyed)
    }

    pub fn with_keyed_rows(shard_id: ShardId, rows: Vec<KeyedRow>) -> Self {
        Self {
            shard_id,
            rows: Arc::new(rows),
            stats: Arc::new(ShardStats::default()),
            unavailable: AtomicU32::new(0),
        }
    }

    pub fn stats(&self) -> &ShardStats {
        &self.stats
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Make the next `times` cursor opens fail as if the shard were
    /// relocating.
    pub fn set_unavailable(&self, times: u32) {
        self.unavailable.store(times, Ordering::SeqCst);
    }
}

impl ShardProvider for InMemoryShard {
    fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    fn open_cursor(&self) -> CollectResult<Box<dyn ShardCursor>> {
        let failing = self
            .unavailable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SourceError::ShardUnavailable {
                shard: self.shard_id.clone(),
                reason: "shard is relocating".into(),
            }
            .into());
        }
        self.stats.cursors_opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(InMemoryCursor {
            rows: Arc::clone(&self.rows),
            stats: Arc::clone(&self.stats),
            unordered_pos: 0,
            closed: false,
        }))
    }
}

struct InMemoryCursor {
    rows: Arc<Vec<KeyedRow>>,
    stats: Arc<ShardStats>,
    unordered_pos: usize,
    closed: bool,
}

impl ShardCursor for InMemoryCursor {
    fn next_sorted(&mut self, request: SortedRequest<'_>) -> CollectResult<SortedChunk> {
        self.stats.sorted_reads.fetch_add(1, Ordering::Relaxed);
        let ordering = request.ordering;
        let mut matching: Vec<&KeyedRow> = self
            .rows
            .iter()
            .filter(|r| (request.predicate)(&r.row))
            .filter(|r| match request.search_after {
                None => true,
                Some(after) => match ordering.compare_row_to_key(&r.row, &after.sort_key) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Equal => r.row_id > after.row_id,
                    std::cmp::Ordering::Less => false,
                },
            })
            .collect();
        matching.sort_by(|a, b| {
            ordering
                .compare(&a.row, &b.row)
                .then_with(|| a.row_id.cmp(&b.row_id))
        });
        let exhausted = matching.len() <= request.limit;
        let rows = matching
            .into_iter()
            .take(request.limit)
            .cloned()
            .collect();
        Ok(SortedChunk { rows, exhausted })
    }

    fn next_unordered(
        &mut self,
        predicate: &RowPredicate,
        batch_size: usize,
    ) -> CollectResult<Vec<Row>> {
        self.stats.unordered_reads.fetch_add(1, Ordering::Relaxed);
        let mut out = Vec::with_capacity(batch_size.min(self.rows.len()));
        while out.len() < batch_size {
            let Some(keyed) = self.rows.get(self.unordered_pos) else {
                break;
            };
            self.unordered_pos += 1;
            if predicate(&keyed.row) {
                out.push(keyed.row.clone());
            }
        }
        Ok(out)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stats.cursors_closed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ordering::OrderingSpec;
    use crate::source::{match_all, SearchAfter};
    use shardcollect_common::datum::Datum;
    use shardcollect_common::types::IndexName;

    fn int_rows(vals: &[i64]) -> Vec<Row> {
        vals.iter().map(|v| Row::new(vec![Datum::Int64(*v)])).collect()
    }

    fn shard() -> ShardId {
        ShardId::new(IndexName::new("t"), 0)
    }

    #[test]
    fn test_in_memory_iterator_restarts() {
        let mut it = InMemoryBatchIterator::of(int_rows(&[1, 2]));
        assert!(it.all_loaded());
        assert!(it.move_next());
        assert!(it.move_next());
        assert!(!it.move_next());
        assert!(it.current_row().is_none());
        assert!(it.try_move_to_start());
        assert!(it.move_next());
        assert_eq!(it.current_row(), Some(&int_rows(&[1])[0]));
        it.close();
        it.close();
        assert!(!it.move_next());
        assert!(!it.try_move_to_start());
        assert!(it.load_next_batch().wait().is_err());
    }

    #[test]
    fn test_sorted_pages_with_duplicate_keys() {
        let s = InMemoryShard::new(shard(), int_rows(&[3, 1, 3, 2, 3]));
        let mut cursor = s.open_cursor().unwrap();
        let ordering = OrderingSpec::single(0, false, None);
        let predicate = match_all();

        let first = cursor
            .next_sorted(SortedRequest {
                ordering: &ordering,
                predicate: &predicate,
                search_after: None,
                limit: 3,
            })
            .unwrap();
        assert!(!first.exhausted);
        let ids: Vec<u64> = first.rows.iter().map(|r| r.row_id.0).collect();
        assert_eq!(ids, vec![1, 3, 0]);

        let last = first.rows.last().unwrap();
        let after = SearchAfter {
            sort_key: ordering.sort_key(&last.row),
            row_id: last.row_id,
        };
        let second = cursor
            .next_sorted(SortedRequest {
                ordering: &ordering,
                predicate: &predicate,
                search_after: Some(&after),
                limit: 3,
            })
            .unwrap();
        assert!(second.exhausted);
        let ids: Vec<u64> = second.rows.iter().map(|r| r.row_id.0).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(s.stats().sorted_reads(), 2);
    }

    #[test]
    fn test_unordered_pages_apply_predicate() {
        let s = InMemoryShard::new(shard(), int_rows(&[1, 2, 3, 4, 5, 6]));
        let mut cursor = s.open_cursor().unwrap();
        let even: RowPredicate =
            Arc::new(|r: &Row| r.get(0).and_then(Datum::as_i64).is_some_and(|v| v % 2 == 0));
        assert_eq!(cursor.next_unordered(&even, 2).unwrap(), int_rows(&[2, 4]));
        assert_eq!(cursor.next_unordered(&even, 2).unwrap(), int_rows(&[6]));
        assert!(cursor.next_unordered(&even, 2).unwrap().is_empty());
        cursor.close();
        cursor.close();
        assert_eq!(s.stats().cursors_closed(), 1);
    }

    #[test]
    fn test_unavailable_then_recovers() {
        let s = InMemoryShard::new(shard(), int_rows(&[1]));
        s.set_unavailable(1);
        let err = s.open_cursor().err().unwrap();
        assert!(err.is_transient_missing());
        assert!(s.open_cursor().is_ok());
        assert_eq!(s.stats().cursors_opened(), 1);
    }
}
