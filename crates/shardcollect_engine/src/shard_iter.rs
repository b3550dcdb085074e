use shardcollect_common::datum::Row;
use shardcollect_common::error::{CollectError, CollectResult};
use shardcollect_common::types::ShardId;

use crate::accounting::{AccountedBatch, RowAccounting};
use crate::batch_iterator::BatchIterator;
use crate::load::BatchLoad;
use crate::source::{RowPredicate, ShardCursor, ShardProvider};

/// Unordered iterator over one shard. Loads run synchronously on the
/// calling thread; the concurrent composite moves them onto workers.
///
/// The current batch stays accounted until the next load or close.
pub struct ShardBatchIterator {
    shard: ShardId,
    cursor: Option<Box<dyn ShardCursor>>,
    predicate: RowPredicate,
    batch_size: usize,
    accounting: RowAccounting,
    batch: Option<AccountedBatch>,
    next: usize,
    on_row: bool,
    all_loaded: bool,
    loaded_once: bool,
    closed: bool,
    loads: u64,
}

impl ShardBatchIterator {
    pub fn new(
        shard: ShardId,
        cursor: Box<dyn ShardCursor>,
        predicate: RowPredicate,
        batch_size: usize,
        accounting: RowAccounting,
    ) -> CollectResult<Self> {
        if batch_size == 0 {
            return Err(CollectError::InvalidArgument(format!(
                "batch size for shard {shard} must be > 0"
            )));
        }
        Ok(Self {
            shard,
            cursor: Some(cursor),
            predicate,
            batch_size,
            accounting,
            batch: None,
            next: 0,
            on_row: false,
            all_loaded: false,
            loaded_once: false,
            closed: false,
            loads: 0,
        })
    }

    pub fn open(
        provider: &dyn ShardProvider,
        predicate: RowPredicate,
        batch_size: usize,
        accounting: RowAccounting,
    ) -> CollectResult<Self> {
        let cursor = provider.open_cursor()?;
        Self::new(
            provider.shard_id().clone(),
            cursor,
            predicate,
            batch_size,
            accounting,
        )
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard
    }

    pub fn loads(&self) -> u64 {
        self.loads
    }

    fn close_cursor(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
    }

    fn load(&mut self) -> CollectResult<()> {
        self.batch = None;
        self.next = 0;
        self.on_row = false;
        let Some(cursor) = self.cursor.as_mut() else {
            return Err(CollectError::closed("shard iterator"));
        };
        self.loads += 1;
        let rows = cursor.next_unordered(&self.predicate, self.batch_size)?;
        let short = rows.len() < self.batch_size;
        tracing::trace!(shard = %self.shard, rows = rows.len(), load = self.loads, "loaded shard batch");
        self.batch = Some(self.accounting.account_batch(rows)?);
        if short {
            self.all_loaded = true;
            self.close_cursor();
        }
        Ok(())
    }
}

impl BatchIterator for ShardBatchIterator {
    fn load_next_batch(&mut self) -> BatchLoad {
        if self.closed {
            return BatchLoad::failed(CollectError::closed("shard iterator"));
        }
        if self.all_loaded {
            return BatchLoad::completed();
        }
        self.loaded_once = true;
        match self.load() {
            Ok(()) => BatchLoad::completed(),
            Err(e) => {
                self.close();
                BatchLoad::failed(e.with_context(format!("shard {}", self.shard)))
            }
        }
    }

    fn move_next(&mut self) -> bool {
        self.on_row = false;
        if self.closed {
            return false;
        }
        assert!(
            self.loaded_once || self.all_loaded,
            "move_next called on shard iterator before the first load"
        );
        match &self.batch {
            Some(batch) if self.next < batch.len() => {
                self.next += 1;
                self.on_row = true;
                true
            }
            _ => false,
        }
    }

    fn current_row(&self) -> Option<&Row> {
        if !self.on_row {
            return None;
        }
        self.batch.as_ref()?.row(self.next - 1)
    }

    fn all_loaded(&self) -> bool {
        self.all_loaded || self.closed
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.on_row = false;
        self.batch = None;
        self.close_cursor();
    }
}

impl Drop for ShardBatchIterator {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::RowAccountant;
    use crate::batch_iterator::collect_rows;
    use crate::memory::InMemoryShard;
    use crate::source::match_all;
    use shardcollect_common::datum::Datum;
    use shardcollect_common::types::IndexName;
    use std::sync::Arc;

    fn shard(n: i64) -> InMemoryShard {
        let rows = (0..n).map(|i| Row::new(vec![Datum::Int64(i)])).collect();
        InMemoryShard::new(ShardId::new(IndexName::new("t"), 0), rows)
    }

    #[test]
    fn test_reads_all_rows_in_batches() {
        let s = shard(7);
        let acc = Arc::new(RowAccountant::unlimited("q"));
        let mut it =
            ShardBatchIterator::open(&s, match_all(), 3, RowAccounting::new(Arc::clone(&acc))).unwrap();
        assert_eq!(collect_rows(&mut it).unwrap().len(), 7);
        assert_eq!(it.loads(), 3);
        assert_eq!(acc.used_bytes(), 0);
        assert_eq!(s.stats().cursors_closed(), 1);
    }

    #[test]
    fn test_batch_released_on_next_load() {
        let s = shard(4);
        let acc = Arc::new(RowAccountant::unlimited("q"));
        let mut it =
            ShardBatchIterator::open(&s, match_all(), 2, RowAccounting::new(Arc::clone(&acc))).unwrap();
        it.load_next_batch().wait().unwrap();
        let one_batch = acc.used_bytes();
        assert!(one_batch > 0);
        while it.move_next() {}
        assert!(!it.all_loaded());
        it.load_next_batch().wait().unwrap();
        assert_eq!(acc.used_bytes(), one_batch);
        it.close();
        assert_eq!(acc.used_bytes(), 0);
    }

    #[test]
    fn test_ceiling_breach_fails_and_closes() {
        let s = shard(10);
        let acc = Arc::new(RowAccountant::new("q", 64));
        let mut it =
            ShardBatchIterator::open(&s, match_all(), 5, RowAccounting::new(Arc::clone(&acc))).unwrap();
        let err = it.load_next_batch().wait().unwrap_err();
        assert!(err.is_resource_exhausted());
        assert!(it.all_loaded());
        assert!(!it.move_next());
        assert_eq!(acc.used_bytes(), 0);
    }

    #[test]
    #[should_panic(expected = "before the first load")]
    fn test_move_before_load_panics() {
        let s = shard(1);
        let mut it = ShardBatchIterator::open(
            &s,
            match_all(),
            2,
            RowAccounting::new(Arc::new(RowAccountant::unlimited("q"))),
        )
        .unwrap();
        it.move_next();
    }
}
