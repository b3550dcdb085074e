//! Per-shard producer of bounded, pre-sorted batches.
//!
//! Each fetch asks the shard cursor for the next `batch_size` matching rows
//! strictly after the low-water mark (sort key of the last emitted row plus
//! its row id), so repeated keys straddling a batch boundary are neither
//! duplicated nor dropped. Once a fetch comes back short the source is
//! exhausted for good.

use std::sync::Arc;

use shardcollect_common::datum::Row;
use shardcollect_common::error::{CollectError, CollectResult};
use shardcollect_common::types::ShardId;

use crate::ordering::OrderingSpec;
use crate::source::{RowPredicate, SearchAfter, ShardCursor, ShardProvider, SortedRequest};

pub struct BoundedOrderedSource {
    shard: ShardId,
    cursor: Option<Box<dyn ShardCursor>>,
    ordering: Arc<OrderingSpec>,
    predicate: RowPredicate,
    batch_size: usize,
    low_water: Option<SearchAfter>,
    exhausted: bool,
    loads: u64,
}

impl BoundedOrderedSource {
    pub fn new(
        shard: ShardId,
        cursor: Box<dyn ShardCursor>,
        ordering: Arc<OrderingSpec>,
        predicate: RowPredicate,
        batch_size: usize,
    ) -> CollectResult<Self> {
        if batch_size == 0 {
            return Err(CollectError::InvalidArgument(format!(
                "batch size for shard {shard} must be > 0"
            )));
        }
        Ok(Self {
            shard,
            cursor: Some(cursor),
            ordering,
            predicate,
            batch_size,
            low_water: None,
            exhausted: false,
            loads: 0,
        })
    }

    /// Open a cursor on `provider`. Missing-source failures are returned
    /// as-is so the caller can apply its tolerance rule.
    pub fn open(
        provider: &dyn ShardProvider,
        ordering: Arc<OrderingSpec>,
        predicate: RowPredicate,
        batch_size: usize,
    ) -> CollectResult<Self> {
        let cursor = provider.open_cursor()?;
        Self::new(
            provider.shard_id().clone(),
            cursor,
            ordering,
            predicate,
            batch_size,
        )
    }

    /// Fetch the next batch. Returns an empty batch once exhausted.
    pub fn fetch_batch(&mut self) -> CollectResult<Vec<Row>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let Some(cursor) = self.cursor.as_mut() else {
            return Err(CollectError::closed("ordered source"));
        };
        self.loads += 1;
        let chunk = cursor.next_sorted(SortedRequest {
            ordering: &self.ordering,
            predicate: &self.predicate,
            search_after: self.low_water.as_ref(),
            limit: self.batch_size,
        })?;

        if chunk.rows.len() > self.batch_size {
            return Err(CollectError::internal_bug(
                "E-SRC-001",
                "shard cursor returned more rows than requested",
                format!(
                    "shard={}, requested={}, returned={}",
                    self.shard,
                    self.batch_size,
                    chunk.rows.len()
                ),
            ));
        }
        if let Some(last) = chunk.rows.last() {
            self.low_water = Some(SearchAfter {
                sort_key: self.ordering.sort_key(&last.row),
                row_id: last.row_id,
            });
        }
        let returned = chunk.rows.len();
        tracing::trace!(
            shard = %self.shard,
            rows = returned,
            load = self.loads,
            "fetched ordered batch"
        );
        if chunk.exhausted || returned < self.batch_size {
            self.exhausted = true;
            self.close();
        }
        Ok(chunk.rows.into_iter().map(|k| k.row).collect())
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Number of fetches issued against the shard cursor.
    pub fn loads(&self) -> u64 {
        self.loads
    }

    pub fn close(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
    }
}

impl Drop for BoundedOrderedSource {
    fn drop(&mut self) {
        self.close();
    }
}
