//! Streaming k-way merge over per-shard sorted sources.
//!
//! Every live source keeps one buffered batch. Buffer heads sit in a
//! min-heap ordered by the `OrderingSpec`, ties broken by source
//! registration order, so output is reproducible regardless of which
//! refill finishes first. When a source's buffer drains and the source is
//! not exhausted the merge stops (`move_next` returns false) until the
//! consumer loads again; only drained sources are refilled.
//!
//! Buffered rows are accounted against the query's `RowAccountant` when a
//! batch lands and released as each row is emitted.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use shardcollect_common::datum::Row;
use shardcollect_common::error::CollectError;
use shardcollect_common::types::ShardId;

use crate::accounting::{AccountedBatch, RowAccounting, SizedRow};
use crate::batch_iterator::BatchIterator;
use crate::limiter::ConcurrencyLimiter;
use crate::load::{BatchLoad, TaskHandle};
use crate::ordered_source::BoundedOrderedSource;
use crate::ordering::OrderingSpec;

// ── Slots and heap entries ──────────────────────────────────────────────────

/// Result of one background refill: the source travels to the worker and
/// back together with its accounted batch.
struct Refill {
    source: BoundedOrderedSource,
    batch: AccountedBatch,
}

struct Slot {
    shard: ShardId,
    /// `None` while a refill is in flight and after close.
    source: Option<BoundedOrderedSource>,
    /// Rows behind the head. The head itself lives in the heap.
    buffer: VecDeque<SizedRow>,
    has_head: bool,
    exhausted: bool,
    refill: Option<TaskHandle<Refill>>,
    loads: u64,
    rows_emitted: u64,
}

impl Slot {
    /// Drained but not finished: the merge must wait for this source.
    fn is_starving(&self) -> bool {
        !self.has_head && !self.exhausted
    }
}

struct MergeHead {
    row: Row,
    bytes: i64,
    slot: usize,
    ordering: Arc<OrderingSpec>,
}

impl PartialEq for MergeHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for MergeHead {}

impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeHead {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.ordering
            .compare(&self.row, &other.row)
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Per-source counters of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMetrics {
    pub shard: ShardId,
    pub loads: u64,
    pub rows_emitted: u64,
    pub exhausted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeMetrics {
    pub sources: Vec<SourceMetrics>,
    pub rows_emitted: u64,
}

// ── Merge iterator ──────────────────────────────────────────────────────────

pub struct KWayMergeIterator {
    slots: Vec<Slot>,
    heap: BinaryHeap<Reverse<MergeHead>>,
    ordering: Arc<OrderingSpec>,
    limiter: Arc<ConcurrencyLimiter>,
    accounting: RowAccounting,
    pending: Option<BatchLoad>,
    loaded_once: bool,
    current: Option<Row>,
    failure: Option<CollectError>,
    closed: bool,
    /// Emitted rows kept for `try_move_to_start`; `None` when disabled.
    replay: Option<Vec<SizedRow>>,
    replay_pos: Option<usize>,
    rows_emitted: u64,
}

impl KWayMergeIterator {
    /// Merge `sources`; their position in the vector is the tie-break
    /// order.
    pub fn new(
        sources: Vec<BoundedOrderedSource>,
        ordering: Arc<OrderingSpec>,
        limiter: Arc<ConcurrencyLimiter>,
        accounting: RowAccounting,
    ) -> Self {
        let slots = sources
            .into_iter()
            .map(|source| Slot {
                shard: source.shard_id().clone(),
                exhausted: source.is_exhausted(),
                source: Some(source),
                buffer: VecDeque::new(),
                has_head: false,
                refill: None,
                loads: 0,
                rows_emitted: 0,
            })
            .collect();
        Self {
            slots,
            heap: BinaryHeap::new(),
            ordering,
            limiter,
            accounting,
            pending: None,
            loaded_once: false,
            current: None,
            failure: None,
            closed: false,
            replay: None,
            replay_pos: None,
            rows_emitted: 0,
        }
    }

    /// Keep emitted rows (and their accounting) so the merge can be
    /// replayed with `try_move_to_start`.
    pub fn with_move_to_start(mut self, enabled: bool) -> Self {
        self.replay = enabled.then(Vec::new);
        self
    }

    pub fn num_sources(&self) -> usize {
        self.slots.len()
    }

    pub fn metrics(&self) -> MergeMetrics {
        MergeMetrics {
            sources: self
                .slots
                .iter()
                .map(|s| SourceMetrics {
                    shard: s.shard.clone(),
                    loads: s.loads,
                    rows_emitted: s.rows_emitted,
                    exhausted: s.exhausted,
                })
                .collect(),
            rows_emitted: self.rows_emitted,
        }
    }

    fn push_head(&mut self, slot_idx: usize, sized: SizedRow) {
        self.slots[slot_idx].has_head = true;
        self.heap.push(Reverse(MergeHead {
            row: sized.row,
            bytes: sized.bytes,
            slot: slot_idx,
            ordering: Arc::clone(&self.ordering),
        }));
    }

    /// Fold completed refills back into their slots. A failed refill
    /// closes the merge.
    fn harvest(&mut self) {
        for idx in 0..self.slots.len() {
            let Some(handle) = self.slots[idx].refill.as_ref() else {
                continue;
            };
            if !handle.is_done() {
                continue;
            }
            let taken = handle.take();
            self.slots[idx].refill = None;
            let refill = match taken {
                Some(Ok(refill)) => refill,
                Some(Err(e)) => {
                    self.fail(e);
                    return;
                }
                None => {
                    self.fail(CollectError::internal_bug(
                        "E-MERGE-001",
                        "refill result missing",
                        format!("shard={}", self.slots[idx].shard),
                    ));
                    return;
                }
            };
            let Refill { source, batch } = refill;
            let slot = &mut self.slots[idx];
            slot.exhausted = source.is_exhausted();
            slot.source = Some(source);
            let mut rows = batch.into_sized_rows().into_iter();
            if let Some(first) = rows.next() {
                self.slots[idx].buffer.extend(rows);
                self.push_head(idx, first);
            }
        }
    }

    fn fail(&mut self, err: CollectError) {
        tracing::debug!(error = %err, "ordered merge failed, closing sources");
        self.failure = Some(err);
        self.close();
    }

    fn next_replayed(&mut self) -> Option<Row> {
        let pos = self.replay_pos?;
        let row = self.replay.as_ref()?.get(pos).map(|r| r.row.clone());
        self.replay_pos = row.as_ref().map(|_| pos + 1);
        row
    }
}

// ── Pull protocol ───────────────────────────────────────────────────────────

impl BatchIterator for KWayMergeIterator {
    fn load_next_batch(&mut self) -> BatchLoad {
        if self.closed {
            return BatchLoad::failed(
                self.failure
                    .clone()
                    .unwrap_or_else(|| CollectError::closed("ordered merge")),
            );
        }
        if let Some(pending) = &self.pending {
            if !pending.is_done() {
                return BatchLoad::failed(CollectError::internal_bug(
                    "E-MERGE-002",
                    "load_next_batch called while a load is pending",
                    format!("sources={}", self.slots.len()),
                ));
            }
        }
        self.harvest();
        if let Some(err) = &self.failure {
            return BatchLoad::failed(err.clone());
        }
        self.loaded_once = true;
        if self.all_loaded() {
            return BatchLoad::completed();
        }

        let mut signals = Vec::new();
        for idx in 0..self.slots.len() {
            let slot = &mut self.slots[idx];
            if !slot.is_starving() || slot.refill.is_some() {
                continue;
            }
            let Some(mut source) = slot.source.take() else {
                continue;
            };
            slot.loads += 1;
            tracing::trace!(shard = %slot.shard, load = slot.loads, "refilling merge source");
            let accounting = self.accounting.clone();
            let handle = self.limiter.submit(move || {
                let rows = source.fetch_batch()?;
                let batch = accounting.account_batch(rows)?;
                Ok(Refill { source, batch })
            });
            signals.push(handle.signal());
            slot.refill = Some(handle);
        }
        let load = BatchLoad::all(signals);
        self.pending = Some(load.clone());
        load
    }

    fn move_next(&mut self) -> bool {
        if let Some(pending) = &self.pending {
            assert!(
                pending.is_done(),
                "move_next called on ordered merge while a load is pending"
            );
        }
        self.current = None;
        if self.closed {
            return false;
        }
        assert!(
            self.loaded_once || self.all_loaded(),
            "move_next called on ordered merge before the first load"
        );
        if let Some(row) = self.next_replayed() {
            self.current = Some(row);
            return true;
        }
        self.harvest();
        if self.closed || self.slots.iter().any(Slot::is_starving) {
            return false;
        }
        let Some(Reverse(head)) = self.heap.pop() else {
            return false;
        };

        let slot = &mut self.slots[head.slot];
        slot.rows_emitted += 1;
        slot.has_head = false;
        if let Some(next) = slot.buffer.pop_front() {
            self.push_head(head.slot, next);
        }
        self.rows_emitted += 1;
        match self.replay.as_mut() {
            Some(replay) => replay.push(SizedRow {
                row: head.row.clone(),
                bytes: head.bytes,
            }),
            None => self.accounting.release(head.bytes),
        }
        self.current = Some(head.row);
        true
    }

    fn current_row(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    fn all_loaded(&self) -> bool {
        self.closed
            || self
                .slots
                .iter()
                .all(|s| s.exhausted && s.refill.is_none())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.current = None;
        self.pending = None;
        let mut released = 0i64;
        for slot in &mut self.slots {
            if let Some(refill) = slot.refill.take() {
                refill.discard();
            }
            released += slot.buffer.drain(..).map(|r| r.bytes).sum::<i64>();
            slot.has_head = false;
            if let Some(mut source) = slot.source.take() {
                source.close();
            }
        }
        released += self.heap.drain().map(|Reverse(h)| h.bytes).sum::<i64>();
        if let Some(replay) = self.replay.as_mut() {
            released += replay.drain(..).map(|r| r.bytes).sum::<i64>();
        }
        self.replay_pos = None;
        self.accounting.release(released);
        tracing::debug!(
            sources = self.slots.len(),
            rows = self.rows_emitted,
            bytes = released,
            "ordered merge closed"
        );
    }

    fn try_move_to_start(&mut self) -> bool {
        if self.closed || self.replay.is_none() {
            return false;
        }
        self.current = None;
        self.replay_pos = Some(0);
        true
    }
}

impl Drop for KWayMergeIterator {
    fn drop(&mut self) {
        self.close();
    }
}
