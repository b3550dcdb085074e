//! Unordered composites over independent child iterators.
//!
//! Both composites walk their children in registration order, exhausting
//! one before moving to the next. `ConcurrentScatterGatherIterator` loads
//! every drained child at once, spread over at most as many worker tasks as
//! the limiter has capacity for; `ConcatBatchIterator` loads only the child
//! it is positioned on, on the caller's thread.

use std::sync::Arc;

use shardcollect_common::datum::Row;
use shardcollect_common::error::{CollectError, CollectResult};

use crate::batch_iterator::BatchIterator;
use crate::limiter::ConcurrencyLimiter;
use crate::load::{BatchLoad, TaskHandle, TaskStatus};

// ── Child bookkeeping ───────────────────────────────────────────────────────

type Child = Box<dyn BatchIterator>;

struct ChildSlot {
    /// `None` while the child is out on a worker.
    iter: Option<Child>,
    /// Buffered rows consumed; the child needs a load before it can
    /// produce more.
    drained: bool,
}

struct ChildSet {
    slots: Vec<ChildSlot>,
    pos: usize,
    on_row: bool,
}

impl ChildSet {
    fn new(children: Vec<Child>) -> Self {
        let slots = children
            .into_iter()
            .map(|c| ChildSlot {
                drained: !c.all_loaded(),
                iter: Some(c),
            })
            .collect();
        Self {
            slots,
            pos: 0,
            on_row: false,
        }
    }

    fn move_next(&mut self) -> bool {
        self.on_row = false;
        while let Some(slot) = self.slots.get_mut(self.pos) {
            let Some(iter) = slot.iter.as_mut() else {
                return false;
            };
            if !slot.drained {
                if iter.move_next() {
                    self.on_row = true;
                    return true;
                }
                slot.drained = true;
            }
            if !iter.all_loaded() {
                return false;
            }
            self.pos += 1;
        }
        false
    }

    fn current_row(&self) -> Option<&Row> {
        if !self.on_row {
            return None;
        }
        self.slots.get(self.pos)?.iter.as_ref()?.current_row()
    }

    fn all_loaded(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.iter.as_ref().is_some_and(|i| i.all_loaded()))
    }

    /// Children that must be loaded before they can produce more rows.
    fn to_load(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .skip(self.pos)
            .filter(|(_, s)| s.drained && s.iter.as_ref().is_some_and(|i| !i.all_loaded()))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn close(&mut self) {
        self.on_row = false;
        for slot in &mut self.slots {
            if let Some(iter) = slot.iter.as_mut() {
                iter.close();
            }
        }
    }

    fn try_move_to_start(&mut self) -> bool {
        let all_present = self.slots.iter().all(|s| s.iter.is_some());
        if !all_present {
            return false;
        }
        let rewound = self
            .slots
            .iter_mut()
            .all(|s| s.iter.as_mut().is_some_and(|i| i.try_move_to_start()));
        if rewound {
            self.pos = 0;
            self.on_row = false;
            for slot in &mut self.slots {
                slot.drained = false;
            }
        }
        rewound
    }
}

// ── Worker groups ───────────────────────────────────────────────────────────

/// Children of one worker task, travelling with their slot index.
type Group = Vec<(usize, Child)>;

/// Load each member in turn on the current thread. On the first failure
/// every member of the group is closed.
fn load_group(mut members: Group) -> CollectResult<Group> {
    for idx in 0..members.len() {
        let result = members[idx].1.load_next_batch().wait();
        if let Err(e) = result {
            for (_, child) in &mut members {
                child.close();
            }
            return Err(e);
        }
    }
    Ok(members)
}

// ── Scatter/gather ──────────────────────────────────────────────────────────

pub struct ConcurrentScatterGatherIterator {
    children: ChildSet,
    limiter: Arc<ConcurrencyLimiter>,
    groups: Vec<TaskHandle<Group>>,
    pending: Option<BatchLoad>,
    loaded_once: bool,
    failure: Option<CollectError>,
    closed: bool,
}

impl ConcurrentScatterGatherIterator {
    pub fn new(children: Vec<Child>, limiter: Arc<ConcurrencyLimiter>) -> Self {
        Self {
            children: ChildSet::new(children),
            limiter,
            groups: Vec::new(),
            pending: None,
            loaded_once: false,
            failure: None,
            closed: false,
        }
    }

    pub fn num_children(&self) -> usize {
        self.children.slots.len()
    }

    /// Put children of finished groups back. A failed group fails the
    /// whole composite.
    fn harvest(&mut self) {
        let mut idx = 0;
        while idx < self.groups.len() {
            if !self.groups[idx].is_done() {
                idx += 1;
                continue;
            }
            let group = self.groups.swap_remove(idx);
            match group.take() {
                Some(Ok(members)) => {
                    for (slot_idx, child) in members {
                        let slot = &mut self.children.slots[slot_idx];
                        slot.iter = Some(child);
                        slot.drained = false;
                    }
                }
                Some(Err(e)) => {
                    self.fail(e);
                    return;
                }
                None => {
                    self.fail(CollectError::internal_bug(
                        "E-SCATTER-001",
                        "group result missing",
                        format!("children={}", self.children.slots.len()),
                    ));
                    return;
                }
            }
        }
    }

    fn fail(&mut self, err: CollectError) {
        tracing::debug!(error = %err, "scatter/gather load failed, closing children");
        self.failure = Some(err);
        self.close();
    }
}

impl BatchIterator for ConcurrentScatterGatherIterator {
    fn load_next_batch(&mut self) -> BatchLoad {
        if self.closed {
            return BatchLoad::failed(
                self.failure
                    .clone()
                    .unwrap_or_else(|| CollectError::closed("scatter/gather iterator")),
            );
        }
        if let Some(pending) = &self.pending {
            if !pending.is_done() {
                return BatchLoad::failed(CollectError::internal_bug(
                    "E-SCATTER-002",
                    "load_next_batch called while a load is pending",
                    format!("children={}", self.children.slots.len()),
                ));
            }
        }
        self.harvest();
        if let Some(err) = &self.failure {
            return BatchLoad::failed(err.clone());
        }
        self.loaded_once = true;

        let to_load = self.children.to_load();
        if to_load.is_empty() {
            return BatchLoad::completed();
        }
        let capacity = self.limiter.available_capacity().max(1);
        let group_size = to_load.len().div_ceil(capacity);
        tracing::trace!(
            children = to_load.len(),
            capacity,
            group_size,
            "scatter/gather load"
        );

        let mut signals = Vec::new();
        for chunk in to_load.chunks(group_size) {
            let members: Group = chunk
                .iter()
                .filter_map(|&idx| self.children.slots[idx].iter.take().map(|c| (idx, c)))
                .collect();
            let handle = self.limiter.submit(move || load_group(members));
            signals.push(handle.signal());
            self.groups.push(handle);
        }
        let load = BatchLoad::all(signals);
        self.pending = Some(load.clone());
        load
    }

    fn move_next(&mut self) -> bool {
        if let Some(pending) = &self.pending {
            assert!(
                pending.is_done(),
                "move_next called on scatter/gather iterator while a load is pending"
            );
        }
        if self.closed {
            return false;
        }
        assert!(
            self.loaded_once || self.all_loaded(),
            "move_next called on scatter/gather iterator before the first load"
        );
        self.harvest();
        if self.closed {
            return false;
        }
        self.children.move_next()
    }

    fn current_row(&self) -> Option<&Row> {
        self.children.current_row()
    }

    fn all_loaded(&self) -> bool {
        self.closed || (self.groups.is_empty() && self.children.all_loaded())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending = None;
        for group in self.groups.drain(..) {
            group.discard();
        }
        self.children.close();
    }

    fn try_move_to_start(&mut self) -> bool {
        if self.closed || !self.groups.is_empty() {
            return false;
        }
        self.children.try_move_to_start()
    }
}

impl Drop for ConcurrentScatterGatherIterator {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Concatenation ───────────────────────────────────────────────────────────

/// Sequential concatenation: loads only the child it is positioned on.
pub struct ConcatBatchIterator {
    children: ChildSet,
    pending: Option<BatchLoad>,
    loaded_once: bool,
    closed: bool,
}

impl ConcatBatchIterator {
    pub fn new(children: Vec<Child>) -> Self {
        Self {
            children: ChildSet::new(children),
            pending: None,
            loaded_once: false,
            closed: false,
        }
    }

    /// Close on a failed previous load; true if the iterator is usable.
    fn settle(&mut self) -> bool {
        let failed = self
            .pending
            .as_ref()
            .is_some_and(|p| p.status() == TaskStatus::Failed);
        if failed {
            self.close();
        }
        !self.closed
    }
}

impl BatchIterator for ConcatBatchIterator {
    fn load_next_batch(&mut self) -> BatchLoad {
        if let Some(pending) = self.pending.clone() {
            if !pending.is_done() {
                return BatchLoad::failed(CollectError::internal_bug(
                    "E-CONCAT-001",
                    "load_next_batch called while a load is pending",
                    format!("children={}", self.children.slots.len()),
                ));
            }
            if let Err(e) = pending.wait() {
                self.close();
                return BatchLoad::failed(e);
            }
        }
        if self.closed {
            return BatchLoad::failed(CollectError::closed("concat iterator"));
        }
        self.loaded_once = true;
        let Some(&idx) = self.children.to_load().first() else {
            return BatchLoad::completed();
        };
        let slot = &mut self.children.slots[idx];
        let Some(child) = slot.iter.as_mut() else {
            return BatchLoad::completed();
        };
        let load = child.load_next_batch();
        slot.drained = false;
        self.pending = Some(load.clone());
        load
    }

    fn move_next(&mut self) -> bool {
        if let Some(pending) = &self.pending {
            assert!(
                pending.is_done(),
                "move_next called on concat iterator while a load is pending"
            );
        }
        if !self.settle() {
            return false;
        }
        assert!(
            self.loaded_once || self.all_loaded(),
            "move_next called on concat iterator before the first load"
        );
        self.children.move_next()
    }

    fn current_row(&self) -> Option<&Row> {
        self.children.current_row()
    }

    fn all_loaded(&self) -> bool {
        self.closed || self.children.all_loaded()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.children.close();
    }

    fn try_move_to_start(&mut self) -> bool {
        !self.closed && self.children.try_move_to_start()
    }
}

impl Drop for ConcatBatchIterator {
    fn drop(&mut self) {
        self.close();
    }
}
