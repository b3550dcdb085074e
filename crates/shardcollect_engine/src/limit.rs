use shardcollect_common::datum::Row;

use crate::batch_iterator::BatchIterator;
use crate::load::BatchLoad;

/// Stops after `limit` rows. Reports `all_loaded` as soon as the limit is
/// reached so consumers stop loading.
pub struct LimitingBatchIterator<I> {
    inner: I,
    limit: u64,
    emitted: u64,
    on_row: bool,
}

impl<I: BatchIterator> LimitingBatchIterator<I> {
    pub fn new(inner: I, limit: u64) -> Self {
        Self {
            inner,
            limit,
            emitted: 0,
            on_row: false,
        }
    }

    fn limit_reached(&self) -> bool {
        self.emitted >= self.limit
    }
}

impl<I: BatchIterator> BatchIterator for LimitingBatchIterator<I> {
    fn load_next_batch(&mut self) -> BatchLoad {
        if self.limit_reached() {
            return BatchLoad::completed();
        }
        self.inner.load_next_batch()
    }

    fn move_next(&mut self) -> bool {
        if self.limit_reached() {
            self.on_row = false;
            return false;
        }
        self.on_row = self.inner.move_next();
        if self.on_row {
            self.emitted += 1;
        }
        self.on_row
    }

    fn current_row(&self) -> Option<&Row> {
        if self.on_row {
            self.inner.current_row()
        } else {
            None
        }
    }

    fn all_loaded(&self) -> bool {
        self.limit_reached() || self.inner.all_loaded()
    }

    fn close(&mut self) {
        self.on_row = false;
        self.inner.close();
    }

    fn try_move_to_start(&mut self) -> bool {
        if self.inner.try_move_to_start() {
            self.emitted = 0;
            self.on_row = false;
            true
        } else {
            false
        }
    }
}
