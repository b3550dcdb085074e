//! The pull-based batch iterator contract.
//!
//! A consumer alternates between `move_next` over already-buffered rows and
//! `load_next_batch` to buffer more:
//!
//! ```ignore
//! loop {
//!     while it.move_next() {
//!         consume(it.current_row());
//!     }
//!     if it.all_loaded() {
//!         break;
//!     }
//!     it.load_next_batch().wait()?;
//! }
//! it.close();
//! ```
//!
//! `move_next` returning false is ambiguous on its own: `all_loaded()`
//! tells whether more loading is needed or the stream is finished.

use shardcollect_common::datum::Row;
use shardcollect_common::error::CollectResult;

use crate::load::BatchLoad;

pub trait BatchIterator: Send {
    /// Start acquiring the next chunk of rows. Must not be called while a
    /// previous load is pending; a no-op once `all_loaded()` is true. A
    /// failed load closes the iterator.
    fn load_next_batch(&mut self) -> BatchLoad;

    /// Advance to the next buffered row. Never blocks.
    ///
    /// # Panics
    /// When called while a load is pending, or before the first load of an
    /// iterator that needs one.
    fn move_next(&mut self) -> bool;

    /// The row under the cursor, valid until the next `move_next`.
    /// `None` unless the last `move_next` returned true.
    fn current_row(&self) -> Option<&Row>;

    /// No further `load_next_batch` can produce rows.
    fn all_loaded(&self) -> bool;

    /// Release all resources. Idempotent.
    fn close(&mut self);

    /// Rewind to before the first row without re-querying the sources.
    /// Returns false when unsupported.
    fn try_move_to_start(&mut self) -> bool {
        false
    }
}

impl<T: BatchIterator + ?Sized> BatchIterator for Box<T> {
    fn load_next_batch(&mut self) -> BatchLoad {
        (**self).load_next_batch()
    }

    fn move_next(&mut self) -> bool {
        (**self).move_next()
    }

    fn current_row(&self) -> Option<&Row> {
        (**self).current_row()
    }

    fn all_loaded(&self) -> bool {
        (**self).all_loaded()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn try_move_to_start(&mut self) -> bool {
        (**self).try_move_to_start()
    }
}

/// Drive `iter` to the end on the calling thread, handing every row to
/// `visitor`. The iterator is closed afterwards, also on error. Returns the
/// number of rows visited.
pub fn visit_rows<I, F>(iter: &mut I, mut visitor: F) -> CollectResult<u64>
where
    I: BatchIterator + ?Sized,
    F: FnMut(&Row) -> CollectResult<()>,
{
    let result = drive(iter, &mut visitor);
    iter.close();
    result
}

fn drive<I, F>(iter: &mut I, visitor: &mut F) -> CollectResult<u64>
where
    I: BatchIterator + ?Sized,
    F: FnMut(&Row) -> CollectResult<()>,
{
    let mut visited = 0u64;
    loop {
        if !iter.all_loaded() {
            iter.load_next_batch().wait()?;
        }
        while iter.move_next() {
            if let Some(row) = iter.current_row() {
                visitor(row)?;
                visited += 1;
            }
        }
        if iter.all_loaded() {
            return Ok(visited);
        }
    }
}

/// Collect every row of `iter` into a vector, closing it afterwards.
pub fn collect_rows<I>(iter: &mut I) -> CollectResult<Vec<Row>>
where
    I: BatchIterator + ?Sized,
{
    let mut rows = Vec::new();
    visit_rows(iter, |row| {
        rows.push(row.clone());
        Ok(())
    })?;
    Ok(rows)
}
