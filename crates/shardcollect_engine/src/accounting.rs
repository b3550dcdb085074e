//! Per-query memory accounting for buffered rows.
//!
//! `RowAccountant` keeps a live estimate of the bytes a query holds in
//! buffers and fails with `CollectError::CircuitBreaking` as soon as an
//! accounting call pushes it over the ceiling. The check runs on every call,
//! so the overshoot is bounded by the size of the value that crossed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use shardcollect_common::datum::{DataType, Datum, Row};
use shardcollect_common::error::{CollectError, CollectResult};

/// Fixed per-value header for variable-width values.
const VARIABLE_HEADER_BYTES: i64 = 24;

/// Fixed per-row overhead: the shared value slice and its handle.
pub const ROW_OVERHEAD_BYTES: i64 = 32;

/// Estimates the heap footprint of values of one type. `Null` is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeEstimator {
    Constant(i64),
    /// Header plus payload length (text, bytes).
    VariableWidth,
}

impl SizeEstimator {
    pub fn for_type(data_type: DataType) -> Self {
        match data_type {
            DataType::Boolean => SizeEstimator::Constant(1),
            DataType::Int32 => SizeEstimator::Constant(4),
            DataType::Int64 | DataType::Float64 | DataType::Timestamp => {
                SizeEstimator::Constant(8)
            }
            DataType::Text | DataType::Bytea => SizeEstimator::VariableWidth,
        }
    }

    pub fn estimate(&self, value: &Datum) -> i64 {
        if value.is_null() {
            return 0;
        }
        match self {
            SizeEstimator::Constant(n) => *n,
            SizeEstimator::VariableWidth => VARIABLE_HEADER_BYTES + payload_len(value),
        }
    }

    /// Size change when `old` is replaced by `new`; `old = None` is an append.
    pub fn estimate_delta(&self, old: Option<&Datum>, new: &Datum) -> i64 {
        self.estimate(new) - old.map_or(0, |v| self.estimate(v))
    }
}

fn payload_len(value: &Datum) -> i64 {
    match value {
        Datum::Text(s) => s.len() as i64,
        Datum::Bytea(b) => b.len() as i64,
        _ => 0,
    }
}

/// Estimate a value using the estimator of its own type.
pub fn estimate_datum(value: &Datum) -> i64 {
    value
        .data_type()
        .map_or(0, |dt| SizeEstimator::for_type(dt).estimate(value))
}

pub fn estimate_row(row: &Row) -> i64 {
    ROW_OVERHEAD_BYTES + row.values().iter().map(estimate_datum).sum::<i64>()
}

/// Live byte counter with a fixed ceiling, owned by one query context.
#[derive(Debug)]
pub struct RowAccountant {
    label: String,
    /// 0 = unlimited.
    limit_bytes: u64,
    used: AtomicI64,
    peak: AtomicI64,
}

impl RowAccountant {
    pub fn new(label: impl Into<String>, limit_bytes: u64) -> Self {
        Self {
            label: label.into(),
            limit_bytes,
            used: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        }
    }

    pub fn unlimited(label: impl Into<String>) -> Self {
        Self::new(label, 0)
    }

    /// Add `delta` bytes (negative releases) and check the ceiling.
    /// The bytes stay accounted even when the check fails.
    pub fn add_bytes(&self, delta: i64) -> CollectResult<()> {
        let now = self.used.fetch_add(delta, Ordering::AcqRel) + delta;
        if delta > 0 {
            self.peak.fetch_max(now, Ordering::Relaxed);
        }
        self.check(now)
    }

    /// Account the size change of replacing `old` with `new` and return the
    /// delta. Supports appends (`old = None`) and in-place replacement such
    /// as a running maximum.
    pub fn add_estimated_size(
        &self,
        estimator: &SizeEstimator,
        old: Option<&Datum>,
        new: &Datum,
    ) -> CollectResult<i64> {
        let delta = estimator.estimate_delta(old, new);
        self.add_bytes(delta)?;
        Ok(delta)
    }

    /// Fail if the accumulated size is above the ceiling.
    pub fn circuit_break(&self) -> CollectResult<()> {
        self.check(self.used.load(Ordering::Acquire))
    }

    fn check(&self, used: i64) -> CollectResult<()> {
        if self.limit_bytes > 0 && used > 0 && used as u64 > self.limit_bytes {
            return Err(CollectError::CircuitBreaking {
                label: self.label.clone(),
                used_bytes: used as u64,
                limit_bytes: self.limit_bytes,
            });
        }
        Ok(())
    }

    /// Give back `bytes`. Saturates at zero: holders that outlive a
    /// `reset` release bytes the accountant already dropped.
    pub fn release(&self, bytes: i64) {
        let prev = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some((used - bytes).max(0))
            })
            .unwrap_or_else(|used| used);
        if prev < bytes {
            tracing::debug!(
                label = %self.label,
                used_bytes = prev,
                released = bytes,
                "release exceeds accounted bytes"
            );
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire).max(0) as u64
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Drop all accounted bytes. Only the owning query context calls this.
    pub fn reset(&self) {
        self.used.store(0, Ordering::Release);
    }
}

/// A row together with the bytes accounted for it.
#[derive(Debug, Clone)]
pub struct SizedRow {
    pub row: Row,
    pub bytes: i64,
}

/// Row-level view over a shared `RowAccountant`.
#[derive(Debug, Clone)]
pub struct RowAccounting {
    accountant: Arc<RowAccountant>,
}

impl RowAccounting {
    pub fn new(accountant: Arc<RowAccountant>) -> Self {
        Self { accountant }
    }

    pub fn accountant(&self) -> &Arc<RowAccountant> {
        &self.accountant
    }

    /// Account one row; returns its estimated size.
    pub fn account_row(&self, row: &Row) -> CollectResult<i64> {
        let bytes = estimate_row(row);
        self.accountant.add_bytes(bytes)?;
        Ok(bytes)
    }

    pub fn release(&self, bytes: i64) {
        self.accountant.release(bytes);
    }

    /// Account every row of a freshly fetched batch. On failure the rows
    /// accounted so far are released again and the batch is dropped.
    pub fn account_batch(&self, rows: Vec<Row>) -> CollectResult<AccountedBatch> {
        let mut batch = AccountedBatch {
            rows: Vec::with_capacity(rows.len()),
            accounting: self.clone(),
        };
        for row in rows {
            let bytes = estimate_row(&row);
            let accounted = self.accountant.add_bytes(bytes);
            batch.rows.push(SizedRow { row, bytes });
            accounted?;
        }
        Ok(batch)
    }
}

/// Rows whose bytes are accounted; whatever is still held on drop is
/// released.
#[derive(Debug)]
pub struct AccountedBatch {
    rows: Vec<SizedRow>,
    accounting: RowAccounting,
}

impl AccountedBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, idx: usize) -> Option<&Row> {
        self.rows.get(idx).map(|r| &r.row)
    }

    pub fn total_bytes(&self) -> i64 {
        self.rows.iter().map(|r| r.bytes).sum()
    }

    /// Hand the rows over; the caller becomes responsible for releasing
    /// each row's bytes.
    pub fn into_sized_rows(mut self) -> Vec<SizedRow> {
        std::mem::take(&mut self.rows)
    }
}

impl Drop for AccountedBatch {
    fn drop(&mut self) {
        let bytes = self.total_bytes();
        if bytes != 0 {
            self.accounting.release(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_row(s: &str) -> Row {
        Row::new(vec![Datum::Text(s.into())])
    }

    #[test]
    fn test_release_after_reset_saturates() {
        let acc = RowAccountant::new("q", 100);
        acc.add_bytes(80).unwrap();
        acc.reset();
        acc.release(50);
        assert_eq!(acc.used_bytes(), 0);
        // Later accounting starts from zero, not from a hidden deficit.
        acc.add_bytes(60).unwrap();
        assert_eq!(acc.used_bytes(), 60);
        assert!(acc.add_bytes(50).unwrap_err().is_resource_exhausted());
    }

    #[test]
    fn test_estimators_per_type() {
        assert_eq!(SizeEstimator::for_type(DataType::Int64).estimate(&Datum::Int64(1)), 8);
        assert_eq!(SizeEstimator::for_type(DataType::Int64).estimate(&Datum::Null), 0);
        let text = SizeEstimator::for_type(DataType::Text);
        assert_eq!(text.estimate(&Datum::Text("abcd".into())), VARIABLE_HEADER_BYTES + 4);
        assert_eq!(estimate_datum(&Datum::Bytea(vec![0; 10])), VARIABLE_HEADER_BYTES + 10);
    }

    #[test]
    fn test_running_maximum_accounts_only_growth() {
        let acc = RowAccountant::new("max", 0);
        let est = SizeEstimator::for_type(DataType::Text);
        let a = Datum::Text("aa".into());
        let b = Datum::Text("bbbbbb".into());
        assert_eq!(acc.add_estimated_size(&est, None, &a).unwrap(), VARIABLE_HEADER_BYTES + 2);
        assert_eq!(acc.add_estimated_size(&est, Some(&a), &b).unwrap(), 4);
        assert_eq!(acc.used_bytes(), (VARIABLE_HEADER_BYTES + 6) as u64);
    }

    #[test]
    fn test_breaker_trips_on_crossing_call() {
        let acc = RowAccountant::new("query-7", 100);
        acc.add_bytes(60).unwrap();
        acc.add_bytes(40).unwrap();
        let err = acc.add_bytes(1).unwrap_err();
        assert!(err.is_resource_exhausted());
        assert!(err.to_string().contains("[query-7]"));
        assert!(acc.circuit_break().is_err());
        acc.release(1);
        assert!(acc.circuit_break().is_ok());
        assert_eq!(acc.peak_bytes(), 101);
    }

    #[test]
    fn test_unlimited_never_trips() {
        let acc = RowAccountant::unlimited("q");
        acc.add_bytes(i64::MAX / 2).unwrap();
        assert!(acc.circuit_break().is_ok());
        acc.reset();
        assert_eq!(acc.used_bytes(), 0);
    }

    #[test]
    fn test_failed_batch_releases_partial_accounting() {
        let acc = Arc::new(RowAccountant::new("q", 150));
        let accounting = RowAccounting::new(Arc::clone(&acc));
        let rows: Vec<Row> = (0..10).map(|i| text_row(&"x".repeat(i * 10))).collect();
        let err = accounting.account_batch(rows).unwrap_err();
        assert!(err.is_resource_exhausted());
        assert_eq!(acc.used_bytes(), 0);
    }

    #[test]
    fn test_batch_drop_releases_untaken_rows() {
        let acc = Arc::new(RowAccountant::unlimited("q"));
        let accounting = RowAccounting::new(Arc::clone(&acc));
        let batch = accounting
            .account_batch(vec![text_row("a"), text_row("bb")])
            .unwrap();
        let total = batch.total_bytes();
        assert_eq!(acc.used_bytes(), total as u64);
        assert_eq!(batch.row(1), Some(&text_row("bb")));
        drop(batch);
        assert_eq!(acc.used_bytes(), 0);

        let batch = accounting.account_batch(vec![text_row("a")]).unwrap();
        let rows = batch.into_sized_rows();
        assert_eq!(acc.used_bytes(), rows[0].bytes as u64);
        accounting.release(rows[0].bytes);
        assert_eq!(acc.used_bytes(), 0);
    }
}
