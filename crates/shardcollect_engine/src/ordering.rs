//! Sort specification shared by shard cursors and the k-way merge.

use std::cmp::Ordering;

use shardcollect_common::datum::{Datum, Row};
use shardcollect_common::error::{CollectError, CollectResult};

/// Ordered list of sort columns with per-column direction and null
/// placement. All three vectors have the same length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderingSpec {
    positions: Vec<usize>,
    reverse: Vec<bool>,
    /// `None` = default placement: nulls last ascending, first descending.
    nulls_first: Vec<Option<bool>>,
}

impl OrderingSpec {
    pub fn new(
        positions: Vec<usize>,
        reverse: Vec<bool>,
        nulls_first: Vec<Option<bool>>,
    ) -> CollectResult<Self> {
        if positions.len() != reverse.len() || positions.len() != nulls_first.len() {
            return Err(CollectError::InvalidArgument(format!(
                "ordering lists differ in length: positions={}, reverse={}, nulls_first={}",
                positions.len(),
                reverse.len(),
                nulls_first.len()
            )));
        }
        if positions.is_empty() {
            return Err(CollectError::InvalidArgument(
                "ordering needs at least one column".into(),
            ));
        }
        Ok(Self {
            positions,
            reverse,
            nulls_first,
        })
    }

    /// Single-column ordering.
    pub fn single(position: usize, reverse: bool, nulls_first: Option<bool>) -> Self {
        Self {
            positions: vec![position],
            reverse: vec![reverse],
            nulls_first: vec![nulls_first],
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// Effective null placement of sort column `i`.
    pub fn nulls_first_at(&self, i: usize) -> bool {
        self.nulls_first[i].unwrap_or(self.reverse[i])
    }

    /// Sort key of `row`: the values at the sort positions. Missing
    /// columns read as `Null`.
    pub fn sort_key(&self, row: &Row) -> Vec<Datum> {
        self.positions
            .iter()
            .map(|&p| row.get(p).cloned().unwrap_or(Datum::Null))
            .collect()
    }

    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for (i, &pos) in self.positions.iter().enumerate() {
            let ord = self.compare_column(i, row_value(a, pos), row_value(b, pos));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Compare two sort keys produced by `sort_key`.
    pub fn compare_keys(&self, a: &[Datum], b: &[Datum]) -> Ordering {
        for i in 0..self.positions.len() {
            let ord = self.compare_column(
                i,
                a.get(i).unwrap_or(&Datum::Null),
                b.get(i).unwrap_or(&Datum::Null),
            );
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Compare a row against a sort key.
    pub fn compare_row_to_key(&self, row: &Row, key: &[Datum]) -> Ordering {
        for (i, &pos) in self.positions.iter().enumerate() {
            let ord = self.compare_column(
                i,
                row_value(row, pos),
                key.get(i).unwrap_or(&Datum::Null),
            );
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    fn compare_column(&self, i: usize, a: &Datum, b: &Datum) -> Ordering {
        // Null placement is absolute: it does not flip with the direction.
        match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if self.nulls_first_at(i) => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if self.nulls_first_at(i) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = a.total_cmp(b);
                if self.reverse[i] {
                    ord.reverse()
                } else {
                    ord
                }
            }
        }
    }
}

fn row_value(row: &Row, pos: usize) -> &Datum {
    row.get(pos).unwrap_or(&Datum::Null)
}
