use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Column data types a shard can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float64,
    Text,
    Timestamp,
    Bytea,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "boolean",
            DataType::Int32 => "integer",
            DataType::Int64 => "bigint",
            DataType::Float64 => "double",
            DataType::Text => "text",
            DataType::Timestamp => "timestamp",
            DataType::Bytea => "bytea",
        };
        f.write_str(name)
    }
}

/// A single scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Timestamp(i64), // microseconds since Unix epoch
    Bytea(Vec<u8>),
}

impl Datum {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Boolean(_) => Some(DataType::Boolean),
            Datum::Int32(_) => Some(DataType::Int32),
            Datum::Int64(_) => Some(DataType::Int64),
            Datum::Float64(_) => Some(DataType::Float64),
            Datum::Text(_) => Some(DataType::Text),
            Datum::Timestamp(_) => Some(DataType::Timestamp),
            Datum::Bytea(_) => Some(DataType::Bytea),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Total order over non-null values. Integers compare across widths,
    /// floats use IEEE total ordering so repeated merges are reproducible.
    /// Values of unrelated types order by type rank. `Null` sorts before
    /// everything here; callers that care about null placement handle nulls
    /// before calling this.
    pub fn total_cmp(&self, other: &Datum) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Null, _) => Ordering::Less,
            (_, Datum::Null) => Ordering::Greater,
            (Datum::Boolean(a), Datum::Boolean(b)) => a.cmp(b),
            (Datum::Int32(a), Datum::Int32(b)) => a.cmp(b),
            (Datum::Int64(a), Datum::Int64(b)) => a.cmp(b),
            (Datum::Int32(a), Datum::Int64(b)) => (*a as i64).cmp(b),
            (Datum::Int64(a), Datum::Int32(b)) => a.cmp(&(*b as i64)),
            (Datum::Float64(a), Datum::Float64(b)) => a.total_cmp(b),
            (Datum::Float64(a), Datum::Int32(b)) => a.total_cmp(&(*b as f64)),
            (Datum::Float64(a), Datum::Int64(b)) => a.total_cmp(&(*b as f64)),
            (Datum::Int32(a), Datum::Float64(b)) => (*a as f64).total_cmp(b),
            (Datum::Int64(a), Datum::Float64(b)) => (*a as f64).total_cmp(b),
            (Datum::Text(a), Datum::Text(b)) => a.cmp(b),
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a.cmp(b),
            (Datum::Bytea(a), Datum::Bytea(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Boolean(_) => 1,
            Datum::Int32(_) | Datum::Int64(_) | Datum::Float64(_) => 2,
            Datum::Timestamp(_) => 3,
            Datum::Text(_) => 4,
            Datum::Bytea(_) => 5,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Boolean(b) => write!(f, "{b}"),
            Datum::Int32(v) => write!(f, "{v}"),
            Datum::Int64(v) => write!(f, "{v}"),
            Datum::Float64(v) => write!(f, "{v}"),
            Datum::Text(s) => write!(f, "{s}"),
            Datum::Timestamp(us) => write!(f, "ts:{us}"),
            Datum::Bytea(bytes) => {
                write!(f, "\\x")?;
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// An immutable, fixed-arity tuple of values.
///
/// Cloning is cheap (the values are shared), so a consumer that must keep a
/// row past the next `move_next` simply clones it. Borrowed `&Row`s handed out
/// by iterators are valid only until the next positional advance.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Arc<[Datum]>,
}

impl Row {
    pub fn new(values: Vec<Datum>) -> Self {
        Self {
            values: values.into(),
        }
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        self.values.get(idx)
    }

    pub fn values(&self) -> &[Datum] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<Datum>> for Row {
    fn from(values: Vec<Datum>) -> Self {
        Self::new(values)
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_cmp_mixed_integer_widths() {
        assert_eq!(Datum::Int32(5).total_cmp(&Datum::Int64(5)), Ordering::Equal);
        assert_eq!(Datum::Int32(4).total_cmp(&Datum::Int64(5)), Ordering::Less);
        assert_eq!(Datum::Int64(9).total_cmp(&Datum::Float64(8.5)), Ordering::Greater);
    }

    #[test]
    fn test_total_cmp_is_total_for_nan() {
        let nan = Datum::Float64(f64::NAN);
        assert_eq!(nan.total_cmp(&nan), Ordering::Equal);
        assert_eq!(Datum::Float64(1.0).total_cmp(&nan), Ordering::Less);
    }

    #[test]
    fn test_row_clone_shares_values() {
        let row = Row::new(vec![Datum::Int32(1), Datum::Text("a".into())]);
        let copy = row.clone();
        assert_eq!(row, copy);
        assert_eq!(copy.len(), 2);
        assert_eq!(copy.to_string(), "(1, a)");
    }
}
