use std::fmt;
use std::sync::Arc;

/// Prefix that marks an index as one partition of a partitioned table.
pub const PARTITIONED_PREFIX: &str = ".partitioned.";

/// Name of a physical index. Either a plain table index (`doc.users`) or a
/// partition index (`.partitioned.users.04132`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexName(Arc<str>);

impl IndexName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Build the index name of one partition of `table`.
    pub fn partition(table: &str, ident: &str) -> Self {
        Self::new(format!("{PARTITIONED_PREFIX}{table}.{ident}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Partitions may be dropped concurrently with a running query.
    pub fn is_partition(&self) -> bool {
        self.0.starts_with(PARTITIONED_PREFIX)
    }

    /// Logical table name: strips the partition prefix and ident.
    pub fn table_name(&self) -> &str {
        match self.0.strip_prefix(PARTITIONED_PREFIX) {
            Some(rest) => rest.rsplit_once('.').map_or(rest, |(table, _)| table),
            None => &self.0,
        }
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a shard: owning index plus shard number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId {
    pub index: IndexName,
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: IndexName, shard: u32) -> Self {
        Self { index, shard }
    }

    /// Whether losing this shard mid-query is tolerable.
    pub fn is_droppable(&self) -> bool {
        self.index.is_partition()
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Stable per-row identifier within one shard, used to break sort-key ties
/// across batch boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(pub u64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row:{}", self.0)
    }
}
