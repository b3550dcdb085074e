//! Row collection over the shards of one node.
//!
//! Shard data reaches the query engine through pull-based [`BatchIterator`]s:
//! ordered reads are merged across shards by [`KWayMergeIterator`], unordered
//! reads are combined by [`ConcurrentScatterGatherIterator`] or
//! [`ConcatBatchIterator`]. Every buffered row is charged to the query's
//! [`RowAccountant`]; background work goes through a shared
//! [`ConcurrencyLimiter`].

pub mod accounting;
pub mod batch_iterator;
pub mod collect_source;
pub mod context;
pub mod limit;
pub mod limiter;
pub mod load;
pub mod memory;
pub mod merge;
pub mod ordered_source;
pub mod ordering;
pub mod registry;
pub mod scatter;
pub mod shard_iter;
pub mod source;
pub mod worker_pool;

pub use accounting::{RowAccountant, RowAccounting, SizeEstimator};
pub use batch_iterator::{collect_rows, visit_rows, BatchIterator};
pub use collect_source::{CollectPhase, RemoteCollectorFactory, ShardCollectSource};
pub use context::QueryContext;
pub use limit::LimitingBatchIterator;
pub use limiter::{ConcurrencyLimiter, LimiterMetrics};
pub use load::{BatchLoad, TaskHandle, TaskStatus};
pub use memory::{InMemoryBatchIterator, InMemoryShard};
pub use merge::{KWayMergeIterator, MergeMetrics};
pub use ordered_source::BoundedOrderedSource;
pub use ordering::OrderingSpec;
pub use registry::ShardRegistry;
pub use scatter::{ConcatBatchIterator, ConcurrentScatterGatherIterator};
pub use shard_iter::ShardBatchIterator;
pub use source::{RowPredicate, ShardCursor, ShardProvider, SourceRegistry};
pub use worker_pool::WorkerPool;
