//! Entry point of the collect layer: turns a routed collect phase into one
//! `BatchIterator` over the node-local shards it names.
//!
//! - ordered phase: one `BoundedOrderedSource` per shard, merged by
//!   `KWayMergeIterator`;
//! - unordered phase: one `ShardBatchIterator` per shard, combined
//!   concurrently or sequentially;
//! - a phase limit caps the result with `LimitingBatchIterator`.
//!
//! Shards missing locally are either collected remotely (unordered reads
//! that do not fetch by row id), skipped (partitions that may be dropped
//! concurrently), or fail the whole phase.

use std::sync::Arc;

use shardcollect_common::config::CollectConfig;
use shardcollect_common::error::{CollectError, CollectResult, SourceError};
use shardcollect_common::types::ShardId;

use crate::batch_iterator::BatchIterator;
use crate::context::QueryContext;
use crate::limit::LimitingBatchIterator;
use crate::limiter::ConcurrencyLimiter;
use crate::memory::InMemoryBatchIterator;
use crate::merge::KWayMergeIterator;
use crate::ordered_source::BoundedOrderedSource;
use crate::ordering::OrderingSpec;
use crate::scatter::{ConcatBatchIterator, ConcurrentScatterGatherIterator};
use crate::shard_iter::ShardBatchIterator;
use crate::source::{match_all, resolve_cursor, tolerate_missing, RowPredicate, SourceRegistry};

/// What to collect from which shards.
#[derive(Clone)]
pub struct CollectPhase {
    /// Node-local shards, in the order used to break ordering ties.
    pub routing: Vec<ShardId>,
    pub predicate: RowPredicate,
    pub order_by: Option<OrderingSpec>,
    pub limit: Option<u64>,
    /// The consumer benefits from overlapping shard reads (shard-level
    /// projections such as partial aggregation).
    pub concurrent_consumption: bool,
    pub require_move_to_start: bool,
    /// Rows are fetched later by row id, which only works on the node
    /// holding the shard.
    pub fetches_row_ids: bool,
}

impl CollectPhase {
    pub fn new(routing: Vec<ShardId>) -> Self {
        Self {
            routing,
            predicate: match_all(),
            order_by: None,
            limit: None,
            concurrent_consumption: false,
            require_move_to_start: false,
            fetches_row_ids: false,
        }
    }

    pub fn with_predicate(mut self, predicate: RowPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn ordered_by(mut self, ordering: OrderingSpec) -> Self {
        self.order_by = Some(ordering);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_concurrent_consumption(mut self, enabled: bool) -> Self {
        self.concurrent_consumption = enabled;
        self
    }

    pub fn with_move_to_start(mut self, enabled: bool) -> Self {
        self.require_move_to_start = enabled;
        self
    }

    pub fn fetching_row_ids(mut self, enabled: bool) -> Self {
        self.fetches_row_ids = enabled;
        self
    }
}

impl std::fmt::Debug for CollectPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectPhase")
            .field("routing", &self.routing)
            .field("order_by", &self.order_by)
            .field("limit", &self.limit)
            .field("concurrent_consumption", &self.concurrent_consumption)
            .field("require_move_to_start", &self.require_move_to_start)
            .field("fetches_row_ids", &self.fetches_row_ids)
            .finish()
    }
}

/// Creates iterators that collect a shard on the node currently holding it.
pub trait RemoteCollectorFactory: Send + Sync {
    fn create_collector(
        &self,
        shard: &ShardId,
        phase: &CollectPhase,
        ctx: &QueryContext,
    ) -> CollectResult<Box<dyn BatchIterator>>;
}

pub struct ShardCollectSource {
    registry: Arc<dyn SourceRegistry>,
    limiter: Arc<ConcurrencyLimiter>,
    config: CollectConfig,
    remote: Option<Arc<dyn RemoteCollectorFactory>>,
}

impl ShardCollectSource {
    pub fn new(
        registry: Arc<dyn SourceRegistry>,
        limiter: Arc<ConcurrencyLimiter>,
        config: CollectConfig,
    ) -> Self {
        Self {
            registry,
            limiter,
            config,
            remote: None,
        }
    }

    pub fn with_remote_collector(mut self, factory: Arc<dyn RemoteCollectorFactory>) -> Self {
        self.remote = Some(factory);
        self
    }

    pub fn config(&self) -> &CollectConfig {
        &self.config
    }

    pub fn get_iterator(
        &self,
        phase: &CollectPhase,
        ctx: &QueryContext,
    ) -> CollectResult<Box<dyn BatchIterator>> {
        tracing::debug!(
            query_id = ctx.query_id(),
            shards = phase.routing.len(),
            ordered = phase.order_by.is_some(),
            limit = ?phase.limit,
            "creating shard collect iterator"
        );
        let iterator = match &phase.order_by {
            Some(ordering) => self.ordered_iterator(phase, ordering, ctx)?,
            None => self.unordered_iterator(phase, ctx)?,
        };
        Ok(match phase.limit {
            Some(limit) => Box::new(LimitingBatchIterator::new(iterator, limit)),
            None => iterator,
        })
    }

    fn ordered_batch_size(&self, phase: &CollectPhase) -> usize {
        let configured = self.config.batch.ordered_batch_size;
        match phase.limit {
            Some(limit) => configured.min(limit as usize).max(1),
            None => configured,
        }
    }

    fn ordered_iterator(
        &self,
        phase: &CollectPhase,
        ordering: &OrderingSpec,
        ctx: &QueryContext,
    ) -> CollectResult<Box<dyn BatchIterator>> {
        let ordering = Arc::new(ordering.clone());
        let batch_size = self.ordered_batch_size(phase);
        let retries = self.config.sources.missing_source_retries;

        let mut sources = Vec::with_capacity(phase.routing.len());
        for shard in &phase.routing {
            match resolve_cursor(self.registry.as_ref(), shard, retries) {
                Ok(cursor) => sources.push(BoundedOrderedSource::new(
                    shard.clone(),
                    cursor,
                    Arc::clone(&ordering),
                    phase.predicate.clone(),
                    batch_size,
                )?),
                Err(e) => tolerate_missing(shard, e)?,
            }
        }
        if sources.is_empty() {
            return Ok(Box::new(InMemoryBatchIterator::empty()));
        }
        let merge = KWayMergeIterator::new(
            sources,
            ordering,
            Arc::clone(&self.limiter),
            ctx.row_accounting(),
        )
        .with_move_to_start(phase.require_move_to_start);
        Ok(Box::new(merge))
    }

    fn unordered_iterator(
        &self,
        phase: &CollectPhase,
        ctx: &QueryContext,
    ) -> CollectResult<Box<dyn BatchIterator>> {
        let retries = self.config.sources.missing_source_retries;
        let mut iterators: Vec<Box<dyn BatchIterator>> = Vec::with_capacity(phase.routing.len());
        for shard in &phase.routing {
            match resolve_cursor(self.registry.as_ref(), shard, retries) {
                Ok(cursor) => iterators.push(Box::new(ShardBatchIterator::new(
                    shard.clone(),
                    cursor,
                    phase.predicate.clone(),
                    self.config.batch.unordered_batch_size,
                    ctx.row_accounting(),
                )?)),
                Err(e) => {
                    if let Some(remote) = self.remote_fallback(phase, &e) {
                        tracing::debug!(shard = %shard, error = %e, "shard not local, collecting remotely");
                        iterators.push(remote.create_collector(shard, phase, ctx)?);
                    } else {
                        tolerate_missing(shard, e)?;
                    }
                }
            }
        }
        Ok(self.combine(iterators, phase))
    }

    /// A remote collector may stand in for a shard that moved away, unless
    /// the phase needs row ids that only the local node can serve.
    fn remote_fallback(
        &self,
        phase: &CollectPhase,
        err: &CollectError,
    ) -> Option<&Arc<dyn RemoteCollectorFactory>> {
        let moved = matches!(
            err,
            CollectError::Source(
                SourceError::ShardNotFound(_) | SourceError::ShardUnavailable { .. }
            )
        );
        if moved && !phase.fetches_row_ids {
            self.remote.as_ref()
        } else {
            None
        }
    }

    fn combine(
        &self,
        mut iterators: Vec<Box<dyn BatchIterator>>,
        phase: &CollectPhase,
    ) -> Box<dyn BatchIterator> {
        match iterators.len() {
            0 => Box::new(InMemoryBatchIterator::empty()),
            1 => iterators.remove(0),
            _ if phase.concurrent_consumption => Box::new(ConcurrentScatterGatherIterator::new(
                iterators,
                Arc::clone(&self.limiter),
            )),
            _ => Box::new(ConcatBatchIterator::new(iterators)),
        }
    }
}
