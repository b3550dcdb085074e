//! Lifecycle-driven shard registry.
//!
//! The node's shard lifecycle feeds this table: a created shard registers a
//! lazily evaluated provider supplier, closing or deleting the shard removes
//! it. Lookups are safe against concurrent registration and removal.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use shardcollect_common::error::{CollectResult, SourceError};
use shardcollect_common::types::ShardId;

use crate::source::{ShardProvider, SourceRegistry};

type ProviderSupplier = Box<dyn Fn() -> Option<Arc<dyn ShardProvider>> + Send + Sync>;

/// Runs the supplier on first use and caches whatever it returned.
struct MemoizedProvider {
    supplier: ProviderSupplier,
    provider: OnceLock<Option<Arc<dyn ShardProvider>>>,
}

impl MemoizedProvider {
    fn get(&self) -> Option<Arc<dyn ShardProvider>> {
        self.provider.get_or_init(|| (self.supplier)()).clone()
    }
}

#[derive(Default)]
pub struct ShardRegistry {
    shards: DashMap<ShardId, Arc<MemoizedProvider>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shard; the provider is created on first resolve. A
    /// supplier returning `None` makes the shard resolve as not found.
    pub fn on_shard_created<F>(&self, shard: ShardId, supplier: F)
    where
        F: Fn() -> Option<Arc<dyn ShardProvider>> + Send + Sync + 'static,
    {
        tracing::debug!(shard = %shard, "shard registered for collection");
        let memoized = Arc::new(MemoizedProvider {
            supplier: Box::new(supplier),
            provider: OnceLock::new(),
        });
        self.shards.insert(shard, memoized);
    }

    /// Register an already constructed provider.
    pub fn register(&self, provider: Arc<dyn ShardProvider>) {
        let shard = provider.shard_id().clone();
        self.on_shard_created(shard, move || Some(Arc::clone(&provider)));
    }

    pub fn on_shard_closed(&self, shard: &ShardId) {
        if self.shards.remove(shard).is_some() {
            tracing::debug!(shard = %shard, "shard closed, removed from collection");
        }
    }

    pub fn on_shard_deleted(&self, shard: &ShardId) {
        if self.shards.remove(shard).is_some() {
            tracing::debug!(shard = %shard, "shard deleted, removed from collection");
        } else {
            tracing::warn!(shard = %shard, "delete of unregistered shard");
        }
    }

    pub fn contains(&self, shard: &ShardId) -> bool {
        self.shards.contains_key(shard)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

impl SourceRegistry for ShardRegistry {
    fn resolve(&self, shard: &ShardId) -> CollectResult<Arc<dyn ShardProvider>> {
        // Clone out of the map so the supplier never runs under a shard lock.
        let entry = self.shards.get(shard).map(|e| Arc::clone(e.value()));
        match entry {
            Some(memoized) => memoized
                .get()
                .ok_or_else(|| SourceError::ShardNotFound(shard.clone()).into()),
            None => {
                let index_known = self.shards.iter().any(|e| e.key().index == shard.index);
                if index_known {
                    Err(SourceError::ShardNotFound(shard.clone()).into())
                } else {
                    Err(SourceError::IndexNotFound(shard.index.clone()).into())
                }
            }
        }
    }
}

impl std::fmt::Debug for ShardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRegistry")
            .field("shards", &self.shards.len())
            .finish()
    }
}
