//! End-to-end collection through `ShardCollectSource`: routing, missing
//! shard handling and limits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use shardcollect_common::{
    CollectConfig, CollectError, Datum, ErrorKind, IndexName, Row, ShardId, SourceError,
};
use shardcollect_engine::{
    collect_rows, BatchIterator, CollectPhase, ConcurrencyLimiter, InMemoryBatchIterator,
    InMemoryShard, OrderingSpec, QueryContext, RemoteCollectorFactory, ShardCollectSource,
    ShardProvider, ShardRegistry, WorkerPool,
};

fn users(n: u32) -> ShardId {
    ShardId::new(IndexName::new("doc.users"), n)
}

fn partition(ident: &str, n: u32) -> ShardId {
    ShardId::new(IndexName::partition("events", ident), n)
}

fn int_rows(vals: impl IntoIterator<Item = i64>) -> Vec<Row> {
    vals.into_iter().map(|v| Row::new(vec![Datum::Int64(v)])).collect()
}

fn firsts(rows: &[Row]) -> Vec<i64> {
    rows.iter()
        .map(|r| r.get(0).and_then(Datum::as_i64).unwrap())
        .collect()
}

struct Cluster {
    registry: Arc<ShardRegistry>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            registry: Arc::new(ShardRegistry::new()),
        }
    }

    fn add(&self, shard: ShardId, rows: Vec<Row>) -> Arc<InMemoryShard> {
        let provider = Arc::new(InMemoryShard::new(shard, rows));
        self.registry
            .register(Arc::clone(&provider) as Arc<dyn ShardProvider>);
        provider
    }

    fn source(&self, config: CollectConfig) -> ShardCollectSource {
        ShardCollectSource::new(
            Arc::clone(&self.registry) as _,
            Arc::new(ConcurrencyLimiter::direct()),
            config,
        )
    }
}

#[test]
fn test_ordered_collect_merges_all_routed_shards() {
    let cluster = Cluster::new();
    cluster.add(users(0), int_rows([9, 1, 5]));
    cluster.add(users(1), int_rows([4, 8]));
    cluster.add(users(2), int_rows([7, 2, 3, 6]));
    let source = cluster.source(CollectConfig::default());
    let ctx = QueryContext::new(0);

    let phase = CollectPhase::new(vec![users(0), users(1), users(2)])
        .ordered_by(OrderingSpec::single(0, false, None));
    let mut it = source.get_iterator(&phase, &ctx).unwrap();
    assert_eq!(firsts(&collect_rows(&mut it).unwrap()), (1..=9).collect::<Vec<_>>());
    assert_eq!(ctx.accountant().used_bytes(), 0);
}

#[test]
fn test_ordered_collect_with_limit_and_predicate() {
    let cluster = Cluster::new();
    cluster.add(users(0), int_rows(0..50));
    cluster.add(users(1), int_rows(50..100));
    let source = cluster.source(CollectConfig::default());
    let ctx = QueryContext::new(0);

    let phase = CollectPhase::new(vec![users(0), users(1)])
        .with_predicate(Arc::new(|row: &Row| {
            row.get(0).and_then(Datum::as_i64).is_some_and(|v| v % 2 == 1)
        }))
        .ordered_by(OrderingSpec::single(0, true, None))
        .with_limit(3);
    let mut it = source.get_iterator(&phase, &ctx).unwrap();
    assert_eq!(firsts(&collect_rows(&mut it).unwrap()), vec![99, 97, 95]);
}

#[test]
fn test_unordered_collect_reads_shards_in_routing_order() {
    let cluster = Cluster::new();
    cluster.add(users(0), int_rows(0..3));
    cluster.add(users(1), int_rows(3..5));
    let mut config = CollectConfig::default();
    config.batch.unordered_batch_size = 2;
    let source = cluster.source(config);
    let ctx = QueryContext::new(0);

    let mut it = source
        .get_iterator(&CollectPhase::new(vec![users(0), users(1)]), &ctx)
        .unwrap();
    assert_eq!(firsts(&collect_rows(&mut it).unwrap()), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_concurrent_consumption_on_worker_pool() {
    let cluster = Cluster::new();
    for n in 0..4 {
        let start = i64::from(n) * 10;
        cluster.add(users(n), int_rows(start..start + 10));
    }
    let mut config = CollectConfig::default();
    config.batch.unordered_batch_size = 3;
    let pool = WorkerPool::new("collect-test", 2, 8).unwrap();
    let source = ShardCollectSource::new(
        Arc::clone(&cluster.registry) as _,
        Arc::new(ConcurrencyLimiter::new(pool, 2)),
        config,
    );
    let ctx = QueryContext::new(0);

    let phase = CollectPhase::new((0..4).map(users).collect()).with_concurrent_consumption(true);
    let mut it = source.get_iterator(&phase, &ctx).unwrap();
    assert_eq!(firsts(&collect_rows(&mut it).unwrap()), (0..40).collect::<Vec<_>>());
    assert_eq!(ctx.accountant().used_bytes(), 0);
}

#[test]
fn test_dropped_partition_is_skipped() {
    let cluster = Cluster::new();
    cluster.add(partition("2024", 0), int_rows([3, 1]));
    let source = cluster.source(CollectConfig::default());
    let ctx = QueryContext::new(0);

    // The 2023 partition was dropped after routing was computed.
    let routing = vec![partition("2023", 0), partition("2024", 0)];
    for phase in [
        CollectPhase::new(routing.clone()),
        CollectPhase::new(routing.clone()).ordered_by(OrderingSpec::single(0, false, None)),
    ] {
        let mut it = source.get_iterator(&phase, &ctx).unwrap();
        let mut got = firsts(&collect_rows(&mut it).unwrap());
        got.sort_unstable();
        assert_eq!(got, vec![1, 3]);
    }
}

#[test]
fn test_missing_required_shard_fails_the_phase() {
    let cluster = Cluster::new();
    cluster.add(users(0), int_rows([1]));
    let source = cluster.source(CollectConfig::default());
    let ctx = QueryContext::new(0);

    let ordered = CollectPhase::new(vec![users(0), users(1)])
        .ordered_by(OrderingSpec::single(0, false, None));
    let err = source.get_iterator(&ordered, &ctx).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_ne!(err.kind(), ErrorKind::Transient);
    assert!(matches!(
        err,
        CollectError::RequiredSourceMissing { ref shard, cause: SourceError::ShardNotFound(_) }
            if *shard == users(1)
    ));

    let missing_index = ShardId::new(IndexName::new("doc.gone"), 0);
    let err = source
        .get_iterator(&CollectPhase::new(vec![missing_index]), &ctx)
        .err()
        .unwrap();
    assert!(err.is_fatal());
    assert!(matches!(err.missing_cause(), Some(SourceError::IndexNotFound(_))));
}

#[test]
fn test_transiently_unavailable_shard_is_retried() {
    let cluster = Cluster::new();
    let shard = cluster.add(users(0), int_rows([2, 1]));
    let source = cluster.source(CollectConfig::default());
    let ctx = QueryContext::new(0);
    let phase = CollectPhase::new(vec![users(0)]).ordered_by(OrderingSpec::single(0, false, None));

    shard.set_unavailable(1);
    let mut it = source.get_iterator(&phase, &ctx).unwrap();
    assert_eq!(firsts(&collect_rows(&mut it).unwrap()), vec![1, 2]);

    // One retry is configured; a second failure on a required shard is fatal.
    shard.set_unavailable(2);
    let err = source.get_iterator(&phase, &ctx).err().unwrap();
    assert!(err.is_fatal());
    assert!(matches!(err.missing_cause(), Some(SourceError::ShardUnavailable { .. })));
}

#[derive(Default)]
struct RecordingRemote {
    created: AtomicUsize,
}

impl RemoteCollectorFactory for RecordingRemote {
    fn create_collector(
        &self,
        shard: &ShardId,
        _phase: &CollectPhase,
        _ctx: &QueryContext,
    ) -> Result<Box<dyn BatchIterator>, CollectError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let marker = 100 + i64::from(shard.shard);
        Ok(Box::new(InMemoryBatchIterator::of(int_rows([marker]))))
    }
}

#[test]
fn test_relocated_shard_collected_remotely() {
    let cluster = Cluster::new();
    cluster.add(users(0), int_rows([1, 2]));
    let remote = Arc::new(RecordingRemote::default());
    let source = cluster
        .source(CollectConfig::default())
        .with_remote_collector(Arc::clone(&remote) as _);
    let ctx = QueryContext::new(0);

    let mut it = source
        .get_iterator(&CollectPhase::new(vec![users(0), users(1)]), &ctx)
        .unwrap();
    assert_eq!(firsts(&collect_rows(&mut it).unwrap()), vec![1, 2, 101]);
    assert_eq!(remote.created.load(Ordering::SeqCst), 1);
}

#[test]
fn test_row_id_fetch_never_goes_remote() {
    let cluster = Cluster::new();
    cluster.add(users(0), int_rows([1]));
    let remote = Arc::new(RecordingRemote::default());
    let source = cluster
        .source(CollectConfig::default())
        .with_remote_collector(Arc::clone(&remote) as _);
    let ctx = QueryContext::new(0);

    let phase = CollectPhase::new(vec![users(0), users(1)]).fetching_row_ids(true);
    let err = source.get_iterator(&phase, &ctx).err().unwrap();
    assert!(err.is_fatal());
    assert!(matches!(err.missing_cause(), Some(SourceError::ShardNotFound(_))));
    assert_eq!(remote.created.load(Ordering::SeqCst), 0);
}

#[test]
fn test_query_memory_ceiling_breaks_collection() {
    let cluster = Cluster::new();
    cluster.add(users(0), int_rows(0..100));
    cluster.add(users(1), int_rows(0..100));
    let source = cluster.source(CollectConfig::default());
    let ctx = QueryContext::new(512);

    let phase = CollectPhase::new(vec![users(0), users(1)])
        .ordered_by(OrderingSpec::single(0, false, None));
    let mut it = source.get_iterator(&phase, &ctx).unwrap();
    let err = collect_rows(&mut it).unwrap_err();
    assert!(err.is_resource_exhausted());
    assert_eq!(ctx.accountant().used_bytes(), 0);
}
