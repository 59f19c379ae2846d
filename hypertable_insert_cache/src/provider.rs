use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use hypertable_catalog::{
    Chunk, ChunkCatalog, ChunkShareGuard, Epoch, Hypertable, InvalidationListener, Partition,
    ResolvedChunk, RowLockMode,
};
use hypertable_clap_blocks::chunk_cache::ChunkCacheConfig;
use hypertable_id::{ChunkId, PartitionId};
use tracing::{debug, info};

use crate::{
    BuildContext, Error, PlanCache, PlanCacheStats, PlanEngine, PlanHandle, Result,
    build_insert_statement,
};

/// Name the cache subscribes to catalog invalidations under
pub const INVALIDATION_SUBSCRIBER_NAME: &str = "chunk_insert_plan_cache";

/// A compiled plan moving staged rows into `chunk`.
///
/// If the chunk was looked up with [`RowLockMode::Shared`] the plan carries the share lock on the
/// chunk record, and the chunk's bounds cannot change until the plan is dropped.
#[derive(Debug)]
pub struct MovementPlan {
    chunk: Chunk,
    plan: PlanHandle,
    share_lock: Option<ChunkShareGuard>,
}

impl MovementPlan {
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk.id
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn plan(&self) -> PlanHandle {
        self.plan
    }

    /// Whether the plan holds a share lock on its chunk record
    pub fn is_share_locked(&self) -> bool {
        self.share_lock.is_some()
    }
}

/// Provides compiled movement plans for the chunks of every hypertable in a catalog
pub struct ChunkInsertPlanCache {
    catalog: Arc<dyn ChunkCatalog>,
    plans: PlanCache,
    config: ChunkCacheConfig,
    shut_down: AtomicBool,
    /// Set once the subscription under [`INVALIDATION_SUBSCRIBER_NAME`] is ours
    subscribed: AtomicBool,
}

impl std::fmt::Debug for ChunkInsertPlanCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkInsertPlanCache")
            .field("plans", &self.plans)
            .field("config", &self.config)
            .field("shut_down", &self.shut_down)
            .field("subscribed", &self.subscribed)
            .finish_non_exhaustive()
    }
}

impl ChunkInsertPlanCache {
    /// Create the cache and subscribe it to invalidation notifications from `catalog`.
    ///
    /// Fails with [`Error::DuplicateSubscription`] if another cache is already subscribed to
    /// `catalog`. That cache keeps its subscription.
    pub fn new(
        catalog: Arc<dyn ChunkCatalog>,
        engine: Arc<dyn PlanEngine>,
        config: ChunkCacheConfig,
    ) -> Result<Arc<Self>> {
        let cache = Arc::new(Self {
            catalog: Arc::clone(&catalog),
            plans: PlanCache::new(engine, config.initial_capacity),
            config,
            shut_down: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
        });
        let listener = Arc::downgrade(&cache) as Weak<dyn InvalidationListener>;
        catalog.subscribe_invalidation(INVALIDATION_SUBSCRIBER_NAME, listener)?;
        cache.subscribed.store(true, Ordering::Release);
        Ok(cache)
    }

    /// Get a plan that moves staged rows of `hypertable` at `timepoint` in `partition` into the
    /// chunk that owns them.
    ///
    /// The owning chunk is created if it does not exist yet. The plan is compiled if the chunk has
    /// none cached, and recompiled if the chunk's bounds changed since it was compiled. `lock` is
    /// passed through to [`hypertable_catalog::ChunkDirectory::resolve_or_create`]: with
    /// [`RowLockMode::Shared`] the returned plan holds a share lock on the chunk record, so its
    /// bounds stay the ones the plan was compiled for until the plan is dropped.
    pub fn get_movement_plan(
        &self,
        hypertable: &Hypertable,
        epoch: &Epoch,
        partition: &Partition,
        timepoint: i64,
        lock: RowLockMode,
    ) -> Result<MovementPlan> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }
        let ResolvedChunk { chunk, share_lock } =
            self.resolve_chunk(partition.id, timepoint, lock)?;
        let ctx = BuildContext {
            hypertable,
            epoch,
            partition,
            chunk: &chunk,
        };

        let plan = self.plans.get_or_build(chunk.id, chunk.range, || {
            build_insert_statement(
                ctx,
                self.catalog.as_ref(),
                self.config.empty_destination_policy,
            )
        });
        match plan {
            Ok(plan) => Ok(MovementPlan {
                chunk,
                plan,
                share_lock,
            }),
            Err(e @ Error::MetadataLookupFailure { .. }) => {
                // the cached plan may reference whatever could not be looked up
                self.plans.evict(chunk.id);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn resolve_chunk(
        &self,
        partition_id: PartitionId,
        timepoint: i64,
        lock: RowLockMode,
    ) -> Result<ResolvedChunk> {
        let mut conflicts = 0;
        loop {
            match self.catalog.resolve_or_create(partition_id, timepoint, lock) {
                Err(hypertable_catalog::Error::ChunkCreateConflict { .. })
                    if conflicts < self.config.create_conflict_retries =>
                {
                    conflicts += 1;
                    debug!(
                        partition_id = %partition_id,
                        timepoint,
                        conflicts,
                        "chunk created concurrently, retrying lookup"
                    );
                }
                res => return Ok(res?),
            }
        }
    }

    /// Release every cached plan. Plans are rebuilt lazily on the next lookup of each chunk.
    pub fn invalidate(&self) {
        self.plans.invalidate();
    }

    pub fn stats(&self) -> PlanCacheStats {
        self.plans.stats()
    }

    /// Unsubscribe from invalidations, then release every cached plan.
    ///
    /// Later calls to [`get_movement_plan`](Self::get_movement_plan) fail with
    /// [`Error::ShutDown`]. Calling this more than once has no further effect. Also runs on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.subscribed.load(Ordering::Acquire) {
            self.catalog.unsubscribe_invalidation(INVALIDATION_SUBSCRIBER_NAME);
        }
        self.plans.shutdown();
        info!("chunk insert plan cache shut down");
    }
}

impl InvalidationListener for ChunkInsertPlanCache {
    fn invalidate_cached_plans(&self) {
        self.invalidate();
    }
}

impl Drop for ChunkInsertPlanCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hypertable_catalog::{
        ChunkTimeRange, InvalidationSource, MemCatalog, TableRef, TimeColumnType,
    };
    use hypertable_clap_blocks::{catalog::ChunkCatalogConfig, chunk_cache::EmptyDestinationPolicy};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::MemPlanEngine;

    struct Fixture {
        catalog: Arc<MemCatalog>,
        engine: Arc<MemPlanEngine>,
        cache: Arc<ChunkInsertPlanCache>,
        hypertable: Arc<Hypertable>,
        epoch: Arc<Epoch>,
        partition: Partition,
    }

    impl Fixture {
        fn new(config: ChunkCacheConfig) -> Self {
            Self::with_catalog(MemCatalog::default(), config)
        }

        fn with_catalog(catalog: MemCatalog, config: ChunkCacheConfig) -> Self {
            let catalog = Arc::new(catalog);
            let engine = Arc::new(MemPlanEngine::with_relations(Arc::clone(&catalog) as _));
            let cache = ChunkInsertPlanCache::new(
                Arc::clone(&catalog) as _,
                Arc::clone(&engine) as _,
                config,
            )
            .unwrap();
            let hypertable = catalog
                .create_hypertable(
                    "ts_data",
                    "readings",
                    "recorded_at",
                    TimeColumnType::BigInt,
                    100,
                )
                .unwrap();
            let (epoch, partitions) = catalog
                .create_epoch(hypertable.id, None, None, 1, None)
                .unwrap();
            Self {
                catalog,
                engine,
                cache,
                hypertable,
                epoch,
                partition: partitions[0],
            }
        }

        fn get(&self, timepoint: i64) -> Result<MovementPlan> {
            self.cache.get_movement_plan(
                &self.hypertable,
                &self.epoch,
                &self.partition,
                timepoint,
                RowLockMode::Shared,
            )
        }

        fn add_destination(&self, chunk_id: ChunkId, name: &str) -> TableRef {
            let table = TableRef::new("ts_data", name);
            self.catalog
                .add_chunk_replica(chunk_id, table.clone())
                .unwrap();
            table
        }
    }

    #[test_log::test]
    fn creates_chunk_and_reuses_plan() {
        let f = Fixture::new(ChunkCacheConfig::default());
        let first = f.get(150).unwrap();
        assert_eq!(ChunkTimeRange::bounded(100, 199), first.chunk().range);
        assert!(first.is_share_locked());

        let second = f.get(199).unwrap();
        assert_eq!(first.chunk(), second.chunk());
        assert_eq!(first.plan(), second.plan());
        assert_eq!(1, f.engine.prepare_count());
        let stats = f.cache.stats();
        assert_eq!((1, 1, 1), (stats.misses, stats.hits, stats.entries));
    }

    #[test_log::test]
    fn bound_change_rebuilds() {
        let f = Fixture::new(ChunkCacheConfig::default());
        let first = f.get(150).unwrap();
        let (chunk_id, first_plan) = (first.chunk_id(), first.plan());
        drop(first);

        f.catalog
            .lock_chunk_for_update(chunk_id)
            .unwrap()
            .set_bounds(ChunkTimeRange::bounded(100, 299))
            .unwrap();

        let second = f.get(250).unwrap();
        assert_eq!(chunk_id, second.chunk_id());
        assert_ne!(first_plan, second.plan());
        assert_eq!(Some(1), f.engine.release_count(first_plan));
        let sql = f.engine.plan(second.plan()).unwrap().sql;
        assert!(sql.contains("(recorded_at <= 299)"));
    }

    #[test_log::test]
    fn held_plan_keeps_bounds_fixed() {
        let f = Fixture::with_catalog(
            MemCatalog::new(&ChunkCatalogConfig {
                lock_wait_timeout: Duration::from_millis(20),
            }),
            ChunkCacheConfig::default(),
        );
        let plan = f.get(150).unwrap();
        assert!(matches!(
            f.catalog.lock_chunk_for_update(plan.chunk_id()),
            Err(hypertable_catalog::Error::LockTimeout { .. })
        ));
        assert_eq!(
            Some(plan.chunk().range),
            f.catalog.get_chunk(plan.chunk_id()).map(|c| c.range)
        );

        let chunk_id = plan.chunk_id();
        drop(plan);
        f.catalog.lock_chunk_for_update(chunk_id).unwrap();

        // unlocked lookups hold nothing
        let unlocked = f
            .cache
            .get_movement_plan(&f.hypertable, &f.epoch, &f.partition, 150, RowLockMode::None)
            .unwrap();
        assert!(!unlocked.is_share_locked());
        f.catalog.lock_chunk_for_update(chunk_id).unwrap();
    }

    #[test_log::test]
    fn routing_change_invalidates() {
        let f = Fixture::new(ChunkCacheConfig::default());
        let first = f.get(0).unwrap();
        assert!(!f.engine.plan(first.plan()).unwrap().sql.contains("INSERT INTO"));

        f.add_destination(first.chunk_id(), "_hyper_1_1_0_1_data");
        assert_eq!(Some(1), f.engine.release_count(first.plan()));
        assert_eq!(1, f.cache.stats().invalidations);

        let second = f.get(0).unwrap();
        let sql = f.engine.plan(second.plan()).unwrap().sql;
        assert!(sql.contains("INSERT INTO ts_data._hyper_1_1_0_1_data"));
    }

    #[test]
    fn empty_destinations_rejected_by_policy() {
        let f = Fixture::new(ChunkCacheConfig {
            empty_destination_policy: EmptyDestinationPolicy::Reject,
            ..Default::default()
        });
        assert!(matches!(f.get(0), Err(Error::NoDestinationTables(_))));
        // the chunk exists regardless, so adding a destination makes the lookup succeed
        let chunk = f.catalog.chunks_in_partition(f.partition.id)[0];
        f.add_destination(chunk.id, "dest");
        assert_eq!(chunk.id, f.get(0).unwrap().chunk_id());
    }

    #[test]
    fn unknown_partition_is_a_lookup_failure() {
        let f = Fixture::new(ChunkCacheConfig::default());
        let mut partition = f.partition;
        partition.id = PartitionId::new(1_000);
        assert!(matches!(
            f.cache
                .get_movement_plan(&f.hypertable, &f.epoch, &partition, 0, RowLockMode::None),
            Err(Error::MetadataLookupFailure { .. })
        ));
    }

    #[test_log::test]
    fn second_cache_on_catalog_is_rejected() {
        let f = Fixture::new(ChunkCacheConfig::default());
        let engine = Arc::new(MemPlanEngine::new());
        let second = ChunkInsertPlanCache::new(
            Arc::clone(&f.catalog) as _,
            engine as _,
            ChunkCacheConfig::default(),
        );
        assert!(matches!(
            second,
            Err(Error::DuplicateSubscription { name }) if name == INVALIDATION_SUBSCRIBER_NAME
        ));

        // the rejected cache was dropped without taking the first one's subscription along
        let plan = f.get(0).unwrap();
        f.add_destination(plan.chunk_id(), "dest");
        assert_eq!(1, f.cache.stats().invalidations);
        assert_eq!(Some(1), f.engine.release_count(plan.plan()));
    }

    #[test_log::test]
    fn shutdown_releases_and_unsubscribes() {
        let f = Fixture::new(ChunkCacheConfig::default());
        let plan = f.get(0).unwrap();

        f.cache.shutdown();
        f.cache.shutdown();
        assert_eq!(Some(1), f.engine.release_count(plan.plan()));
        assert!(matches!(f.get(0), Err(Error::ShutDown)));

        // the subscription name is free again
        assert!(!f.catalog.unsubscribe_invalidation(INVALIDATION_SUBSCRIBER_NAME));
        // routing changes no longer reach the cache
        f.add_destination(plan.chunk_id(), "dest");
        assert_eq!(0, f.cache.stats().invalidations);
    }

    #[test]
    fn drop_releases_plans() {
        let f = Fixture::new(ChunkCacheConfig::default());
        let plan = f.get(0).unwrap();
        let Fixture { cache, engine, .. } = f;
        drop(cache);
        assert_eq!(Some(1), engine.release_count(plan.plan()));
        assert!(engine.live_plans().is_empty());
    }
}
