//! Per-chunk cache of compiled movement plans.

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use hashbrown::HashMap;
use hypertable_catalog::ChunkTimeRange;
use hypertable_id::ChunkId;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{Error, InsertStatement, PlanEngine, PlanHandle, Result};

/// A compiled plan along with the chunk bounds it was compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanCacheEntry {
    pub chunk_id: ChunkId,
    pub range: ChunkTimeRange,
    pub plan: PlanHandle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanCacheStats {
    /// Lookups served from a current entry
    pub hits: u64,
    /// Lookups that compiled a plan for a chunk with no entry
    pub misses: u64,
    /// Lookups that recompiled a plan because the chunk's bounds changed
    pub rebuilds: u64,
    pub invalidations: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    rebuilds: AtomicU64,
    invalidations: AtomicU64,
}

/// Map of chunk id to compiled plan.
///
/// Every plan the cache compiled is released through the [`PlanEngine`] exactly once: when it is
/// replaced by a rebuild, evicted, bulk invalidated, or when the cache is shut down.
pub struct PlanCache {
    engine: Arc<dyn PlanEngine>,
    /// `None` once shut down
    entries: Mutex<Option<HashMap<ChunkId, PlanCacheEntry>>>,
    initial_capacity: usize,
    counters: Counters,
}

impl Debug for PlanCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanCache")
            .field("engine", &self.engine)
            .field("initial_capacity", &self.initial_capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PlanCache {
    pub fn new(engine: Arc<dyn PlanEngine>, initial_capacity: usize) -> Self {
        Self {
            engine,
            entries: Mutex::new(Some(HashMap::with_capacity(initial_capacity))),
            initial_capacity,
            counters: Counters::default(),
        }
    }

    /// Return the plan for `chunk_id` compiled for `range`.
    ///
    /// If there is no entry, or the entry was compiled for different bounds, the statement
    /// produced by `build` is compiled and stored. A replaced plan is released only after its
    /// successor compiled. If `build` or compilation fails the cache is left as it was.
    pub fn get_or_build<F>(
        &self,
        chunk_id: ChunkId,
        range: ChunkTimeRange,
        build: F,
    ) -> Result<PlanHandle>
    where
        F: FnOnce() -> Result<InsertStatement>,
    {
        let mut guard = self.entries.lock();
        let entries = guard.as_mut().ok_or(Error::ShutDown)?;

        match entries.get_mut(&chunk_id) {
            Some(entry) if entry.range == range => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(chunk_id = %chunk_id, plan = %entry.plan, "plan cache hit");
                Ok(entry.plan)
            }
            Some(entry) => {
                let plan = self.compile(chunk_id, build)?;
                debug!(
                    chunk_id = %chunk_id,
                    old_range = %entry.range,
                    new_range = %range,
                    old_plan = %entry.plan,
                    new_plan = %plan,
                    "chunk bounds changed, rebuilt plan"
                );
                self.engine.release(entry.plan);
                entry.range = range;
                entry.plan = plan;
                self.counters.rebuilds.fetch_add(1, Ordering::Relaxed);
                Ok(plan)
            }
            None => {
                let plan = self.compile(chunk_id, build)?;
                debug!(chunk_id = %chunk_id, %range, %plan, "plan cache miss, compiled plan");
                entries.insert(
                    chunk_id,
                    PlanCacheEntry {
                        chunk_id,
                        range,
                        plan,
                    },
                );
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(plan)
            }
        }
    }

    fn compile<F>(&self, chunk_id: ChunkId, build: F) -> Result<PlanHandle>
    where
        F: FnOnce() -> Result<InsertStatement>,
    {
        let statement = build()?;
        self.engine
            .prepare(statement.sql(), statement.param_count())
            .map_err(|e| Error::CompileError {
                chunk_id,
                reason: e.to_string(),
            })
    }

    /// Release every compiled plan and start over with an empty map.
    pub fn invalidate(&self) {
        let mut guard = self.entries.lock();
        let Some(entries) = guard.as_mut() else {
            return;
        };
        let n_released = entries.len();
        for entry in entries.values() {
            self.engine.release(entry.plan);
        }
        *entries = HashMap::with_capacity(self.initial_capacity);
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        info!(n_released, "invalidated chunk insert plans");
    }

    /// Drop the entry for `chunk_id`, releasing its plan. Returns whether there was one.
    pub fn evict(&self, chunk_id: ChunkId) -> bool {
        let mut guard = self.entries.lock();
        match guard.as_mut().and_then(|entries| entries.remove(&chunk_id)) {
            Some(entry) => {
                self.engine.release(entry.plan);
                debug!(chunk_id = %chunk_id, plan = %entry.plan, "evicted plan");
                true
            }
            None => false,
        }
    }

    /// Release every compiled plan along with the map itself. Later lookups fail with
    /// [`Error::ShutDown`].
    pub fn shutdown(&self) {
        if let Some(entries) = self.entries.lock().take() {
            for entry in entries.values() {
                self.engine.release(entry.plan);
            }
            info!(n_released = entries.len(), "released all chunk insert plans");
        }
    }

    pub fn entry(&self, chunk_id: ChunkId) -> Option<PlanCacheEntry> {
        self.entries
            .lock()
            .as_ref()
            .and_then(|entries| entries.get(&chunk_id).copied())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().as_ref().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PlanCacheStats {
        PlanCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            rebuilds: self.counters.rebuilds.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use hypertable_catalog::TableRef;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::{InsertStatementBuilder, MemPlanEngine};

    fn cache() -> (Arc<MemPlanEngine>, PlanCache) {
        let engine = Arc::new(MemPlanEngine::new());
        let cache = PlanCache::new(Arc::clone(&engine) as _, 4);
        (engine, cache)
    }

    fn statement(dest: &str) -> Result<InsertStatement> {
        Ok(InsertStatementBuilder::new(TableRef::new("staging", "rows"))
            .destination(TableRef::new("dest", dest))
            .build())
    }

    fn unreachable_build() -> Result<InsertStatement> {
        panic!("hit must not rebuild")
    }

    #[test_log::test]
    fn hit_returns_same_plan() {
        let (engine, cache) = cache();
        let id = ChunkId::new(1);
        let range = ChunkTimeRange::bounded(0, 9);

        let first = cache.get_or_build(id, range, || statement("a")).unwrap();
        let second = cache.get_or_build(id, range, unreachable_build).unwrap();
        assert_eq!(first, second);
        assert_eq!(1, engine.prepare_count());
        assert_eq!(
            PlanCacheStats {
                hits: 1,
                misses: 1,
                rebuilds: 0,
                invalidations: 0,
                entries: 1,
            },
            cache.stats()
        );
    }

    #[test_log::test]
    fn changed_bounds_rebuild_and_release_once() {
        let (engine, cache) = cache();
        let id = ChunkId::new(1);

        let old = cache
            .get_or_build(id, ChunkTimeRange::bounded(0, 9), || statement("a"))
            .unwrap();
        let new_range = ChunkTimeRange::bounded(0, 19);
        let new = cache.get_or_build(id, new_range, || statement("a")).unwrap();

        assert_ne!(old, new);
        assert_eq!(Some(1), engine.release_count(old));
        assert_eq!(Some(0), engine.release_count(new));
        assert_eq!(
            Some(PlanCacheEntry {
                chunk_id: id,
                range: new_range,
                plan: new,
            }),
            cache.entry(id)
        );
        assert_eq!(1, cache.stats().rebuilds);

        // the rebuilt entry is now the current one
        assert_eq!(new, cache.get_or_build(id, new_range, unreachable_build).unwrap());
        assert_eq!(Some(1), engine.release_count(old));
    }

    #[test]
    fn failed_build_stores_nothing() {
        let (engine, cache) = cache();
        let id = ChunkId::new(1);
        let err = cache
            .get_or_build(id, ChunkTimeRange::open(), || {
                Err(Error::NoDestinationTables(id))
            })
            .unwrap_err();
        assert!(matches!(err, Error::NoDestinationTables(_)));
        assert!(cache.is_empty());
        assert_eq!(0, engine.prepare_count());
    }

    #[test]
    fn failed_rebuild_keeps_previous_entry() {
        let (engine, cache) = cache();
        let id = ChunkId::new(1);
        let range = ChunkTimeRange::bounded(0, 9);
        let plan = cache.get_or_build(id, range, || statement("a")).unwrap();

        let err = cache
            .get_or_build(id, ChunkTimeRange::bounded(0, 5), || {
                Ok(InsertStatementBuilder::new(TableRef::new("staging", "rows"))
                    .predicate("(broken")
                    .build())
            })
            .unwrap_err();
        assert!(matches!(err, Error::CompileError { chunk_id, .. } if chunk_id == id));

        assert_eq!(
            Some(PlanCacheEntry {
                chunk_id: id,
                range,
                plan,
            }),
            cache.entry(id)
        );
        assert_eq!(vec![plan], engine.live_plans());
    }

    #[test_log::test]
    fn invalidate_releases_everything() {
        let (engine, cache) = cache();
        let plans: Vec<_> = (1..=10)
            .map(|i| {
                cache
                    .get_or_build(ChunkId::new(i), ChunkTimeRange::open(), || statement("a"))
                    .unwrap()
            })
            .collect();
        assert_eq!(10, cache.len());

        cache.invalidate();
        assert!(cache.is_empty());
        assert!(engine.live_plans().is_empty());
        for plan in plans {
            assert_eq!(Some(1), engine.release_count(plan));
        }
        assert_eq!(1, cache.stats().invalidations);

        // entries are rebuilt lazily
        cache
            .get_or_build(ChunkId::new(1), ChunkTimeRange::open(), || statement("a"))
            .unwrap();
        assert_eq!(1, cache.len());
        assert_eq!(11, cache.stats().misses);
    }

    #[test]
    fn evict_single_entry() {
        let (engine, cache) = cache();
        let plan = cache
            .get_or_build(ChunkId::new(1), ChunkTimeRange::open(), || statement("a"))
            .unwrap();
        assert!(cache.evict(ChunkId::new(1)));
        assert!(!cache.evict(ChunkId::new(1)));
        assert_eq!(Some(1), engine.release_count(plan));
    }

    #[test]
    fn shutdown_releases_and_disables() {
        let (engine, cache) = cache();
        let plan = cache
            .get_or_build(ChunkId::new(1), ChunkTimeRange::open(), || statement("a"))
            .unwrap();
        cache.shutdown();
        cache.shutdown();
        cache.invalidate();
        assert_eq!(Some(1), engine.release_count(plan));
        assert!(matches!(
            cache.get_or_build(ChunkId::new(1), ChunkTimeRange::open(), || statement("a")),
            Err(Error::ShutDown)
        ));
        assert_eq!(0, cache.stats().entries);
    }

    proptest! {
        #[test]
        fn replaced_plans_are_released_exactly_once(
            lookups in prop::collection::vec((1i32..4, 0i64..3, 0i64..3), 1..60),
        ) {
            let (engine, cache) = cache();
            let mut current: HashMap<ChunkId, (ChunkTimeRange, PlanHandle)> = HashMap::new();
            let mut replaced = Vec::new();

            for (id, start, len) in lookups {
                let id = ChunkId::new(id);
                let range = ChunkTimeRange::bounded(start, start + len);
                let plan = cache.get_or_build(id, range, || statement("a")).unwrap();
                match current.insert(id, (range, plan)) {
                    Some((old_range, old_plan)) if old_range == range => {
                        prop_assert_eq!(old_plan, plan);
                    }
                    Some((_, old_plan)) => {
                        prop_assert_ne!(old_plan, plan);
                        replaced.push(old_plan);
                    }
                    None => {}
                }
            }

            for plan in &replaced {
                prop_assert_eq!(Some(1), engine.release_count(*plan));
            }
            let mut live: Vec<_> = current.values().map(|(_, plan)| *plan).collect();
            live.sort();
            let mut engine_live = engine.live_plans();
            engine_live.sort();
            prop_assert_eq!(live, engine_live);

            let stats = cache.stats();
            prop_assert_eq!(current.len() as u64, stats.misses);
            prop_assert_eq!(replaced.len() as u64, stats.rebuilds);
            prop_assert_eq!(engine.prepare_count() as u64, stats.misses + stats.rebuilds);
        }
    }
}
