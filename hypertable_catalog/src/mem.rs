//! This module implements an in-memory implementation of the catalog interfaces. It can be used
//! for testing or for a process that keeps chunk metadata without persistence.

use std::{
    fmt::Formatter,
    sync::{Arc, Weak},
    time::Duration,
};

use hashbrown::{HashMap, HashSet};
use hypertable_clap_blocks::catalog::ChunkCatalogConfig;
use hypertable_id::{ChunkId, EpochId, HypertableId, PartitionId};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    Chunk, ChunkDirectory, ChunkRouting, ChunkTimeRange, Epoch, Error, Hypertable,
    InvalidationListener, InvalidationSource, Partition, Partitioning, RelationLookup, Result,
    RowLockMode, TableRef, TimeColumnType,
    lock::{ChunkLocks, ChunkShareGuard, ResolvedChunk},
    subscription::InvalidationSubscriptions,
};

/// Keyspace used by epochs that have no partitioning function
const DEFAULT_KEYSPACE_SIZE: i32 = 32_768;

#[derive(Debug)]
struct InnerCatalog {
    hypertables: HashMap<HypertableId, Arc<Hypertable>>,
    epochs: HashMap<EpochId, Arc<Epoch>>,
    partitions: HashMap<PartitionId, Partition>,
    chunks: Vec<Chunk>,
    /// Destination tables per chunk, in insertion order
    replicas: HashMap<ChunkId, Vec<TableRef>>,
    relations: HashSet<TableRef>,
    next_hypertable_id: HypertableId,
    next_epoch_id: EpochId,
    next_partition_id: PartitionId,
    next_chunk_id: ChunkId,
}

impl InnerCatalog {
    fn new() -> Self {
        Self {
            hypertables: HashMap::new(),
            epochs: HashMap::new(),
            partitions: HashMap::new(),
            chunks: Vec::new(),
            replicas: HashMap::new(),
            relations: HashSet::new(),
            next_hypertable_id: HypertableId::new(1),
            next_epoch_id: EpochId::new(1),
            next_partition_id: PartitionId::new(1),
            next_chunk_id: ChunkId::new(1),
        }
    }

    fn partition_chunks(&self, partition_id: PartitionId) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter(move |c| c.partition_id == partition_id)
    }

    fn find_chunk(&self, partition_id: PartitionId, timepoint: i64) -> Option<Chunk> {
        self.partition_chunks(partition_id)
            .find(|c| c.range.contains(timepoint))
            .copied()
    }

    /// Check `range` against all chunks in the partition other than `exclude`
    fn check_overlap(
        &self,
        partition_id: PartitionId,
        range: ChunkTimeRange,
        exclude: Option<ChunkId>,
    ) -> Result<()> {
        if !range.is_valid() {
            return Err(Error::InvalidChunkBounds(range));
        }
        match self
            .partition_chunks(partition_id)
            .find(|c| Some(c.id) != exclude && c.range.overlaps(&range))
        {
            Some(existing) => Err(Error::ChunkBoundsOverlap {
                partition_id,
                range,
                existing: existing.id,
            }),
            None => Ok(()),
        }
    }

    fn push_chunk(&mut self, partition_id: PartitionId, range: ChunkTimeRange) -> Chunk {
        let id = self.next_chunk_id;
        self.next_chunk_id = id.next();
        let chunk = Chunk {
            id,
            partition_id,
            range,
        };
        self.chunks.push(chunk);
        chunk
    }
}

/// In-memory catalog implementing [`ChunkDirectory`], [`ChunkRouting`], [`InvalidationSource`]
/// and [`RelationLookup`], along with the administrative operations that create the metadata
/// those traits read.
pub struct MemCatalog {
    inner: RwLock<InnerCatalog>,
    locks: Arc<ChunkLocks>,
    subscriptions: Mutex<InvalidationSubscriptions>,
    lock_wait_timeout: Duration,
}

impl std::fmt::Debug for MemCatalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemCatalog").finish_non_exhaustive()
    }
}

impl Default for MemCatalog {
    fn default() -> Self {
        Self::new(&ChunkCatalogConfig::default())
    }
}

impl MemCatalog {
    pub fn new(config: &ChunkCatalogConfig) -> Self {
        Self {
            inner: RwLock::new(InnerCatalog::new()),
            locks: Default::default(),
            subscriptions: Default::default(),
            lock_wait_timeout: config.lock_wait_timeout,
        }
    }

    /// Create a hypertable and register its staging table as a relation
    pub fn create_hypertable(
        &self,
        schema_name: &str,
        table_name: &str,
        time_column_name: &str,
        time_column_type: TimeColumnType,
        chunk_time_interval: i64,
    ) -> Result<Arc<Hypertable>> {
        if chunk_time_interval <= 0 {
            return Err(Error::InvalidChunkInterval(chunk_time_interval));
        }
        let mut inner = self.inner.write();
        let id = inner.next_hypertable_id;
        inner.next_hypertable_id = id.next();
        let hypertable = Arc::new(Hypertable {
            id,
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            time_column_name: time_column_name.into(),
            time_column_type,
            chunk_time_interval,
        });
        inner.relations.insert(hypertable.staging_table());
        inner.hypertables.insert(id, Arc::clone(&hypertable));
        info!(hypertable_id = %id, schema_name, table_name, "created hypertable");
        Ok(hypertable)
    }

    /// Create an epoch for a hypertable, splitting the partitioning keyspace evenly across
    /// `num_partitions` partitions.
    pub fn create_epoch(
        &self,
        hypertable_id: HypertableId,
        start_time: Option<i64>,
        end_time: Option<i64>,
        num_partitions: i16,
        partitioning: Option<Partitioning>,
    ) -> Result<(Arc<Epoch>, Vec<Partition>)> {
        if num_partitions < 1 {
            return Err(Error::invalid_epoch(format!(
                "partition count must be at least 1, got {num_partitions}"
            )));
        }
        if !ChunkTimeRange::new(start_time, end_time).is_valid() {
            return Err(Error::invalid_epoch("epoch starts after it ends"));
        }
        let keyspace_size = match &partitioning {
            Some(p) if p.func.modulo < i32::from(num_partitions) => {
                return Err(Error::invalid_epoch(format!(
                    "modulo {} is smaller than the partition count {num_partitions}",
                    p.func.modulo
                )));
            }
            Some(p) => p.func.modulo,
            None if num_partitions > 1 => {
                return Err(Error::invalid_epoch(
                    "an epoch with more than one partition needs a partitioning function",
                ));
            }
            None => DEFAULT_KEYSPACE_SIZE,
        };

        let mut inner = self.inner.write();
        if !inner.hypertables.contains_key(&hypertable_id) {
            return Err(Error::HypertableNotFound(hypertable_id));
        }
        let id = inner.next_epoch_id;
        inner.next_epoch_id = id.next();
        let epoch = Arc::new(Epoch {
            id,
            hypertable_id,
            start_time,
            end_time,
            num_partitions,
            partitioning,
        });
        inner.epochs.insert(id, Arc::clone(&epoch));

        let n = i64::from(num_partitions);
        let size = i64::from(keyspace_size);
        let mut partitions = Vec::with_capacity(num_partitions as usize);
        for i in 0..n {
            let partition_id = inner.next_partition_id;
            inner.next_partition_id = partition_id.next();
            // both bounds lie in [0, keyspace_size) so the casts cannot truncate
            let partition = Partition {
                id: partition_id,
                epoch_id: id,
                keyspace_start: (i * size / n) as i32,
                keyspace_end: ((i + 1) * size / n - 1) as i32,
            };
            inner.partitions.insert(partition_id, partition);
            partitions.push(partition);
        }
        info!(epoch_id = %id, hypertable_id = %hypertable_id, num_partitions, "created epoch");
        Ok((epoch, partitions))
    }

    pub fn hypertable(&self, id: HypertableId) -> Option<Arc<Hypertable>> {
        self.inner.read().hypertables.get(&id).map(Arc::clone)
    }

    pub fn epoch(&self, id: EpochId) -> Option<Arc<Epoch>> {
        self.inner.read().epochs.get(&id).map(Arc::clone)
    }

    pub fn partition(&self, id: PartitionId) -> Option<Partition> {
        self.inner.read().partitions.get(&id).copied()
    }

    pub fn get_chunk(&self, id: ChunkId) -> Option<Chunk> {
        self.inner.read().chunks.iter().find(|c| c.id == id).copied()
    }

    /// All chunks of a partition, ordered by start time with an open start first
    pub fn chunks_in_partition(&self, partition_id: PartitionId) -> Vec<Chunk> {
        let mut chunks: Vec<_> = self
            .inner
            .read()
            .partition_chunks(partition_id)
            .copied()
            .collect();
        chunks.sort_by_key(|c| c.range.start);
        chunks
    }

    /// Insert a chunk with explicit bounds, as the external chunk-management process does
    pub fn insert_chunk(&self, partition_id: PartitionId, range: ChunkTimeRange) -> Result<Chunk> {
        let mut inner = self.inner.write();
        if !inner.partitions.contains_key(&partition_id) {
            return Err(Error::PartitionNotFound(partition_id));
        }
        inner.check_overlap(partition_id, range, None)?;
        let chunk = inner.push_chunk(partition_id, range);
        info!(chunk_id = %chunk.id, partition_id = %partition_id, %range, "inserted chunk");
        Ok(chunk)
    }

    /// Take an exclusive lock on a chunk record so that its bounds can be changed.
    ///
    /// Waits until every share lock handed out by a lookup of the chunk has been dropped, up to the
    /// lock wait timeout.
    pub fn lock_chunk_for_update(&self, chunk_id: ChunkId) -> Result<ChunkUpdateGuard<'_>> {
        if self.get_chunk(chunk_id).is_none() {
            return Err(Error::ChunkNotFound(chunk_id));
        }
        self.locks.lock_exclusive(chunk_id, self.lock_wait_timeout)?;
        Ok(ChunkUpdateGuard {
            catalog: self,
            chunk_id,
        })
    }

    /// Route rows of `chunk_id` to `table` as well, registering `table` as a relation.
    ///
    /// Notifies invalidation subscribers, since plans built for the chunk no longer write to
    /// every destination.
    pub fn add_chunk_replica(&self, chunk_id: ChunkId, table: TableRef) -> Result<()> {
        {
            let mut inner = self.inner.write();
            if !inner.chunks.iter().any(|c| c.id == chunk_id) {
                return Err(Error::ChunkNotFound(chunk_id));
            }
            inner.relations.insert(table.clone());
            let tables = inner.replicas.entry(chunk_id).or_default();
            if tables.contains(&table) {
                return Ok(());
            }
            info!(chunk_id = %chunk_id, %table, "added chunk replica");
            tables.push(table);
        }
        self.notify_invalidation();
        Ok(())
    }

    /// Stop routing rows of `chunk_id` to `table`. The relation is dropped once no chunk routes to
    /// it any more.
    ///
    /// Returns whether the chunk was routed to `table`. Notifies invalidation subscribers if so,
    /// since compiled plans may still reference the dropped relation.
    pub fn drop_chunk_replica(&self, chunk_id: ChunkId, table: &TableRef) -> Result<bool> {
        {
            let mut inner = self.inner.write();
            if !inner.chunks.iter().any(|c| c.id == chunk_id) {
                return Err(Error::ChunkNotFound(chunk_id));
            }
            let Some(tables) = inner.replicas.get_mut(&chunk_id) else {
                return Ok(false);
            };
            let before = tables.len();
            tables.retain(|t| t != table);
            if tables.len() == before {
                return Ok(false);
            }
            if !inner.replicas.values().any(|tables| tables.contains(table)) {
                inner.relations.remove(table);
            }
            info!(chunk_id = %chunk_id, %table, "dropped chunk replica");
        }
        self.notify_invalidation();
        Ok(true)
    }

    /// Signal every subscriber that cached artifacts derived from this catalog are stale.
    ///
    /// Listeners are called after the subscription lock is released, so they may call back
    /// into the catalog.
    pub fn notify_invalidation(&self) {
        let listeners = self.subscriptions.lock().live_listeners();
        debug!(n_listeners = listeners.len(), "notifying invalidation listeners");
        for listener in listeners {
            listener.invalidate_cached_plans();
        }
    }

    /// Create the chunk covering `timepoint` in a partition that has no chunk containing it.
    ///
    /// New chunks are aligned to the hypertable's chunk time interval, clamped to the epoch,
    /// and trimmed against neighbouring chunks so that bounds never overlap.
    pub(crate) fn create_chunk(&self, partition_id: PartitionId, timepoint: i64) -> Result<Chunk> {
        let mut inner = self.inner.write();
        let partition = inner
            .partitions
            .get(&partition_id)
            .copied()
            .ok_or(Error::PartitionNotFound(partition_id))?;
        let epoch = inner
            .epochs
            .get(&partition.epoch_id)
            .map(Arc::clone)
            .ok_or(Error::EpochNotFound(partition.epoch_id))?;
        let interval = inner
            .hypertables
            .get(&epoch.hypertable_id)
            .map(|h| h.chunk_time_interval)
            .ok_or(Error::HypertableNotFound(epoch.hypertable_id))?;

        if !ChunkTimeRange::new(epoch.start_time, epoch.end_time).contains(timepoint) {
            return Err(Error::TimeOutsideEpoch {
                epoch_id: epoch.id,
                timepoint,
            });
        }
        // someone created it between our scan and taking the write lock
        if inner.find_chunk(partition_id, timepoint).is_some() {
            return Err(Error::ChunkCreateConflict {
                partition_id,
                timepoint,
            });
        }

        let range = new_chunk_range(
            timepoint,
            interval,
            &epoch,
            inner.partition_chunks(partition_id),
        );
        let chunk = inner.push_chunk(partition_id, range);
        info!(chunk_id = %chunk.id, partition_id = %partition_id, %range, "created chunk");
        Ok(chunk)
    }
}

fn new_chunk_range<'a>(
    timepoint: i64,
    interval: i64,
    epoch: &Epoch,
    neighbours: impl Iterator<Item = &'a Chunk>,
) -> ChunkTimeRange {
    let aligned = timepoint.div_euclid(interval).saturating_mul(interval);
    let mut start = epoch.start_time.map_or(aligned, |s| aligned.max(s));
    let mut end = aligned.saturating_add(interval - 1);
    if let Some(e) = epoch.end_time {
        end = end.min(e);
    }

    // none of the neighbours contain `timepoint`, so each lies entirely before or after it
    for chunk in neighbours {
        match (chunk.range.start, chunk.range.end) {
            (_, Some(e)) if e < timepoint => start = start.max(e + 1),
            (Some(s), _) if s > timepoint => end = end.min(s - 1),
            _ => {}
        }
    }
    ChunkTimeRange::bounded(start, end)
}

impl ChunkDirectory for MemCatalog {
    fn resolve_or_create(
        &self,
        partition_id: PartitionId,
        timepoint: i64,
        lock: RowLockMode,
    ) -> Result<ResolvedChunk> {
        loop {
            let found = {
                let inner = self.inner.read();
                if !inner.partitions.contains_key(&partition_id) {
                    return Err(Error::PartitionNotFound(partition_id));
                }
                inner.find_chunk(partition_id, timepoint)
            };
            let chunk = match found {
                Some(chunk) => chunk,
                None => match self.create_chunk(partition_id, timepoint) {
                    Ok(chunk) => chunk,
                    Err(Error::ChunkCreateConflict { .. }) => {
                        debug!(
                            partition_id = %partition_id,
                            timepoint,
                            "chunk created concurrently, rescanning"
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            match lock {
                RowLockMode::None => return Ok(ResolvedChunk::unlocked(chunk)),
                RowLockMode::Shared => {
                    self.locks.lock_shared(chunk.id, self.lock_wait_timeout)?;
                    let share_lock = ChunkShareGuard::new(Arc::clone(&self.locks) as _, chunk.id);
                    match self.get_chunk(chunk.id) {
                        Some(current) if current.range.contains(timepoint) => {
                            return Ok(ResolvedChunk {
                                chunk: current,
                                share_lock: Some(share_lock),
                            });
                        }
                        // the bounds moved away from `timepoint` while we waited
                        _ => debug!(
                            chunk_id = %chunk.id,
                            timepoint,
                            "chunk bounds changed during lookup, rescanning"
                        ),
                    }
                }
            }
        }
    }
}

impl ChunkRouting for MemCatalog {
    fn destination_tables(&self, chunk_id: ChunkId) -> Result<Vec<TableRef>> {
        let inner = self.inner.read();
        if !inner.chunks.iter().any(|c| c.id == chunk_id) {
            return Err(Error::ChunkNotFound(chunk_id));
        }
        Ok(inner.replicas.get(&chunk_id).cloned().unwrap_or_default())
    }
}

impl InvalidationSource for MemCatalog {
    fn subscribe_invalidation(
        &self,
        name: &str,
        listener: Weak<dyn InvalidationListener>,
    ) -> Result<()> {
        self.subscriptions.lock().subscribe(name, listener)
    }

    fn unsubscribe_invalidation(&self, name: &str) -> bool {
        self.subscriptions.lock().unsubscribe(name)
    }
}

impl RelationLookup for MemCatalog {
    fn relation_exists(&self, table: &TableRef) -> bool {
        self.inner.read().relations.contains(table)
    }
}

/// Exclusive lock on a chunk record, released on drop
#[derive(Debug)]
pub struct ChunkUpdateGuard<'a> {
    catalog: &'a MemCatalog,
    chunk_id: ChunkId,
}

impl ChunkUpdateGuard<'_> {
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Narrow or widen the chunk's bounds. The new bounds may not overlap another chunk in the
    /// same partition.
    pub fn set_bounds(&self, range: ChunkTimeRange) -> Result<Chunk> {
        let mut inner = self.catalog.inner.write();
        let partition_id = inner
            .chunks
            .iter()
            .find(|c| c.id == self.chunk_id)
            .map(|c| c.partition_id)
            .ok_or(Error::ChunkNotFound(self.chunk_id))?;
        inner.check_overlap(partition_id, range, Some(self.chunk_id))?;
        let chunk = inner
            .chunks
            .iter_mut()
            .find(|c| c.id == self.chunk_id)
            .ok_or(Error::ChunkNotFound(self.chunk_id))?;
        let old = chunk.range;
        chunk.range = range;
        info!(chunk_id = %self.chunk_id, %old, new = %range, "changed chunk bounds");
        Ok(*chunk)
    }
}

impl Drop for ChunkUpdateGuard<'_> {
    fn drop(&mut self) {
        self.catalog.locks.unlock_exclusive(self.chunk_id);
    }
}
