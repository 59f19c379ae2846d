//! Catalog of hypertable metadata and chunk identity.
//!
//! This crate owns the records the chunk insert-plan cache reads: hypertables and their time
//! columns, epochs with their partitioning scheme, keyspace partitions, and the chunks that
//! subdivide each partition by time. The seams the cache consumes are expressed as traits
//! ([`ChunkDirectory`], [`ChunkRouting`], [`InvalidationSource`], [`RelationLookup`]) so that a
//! durable catalog can stand in for the in-memory [`MemCatalog`].

use std::{fmt::Debug, sync::Weak, time::Duration};

use hypertable_id::{ChunkId, EpochId, HypertableId, PartitionId};

pub mod catalog;
pub mod lock;
pub mod mem;
mod subscription;
pub mod time;

pub use catalog::{
    Chunk, ChunkTimeRange, Epoch, Hypertable, INTERNAL_SCHEMA_NAME, Partition, Partitioning,
    PartitioningFunc, TableRef,
};
pub use lock::{ChunkShareGuard, ResolvedChunk, RowLockMode, ShareLockRelease};
pub use mem::{ChunkUpdateGuard, MemCatalog};
pub use time::TimeColumnType;

#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    #[error("hypertable {0} not found")]
    HypertableNotFound(HypertableId),

    #[error("epoch {0} not found")]
    EpochNotFound(EpochId),

    #[error("partition {0} not found")]
    PartitionNotFound(PartitionId),

    #[error("chunk {0} not found")]
    ChunkNotFound(ChunkId),

    #[error(
        "an overlapping chunk was created concurrently in partition {partition_id} for time {timepoint}"
    )]
    ChunkCreateConflict {
        partition_id: PartitionId,
        timepoint: i64,
    },

    #[error("chunk bounds {range} overlap chunk {existing} in partition {partition_id}")]
    ChunkBoundsOverlap {
        partition_id: PartitionId,
        range: ChunkTimeRange,
        existing: ChunkId,
    },

    #[error("chunk bounds {0} are empty")]
    InvalidChunkBounds(ChunkTimeRange),

    #[error("time {timepoint} is outside of epoch {epoch_id}")]
    TimeOutsideEpoch { epoch_id: EpochId, timepoint: i64 },

    #[error("timed out after {waited:?} waiting for a lock on chunk {chunk_id}")]
    LockTimeout { chunk_id: ChunkId, waited: Duration },

    #[error("an invalidation listener is already subscribed as {name}")]
    DuplicateSubscription { name: String },

    #[error("invalid epoch: {reason}")]
    InvalidEpoch { reason: String },

    #[error("chunk time interval must be positive, got {0}")]
    InvalidChunkInterval(i64),

    #[error("time value {value} cannot be represented as {column_type}")]
    TimeLiteralOutOfRange {
        column_type: TimeColumnType,
        value: i64,
    },
}

impl Error {
    fn invalid_epoch(reason: impl Into<String>) -> Self {
        Self::InvalidEpoch {
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Finds the chunk that owns a point in time within a partition, creating it if need be.
pub trait ChunkDirectory: Debug + Send + Sync + 'static {
    /// Return the chunk of `partition_id` whose bounds contain `timepoint`, creating a new chunk
    /// that covers `timepoint` if there is none.
    ///
    /// With [`RowLockMode::Shared`] the lookup waits out any in-flight bound update on the chunk
    /// and returns a share lock with the chunk. Bound updates wait until the caller drops that
    /// lock. With [`RowLockMode::None`] the returned bounds may already be stale by the time the
    /// caller uses them.
    ///
    /// Fails with [`Error::ChunkCreateConflict`] if another caller created an overlapping chunk
    /// between the lookup and the insert; the caller should retry.
    fn resolve_or_create(
        &self,
        partition_id: PartitionId,
        timepoint: i64,
        lock: RowLockMode,
    ) -> Result<ResolvedChunk>;
}

/// Resolves the physical tables that rows of a chunk are written to.
pub trait ChunkRouting: Debug + Send + Sync + 'static {
    /// The destination tables for `chunk_id`, in a stable order. An empty list is not an error.
    fn destination_tables(&self, chunk_id: ChunkId) -> Result<Vec<TableRef>>;
}

/// Something that holds artifacts derived from catalog state and must drop them when that
/// state changes underneath it.
pub trait InvalidationListener: Send + Sync + 'static {
    fn invalidate_cached_plans(&self);
}

/// Delivers invalidation notifications, e.g., on DDL or routing changes.
pub trait InvalidationSource: Debug + Send + Sync + 'static {
    /// Register `listener` under `name`. Fails with [`Error::DuplicateSubscription`] if `name` is
    /// already subscribed, leaving that subscription in place.
    fn subscribe_invalidation(
        &self,
        name: &str,
        listener: Weak<dyn InvalidationListener>,
    ) -> Result<()>;

    /// Remove the subscription registered under `name`. Returns whether one was removed.
    fn unsubscribe_invalidation(&self, name: &str) -> bool;
}

/// Answers whether a relation exists, as a plan engine needs to when preparing a statement.
pub trait RelationLookup: Debug + Send + Sync + 'static {
    fn relation_exists(&self, table: &TableRef) -> bool;
}

/// The full set of catalog services the chunk insert-plan cache depends on.
pub trait ChunkCatalog: ChunkDirectory + ChunkRouting + InvalidationSource {}

impl<T> ChunkCatalog for T where T: ChunkDirectory + ChunkRouting + InvalidationSource {}
