//! Cache of compiled plans that move staged rows into hypertable chunks.
//!
//! [`ChunkInsertPlanCache`] is the entry point: given a partition and a point in time it resolves
//! (or creates) the owning chunk through the catalog and returns a compiled movement plan for that
//! chunk. Plans are compiled once per chunk and reused until the chunk's bounds change or the
//! catalog signals that routing or schema changed.

use std::time::Duration;

use hypertable_id::{ChunkId, PartitionId};

pub mod engine;
pub mod insert_sql;
pub mod plan_cache;
pub mod provider;

pub use engine::{EngineError, MemPlanEngine, PlanEngine, PlanHandle, PreparedPlan};
pub use insert_sql::{
    BuildContext, InsertStatement, InsertStatementBuilder, build_insert_statement,
    quote_identifier,
};
pub use plan_cache::{PlanCache, PlanCacheEntry, PlanCacheStats};
pub use provider::{ChunkInsertPlanCache, INVALIDATION_SUBSCRIBER_NAME, MovementPlan};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "an overlapping chunk was created concurrently in partition {partition_id} for time {timepoint}"
    )]
    ChunkCreateConflict {
        partition_id: PartitionId,
        timepoint: i64,
    },

    #[error("failed to compile movement plan for chunk {chunk_id}: {reason}")]
    CompileError { chunk_id: ChunkId, reason: String },

    #[error("another plan cache is already subscribed to the catalog as {name}")]
    DuplicateSubscription { name: String },

    #[error("metadata lookup failed: {source}")]
    MetadataLookupFailure { source: hypertable_catalog::Error },

    #[error("timed out after {waited:?} waiting for a lock on chunk {chunk_id}")]
    LockTimeout { chunk_id: ChunkId, waited: Duration },

    #[error("chunk {0} has no destination tables")]
    NoDestinationTables(ChunkId),

    #[error("the chunk insert plan cache has been shut down")]
    ShutDown,
}

impl From<hypertable_catalog::Error> for Error {
    fn from(e: hypertable_catalog::Error) -> Self {
        match e {
            hypertable_catalog::Error::ChunkCreateConflict {
                partition_id,
                timepoint,
            } => Self::ChunkCreateConflict {
                partition_id,
                timepoint,
            },
            hypertable_catalog::Error::LockTimeout { chunk_id, waited } => {
                Self::LockTimeout { chunk_id, waited }
            }
            hypertable_catalog::Error::DuplicateSubscription { name } => {
                Self::DuplicateSubscription { name }
            }
            source => Self::MetadataLookupFailure { source },
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
