//! Config for the chunk insert-plan cache.

/// What to do when a chunk routes to no destination tables.
///
/// A movement statement for such a chunk still deletes the matching rows from the staging table
/// but inserts them nowhere, so the staged rows are discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum EmptyDestinationPolicy {
    /// Build the statement anyway and log a warning.
    #[default]
    Warn,

    /// Refuse to build the statement.
    Reject,
}

/// CLI config for the chunk insert-plan cache.
#[derive(Debug, Clone, clap::Parser)]
#[allow(missing_copy_implementations)]
pub struct ChunkCacheConfig {
    /// Number of entries the plan cache allocates room for up front, and again after every
    /// invalidation.
    #[clap(
        long = "chunk-cache-initial-capacity",
        env = "HYPERTABLE_CHUNK_CACHE_INITIAL_CAPACITY",
        default_value = "16",
        action
    )]
    pub initial_capacity: usize,

    /// How many times a chunk lookup is retried after losing a race to create an overlapping
    /// chunk.
    #[clap(
        long = "chunk-create-conflict-retries",
        env = "HYPERTABLE_CHUNK_CREATE_CONFLICT_RETRIES",
        default_value = "3",
        action
    )]
    pub create_conflict_retries: usize,

    /// Behaviour when a chunk has no destination tables to move staged rows into.
    #[clap(
        long = "chunk-cache-empty-destination-policy",
        env = "HYPERTABLE_CHUNK_CACHE_EMPTY_DESTINATION_POLICY",
        default_value_t = EmptyDestinationPolicy::default(),
        value_enum,
        action
    )]
    pub empty_destination_policy: EmptyDestinationPolicy,
}

impl Default for ChunkCacheConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 16,
            create_conflict_retries: 3,
            empty_destination_policy: EmptyDestinationPolicy::default(),
        }
    }
}
