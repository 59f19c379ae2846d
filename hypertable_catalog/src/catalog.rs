//! Metadata records describing hypertables, their epochs and partitions, and chunks.

use std::{fmt::Display, sync::Arc};

use hypertable_id::{ChunkId, EpochId, HypertableId, PartitionId};
use serde::{Deserialize, Serialize};

use crate::time::TimeColumnType;

/// Schema holding the staging tables created for each hypertable
pub const INTERNAL_SCHEMA_NAME: &str = "_hypertable_internal";

/// A schema-qualified table reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema_name: Arc<str>,
    pub table_name: Arc<str>,
}

impl TableRef {
    pub fn new(schema_name: impl Into<Arc<str>>, table_name: impl Into<Arc<str>>) -> Self {
        Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
        }
    }
}

impl Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema_name, self.table_name)
    }
}

/// Time-series metadata for a hypertable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hypertable {
    pub id: HypertableId,
    pub schema_name: Arc<str>,
    pub table_name: Arc<str>,
    pub time_column_name: Arc<str>,
    pub time_column_type: TimeColumnType,
    /// Width, in internal time units, of chunks created for this hypertable
    pub chunk_time_interval: i64,
}

impl Hypertable {
    /// The staging table that ingested rows land in before they are moved into chunks
    pub fn staging_table(&self) -> TableRef {
        TableRef::new(INTERNAL_SCHEMA_NAME, format!("_hyper_{}_copy_t", self.id))
    }
}

/// The partitioning function applied to the partitioning column of an epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitioningFunc {
    pub schema_name: Arc<str>,
    pub name: Arc<str>,
    /// The function maps every value into `[0, modulo)`
    pub modulo: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partitioning {
    pub column_name: Arc<str>,
    pub func: PartitioningFunc,
}

/// A span of time over which one partitioning scheme applies to a hypertable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub id: EpochId,
    pub hypertable_id: HypertableId,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub num_partitions: i16,
    /// Always set when `num_partitions > 1`
    pub partitioning: Option<Partitioning>,
}

/// A keyspace slice within an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    pub epoch_id: EpochId,
    pub keyspace_start: i32,
    pub keyspace_end: i32,
}

/// Inclusive time bounds of a chunk. `None` marks an open bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkTimeRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl ChunkTimeRange {
    pub const fn new(start: Option<i64>, end: Option<i64>) -> Self {
        Self { start, end }
    }

    pub const fn bounded(start: i64, end: i64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// A range open on both ends
    pub const fn open() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    pub fn contains(&self, timepoint: i64) -> bool {
        self.start.is_none_or(|start| timepoint >= start)
            && self.end.is_none_or(|end| timepoint <= end)
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        let starts_before_other_ends = match (self.start, other.end) {
            (Some(start), Some(end)) => start <= end,
            _ => true,
        };
        let ends_after_other_starts = match (self.end, other.start) {
            (Some(end), Some(start)) => end >= start,
            _ => true,
        };
        starts_before_other_ends && ends_after_other_starts
    }

    /// Whether the range is non-empty, i.e., its start does not come after its end
    pub fn is_valid(&self) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start <= end,
            _ => true,
        }
    }
}

impl Display for ChunkTimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.start {
            Some(start) => write!(f, "[{start}, ")?,
            None => write!(f, "(-inf, ")?,
        }
        match self.end {
            Some(end) => write!(f, "{end}]"),
            None => write!(f, "+inf)"),
        }
    }
}

/// A bounded time region of one partition of a hypertable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub partition_id: PartitionId,
    pub range: ChunkTimeRange,
}
