//! Identifier newtypes shared by the hypertable catalog and the chunk insert-plan cache.
//!
//! All identifiers are assigned by the catalog. They wrap an `i32` so that they line up with the
//! integer keys of the catalog tables they come from.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

macro_rules! catalog_identifier_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
        #[serde(transparent)]
        pub struct $name(i32);

        impl $name {
            pub const fn new(v: i32) -> Self {
                Self(v)
            }

            /// The identifier that follows this one in allocation order
            pub fn next(&self) -> Self {
                Self(
                    self.0
                        .checked_add(1)
                        .expect(concat!("Overflowed with ", stringify!($name), "s")),
                )
            }

            pub const fn get(&self) -> i32 {
                self.0
            }
        }

        impl From<i32> for $name {
            fn from(value: i32) -> Self {
                Self(value)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

catalog_identifier_type!(
    /// Identifies a hypertable, i.e., the logical time-partitioned table
    HypertableId
);

catalog_identifier_type!(
    /// Identifies an epoch, the span of time over which one partitioning scheme applies
    EpochId
);

catalog_identifier_type!(
    /// Identifies a keyspace partition within an epoch
    PartitionId
);

catalog_identifier_type!(
    /// Identifies a chunk; stable for the lifetime of the chunk
    ChunkId
);
