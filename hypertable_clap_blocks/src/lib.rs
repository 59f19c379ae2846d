//! Building blocks for [`clap`]-driven configuration of the hypertable chunk catalog and the
//! chunk insert-plan cache.

pub mod catalog;
pub mod chunk_cache;
