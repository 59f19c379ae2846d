//! Config for the in-process chunk catalog.

use std::time::Duration;

/// CLI config for the chunk catalog.
#[derive(Debug, Clone, clap::Parser)]
#[allow(missing_copy_implementations)]
pub struct ChunkCatalogConfig {
    /// How long a chunk lookup that takes a share lock waits for a concurrent bound update on the
    /// same chunk before giving up.
    #[clap(
        long = "chunk-lock-wait-timeout",
        env = "HYPERTABLE_CHUNK_LOCK_WAIT_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub lock_wait_timeout: Duration,
}

impl Default for ChunkCatalogConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_timeout() {
        let config = ChunkCatalogConfig::parse_from(["test"]);
        assert_eq!(Duration::from_secs(5), config.lock_wait_timeout);
    }

    #[test]
    fn humantime_timeout() {
        let config = ChunkCatalogConfig::parse_from(["test", "--chunk-lock-wait-timeout", "250ms"]);
        assert_eq!(Duration::from_millis(250), config.lock_wait_timeout);
    }
}
