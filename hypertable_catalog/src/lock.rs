//! Row-level locking of chunk records.

use std::{
    fmt::Debug,
    sync::Arc,
    time::{Duration, Instant},
};

use hashbrown::HashMap;
use hypertable_id::ChunkId;
use parking_lot::{Condvar, Mutex};

use crate::{Chunk, Error, Result};

/// How a chunk lookup synchronizes with concurrent changes to the chunk's bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLockMode {
    /// Take a share lock on the chunk record and hand it to the caller in a [`ChunkShareGuard`].
    /// The lookup waits for any exclusive holder (a bound update) to finish, and bound updates
    /// wait until the guard is dropped, so the bounds returned stay the committed ones for as
    /// long as the caller holds the guard.
    Shared,
    /// Take no lock. The caller accepts that the bounds may change under it.
    None,
}

/// Releases share locks handed out with a resolved chunk
pub trait ShareLockRelease: Debug + Send + Sync + 'static {
    fn unlock_shared(&self, chunk_id: ChunkId);
}

/// A share lock on a chunk record, released on drop
#[derive(Debug)]
pub struct ChunkShareGuard {
    locks: Arc<dyn ShareLockRelease>,
    chunk_id: ChunkId,
}

impl ChunkShareGuard {
    /// Wrap a share lock on `chunk_id` that the caller already holds in `locks`
    pub fn new(locks: Arc<dyn ShareLockRelease>, chunk_id: ChunkId) -> Self {
        Self { locks, chunk_id }
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }
}

impl Drop for ChunkShareGuard {
    fn drop(&mut self) {
        self.locks.unlock_shared(self.chunk_id);
    }
}

/// The chunk found or created by a lookup, along with the share lock taken under
/// [`RowLockMode::Shared`]
#[derive(Debug)]
pub struct ResolvedChunk {
    pub chunk: Chunk,
    pub share_lock: Option<ChunkShareGuard>,
}

impl ResolvedChunk {
    pub fn unlocked(chunk: Chunk) -> Self {
        Self {
            chunk,
            share_lock: None,
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    exclusive: hashbrown::HashSet<ChunkId>,
    shared: HashMap<ChunkId, usize>,
}

impl LockState {
    fn shared_holders(&self, chunk_id: ChunkId) -> usize {
        self.shared.get(&chunk_id).copied().unwrap_or_default()
    }
}

/// Lock table for chunk records
#[derive(Debug, Default)]
pub(crate) struct ChunkLocks {
    state: Mutex<LockState>,
    released: Condvar,
}

impl ChunkLocks {
    pub(crate) fn lock_shared(&self, chunk_id: ChunkId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.exclusive.contains(&chunk_id) {
            if self.released.wait_until(&mut state, deadline).timed_out()
                && state.exclusive.contains(&chunk_id)
            {
                return Err(Error::LockTimeout {
                    chunk_id,
                    waited: timeout,
                });
            }
        }
        *state.shared.entry(chunk_id).or_default() += 1;
        Ok(())
    }

    pub(crate) fn lock_exclusive(&self, chunk_id: ChunkId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.exclusive.contains(&chunk_id) || state.shared_holders(chunk_id) > 0 {
            if self.released.wait_until(&mut state, deadline).timed_out()
                && (state.exclusive.contains(&chunk_id) || state.shared_holders(chunk_id) > 0)
            {
                return Err(Error::LockTimeout {
                    chunk_id,
                    waited: timeout,
                });
            }
        }
        state.exclusive.insert(chunk_id);
        Ok(())
    }

    pub(crate) fn unlock_exclusive(&self, chunk_id: ChunkId) {
        self.state.lock().exclusive.remove(&chunk_id);
        self.released.notify_all();
    }
}

impl ShareLockRelease for ChunkLocks {
    fn unlock_shared(&self, chunk_id: ChunkId) {
        let mut state = self.state.lock();
        if let Some(holders) = state.shared.get_mut(&chunk_id) {
            *holders -= 1;
            if *holders == 0 {
                state.shared.remove(&chunk_id);
            }
        }
        self.released.notify_all();
    }
}
