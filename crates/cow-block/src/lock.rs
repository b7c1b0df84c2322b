//! Per-identifier locking and read pinning.
//!
//! `LockTable` serializes read-check-modify sequences on a single identifier;
//! operations on distinct identifiers never share a mutex. Entries are created
//! on demand and dropped once no guard refers to them.
//!
//! `PinTable` tracks in-flight reads. Reclamation only proceeds on an
//! identifier with no pinned readers, and once it starts new pins are refused.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::ident::BlockId;

#[derive(Default)]
pub(crate) struct LockTable {
    locks: DashMap<BlockId, Arc<Mutex<()>>>,
}

pub(crate) struct IdGuard<'a> {
    table: &'a LockTable,
    id: BlockId,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl LockTable {
    pub fn lock(&self, id: BlockId) -> IdGuard<'_> {
        let mutex = self.handle(id);
        IdGuard {
            table: self,
            id,
            guard: Some(mutex.lock_arc()),
        }
    }

    /// Like `lock`, but gives up immediately if the identifier is busy.
    pub fn try_lock(&self, id: BlockId) -> Option<IdGuard<'_>> {
        let mutex = self.handle(id);
        let attempt = mutex.try_lock_arc();
        match attempt {
            Some(guard) => Some(IdGuard {
                table: self,
                id,
                guard: Some(guard),
            }),
            None => {
                drop(mutex);
                self.evict(&id);
                None
            }
        }
    }

    /// Number of identifiers with a live mutex.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    fn handle(&self, id: BlockId) -> Arc<Mutex<()>> {
        // Cloned under the shard lock so `evict` can never race a new holder.
        Arc::clone(self.locks.entry(id).or_default().value())
    }

    fn evict(&self, id: &BlockId) {
        self.locks
            .remove_if(id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.table.evict(&self.id);
    }
}

#[derive(Default)]
struct PinState {
    readers: usize,
    reclaiming: bool,
}

#[derive(Default)]
pub(crate) struct PinTable {
    pins: DashMap<BlockId, PinState>,
}

pub(crate) struct PinGuard<'a> {
    table: &'a PinTable,
    id: BlockId,
}

pub(crate) struct ReclaimGuard<'a> {
    table: &'a PinTable,
    id: BlockId,
}

impl PinTable {
    /// Register a reader; `None` if the block is already being reclaimed.
    pub fn pin(&self, id: BlockId) -> Option<PinGuard<'_>> {
        let mut state = self.pins.entry(id).or_default();
        if state.reclaiming {
            return None;
        }
        state.readers += 1;
        Some(PinGuard { table: self, id })
    }

    /// Claim the block for reclamation; `None` while readers hold it.
    pub fn begin_reclaim(&self, id: BlockId) -> Option<ReclaimGuard<'_>> {
        let mut state = self.pins.entry(id).or_default();
        if state.readers > 0 {
            return None;
        }
        state.reclaiming = true;
        Some(ReclaimGuard { table: self, id })
    }

    #[cfg(test)]
    pub fn readers(&self, id: &BlockId) -> usize {
        self.pins.get(id).map(|s| s.readers).unwrap_or(0)
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut state) = self.table.pins.get_mut(&self.id) {
            state.readers -= 1;
        }
        self.table
            .pins
            .remove_if(&self.id, |_, s| s.readers == 0 && !s.reclaiming);
    }
}

impl Drop for ReclaimGuard<'_> {
    fn drop(&mut self) {
        self.table.pins.remove(&self.id);
    }
}
