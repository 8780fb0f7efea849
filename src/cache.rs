//! Resident-body cache with LRU eviction under a byte budget.
//!
//! The cache never owns node bodies; it tracks which identifiers currently
//! have one installed, how large it is and when it was last used. Eviction
//! empties the identifier's body slot, which is exactly the "reclaimed soft
//! reference" case every reader already handles by reloading from storage.
//!
//! An identifier is only passivated if its write lock can be taken without
//! waiting, so bodies in use by a reader or writer are never dropped from
//! under them. Dirty bodies (deferred write policy) are written back first.

use crate::error::Result;
use crate::identifier::{NodeId, NodeIdentifier};
use crate::node::Node;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing cache behaviour since creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub resident_nodes: usize,
    pub resident_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
}

impl CacheStats {
    /// Fraction of resolutions served without touching storage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot {
    ident: Arc<NodeIdentifier>,
    size: usize,
    tick: u64,
}

#[derive(Default)]
struct LruState {
    slots: FxHashMap<NodeId, Slot>,
    order: BTreeMap<u64, NodeId>,
    tick: u64,
    resident_bytes: usize,
}

pub struct NodeCache {
    state: Mutex<LruState>,
    max_bytes: usize,
    /// Only one thread runs an eviction sweep at a time.
    evicting: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
}

impl NodeCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(LruState::default()),
            max_bytes,
            evicting: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            write_backs: AtomicU64::new(0),
        }
    }

    /// Record that `ident` now has a resident body of `size` bytes.
    pub fn admit(&self, ident: &Arc<NodeIdentifier>, size: usize) {
        let mut guard = self.state.lock();
        let LruState {
            slots,
            order,
            tick,
            resident_bytes,
        } = &mut *guard;

        *tick += 1;
        match slots.get_mut(&ident.id()) {
            Some(slot) => {
                order.remove(&slot.tick);
                *resident_bytes -= slot.size;
                slot.size = size;
                slot.tick = *tick;
            }
            None => {
                slots.insert(
                    ident.id(),
                    Slot {
                        ident: Arc::clone(ident),
                        size,
                        tick: *tick,
                    },
                );
            }
        }
        order.insert(*tick, ident.id());
        *resident_bytes += size;
    }

    /// Mark a resident body as recently used.
    pub fn touch(&self, id: NodeId) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.state.lock();
        let LruState {
            slots, order, tick, ..
        } = &mut *guard;
        if let Some(slot) = slots.get_mut(&id) {
            *tick += 1;
            order.remove(&slot.tick);
            slot.tick = *tick;
            order.insert(*tick, id);
        }
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop tracking `id` (its body was dropped or the node was removed).
    pub fn forget(&self, id: NodeId) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.remove(&id) {
            state.order.remove(&slot.tick);
            state.resident_bytes -= slot.size;
        }
    }

    pub fn is_over_budget(&self) -> bool {
        self.state.lock().resident_bytes > self.max_bytes
    }

    /// Passivate least-recently-used bodies until the budget is met or no
    /// more candidates are free. Returns the number of bodies evicted.
    pub fn evict_over_budget<F>(&self, write_back: F) -> usize
    where
        F: Fn(&NodeIdentifier, &Node) -> Result<()>,
    {
        let Some(_sweep) = self.evicting.try_lock() else {
            return 0;
        };

        let mut evicted = 0;
        let mut skipped = FxHashSet::default();
        loop {
            let candidate = {
                let state = self.state.lock();
                if state.resident_bytes <= self.max_bytes {
                    break;
                }
                state
                    .order
                    .values()
                    .find(|id| !skipped.contains(*id))
                    .and_then(|id| state.slots.get(id))
                    .map(|slot| Arc::clone(&slot.ident))
            };
            let Some(ident) = candidate else {
                break;
            };

            match self.passivate(&ident, &write_back) {
                Ok(true) => evicted += 1,
                Ok(false) => {
                    skipped.insert(ident.id());
                }
                Err(e) => {
                    log::warn!(
                        "Write-back of node {} failed during eviction: {}",
                        ident.id(),
                        e
                    );
                    skipped.insert(ident.id());
                }
            }
        }
        evicted
    }

    /// Drop the resident body of `ident` if nobody holds its lock.
    ///
    /// Returns `Ok(false)` when the node is busy. A dirty body is written back
    /// before it is dropped; if that fails the body stays resident.
    pub fn passivate<F>(&self, ident: &Arc<NodeIdentifier>, write_back: F) -> Result<bool>
    where
        F: Fn(&NodeIdentifier, &Node) -> Result<()>,
    {
        let Some(_guard) = ident.try_write_lock() else {
            return Ok(false);
        };

        if ident.is_dirty() {
            if let Some(node) = ident.node() {
                write_back(ident, &node)?;
                self.write_backs.fetch_add(1, Ordering::Relaxed);
            }
            ident.clear_dirty();
        }

        if ident.clear_node().is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            log::trace!("Passivated node {}", ident.id());
        }
        self.forget(ident.id());
        Ok(true)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            resident_nodes: state.slots.len(),
            resident_bytes: state.resident_bytes,
            max_bytes: self.max_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("stats", &self.stats())
            .finish()
    }
}
