//! Node identifiers: stable handles for tree nodes across memory and storage.
//!
//! A [`NodeIdentifier`] outlives the resident body it points at. It owns the
//! node's reader/writer lock, the data-ready (`valid`) flag and a reclaimable
//! slot for the body. The slot may be emptied by the cache at any time the
//! node is not locked, so every reader goes through the index's resolution
//! path instead of holding on to a body across operations.

use crate::envelope::Envelope;
use crate::error::{Result, SpatreeError};
use crate::node::Node;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod arena;
mod lock;

pub use arena::IdentifierArena;
use lock::NodeLock;

/// Stable integer key of a node, shared by the arena and storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Concrete node variant behind an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Leaf,
    Internal,
}

/// The serialisable part of an identifier.
///
/// Only `valid` is state; `id`, `level` and `shape` are the key. The lock and
/// the body slot are transient and come back fresh from
/// [`NodeIdentifier::from_persisted`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedIdentifier {
    pub id: NodeId,
    pub level: u32,
    pub shape: Envelope,
    pub valid: bool,
}

/// Handle for one tree node.
pub struct NodeIdentifier {
    id: NodeId,
    level: u32,
    shape: RwLock<Envelope>,
    valid: AtomicBool,
    dirty: AtomicBool,
    lock: NodeLock,
    body: Mutex<Option<Arc<Node>>>,
    /// Serialises storage loads so concurrent resolvers coalesce.
    fill: Mutex<()>,
}

impl NodeIdentifier {
    /// A fresh identifier: unlocked, no body, not valid.
    pub fn new(id: NodeId, level: u32, shape: Envelope) -> Self {
        Self {
            id,
            level,
            shape: RwLock::new(shape),
            valid: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            lock: NodeLock::new(),
            body: Mutex::new(None),
            fill: Mutex::new(()),
        }
    }

    /// Rebuild an identifier from its persisted form. The result is unlocked
    /// and has no body, so it must be resolved from storage before first use.
    pub fn from_persisted(persisted: PersistedIdentifier) -> Self {
        let ident = Self::new(persisted.id, persisted.level, persisted.shape);
        ident.valid.store(persisted.valid, Ordering::Release);
        ident
    }

    pub fn to_persisted(&self) -> PersistedIdentifier {
        PersistedIdentifier {
            id: self.id,
            level: self.level,
            shape: self.shape(),
            valid: self.is_valid(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn kind(&self) -> NodeKind {
        if self.level == 0 {
            NodeKind::Leaf
        } else {
            NodeKind::Internal
        }
    }

    /// The region this node bounds.
    pub fn shape(&self) -> Envelope {
        self.shape.read().clone()
    }

    /// Re-tighten the recorded region. Only legal while the calling thread
    /// holds this identifier's write lock.
    pub(crate) fn set_shape(&self, shape: Envelope) {
        debug_assert!(
            self.lock.is_write_held_by_current_thread(),
            "shape of {} updated without its write lock",
            self.id
        );
        *self.shape.write() = shape;
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }

    /// True iff no reader holds the lock. Callers must still take the write
    /// lock before mutating.
    pub fn is_writable(&self) -> bool {
        self.lock.is_writable()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// The resident body, if it has not been reclaimed.
    pub fn node(&self) -> Option<Arc<Node>> {
        self.body.lock().clone()
    }

    /// Install a body. Its identity must match this identifier.
    pub fn set_node(&self, node: Arc<Node>) {
        debug_assert_eq!(node.id(), self.id, "body installed under a foreign identifier");
        *self.body.lock() = Some(node);
    }

    /// Drop the resident body, returning it. `valid` is left untouched:
    /// memory reclamation alone does not make the stored body stale.
    pub fn clear_node(&self) -> Option<Arc<Node>> {
        self.body.lock().take()
    }

    pub fn is_resident(&self) -> bool {
        self.body.lock().is_some()
    }

    /// The resident body differs from what storage holds.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub(crate) fn fill_lock(&self) -> MutexGuard<'_, ()> {
        self.fill.lock()
    }

    /// Shared hold, released when the guard drops.
    pub fn read_lock(self: &Arc<Self>, timeout: Option<Duration>) -> Result<ReadGuard> {
        if self.lock.acquire_read(timeout) {
            Ok(ReadGuard {
                ident: Arc::clone(self),
            })
        } else {
            Err(SpatreeError::Timeout(format!("read lock on node {}", self.id)))
        }
    }

    /// Exclusive hold, reentrant for the owning thread.
    pub fn write_lock(self: &Arc<Self>, timeout: Option<Duration>) -> Result<WriteGuard> {
        if self.lock.acquire_write(timeout) {
            Ok(WriteGuard {
                ident: Arc::clone(self),
            })
        } else {
            Err(SpatreeError::Timeout(format!(
                "write lock on node {}",
                self.id
            )))
        }
    }

    /// Exclusive hold only if it is free right now.
    pub fn try_write_lock(self: &Arc<Self>) -> Option<WriteGuard> {
        self.lock.try_acquire_write().then(|| WriteGuard {
            ident: Arc::clone(self),
        })
    }
}

impl PartialEq for NodeIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.id == other.id && self.shape() == other.shape()
    }
}

impl Eq for NodeIdentifier {}

impl Hash for NodeIdentifier {
    // The shape is left out: it may be re-tightened while the identifier is
    // a map key, and equal identifiers still hash alike.
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        self.id.hash(state);
    }
}

impl fmt::Debug for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentifier")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("shape", &self.shape())
            .field("valid", &self.is_valid())
            .field("dirty", &self.is_dirty())
            .field("resident", &self.is_resident())
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Owned shared hold on an identifier.
pub struct ReadGuard {
    ident: Arc<NodeIdentifier>,
}

impl ReadGuard {
    pub fn identifier(&self) -> &Arc<NodeIdentifier> {
        &self.ident
    }
}

impl Deref for ReadGuard {
    type Target = NodeIdentifier;

    fn deref(&self) -> &NodeIdentifier {
        &self.ident
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.ident.lock.release_read();
    }
}

impl fmt::Debug for ReadGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReadGuard({})", self.ident.id)
    }
}

/// Owned exclusive hold on an identifier.
pub struct WriteGuard {
    ident: Arc<NodeIdentifier>,
}

impl WriteGuard {
    pub fn identifier(&self) -> &Arc<NodeIdentifier> {
        &self.ident
    }

    /// A second, nested hold on the same lock. Never blocks.
    pub fn reacquire(&self) -> WriteGuard {
        let reentered = self.ident.lock.try_acquire_write();
        debug_assert!(reentered, "owner failed to re-enter its own write lock");
        WriteGuard {
            ident: Arc::clone(&self.ident),
        }
    }
}

impl Deref for WriteGuard {
    type Target = NodeIdentifier;

    fn deref(&self) -> &NodeIdentifier {
        &self.ident
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.ident.lock.release_write();
    }
}

impl fmt::Debug for WriteGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriteGuard({})", self.ident.id)
    }
}
