//! The spatial tree manager.
//!
//! [`SpatialIndex`] walks node identifiers top-down, taking read locks for
//! queries and write locks for mutations, and asks its [`NodeStorage`] for any
//! body that is not resident. Every identifier is registered in an arena keyed
//! by [`NodeId`]; the current root is held separately and only replaced by the
//! thread holding the old root's write lock.
//!
//! Lock order is always parent before child. An operation that acquires the
//! root re-checks, after the lock is granted, that it is still the root and
//! starts over otherwise.

mod changeset;
mod delete;
mod insert;
mod query;
mod split;
mod staged;

pub use query::QueryIter;

use crate::builder::IndexBuilder;
use crate::cache::{CacheStats, NodeCache};
use crate::config::{IndexConfig, WritePolicy};
use crate::envelope::Envelope;
use crate::error::{Result, SpatreeError};
use crate::identifier::{IdentifierArena, NodeId, NodeIdentifier, ReadGuard, WriteGuard};
use crate::node::Node;
use crate::storage::{FileStorage, MemoryStorage, NodeStorage, StorageStats, TreeManifest};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time counters for an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub entries: u64,
    pub height: usize,
    /// Identifiers currently registered, resident or not.
    pub identifiers: usize,
    pub cache: CacheStats,
    pub storage: StorageStats,
}

/// Shape of the tree as seen by [`SpatialIndex::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStats {
    pub height: usize,
    pub node_count: usize,
    pub leaf_count: usize,
    pub entry_count: u64,
}

pub struct SpatialIndex {
    config: IndexConfig,
    storage: Arc<dyn NodeStorage>,
    arena: IdentifierArena,
    cache: NodeCache,
    root: RwLock<Arc<NodeIdentifier>>,
    entry_count: AtomicU64,
    manifest_lock: Mutex<()>,
}

impl SpatialIndex {
    /// Open an index over `storage`.
    ///
    /// If the storage holds a manifest the existing tree is reopened and its
    /// nodes are loaded lazily. Otherwise an empty tree is created.
    pub fn new(storage: Arc<dyn NodeStorage>, config: IndexConfig) -> Result<Self> {
        config.validate().map_err(SpatreeError::Config)?;
        let cache = NodeCache::new(config.cache.max_bytes);

        let (arena, root, entry_count) = match storage.load_manifest()? {
            Some(manifest) => {
                if manifest.dimensions != config.dimensions {
                    return Err(SpatreeError::Config(format!(
                        "storage holds a {}-dimensional index, configured for {}",
                        manifest.dimensions, config.dimensions
                    )));
                }
                let arena = IdentifierArena::new(manifest.next_id);
                let root = Arc::new(NodeIdentifier::from_persisted(manifest.root));
                arena.insert(Arc::clone(&root));
                log::debug!(
                    "Reopened index with root {} ({} entries)",
                    root.id(),
                    manifest.entry_count
                );
                (arena, root, manifest.entry_count)
            }
            None => {
                let arena = IdentifierArena::new(1);
                let root = arena.allocate(0, Envelope::empty(config.dimensions));
                let body = Node::leaf(root.id());
                storage.save(&root, &body)?;
                let body = Arc::new(body);
                cache.admit(&root, body.estimated_size());
                root.set_node(body);
                root.set_valid(true);
                (arena, root, 0)
            }
        };

        let index = Self {
            config,
            storage,
            arena,
            cache,
            root: RwLock::new(root),
            entry_count: AtomicU64::new(entry_count),
            manifest_lock: Mutex::new(()),
        };
        index.persist_manifest()?;
        Ok(index)
    }

    /// Index backed by a fresh [`MemoryStorage`].
    pub fn memory(config: IndexConfig) -> Result<Self> {
        Self::new(Arc::new(MemoryStorage::new()), config)
    }

    /// Index backed by a [`FileStorage`] directory, reopening it if present.
    pub fn open<P: AsRef<Path>>(path: P, config: IndexConfig) -> Result<Self> {
        Self::new(Arc::new(FileStorage::open(path)?), config)
    }

    pub fn builder() -> IndexBuilder {
        IndexBuilder::new()
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn NodeStorage> {
        &self.storage
    }

    /// Number of stored entries.
    pub fn len(&self) -> u64 {
        self.entry_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of levels; a tree whose root is a leaf has height 1.
    pub fn height(&self) -> usize {
        self.root_identifier().level() as usize + 1
    }

    pub fn root_identifier(&self) -> Arc<NodeIdentifier> {
        Arc::clone(&self.root.read())
    }

    /// Registered identifier for `id`, if the node is known to this process.
    pub fn identifier(&self, id: NodeId) -> Option<Arc<NodeIdentifier>> {
        self.arena.get(id)
    }

    /// Drop the resident body of one node, writing it back first if dirty.
    ///
    /// Returns `Ok(false)` if the node is currently locked.
    pub fn passivate(&self, id: NodeId) -> Result<bool> {
        let ident = self.arena.get(id).ok_or(SpatreeError::NodeNotFound(id))?;
        self.cache.passivate(&ident, |ident, node| self.storage.save(ident, node))
    }

    /// Passivate every unlocked node. Returns how many bodies were dropped.
    pub fn passivate_all(&self) -> Result<usize> {
        let mut passivated = 0;
        for ident in self.arena.snapshot() {
            if !ident.is_resident() {
                continue;
            }
            if self
                .cache
                .passivate(&ident, |ident, node| self.storage.save(ident, node))?
            {
                passivated += 1;
            }
        }
        Ok(passivated)
    }

    /// Mark a node's body stale so the next access reloads it from storage.
    pub fn invalidate(&self, id: NodeId) -> Result<()> {
        let ident = self.arena.get(id).ok_or(SpatreeError::NodeNotFound(id))?;
        let _guard = self.write_lock(&ident)?;
        if ident.is_dirty() {
            if let Some(node) = ident.node() {
                self.storage.save(&ident, &node)?;
            }
            ident.clear_dirty();
        }
        ident.set_valid(false);
        ident.clear_node();
        self.cache.forget(ident.id());
        Ok(())
    }

    /// Write every dirty body and the manifest, then sync storage.
    pub fn flush(&self) -> Result<()> {
        let mut written = 0;
        for ident in self.arena.snapshot() {
            if !ident.is_dirty() {
                continue;
            }
            let _guard = self.read_lock(&ident)?;
            if let Some(node) = ident.node()
                && ident.is_dirty()
            {
                self.storage.save(&ident, &node)?;
                written += 1;
            }
            ident.clear_dirty();
        }
        self.persist_manifest()?;
        self.storage.sync()?;
        if written > 0 {
            log::debug!("Flushed {} dirty node(s)", written);
        }
        Ok(())
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            entries: self.len(),
            height: self.height(),
            identifiers: self.arena.len(),
            cache: self.cache.stats(),
            storage: self.storage.stats(),
        }
    }

    /// Walk the whole tree and check its structural invariants: recorded
    /// shapes are tight, levels step down by one, fan-out stays within
    /// bounds and the entry count matches [`len`](Self::len).
    ///
    /// Meant for quiescent indexes; concurrent writers may make the entry
    /// count check fail spuriously.
    pub fn validate(&self) -> Result<TreeStats> {
        let root = self.lock_root_read()?;
        let mut stats = TreeStats {
            height: root.level() as usize + 1,
            ..TreeStats::default()
        };
        self.validate_node(&root, true, &mut stats)?;
        drop(root);

        if stats.entry_count != self.len() {
            return Err(SpatreeError::invariant(format!(
                "tree holds {} entries but the index counts {}",
                stats.entry_count,
                self.len()
            )));
        }
        Ok(stats)
    }

    fn validate_node(&self, guard: &ReadGuard, is_root: bool, stats: &mut TreeStats) -> Result<()> {
        let ident = guard.identifier();
        let node = self.resolve(ident)?;
        stats.node_count += 1;

        let bounds = node.bounds(self.config.dimensions);
        if bounds != ident.shape() {
            return Err(SpatreeError::invariant(format!(
                "node {} records {:?} but its entries span {:?}",
                ident.id(),
                ident.shape(),
                bounds
            )));
        }

        let count = node.child_count();
        if count > self.config.max_entries {
            return Err(SpatreeError::invariant(format!(
                "node {} holds {} entries, more than {}",
                ident.id(),
                count,
                self.config.max_entries
            )));
        }
        if !is_root && count < self.config.min_entries {
            return Err(SpatreeError::invariant(format!(
                "node {} holds {} entries, fewer than {}",
                ident.id(),
                count,
                self.config.min_entries
            )));
        }
        if is_root && !node.is_leaf() && count < 2 {
            return Err(SpatreeError::invariant(format!(
                "internal root {} has {} child(ren)",
                ident.id(),
                count
            )));
        }

        if node.is_leaf() {
            stats.leaf_count += 1;
            stats.entry_count += count as u64;
            return Ok(());
        }
        for index in 0..count {
            let child = self.child_identifier(&node, index)?;
            let child_guard = self.read_lock(&child)?;
            self.check_child(&node, index, &child_guard)?;
            if child.shape() != node.children()[index].shape {
                return Err(SpatreeError::invariant(format!(
                    "node {} records a loose shape for child {}",
                    ident.id(),
                    child.id()
                )));
            }
            self.validate_node(&child_guard, false, stats)?;
        }
        Ok(())
    }

    /// Materialise the body of `ident`. The caller holds its read or write
    /// lock, so the body cannot be evicted until that lock is released.
    ///
    /// Concurrent resolvers of the same identifier coalesce into one load.
    pub(crate) fn resolve(&self, ident: &Arc<NodeIdentifier>) -> Result<Arc<Node>> {
        if let Some(node) = self.resident_body(ident) {
            return Ok(node);
        }

        let _fill = ident.fill_lock();
        if let Some(node) = self.resident_body(ident) {
            return Ok(node);
        }

        self.cache.record_miss();
        match self.storage.load(ident) {
            Ok(node) => {
                let node = Arc::new(node);
                ident.set_node(Arc::clone(&node));
                ident.set_valid(true);
                self.cache.admit(ident, node.estimated_size());
                log::trace!("Loaded node {} from storage", ident.id());
                Ok(node)
            }
            Err(e) => {
                ident.set_valid(false);
                log::warn!("Failed to load node {}: {}", ident.id(), e);
                Err(e)
            }
        }
    }

    fn resident_body(&self, ident: &NodeIdentifier) -> Option<Arc<Node>> {
        if !ident.is_valid() {
            return None;
        }
        let node = ident.node()?;
        self.cache.touch(ident.id());
        Some(node)
    }

    /// Identifier of the child at `index` of an internal node.
    pub(crate) fn child_identifier(
        &self,
        parent: &Node,
        index: usize,
    ) -> Result<Arc<NodeIdentifier>> {
        let entry = parent.children().get(index).ok_or_else(|| {
            SpatreeError::invariant(format!(
                "node {} has no child at index {}",
                parent.id(),
                index
            ))
        })?;
        let expected_level = parent.level().checked_sub(1).ok_or_else(|| {
            SpatreeError::invariant(format!("leaf {} has child references", parent.id()))
        })?;

        let child = self.arena.get_or_insert(entry.id, expected_level, &entry.shape);
        if child.level() != expected_level {
            return Err(SpatreeError::invariant(format!(
                "child {} of node {} is at level {}, expected {}",
                child.id(),
                parent.id(),
                child.level(),
                expected_level
            )));
        }
        Ok(child)
    }

    /// The shape a parent records for a child must cover the child's own
    /// shape. Checked with the child's lock held.
    pub(crate) fn check_child(
        &self,
        parent: &Node,
        index: usize,
        child: &NodeIdentifier,
    ) -> Result<()> {
        let recorded = parent.child_shape(index);
        match recorded {
            Some(recorded) if recorded.contains(&child.shape()) => Ok(()),
            _ => Err(SpatreeError::invariant(format!(
                "child {} of node {} is not contained in its recorded shape",
                child.id(),
                parent.id()
            ))),
        }
    }

    pub(crate) fn read_lock(&self, ident: &Arc<NodeIdentifier>) -> Result<ReadGuard> {
        ident.read_lock(self.config.lock_timeout())
    }

    pub(crate) fn write_lock(&self, ident: &Arc<NodeIdentifier>) -> Result<WriteGuard> {
        ident.write_lock(self.config.lock_timeout())
    }

    fn is_root(&self, ident: &Arc<NodeIdentifier>) -> bool {
        Arc::ptr_eq(&self.root.read(), ident)
    }

    pub(crate) fn lock_root_read(&self) -> Result<ReadGuard> {
        loop {
            let root = self.root_identifier();
            let guard = self.read_lock(&root)?;
            if self.is_root(&root) {
                return Ok(guard);
            }
        }
    }

    pub(crate) fn lock_root_write(&self) -> Result<WriteGuard> {
        loop {
            let root = self.root_identifier();
            let guard = self.write_lock(&root)?;
            if self.is_root(&root) {
                return Ok(guard);
            }
        }
    }

    /// Publish a new root. The caller holds the write locks of both roots.
    pub(crate) fn replace_root(&self, new_root: &Arc<NodeIdentifier>) {
        *self.root.write() = Arc::clone(new_root);
    }

    fn manifest(&self) -> TreeManifest {
        TreeManifest {
            root: self.root_identifier().to_persisted(),
            next_id: self.arena.next_id(),
            entry_count: self.len(),
            dimensions: self.config.dimensions,
        }
    }

    fn persist_manifest(&self) -> Result<()> {
        let _guard = self.manifest_lock.lock();
        self.storage.save_manifest(&self.manifest())
    }

    /// Save the manifest if the write policy requires it after every change.
    pub(crate) fn commit_manifest(&self) -> Result<()> {
        match self.config.write_policy {
            WritePolicy::WriteThrough => self.persist_manifest(),
            WritePolicy::Deferred => Ok(()),
        }
    }

    /// Evict least-recently-used bodies while over the cache budget.
    pub(crate) fn enforce_cache_budget(&self) {
        if self.cache.is_over_budget() {
            let evicted = self
                .cache
                .evict_over_budget(|ident, node| self.storage.save(ident, node));
            if evicted > 0 {
                log::trace!("Evicted {} node(s) over the cache budget", evicted);
            }
        }
    }
}

impl fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("config", &self.config)
            .field("root", &self.root_identifier().id())
            .field("height", &self.height())
            .field("entries", &self.len())
            .finish()
    }
}

/// Best-effort flush of deferred writes on drop. Errors are logged; call
/// [`SpatialIndex::flush`] explicitly to handle them.
impl Drop for SpatialIndex {
    fn drop(&mut self) {
        if self.config.write_policy == WritePolicy::Deferred
            && let Err(e) = self.flush()
        {
            log::warn!("Failed to flush index on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn small_config() -> IndexConfig {
        IndexConfig::default().with_fanout(2, 4)
    }

    fn grid(index: &SpatialIndex, n: usize) {
        for i in 0..n {
            let x = (i % 10) as f64;
            let y = (i / 10) as f64;
            index
                .insert(
                    Envelope::rect(x, y, x + 0.5, y + 0.5),
                    Bytes::from(format!("{}", i)),
                )
                .unwrap();
        }
    }

    #[test]
    fn test_empty_index() {
        let index = SpatialIndex::memory(IndexConfig::default()).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.height(), 1);
        assert_eq!(
            index.validate().unwrap(),
            TreeStats {
                height: 1,
                node_count: 1,
                leaf_count: 1,
                entry_count: 0
            }
        );
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = IndexConfig::default().with_fanout(3, 4);
        assert!(matches!(
            SpatialIndex::memory(config),
            Err(SpatreeError::Config(_))
        ));
    }

    #[test]
    fn test_grows_and_validates() {
        let index = SpatialIndex::memory(small_config()).unwrap();
        grid(&index, 60);

        let stats = index.validate().unwrap();
        assert_eq!(stats.entry_count, 60);
        assert!(stats.height >= 3);
        assert_eq!(stats.height, index.height());
    }

    #[test]
    fn test_resolution_after_passivation() {
        let index = SpatialIndex::memory(small_config()).unwrap();
        grid(&index, 30);

        let before = index.query_to_vec(&Envelope::rect(0.0, 0.0, 3.0, 3.0)).unwrap();
        assert!(index.passivate_all().unwrap() > 0);
        assert_eq!(index.stats().cache.resident_nodes, 0);

        let after = index.query_to_vec(&Envelope::rect(0.0, 0.0, 3.0, 3.0)).unwrap();
        assert_eq!(before.len(), after.len());
        assert!(index.stats().cache.misses > 0);
    }

    #[test]
    fn test_invalidate_reloads() {
        let index = SpatialIndex::memory(small_config()).unwrap();
        grid(&index, 5);

        let root = index.root_identifier();
        index.invalidate(root.id()).unwrap();
        assert!(!root.is_valid());
        assert!(root.node().is_none());

        assert_eq!(index.query_to_vec(&Envelope::rect(-1.0, -1.0, 20.0, 20.0)).unwrap().len(), 5);
        assert!(root.is_valid());
        assert!(matches!(
            index.invalidate(NodeId::new(9999)),
            Err(SpatreeError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_tiny_cache_budget() {
        let config = small_config().with_cache_bytes(512);
        let index = SpatialIndex::memory(config).unwrap();
        grid(&index, 50);

        let stats = index.stats();
        assert!(stats.cache.evictions > 0);
        assert!(stats.cache.resident_bytes <= 512);
        assert_eq!(index.validate().unwrap().entry_count, 50);
    }
}
