//! Private working copy of the nodes a delete touches.
//!
//! Each node is write-locked the first time it is visited and its body is
//! cloned into the copy. Condensing and reinsertion rewrite only the copy;
//! [`StagedTree::commit`] turns it into one [`ChangeSet`], so an error at any
//! earlier point leaves the tree exactly as it was.

use super::SpatialIndex;
use super::changeset::ChangeSet;
use super::insert::node_error;
use crate::envelope::Envelope;
use crate::error::{Result, SpatreeError};
use crate::identifier::{NodeId, NodeIdentifier, WriteGuard};
use crate::node::{Item, Node};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

struct Slot {
    ident: Arc<NodeIdentifier>,
    /// Committed body; `None` for nodes created in this copy.
    previous: Option<Arc<Node>>,
    body: Node,
    changed: bool,
    removed: bool,
}

/// Path from the root to a node: each step is a node and the child slot
/// followed below it.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub(crate) steps: Vec<(NodeId, usize)>,
    pub(crate) target: NodeId,
}

pub(crate) struct StagedTree<'a> {
    index: &'a SpatialIndex,
    root: NodeId,
    original_root: NodeId,
    /// Roots given up while shortening the tree.
    retired_roots: Vec<NodeId>,
    slots: FxHashMap<NodeId, Slot>,
    /// Held locks in acquisition order.
    guards: Vec<WriteGuard>,
    created: Vec<NodeId>,
    committed: bool,
}

impl<'a> StagedTree<'a> {
    /// Start a copy from the write-locked root.
    pub(crate) fn new(index: &'a SpatialIndex, root: WriteGuard, body: Arc<Node>) -> Self {
        let id = root.id();
        let mut tree = Self {
            index,
            root: id,
            original_root: id,
            retired_roots: Vec::new(),
            slots: FxHashMap::default(),
            guards: Vec::new(),
            created: Vec::new(),
            committed: false,
        };
        tree.adopt(root, body);
        tree
    }

    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    /// Hand the root role to `id`. The old root must already be removed.
    pub(crate) fn set_root(&mut self, id: NodeId) {
        self.retired_roots.push(self.root);
        self.root = id;
    }

    pub(crate) fn max_entries(&self) -> usize {
        self.index.config.max_entries
    }

    pub(crate) fn min_entries(&self) -> usize {
        self.index.config.min_entries
    }

    pub(crate) fn dimensions(&self) -> usize {
        self.index.config.dimensions
    }

    /// Take over a lock the caller already holds along with the body read
    /// under it. A node already in the copy keeps its staged body.
    pub(crate) fn adopt(&mut self, guard: WriteGuard, body: Arc<Node>) {
        let id = guard.id();
        if self.slots.contains_key(&id) {
            return;
        }
        self.slots.insert(
            id,
            Slot {
                ident: Arc::clone(guard.identifier()),
                body: (*body).clone(),
                previous: Some(body),
                changed: false,
                removed: false,
            },
        );
        self.guards.push(guard);
    }

    pub(crate) fn body(&self, id: NodeId) -> Result<&Node> {
        match self.slots.get(&id) {
            Some(slot) if !slot.removed => Ok(&slot.body),
            _ => Err(SpatreeError::invariant(format!(
                "node {} is not part of the staged tree",
                id
            ))),
        }
    }

    pub(crate) fn body_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        match self.slots.get_mut(&id) {
            Some(slot) if !slot.removed => {
                slot.changed = true;
                Ok(&mut slot.body)
            }
            _ => Err(SpatreeError::invariant(format!(
                "node {} is not part of the staged tree",
                id
            ))),
        }
    }

    /// Child at `slot` of a staged internal node, locking and staging it on
    /// first visit.
    pub(crate) fn child(&mut self, parent: NodeId, slot: usize) -> Result<NodeId> {
        let index = self.index;
        let parent_body = self.body(parent)?;
        let id = parent_body.child_id(slot).ok_or_else(|| {
            SpatreeError::invariant(format!("node {} has no child at index {}", parent, slot))
        })?;
        if self.slots.contains_key(&id) {
            return Ok(id);
        }

        let ident = index.child_identifier(parent_body, slot)?;
        let guard = index.write_lock(&ident)?;
        index.check_child(parent_body, slot, &guard)?;
        let body = index.resolve(&ident)?;
        self.adopt(guard, body);
        Ok(id)
    }

    /// Register a new node holding `items`. It stays locked until the copy is
    /// committed or dropped.
    pub(crate) fn create(&mut self, level: u32, items: Vec<Item>) -> Result<NodeId> {
        let mut shape = Envelope::empty(self.dimensions());
        for item in &items {
            shape.expand_to_include(item.shape());
        }
        let ident = self.index.arena.allocate(level, shape);
        let id = ident.id();
        self.created.push(id);

        let guard = ident.try_write_lock().ok_or_else(|| {
            SpatreeError::invariant(format!("fresh node {} is already locked", id))
        })?;
        let body = Node::from_items(id, level, items).map_err(node_error)?;
        self.slots.insert(
            id,
            Slot {
                ident,
                previous: None,
                body,
                changed: true,
                removed: false,
            },
        );
        self.guards.push(guard);
        Ok(id)
    }

    pub(crate) fn remove(&mut self, id: NodeId) -> Result<()> {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.removed = true;
                Ok(())
            }
            None => Err(SpatreeError::invariant(format!(
                "cannot remove unstaged node {}",
                id
            ))),
        }
    }

    /// Re-record the tight shape of every node on `route`, bottom-up.
    pub(crate) fn tighten(&mut self, route: &Route) -> Result<()> {
        let dims = self.dimensions();
        let mut shape = self.body(route.target)?.bounds(dims);
        for &(parent, slot) in route.steps.iter().rev() {
            let body = self.body_mut(parent)?;
            body.set_child_shape(slot, shape).map_err(node_error)?;
            shape = body.bounds(dims);
        }
        Ok(())
    }

    /// Commit the copy as a single change and remove `removed_entries` from
    /// the entry count. A root that changed during restructuring is
    /// published, and the retired roots are dropped once the manifest names
    /// their successor.
    pub(crate) fn commit(mut self, removed_entries: u64) -> Result<()> {
        let index = self.index;
        let dims = self.dimensions();
        let mut slots = std::mem::take(&mut self.slots);

        let mut changes = ChangeSet::new();
        let mut retired = ChangeSet::new();
        let mut fresh = Vec::new();
        let mut modified = Vec::new();

        for (id, slot) in slots.drain() {
            let is_fresh = slot.previous.is_none();
            if is_fresh && slot.removed {
                index.arena.remove(id);
            } else if is_fresh {
                fresh.push(slot);
            } else if slot.removed && self.retired_roots.contains(&id) {
                retired.remove(&slot.ident);
            } else if slot.removed {
                changes.remove(&slot.ident);
            } else if slot.changed {
                modified.push(slot);
            }
        }

        fresh.sort_by_key(|slot| slot.body.level());
        for slot in fresh {
            slot.ident.set_shape(slot.body.bounds(dims));
            changes.create(&slot.ident, slot.body);
        }
        modified.sort_by_key(|slot| slot.body.level());
        for slot in modified {
            let shape = slot.body.bounds(dims);
            if let Some(previous) = slot.previous {
                changes.modify(&slot.ident, previous, slot.body, shape);
            }
        }

        changes.apply(index)?;
        self.committed = true;
        index.entry_count.fetch_sub(removed_entries, Ordering::AcqRel);

        if self.root != self.original_root {
            let new_root = index.arena.get(self.root).ok_or_else(|| {
                SpatreeError::invariant(format!("new root {} is not registered", self.root))
            })?;
            index.replace_root(&new_root);
            log::debug!(
                "Root {} replaced by {}, height now {}",
                self.original_root,
                self.root,
                new_root.level() + 1
            );
        }
        index.commit_manifest()?;
        retired.apply(index)
    }
}

impl Drop for StagedTree<'_> {
    fn drop(&mut self) {
        if !self.committed {
            for id in &self.created {
                self.index.arena.remove(*id);
            }
        }
        // release bottom-up
        while self.guards.pop().is_some() {}
    }
}
