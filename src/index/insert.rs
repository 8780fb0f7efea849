use super::SpatialIndex;
use super::changeset::ChangeSet;
use super::split;
use crate::envelope::Envelope;
use crate::error::{Result, SpatreeError};
use crate::identifier::{NodeIdentifier, WriteGuard};
use crate::node::{ChildEntry, Item, LeafEntry, Node, NodeError};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// A write-locked node on the descent path and the child slot taken below it.
struct PathStep {
    guard: WriteGuard,
    node: Arc<Node>,
    child_index: usize,
}

impl SpatialIndex {
    /// Store `payload` under `shape`.
    ///
    /// Duplicate `(shape, payload)` pairs are stored as separate entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use spatree::{Envelope, IndexConfig, SpatialIndex};
    ///
    /// let index = SpatialIndex::memory(IndexConfig::default()).unwrap();
    /// index.insert(Envelope::rect(0.0, 0.0, 1.0, 1.0), "a").unwrap();
    /// assert_eq!(index.len(), 1);
    /// ```
    pub fn insert(&self, shape: Envelope, payload: impl Into<Bytes>) -> Result<()> {
        shape.validate(self.config.dimensions)?;
        let item = Item::Entry(LeafEntry::new(shape, payload));

        let result = self.insert_item(item, 0).and_then(|()| {
            self.entry_count.fetch_add(1, Ordering::AcqRel);
            self.commit_manifest()
        });
        self.enforce_cache_budget();
        result
    }

    /// Place `item` into some node at `level`, starting from the root.
    ///
    /// Descends with write locks, releasing every held ancestor as soon as a
    /// child is reached that can absorb the item without splitting or growing.
    /// A new root grown by a root split stays locked until every guard below
    /// it is gone.
    fn insert_item(&self, item: Item, level: u32) -> Result<()> {
        let root = self.lock_root_write()?;
        let max = self.config.max_entries;
        let dims = self.config.dimensions;

        let mut path: Vec<PathStep> = Vec::new();
        let mut current = root;
        let mut node = self.resolve(current.identifier())?;
        if node.level() < level {
            return Err(SpatreeError::invariant(format!(
                "cannot insert at level {} below a root at level {}",
                level,
                node.level()
            )));
        }

        while node.level() > level {
            let child_index = split::choose_subtree(node.children(), item.shape()).ok_or_else(|| {
                SpatreeError::invariant(format!("internal node {} has no children", node.id()))
            })?;
            let child = self.child_identifier(&node, child_index)?;
            let child_guard = self.write_lock(&child)?;
            self.check_child(&node, child_index, &child_guard)?;
            let child_node = self.resolve(&child)?;

            path.push(PathStep {
                guard: current,
                node,
                child_index,
            });
            if child_node.child_count() < max && child.shape().contains(item.shape()) {
                release(&mut path);
            }
            current = child_guard;
            node = child_node;
        }

        let mut changes = ChangeSet::new();
        let mut updated = (*node).clone();
        let mut carry = self.add_item(&mut updated, item, &mut changes)?;
        let mut shape = updated.bounds(dims);
        changes.modify(current.identifier(), node, updated, shape.clone());

        let mut held = vec![current];
        while let Some(step) = path.pop() {
            let mut parent = (*step.node).clone();
            parent
                .set_child_shape(step.child_index, shape)
                .map_err(node_error)?;
            if let Some(sibling) = carry.take() {
                carry = self.add_item(&mut parent, Item::Child(sibling), &mut changes)?;
            }
            shape = parent.bounds(dims);
            changes.modify(step.guard.identifier(), step.node, parent, shape.clone());
            held.push(step.guard);
        }

        let mut _new_root = None;
        if let Some(sibling) = carry {
            let top = held
                .last()
                .map(|g| Arc::clone(g.identifier()))
                .ok_or_else(|| SpatreeError::invariant("split with no held node"))?;
            if !self.is_root(&top) {
                return Err(SpatreeError::invariant(format!(
                    "split reached node {} which is not the root",
                    top.id()
                )));
            }

            let level = top.level() + 1;
            let old_root = ChildEntry {
                shape: shape.clone(),
                id: top.id(),
            };
            let root_shape = shape.union(&sibling.shape);
            let new_root = self.arena.allocate(level, root_shape);
            let guard = new_root.try_write_lock().ok_or_else(|| {
                SpatreeError::invariant(format!("fresh root {} is already locked", new_root.id()))
            })?;
            let body = Node::from_items(
                new_root.id(),
                level,
                vec![Item::Child(old_root), Item::Child(sibling)],
            )
            .map_err(node_error)?;
            changes.create(&new_root, body);
            changes.apply(self)?;

            self.replace_root(&new_root);
            log::debug!(
                "Root split: new root {} at height {}",
                new_root.id(),
                level + 1
            );
            _new_root = Some(guard);
        } else {
            changes.apply(self)?;
        }

        // release bottom-up, the new root last
        drop(held);
        Ok(())
    }

    /// Add `item` to `node`, splitting on overflow. Returns the entry for the
    /// new sibling that the parent must adopt, if a split happened.
    fn add_item(
        &self,
        node: &mut Node,
        item: Item,
        changes: &mut ChangeSet,
    ) -> Result<Option<ChildEntry>> {
        match node.insert_item(item, self.config.max_entries) {
            Ok(()) => Ok(None),
            Err(NodeError::Overflow(item)) => self.split_node(node, item).map(|(sibling, body)| {
                let entry = ChildEntry {
                    shape: sibling.shape(),
                    id: sibling.id(),
                };
                changes.create(&sibling, body);
                Some(entry)
            }),
            Err(e) => Err(node_error(e)),
        }
    }

    /// Quadratic split of a full node plus one extra item. The node keeps its
    /// identity and the first group; the second group moves to a new sibling.
    fn split_node(&self, node: &mut Node, extra: Item) -> Result<(Arc<NodeIdentifier>, Node)> {
        let dims = self.config.dimensions;
        let mut items = node.take_items();
        items.push(extra);
        let (keep, moved) = split::quadratic_split(items, self.config.min_entries);

        *node = Node::from_items(node.id(), node.level(), keep).map_err(node_error)?;

        let mut sibling_shape = Envelope::empty(dims);
        for item in &moved {
            sibling_shape.expand_to_include(item.shape());
        }
        let sibling = self.arena.allocate(node.level(), sibling_shape);
        let body = Node::from_items(sibling.id(), node.level(), moved).map_err(node_error)?;

        log::debug!(
            "Split node {} at level {}: {} + {} entries, new sibling {}",
            node.id(),
            node.level(),
            node.child_count(),
            body.child_count(),
            sibling.id()
        );
        Ok((sibling, body))
    }
}

/// Release held ancestors, deepest first.
fn release(path: &mut Vec<PathStep>) {
    while path.pop().is_some() {}
}

pub(crate) fn node_error(e: NodeError) -> SpatreeError {
    SpatreeError::invariant(format!("unexpected node condition: {:?}", e))
}
