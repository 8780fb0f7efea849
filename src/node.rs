//! Resident node bodies.
//!
//! A [`Node`] is what storage persists and what a node identifier caches. Leaf
//! nodes (level 0) hold `(shape, payload)` entries, internal nodes hold
//! `(shape, child id)` pairs. Nodes perform no locking: callers mutate a body
//! only while holding the owning identifier's write lock, and always on a
//! private copy that is committed afterwards.

use crate::envelope::Envelope;
use crate::identifier::{NodeId, NodeKind};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::mem;

/// A stored `(shape, payload)` pair. The payload is opaque to the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub shape: Envelope,
    pub payload: Bytes,
}

impl LeafEntry {
    pub fn new(shape: Envelope, payload: impl Into<Bytes>) -> Self {
        Self {
            shape,
            payload: payload.into(),
        }
    }
}

/// Reference from an internal node to one of its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildEntry {
    pub shape: Envelope,
    pub id: NodeId,
}

/// Either kind of slot, used when items move between nodes (splits and
/// reinsertion).
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Entry(LeafEntry),
    Child(ChildEntry),
}

impl Item {
    pub fn shape(&self) -> &Envelope {
        match self {
            Item::Entry(e) => &e.shape,
            Item::Child(c) => &c.shape,
        }
    }
}

/// Slots of a node body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeEntries {
    Leaf(Vec<LeafEntry>),
    Internal(Vec<ChildEntry>),
}

/// Signals exchanged between a node and the tree manager.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeError {
    /// The node already holds the maximum number of slots. The rejected item
    /// is handed back so the caller can split.
    Overflow(Item),
    IndexOutOfRange { index: usize, len: usize },
    /// A leaf entry offered to an internal node or the reverse.
    KindMismatch,
}

/// In-memory body of a tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    level: u32,
    entries: NodeEntries,
}

impl Node {
    /// Empty leaf.
    pub fn leaf(id: NodeId) -> Self {
        Self {
            id,
            level: 0,
            entries: NodeEntries::Leaf(Vec::new()),
        }
    }

    /// Empty internal node. `level` must be at least 1.
    pub fn internal(id: NodeId, level: u32) -> Self {
        debug_assert!(level > 0, "internal nodes live above the leaf level");
        Self {
            id,
            level,
            entries: NodeEntries::Internal(Vec::new()),
        }
    }

    /// Build a node from items of a single kind.
    pub fn from_items(id: NodeId, level: u32, items: Vec<Item>) -> Result<Self, NodeError> {
        let mut node = if level == 0 {
            Self::leaf(id)
        } else {
            Self::internal(id, level)
        };
        for item in items {
            node.push_item(item)?;
        }
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Distance from the leaf level; leaves are level 0.
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn kind(&self) -> NodeKind {
        match self.entries {
            NodeEntries::Leaf(_) => NodeKind::Leaf,
            NodeEntries::Internal(_) => NodeKind::Internal,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.entries, NodeEntries::Leaf(_))
    }

    pub fn entries(&self) -> &NodeEntries {
        &self.entries
    }

    /// Number of entries (leaf) or children (internal).
    pub fn child_count(&self) -> usize {
        match &self.entries {
            NodeEntries::Leaf(e) => e.len(),
            NodeEntries::Internal(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.child_count() == 0
    }

    pub fn child_shape(&self, index: usize) -> Option<&Envelope> {
        match &self.entries {
            NodeEntries::Leaf(e) => e.get(index).map(|e| &e.shape),
            NodeEntries::Internal(c) => c.get(index).map(|c| &c.shape),
        }
    }

    /// Child identifier at `index`; `None` for leaves or out of range.
    pub fn child_id(&self, index: usize) -> Option<NodeId> {
        self.children().get(index).map(|c| c.id)
    }

    /// Leaf entry at `index`; `None` for internal nodes or out of range.
    pub fn entry(&self, index: usize) -> Option<&LeafEntry> {
        self.leaf_entries().get(index)
    }

    pub fn children(&self) -> &[ChildEntry] {
        match &self.entries {
            NodeEntries::Internal(c) => c,
            NodeEntries::Leaf(_) => &[],
        }
    }

    pub fn leaf_entries(&self) -> &[LeafEntry] {
        match &self.entries {
            NodeEntries::Leaf(e) => e,
            NodeEntries::Internal(_) => &[],
        }
    }

    /// Append a leaf entry, failing with `Overflow` once `max_entries` is reached.
    pub fn insert_entry(
        &mut self,
        shape: Envelope,
        payload: Bytes,
        max_entries: usize,
    ) -> Result<(), NodeError> {
        self.insert_item(Item::Entry(LeafEntry { shape, payload }), max_entries)
    }

    /// Append any item of this node's kind, bounded by `max_entries`.
    pub fn insert_item(&mut self, item: Item, max_entries: usize) -> Result<(), NodeError> {
        if self.child_count() >= max_entries {
            return Err(NodeError::Overflow(item));
        }
        self.push_item(item)
    }

    fn push_item(&mut self, item: Item) -> Result<(), NodeError> {
        match (&mut self.entries, item) {
            (NodeEntries::Leaf(entries), Item::Entry(e)) => entries.push(e),
            (NodeEntries::Internal(children), Item::Child(c)) => children.push(c),
            _ => return Err(NodeError::KindMismatch),
        }
        Ok(())
    }

    /// Remove the slot at `index`, shifting later slots down.
    pub fn delete_entry(&mut self, index: usize) -> Result<Item, NodeError> {
        let len = self.child_count();
        if index >= len {
            return Err(NodeError::IndexOutOfRange { index, len });
        }
        Ok(match &mut self.entries {
            NodeEntries::Leaf(e) => Item::Entry(e.remove(index)),
            NodeEntries::Internal(c) => Item::Child(c.remove(index)),
        })
    }

    /// Overwrite the recorded shape of the child at `index`.
    pub fn set_child_shape(&mut self, index: usize, shape: Envelope) -> Result<(), NodeError> {
        let len = self.child_count();
        let slot = match &mut self.entries {
            NodeEntries::Leaf(e) => e.get_mut(index).map(|e| &mut e.shape),
            NodeEntries::Internal(c) => c.get_mut(index).map(|c| &mut c.shape),
        };
        match slot {
            Some(s) => {
                *s = shape;
                Ok(())
            }
            None => Err(NodeError::IndexOutOfRange { index, len }),
        }
    }

    /// Position of the child with the given id.
    pub fn child_index(&self, id: NodeId) -> Option<usize> {
        self.children().iter().position(|c| c.id == id)
    }

    /// Position of an exact `(shape, payload)` match in a leaf.
    pub fn position_of(&self, shape: &Envelope, payload: &[u8]) -> Option<usize> {
        self.leaf_entries()
            .iter()
            .position(|e| e.shape == *shape && e.payload.as_ref() == payload)
    }

    /// Tight bounding envelope over all slots.
    pub fn bounds(&self, dimensions: usize) -> Envelope {
        let mut env = Envelope::empty(dimensions);
        for i in 0..self.child_count() {
            if let Some(shape) = self.child_shape(i) {
                env.expand_to_include(shape);
            }
        }
        env
    }

    /// Move every slot out, leaving the node empty.
    pub fn take_items(&mut self) -> Vec<Item> {
        match &mut self.entries {
            NodeEntries::Leaf(e) => mem::take(e).into_iter().map(Item::Entry).collect(),
            NodeEntries::Internal(c) => mem::take(c).into_iter().map(Item::Child).collect(),
        }
    }

    /// Rough resident footprint, used by the cache byte budget.
    pub fn estimated_size(&self) -> usize {
        let envelope_size = |e: &Envelope| mem::size_of::<Envelope>() + e.dimensions() * 16;
        let slots: usize = match &self.entries {
            NodeEntries::Leaf(e) => e
                .iter()
                .map(|e| envelope_size(&e.shape) + mem::size_of::<Bytes>() + e.payload.len())
                .sum(),
            NodeEntries::Internal(c) => c
                .iter()
                .map(|c| envelope_size(&c.shape) + mem::size_of::<NodeId>())
                .sum(),
        };
        mem::size_of::<Self>() + slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with(n: usize) -> Node {
        let mut node = Node::leaf(NodeId::new(1));
        for i in 0..n {
            let f = i as f64;
            node.insert_entry(
                Envelope::rect(f, f, f + 1.0, f + 1.0),
                Bytes::from(format!("e{}", i)),
                8,
            )
            .unwrap();
        }
        node
    }

    #[test]
    fn test_insert_until_overflow() {
        let mut node = leaf_with(3);
        assert_eq!(node.child_count(), 3);

        let err = node
            .insert_entry(Envelope::rect(0.0, 0.0, 1.0, 1.0), Bytes::from("x"), 3)
            .unwrap_err();
        match err {
            NodeError::Overflow(Item::Entry(e)) => assert_eq!(e.payload.as_ref(), b"x"),
            other => panic!("expected overflow, got {:?}", other),
        }
        assert_eq!(node.child_count(), 3);
    }

    #[test]
    fn test_delete_compacts() {
        let mut node = leaf_with(3);
        let removed = node.delete_entry(1).unwrap();
        assert_eq!(removed.shape(), &Envelope::rect(1.0, 1.0, 2.0, 2.0));
        assert_eq!(node.child_count(), 2);
        assert_eq!(node.entry(1).unwrap().payload.as_ref(), b"e2");

        assert_eq!(
            node.delete_entry(5),
            Err(NodeError::IndexOutOfRange { index: 5, len: 2 })
        );
    }

    #[test]
    fn test_bounds_and_lookup() {
        let node = leaf_with(3);
        assert_eq!(node.bounds(2), Envelope::rect(0.0, 0.0, 3.0, 3.0));
        assert_eq!(
            node.position_of(&Envelope::rect(2.0, 2.0, 3.0, 3.0), b"e2"),
            Some(2)
        );
        assert_eq!(
            node.position_of(&Envelope::rect(2.0, 2.0, 3.0, 3.0), b"e1"),
            None
        );
        assert!(Node::leaf(NodeId::new(9)).bounds(2).is_empty());
    }

    #[test]
    fn test_kind_mismatch() {
        let mut internal = Node::internal(NodeId::new(2), 1);
        let entry = Item::Entry(LeafEntry::new(Envelope::rect(0.0, 0.0, 1.0, 1.0), "a"));
        assert_eq!(internal.insert_item(entry, 4), Err(NodeError::KindMismatch));

        let child = Item::Child(ChildEntry {
            shape: Envelope::rect(0.0, 0.0, 1.0, 1.0),
            id: NodeId::new(3),
        });
        internal.insert_item(child, 4).unwrap();
        assert_eq!(internal.child_id(0), Some(NodeId::new(3)));
        assert_eq!(internal.child_index(NodeId::new(3)), Some(0));
        assert!(internal.entry(0).is_none());
    }

    #[test]
    fn test_take_and_rebuild() {
        let mut node = leaf_with(4);
        let items = node.take_items();
        assert!(node.is_empty());

        let rebuilt = Node::from_items(NodeId::new(5), 0, items).unwrap();
        assert_eq!(rebuilt.child_count(), 4);
        assert_eq!(rebuilt.id(), NodeId::new(5));
        assert!(rebuilt.estimated_size() > leaf_with(1).estimated_size());
    }
}
