//! Staged structural changes of one tree operation.
//!
//! Insert and delete build every new body on a private copy while holding
//! the affected identifiers' write locks, then commit them together. Under
//! the write-through policy new nodes reach storage before the nodes that
//! reference them, modified nodes are saved bottom-up, and removals come
//! last. A failed save leaves the in-memory tree exactly as it was.

use super::SpatialIndex;
use crate::config::WritePolicy;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::identifier::NodeIdentifier;
use crate::node::Node;
use std::sync::Arc;

struct Staged {
    ident: Arc<NodeIdentifier>,
    previous: Option<Arc<Node>>,
    node: Arc<Node>,
    shape: Envelope,
}

#[derive(Default)]
pub(crate) struct ChangeSet {
    fresh: Vec<Staged>,
    modified: Vec<Staged>,
    removed: Vec<Arc<NodeIdentifier>>,
}

impl ChangeSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replace the body of an existing node. The caller holds its write lock
    /// and stages nodes in bottom-up order.
    pub(crate) fn modify(
        &mut self,
        ident: &Arc<NodeIdentifier>,
        previous: Arc<Node>,
        node: Node,
        shape: Envelope,
    ) {
        self.modified.push(Staged {
            ident: Arc::clone(ident),
            previous: Some(previous),
            node: Arc::new(node),
            shape,
        });
    }

    /// Install the first body of a freshly allocated identifier.
    pub(crate) fn create(&mut self, ident: &Arc<NodeIdentifier>, node: Node) {
        let shape = ident.shape();
        self.fresh.push(Staged {
            ident: Arc::clone(ident),
            previous: None,
            node: Arc::new(node),
            shape,
        });
    }

    /// Delete a node once the rest of the change is committed.
    pub(crate) fn remove(&mut self, ident: &Arc<NodeIdentifier>) {
        self.removed.push(Arc::clone(ident));
    }

    pub(crate) fn apply(self, index: &SpatialIndex) -> Result<()> {
        let deferred = index.config.write_policy == WritePolicy::Deferred;

        if !deferred {
            let mut saved: Vec<&Staged> = Vec::new();
            for staged in self.fresh.iter().chain(self.modified.iter()) {
                if let Err(e) = index.storage.save(&staged.ident, &staged.node) {
                    log::warn!(
                        "Failed to save node {}, rolling back {} saved node(s): {}",
                        staged.ident.id(),
                        saved.len(),
                        e
                    );
                    self.rollback(index, &saved);
                    return Err(e);
                }
                saved.push(staged);
            }
        }

        for staged in self.fresh.iter().chain(self.modified.iter()) {
            if staged.previous.is_some() {
                staged.ident.set_shape(staged.shape.clone());
            }
            staged.ident.set_node(Arc::clone(&staged.node));
            staged.ident.set_valid(true);
            if deferred {
                staged.ident.mark_dirty();
            } else {
                staged.ident.clear_dirty();
            }
            index
                .cache
                .admit(&staged.ident, staged.node.estimated_size());
        }

        for ident in &self.removed {
            if let Err(e) = index.storage.remove(ident) {
                log::warn!("Failed to remove node {} from storage: {}", ident.id(), e);
            }
            index.arena.remove(ident.id());
            index.cache.forget(ident.id());
            ident.clear_node();
            ident.clear_dirty();
            ident.set_valid(false);
        }
        Ok(())
    }

    /// Undo a partially saved commit. Nodes that already reached storage
    /// keep their previous body in memory, marked dirty so the next flush or
    /// eviction writes it back over the orphaned save.
    fn rollback(&self, index: &SpatialIndex, saved: &[&Staged]) {
        for staged in saved {
            match &staged.previous {
                Some(previous) => {
                    staged.ident.set_node(Arc::clone(previous));
                    staged.ident.mark_dirty();
                }
                None => {
                    if let Err(e) = index.storage.remove(&staged.ident) {
                        log::warn!(
                            "Failed to discard node {} during rollback: {}",
                            staged.ident.id(),
                            e
                        );
                    }
                }
            }
        }
        for staged in &self.fresh {
            index.arena.remove(staged.ident.id());
        }
    }
}
