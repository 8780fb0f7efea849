//! Registry of live node identifiers keyed by [`NodeId`].

use super::{NodeId, NodeIdentifier};
use crate::envelope::Envelope;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Owns one `Arc<NodeIdentifier>` per node known to the process.
///
/// Identifiers for nodes that exist only in storage are created lazily, the
/// first time a parent body referencing them is walked.
#[derive(Debug)]
pub struct IdentifierArena {
    records: RwLock<FxHashMap<NodeId, Arc<NodeIdentifier>>>,
    next_id: AtomicU64,
}

impl IdentifierArena {
    /// Empty arena that hands out ids starting at `next_id`.
    pub fn new(next_id: u64) -> Self {
        Self {
            records: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(next_id),
        }
    }

    /// Register a brand-new identifier with a never-used id.
    pub fn allocate(&self, level: u32, shape: Envelope) -> Arc<NodeIdentifier> {
        let id = NodeId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let ident = Arc::new(NodeIdentifier::new(id, level, shape));
        self.records.write().insert(id, Arc::clone(&ident));
        ident
    }

    /// Register an identifier built elsewhere (e.g. restored from a manifest).
    pub fn insert(&self, ident: Arc<NodeIdentifier>) {
        self.bump_past(ident.id());
        self.records.write().insert(ident.id(), ident);
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<NodeIdentifier>> {
        self.records.read().get(&id).cloned()
    }

    /// The registered identifier for `id`, or a fresh unresolved one.
    pub fn get_or_insert(&self, id: NodeId, level: u32, shape: &Envelope) -> Arc<NodeIdentifier> {
        if let Some(ident) = self.get(id) {
            return ident;
        }
        self.bump_past(id);
        let mut records = self.records.write();
        Arc::clone(
            records
                .entry(id)
                .or_insert_with(|| Arc::new(NodeIdentifier::new(id, level, shape.clone()))),
        )
    }

    pub fn remove(&self, id: NodeId) -> Option<Arc<NodeIdentifier>> {
        self.records.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// The id the next allocation will use.
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every registered identifier.
    pub fn snapshot(&self) -> Vec<Arc<NodeIdentifier>> {
        self.records.read().values().cloned().collect()
    }

    fn bump_past(&self, id: NodeId) {
        self.next_id.fetch_max(id.get() + 1, Ordering::Relaxed);
    }
}
