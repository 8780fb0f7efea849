//! In-memory node storage.
//!
//! Bodies are kept encoded, so passivating a node and resolving it again
//! exercises the same codec path as a real backend.

use super::{NodeStorage, StorageStats, TreeManifest, codec};
use crate::error::{Result, SpatreeError};
use crate::identifier::{NodeId, NodeIdentifier};
use crate::node::Node;
use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    nodes: RwLock<FxHashMap<NodeId, Bytes>>,
    manifest: RwLock<Option<Bytes>>,
    loads: AtomicU64,
    saves: AtomicU64,
    removes: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.read().contains_key(&id)
    }

    /// Overwrite the stored record of `id` with arbitrary bytes.
    pub fn put_raw(&self, id: NodeId, bytes: impl Into<Bytes>) {
        self.nodes.write().insert(id, bytes.into());
    }
}

impl NodeStorage for MemoryStorage {
    fn load(&self, ident: &NodeIdentifier) -> Result<Node> {
        let bytes = self
            .nodes
            .read()
            .get(&ident.id())
            .cloned()
            .ok_or(SpatreeError::NodeNotFound(ident.id()))?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        codec::decode_node(ident, &bytes)
    }

    fn save(&self, ident: &NodeIdentifier, node: &Node) -> Result<()> {
        let bytes = codec::encode_node(node)?;
        self.nodes.write().insert(ident.id(), Bytes::from(bytes));
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remove(&self, ident: &NodeIdentifier) -> Result<()> {
        if self.nodes.write().remove(&ident.id()).is_some() {
            self.removes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn load_manifest(&self) -> Result<Option<TreeManifest>> {
        match self.manifest.read().as_ref() {
            Some(bytes) => codec::decode_manifest(bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save_manifest(&self, manifest: &TreeManifest) -> Result<()> {
        let bytes = codec::encode_manifest(manifest)?;
        *self.manifest.write() = Some(Bytes::from(bytes));
        Ok(())
    }

    fn stats(&self) -> StorageStats {
        let nodes = self.nodes.read();
        StorageStats {
            nodes: nodes.len(),
            bytes: nodes.values().map(|b| b.len() as u64).sum(),
            loads: self.loads.load(Ordering::Relaxed),
            saves: self.saves.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
        }
    }
}
