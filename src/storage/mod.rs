//! Persistence contract for node bodies and the tree manifest.
//!
//! The index never reads bodies directly: whenever an identifier has no
//! resident body it asks a [`NodeStorage`] for one. Two backends ship with
//! the crate:
//! - [`MemoryStorage`]: serialised bodies in a hash map, for tests and
//!   process-local indexes
//! - [`FileStorage`]: one file per node in a directory

pub mod codec;
mod file;
mod memory;

pub use file::{FileStorage, SyncPolicy};
pub use memory::MemoryStorage;

use crate::error::Result;
use crate::identifier::{NodeIdentifier, PersistedIdentifier};
use crate::node::Node;
use serde::{Deserialize, Serialize};

/// Tree-level state needed to reopen an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeManifest {
    pub root: PersistedIdentifier,
    pub next_id: u64,
    pub entry_count: u64,
    pub dimensions: usize,
}

/// Counters reported by a storage backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Node bodies currently stored.
    pub nodes: usize,
    /// Encoded size of stored bodies.
    pub bytes: u64,
    pub loads: u64,
    pub saves: u64,
    pub removes: u64,
}

/// Backing store for node bodies.
///
/// Implementations are shared between threads and must tolerate concurrent
/// calls for different identifiers. Calls for the same identifier are
/// serialised by the index.
pub trait NodeStorage: Send + Sync {
    /// Materialise the body for `ident`.
    ///
    /// Fails with `NodeNotFound` if nothing is stored and `CorruptData` if the
    /// stored bytes cannot be decoded or describe a different node.
    fn load(&self, ident: &NodeIdentifier) -> Result<Node>;

    /// Durably record `node` as the body of `ident`.
    fn save(&self, ident: &NodeIdentifier, node: &Node) -> Result<()>;

    /// Forget the body of `ident`. Removing an absent node is not an error.
    fn remove(&self, ident: &NodeIdentifier) -> Result<()>;

    fn load_manifest(&self) -> Result<Option<TreeManifest>>;

    fn save_manifest(&self, manifest: &TreeManifest) -> Result<()>;

    /// Flush anything buffered by the backend.
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> StorageStats;
}
