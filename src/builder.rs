//! Index builder for choosing storage and configuration in one place.

use crate::config::IndexConfig;
use crate::error::Result;
use crate::index::SpatialIndex;
use crate::storage::{FileStorage, MemoryStorage, NodeStorage, SyncPolicy};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Builder for a [`SpatialIndex`] over in-memory, directory or custom storage.
///
/// ```rust
/// use spatree::{Envelope, IndexBuilder, IndexConfig};
///
/// let index = IndexBuilder::new()
///     .config(IndexConfig::default().with_fanout(2, 8))
///     .in_memory()
///     .build()
///     .unwrap();
/// index.insert(Envelope::rect(0.0, 0.0, 1.0, 1.0), "a").unwrap();
/// ```
pub struct IndexBuilder {
    config: IndexConfig,
    path: Option<PathBuf>,
    sync_policy: SyncPolicy,
    storage: Option<Arc<dyn NodeStorage>>,
}

impl IndexBuilder {
    /// Create a new builder with default in-memory configuration.
    pub fn new() -> Self {
        Self {
            config: IndexConfig::default(),
            path: None,
            sync_policy: SyncPolicy::default(),
            storage: None,
        }
    }

    pub fn config(mut self, config: IndexConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist nodes under `path`. An existing index there is reopened.
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self.storage = None;
        self
    }

    /// Sync policy for directory storage; ignored otherwise.
    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    /// Use caller-supplied storage.
    pub fn storage(mut self, storage: Arc<dyn NodeStorage>) -> Self {
        self.storage = Some(storage);
        self.path = None;
        self
    }

    /// Configure for in-memory storage with no persistence.
    pub fn in_memory(mut self) -> Self {
        self.path = None;
        self.storage = None;
        self
    }

    pub fn build(self) -> Result<SpatialIndex> {
        let storage: Arc<dyn NodeStorage> = match (self.storage, self.path) {
            (Some(storage), _) => storage,
            (None, Some(path)) => {
                Arc::new(FileStorage::open(path)?.with_sync_policy(self.sync_policy))
            }
            (None, None) => Arc::new(MemoryStorage::new()),
        };
        SpatialIndex::new(storage, self.config)
    }
}

impl Default for IndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IndexBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexBuilder")
            .field("config", &self.config)
            .field("path", &self.path)
            .field("sync_policy", &self.sync_policy)
            .field("custom_storage", &self.storage.is_some())
            .finish()
    }
}
