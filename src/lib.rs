//! Concurrent R-tree whose nodes live in a bounded cache and are passivated
//! to pluggable storage.
//!
//! ```rust
//! use spatree::{Envelope, IndexConfig, SpatialIndex};
//!
//! let index = SpatialIndex::memory(IndexConfig::default().with_fanout(1, 2))?;
//! index.insert(Envelope::rect(0.0, 0.0, 1.0, 1.0), "a")?;
//! index.insert(Envelope::rect(5.0, 5.0, 6.0, 6.0), "b")?;
//!
//! // bodies can be dropped from memory at any time; they are reloaded on demand
//! index.passivate_all()?;
//! let hits = index.query_to_vec(&Envelope::rect(0.0, 0.0, 2.0, 2.0))?;
//! assert_eq!(hits.len(), 1);
//!
//! index.delete(&Envelope::rect(5.0, 5.0, 6.0, 6.0), "b")?;
//! assert_eq!(index.len(), 1);
//! # Ok::<(), spatree::SpatreeError>(())
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod envelope;
pub mod error;
pub mod identifier;
pub mod index;
pub mod node;
pub mod storage;

pub use builder::IndexBuilder;
pub use cache::CacheStats;
pub use config::{CacheConfig, IndexConfig, WritePolicy};
pub use envelope::Envelope;
pub use error::{Result, SpatreeError};
pub use identifier::{NodeId, NodeIdentifier, NodeKind, PersistedIdentifier};
pub use index::{IndexStats, QueryIter, SpatialIndex, TreeStats};
pub use node::{ChildEntry, LeafEntry, Node};
pub use storage::{
    FileStorage, MemoryStorage, NodeStorage, StorageStats, SyncPolicy, TreeManifest,
};

pub use bytes::Bytes;
pub use geo::{Point, Rect};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {
    pub use crate::{Envelope, IndexBuilder, IndexConfig, Result, SpatialIndex, SpatreeError};

    pub use crate::{FileStorage, MemoryStorage, NodeStorage, SyncPolicy, WritePolicy};

    pub use bytes::Bytes;
}
