//! Directory-backed node storage.
//!
//! Layout:
//! ```text
//! <root>/MANIFEST
//! <root>/nodes/<id as 16 hex digits>.node
//! ```
//! Every file is replaced atomically: the record is written to a uniquely
//! named temp file in the same directory and renamed over the old one.

use super::{NodeStorage, StorageStats, TreeManifest, codec};
use crate::error::{Result, SpatreeError};
use crate::identifier::{NodeId, NodeIdentifier};
use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

const MANIFEST_FILE: &str = "MANIFEST";
const NODES_DIR: &str = "nodes";
const NODE_EXT: &str = "node";

/// Whether writes are forced to disk before they are reported done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Leave flushing to the OS.
    #[default]
    Never,
    /// `fsync` every file and its directory after each write.
    Always,
}

#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    nodes_dir: PathBuf,
    sync_policy: SyncPolicy,
    loads: AtomicU64,
    saves: AtomicU64,
    removes: AtomicU64,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let nodes_dir = root.join(NODES_DIR);
        fs::create_dir_all(&nodes_dir)?;
        Ok(Self {
            root,
            nodes_dir,
            sync_policy: SyncPolicy::default(),
            loads: AtomicU64::new(0),
            saves: AtomicU64::new(0),
            removes: AtomicU64::new(0),
        })
    }

    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Location of the record for `id`.
    pub fn node_path(&self, id: NodeId) -> PathBuf {
        self.nodes_dir.join(format!("{:016x}.{}", id.get(), NODE_EXT))
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let dir = path.parent().unwrap_or(self.root.as_path());
        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4().simple()));

        let result = (|| {
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(bytes)?;
            writer.flush()?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            if self.sync_policy == SyncPolicy::Always {
                file.sync_all()?;
            }
            drop(file);

            fs::rename(&temp_path, path)?;
            if self.sync_policy == SyncPolicy::Always {
                File::open(dir)?.sync_all()?;
            }
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }
}

impl NodeStorage for FileStorage {
    fn load(&self, ident: &NodeIdentifier) -> Result<Node> {
        let bytes = match fs::read(self.node_path(ident.id())) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SpatreeError::NodeNotFound(ident.id()));
            }
            Err(e) => return Err(e.into()),
        };
        self.loads.fetch_add(1, Ordering::Relaxed);
        codec::decode_node(ident, &bytes)
    }

    fn save(&self, ident: &NodeIdentifier, node: &Node) -> Result<()> {
        let bytes = codec::encode_node(node)?;
        self.write_atomic(&self.node_path(ident.id()), &bytes).map_err(|e| {
            SpatreeError::WriteError(format!("failed to write node {}: {}", ident.id(), e))
        })?;
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remove(&self, ident: &NodeIdentifier) -> Result<()> {
        match fs::remove_file(self.node_path(ident.id())) {
            Ok(()) => {
                self.removes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_manifest(&self) -> Result<Option<TreeManifest>> {
        match fs::read(self.manifest_path()) {
            Ok(bytes) => codec::decode_manifest(&bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_manifest(&self, manifest: &TreeManifest) -> Result<()> {
        let bytes = codec::encode_manifest(manifest)?;
        self.write_atomic(&self.manifest_path(), &bytes)
            .map_err(|e| SpatreeError::WriteError(format!("failed to write manifest: {}", e)))
    }

    fn sync(&self) -> Result<()> {
        File::open(&self.nodes_dir)?.sync_all()?;
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }

    fn stats(&self) -> StorageStats {
        let mut nodes = 0;
        let mut bytes = 0;
        if let Ok(entries) = fs::read_dir(&self.nodes_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == NODE_EXT) {
                    nodes += 1;
                    bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
        }
        StorageStats {
            nodes,
            bytes,
            loads: self.loads.load(Ordering::Relaxed),
            saves: self.saves.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
        }
    }
}
