//! On-disk framing of node bodies and the manifest.
//!
//! A node record is `NODE_MAGIC (4) | VERSION (1) | bincode(Node)` and the
//! manifest is framed the same way under `MANIFEST_MAGIC`.

use crate::error::{Result, SpatreeError};
use crate::identifier::NodeIdentifier;
use crate::node::Node;
use crate::storage::TreeManifest;
use std::io;

pub const NODE_MAGIC: &[u8; 4] = b"SPTN";
pub const MANIFEST_MAGIC: &[u8; 4] = b"SPTM";
pub const NODE_VERSION: u8 = 1;

const HEADER_LEN: usize = NODE_MAGIC.len() + 1;

pub fn encode_node(node: &Node) -> Result<Vec<u8>> {
    let body = bincode::serialize(node).map_err(|e| {
        SpatreeError::WriteError(format!("failed to encode node {}: {}", node.id(), e))
    })?;
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(NODE_MAGIC);
    buf.push(NODE_VERSION);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode a record and check it really is the body of `ident`.
pub fn decode_node(ident: &NodeIdentifier, bytes: &[u8]) -> Result<Node> {
    let id = ident.id();
    if bytes.len() < HEADER_LEN {
        return Err(SpatreeError::corrupt(id, "record shorter than header"));
    }
    if &bytes[..NODE_MAGIC.len()] != NODE_MAGIC {
        return Err(SpatreeError::corrupt(id, "bad magic"));
    }
    let version = bytes[NODE_MAGIC.len()];
    if version != NODE_VERSION {
        return Err(SpatreeError::corrupt(
            id,
            format!("unsupported format version {}", version),
        ));
    }

    let node: Node = bincode::deserialize(&bytes[HEADER_LEN..])
        .map_err(|e| SpatreeError::corrupt(id, e.to_string()))?;

    if node.id() != id {
        return Err(SpatreeError::corrupt(
            id,
            format!("record belongs to node {}", node.id()),
        ));
    }
    if node.level() != ident.level() {
        return Err(SpatreeError::corrupt(
            id,
            format!(
                "record is at level {}, identifier expects {}",
                node.level(),
                ident.level()
            ),
        ));
    }
    Ok(node)
}

pub fn encode_manifest(manifest: &TreeManifest) -> Result<Vec<u8>> {
    let body = bincode::serialize(manifest)
        .map_err(|e| SpatreeError::WriteError(format!("failed to encode manifest: {}", e)))?;
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(MANIFEST_MAGIC);
    buf.push(NODE_VERSION);
    buf.extend_from_slice(&body);
    Ok(buf)
}

pub fn decode_manifest(bytes: &[u8]) -> Result<TreeManifest> {
    let invalid = |msg: String| SpatreeError::Io(io::Error::new(io::ErrorKind::InvalidData, msg));
    if bytes.len() < HEADER_LEN || &bytes[..MANIFEST_MAGIC.len()] != MANIFEST_MAGIC {
        return Err(invalid("manifest has a bad header".to_string()));
    }
    if bytes[MANIFEST_MAGIC.len()] != NODE_VERSION {
        return Err(invalid(format!(
            "unsupported manifest version {}",
            bytes[MANIFEST_MAGIC.len()]
        )));
    }
    bincode::deserialize(&bytes[HEADER_LEN..])
        .map_err(|e| invalid(format!("failed to decode manifest: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::identifier::{NodeId, PersistedIdentifier};
    use bytes::Bytes;

    fn sample() -> (NodeIdentifier, Node) {
        let mut node = Node::leaf(NodeId::new(3));
        node.insert_entry(Envelope::rect(0.0, 0.0, 2.0, 1.0), Bytes::from("a"), 4).unwrap();
        let ident = NodeIdentifier::new(NodeId::new(3), 0, node.bounds(2));
        (ident, node)
    }

    #[test]
    fn test_node_round_trip() {
        let (ident, node) = sample();
        let bytes = encode_node(&node).unwrap();
        assert_eq!(&bytes[..4], NODE_MAGIC);
        assert_eq!(decode_node(&ident, &bytes).unwrap(), node);
    }

    #[test]
    fn test_rejects_bad_header() {
        let (ident, node) = sample();
        let mut bytes = encode_node(&node).unwrap();

        let err = decode_node(&ident, &bytes[..3]).unwrap_err();
        assert!(matches!(err, SpatreeError::CorruptData { .. }));

        bytes[4] = 9;
        let err = decode_node(&ident, &bytes).unwrap_err();
        assert!(err.to_string().contains("version 9"));

        bytes[0] = b'X';
        assert!(decode_node(&ident, &bytes).is_err());
    }

    #[test]
    fn test_rejects_foreign_record() {
        let (_, node) = sample();
        let bytes = encode_node(&node).unwrap();

        let other = NodeIdentifier::new(NodeId::new(4), 0, Envelope::empty(2));
        assert!(matches!(
            decode_node(&other, &bytes),
            Err(SpatreeError::CorruptData { .. })
        ));

        let wrong_level = NodeIdentifier::new(NodeId::new(3), 1, Envelope::empty(2));
        assert!(decode_node(&wrong_level, &bytes).is_err());
    }

    #[test]
    fn test_rejects_truncated_body() {
        let (ident, node) = sample();
        let bytes = encode_node(&node).unwrap();
        let err = decode_node(&ident, &bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, SpatreeError::CorruptData { .. }));
    }

    #[test]
    fn test_manifest_round_trip() {
        let manifest = TreeManifest {
            root: PersistedIdentifier {
                id: NodeId::new(1),
                level: 2,
                shape: Envelope::rect(0.0, 0.0, 10.0, 10.0),
                valid: true,
            },
            next_id: 42,
            entry_count: 100,
            dimensions: 2,
        };
        let bytes = encode_manifest(&manifest).unwrap();
        assert_eq!(decode_manifest(&bytes).unwrap(), manifest);
        assert!(decode_manifest(b"garbage").is_err());

        // an empty tree's root bounds hold infinities
        let empty = TreeManifest {
            root: PersistedIdentifier {
                shape: Envelope::empty(3),
                ..manifest.root.clone()
            },
            ..manifest
        };
        let bytes = encode_manifest(&empty).unwrap();
        assert!(decode_manifest(&bytes).unwrap().root.shape.is_empty());
    }
}
