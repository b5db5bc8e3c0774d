//! The node model.
//!
//! Nodes are the building blocks of a realm's DAG. Three kinds:
//!
//! - `Collection`: an ordered map of names to child node keys
//! - `File`: an ordered list of chunk keys with parallel byte lengths
//! - `Chunk`: a part-tree over sub-chunk keys, used only when a single
//!   chunk would exceed the configured blob ceiling (plain chunks are
//!   stored as raw bytes and never carry a node record)
//!
//! Nodes are immutable and content-addressed: a node's key is the
//! digest of its canonical DAG-CBOR encoding, so equal content always
//! has equal keys and a key is never reused for different content.
//! Children are always created (and their keys known) before the
//! parent that references them, which is what keeps the graph acyclic.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::digest::Key;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Discriminant for the three node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Collection,
    File,
    Chunk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Collection {
        /// Aggregate byte size of the subtree.
        size: u64,
        /// Child name -> child node key. Names unique within the
        /// collection; BTreeMap keeps the encoding canonical.
        children: BTreeMap<String, Key>,
    },
    File {
        /// Total byte size; equals the sum of `chunk_sizes`.
        size: u64,
        content_type: String,
        /// Ordered chunk keys describing the fixed-offset split.
        chunks: Vec<Key>,
        /// Byte length of each chunk, parallel to `chunks`.
        chunk_sizes: Vec<u64>,
    },
    Chunk {
        size: u64,
        /// Sub-chunk keys for oversized chunks assembled as a small
        /// tree. Raw chunks have no node record at all.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parts: Option<Vec<Key>>,
    },
}

impl Node {
    /// Canonical DAG-CBOR encoding. This is what the node's key is the
    /// digest of.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        serde_ipld_dagcbor::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_ipld_dagcbor::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// The node's content key: digest of the canonical encoding.
    pub fn key(&self) -> Result<Key, CodecError> {
        Ok(Key::digest(&self.encode()?))
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Collection { .. } => NodeKind::Collection,
            Node::File { .. } => NodeKind::File,
            Node::Chunk { .. } => NodeKind::Chunk,
        }
    }

    /// Logical byte size of the node's content.
    pub fn size(&self) -> u64 {
        match self {
            Node::Collection { size, .. } => *size,
            Node::File { size, .. } => *size,
            Node::Chunk { size, .. } => *size,
        }
    }

    /// Keys of every node this node references, in traversal order.
    pub fn child_keys(&self) -> Vec<Key> {
        match self {
            Node::Collection { children, .. } => children.values().copied().collect(),
            Node::File { chunks, .. } => chunks.clone(),
            Node::Chunk { parts, .. } => parts.clone().unwrap_or_default(),
        }
    }
}
