//! Content-addressed blob access.
//!
//! Wraps the backing [`BlobStore`] with digest verification on every
//! write. Two planes share the store: raw chunk bytes live under
//! `data/<key>` and encoded node metadata under `node/<key>`. In both
//! planes the stored bytes hash to the key they live at, so a write to
//! an occupied key is by definition a re-upload of identical content
//! and completes as a verified no-op.

use std::sync::Arc;

use bytes::Bytes;
use store::{BlobStore, ByteStream, StoreError};
use tracing::debug;

use crate::digest::Key;
use crate::node::{CodecError, Node};

#[derive(Debug, thiserror::Error)]
pub enum ChunkStoreError {
    /// Uploaded bytes do not hash to the asserted key. Caller bug or
    /// tampering; never retried.
    #[error("digest mismatch: asserted {asserted}, computed {computed}")]
    DigestMismatch { asserted: Key, computed: Key },
    #[error("not found: {0}")]
    NotFound(Key),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Outcome of a content-addressed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// False when the key already held the content (deduplicated).
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct ChunkStore {
    blobs: Arc<dyn BlobStore>,
}

fn data_key(key: &Key) -> String {
    format!("data/{}", key)
}

fn node_key(key: &Key) -> String {
    format!("node/{}", key)
}

impl ChunkStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Store raw chunk bytes under the asserted key.
    ///
    /// Verifies `digest(bytes) == key` before accepting. An existing
    /// key is a verified no-op, which makes concurrent re-uploads of
    /// identical content safe and idempotent.
    pub async fn put_chunk(&self, key: Key, bytes: Bytes) -> Result<PutOutcome, ChunkStoreError> {
        let computed = Key::digest(&bytes);
        if computed != key {
            return Err(ChunkStoreError::DigestMismatch {
                asserted: key,
                computed,
            });
        }

        if self.blobs.contains(&data_key(&key)).await? {
            debug!(%key, "chunk already present, deduplicated");
            return Ok(PutOutcome { created: false });
        }

        debug!(%key, size = bytes.len(), "storing chunk");
        self.blobs.put(&data_key(&key), bytes).await?;
        Ok(PutOutcome { created: true })
    }

    /// Fetch raw chunk bytes.
    pub async fn get_chunk(&self, key: &Key) -> Result<Bytes, ChunkStoreError> {
        self.blobs
            .get(&data_key(key))
            .await?
            .ok_or(ChunkStoreError::NotFound(*key))
    }

    /// Stream raw chunk bytes without full buffering.
    pub async fn stream_chunk(&self, key: &Key) -> Result<ByteStream, ChunkStoreError> {
        match self.blobs.stream(&data_key(key)).await {
            Ok(stream) => Ok(stream),
            Err(StoreError::NotFound(_)) => Err(ChunkStoreError::NotFound(*key)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn contains_chunk(&self, key: &Key) -> Result<bool, ChunkStoreError> {
        Ok(self.blobs.contains(&data_key(key)).await?)
    }

    /// Store an encoded node. Returns the node's key, the encoded
    /// length (its physical footprint), and whether it was new.
    pub async fn put_node(&self, node: &Node) -> Result<(Key, u64, bool), ChunkStoreError> {
        let encoded = node.encode()?;
        let key = Key::digest(&encoded);
        let physical = encoded.len() as u64;

        if self.blobs.contains(&node_key(&key)).await? {
            return Ok((key, physical, false));
        }

        debug!(%key, size = physical, kind = ?node.kind(), "storing node");
        self.blobs.put(&node_key(&key), encoded).await?;
        Ok((key, physical, true))
    }

    /// Fetch and decode a node record.
    pub async fn get_node(&self, key: &Key) -> Result<Node, ChunkStoreError> {
        self.try_get_node(key)
            .await?
            .ok_or(ChunkStoreError::NotFound(*key))
    }

    /// Fetch a node record if one exists at `key`. Keys holding raw
    /// chunk bytes have no node record and return `None`.
    pub async fn try_get_node(&self, key: &Key) -> Result<Option<Node>, ChunkStoreError> {
        match self.blobs.get(&node_key(key)).await? {
            Some(bytes) => Ok(Some(Node::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn contains_node(&self, key: &Key) -> Result<bool, ChunkStoreError> {
        Ok(self.blobs.contains(&node_key(key)).await?)
    }

    /// Does any content live at this key, in either plane?
    pub async fn contains(&self, key: &Key) -> Result<bool, ChunkStoreError> {
        Ok(self.contains_node(key).await? || self.contains_chunk(key).await?)
    }

    /// Materialize one chunk of a file: raw bytes directly, or the
    /// concatenation of a part-tree's raw parts.
    pub async fn read_chunk(&self, key: &Key) -> Result<Bytes, ChunkStoreError> {
        if let Some(node) = self.try_get_node(key).await? {
            let Node::Chunk { parts, size } = node else {
                return Err(ChunkStoreError::NotFound(*key));
            };
            let parts = parts.unwrap_or_default();
            let mut assembled = Vec::with_capacity(size as usize);
            for part in &parts {
                assembled.extend_from_slice(&self.get_chunk(part).await?);
            }
            return Ok(Bytes::from(assembled));
        }
        self.get_chunk(key).await
    }
}
