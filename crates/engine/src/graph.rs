//! The node graph.
//!
//! Builds and validates nodes, assembles and streams chunked file
//! content, and answers DAG resolve (missing-key) queries for
//! incremental sync.
//!
//! Files are split at fixed offsets into threshold-sized chunks (the
//! final chunk may be shorter). Splitting is content-independent,
//! which keeps it reproducible and simple at the cost of weaker
//! cross-file dedup: an insert at the start of a file shifts every
//! downstream chunk boundary. Known limitation, not a bug.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use crate::chunks::{ChunkStore, ChunkStoreError};
use crate::config::Config;
use crate::digest::Key;
use crate::node::{CodecError, Node};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("invalid range: [{start}, {end}) over {size} bytes")]
    InvalidRange { start: u64, end: u64, size: u64 },
    #[error("config limit exceeded: {0}")]
    ConfigLimitExceeded(String),
    #[error("not found: {0}")]
    NotFound(Key),
    #[error("not a file node: {0}")]
    NotAFile(Key),
    #[error("referenced child does not exist: {0}")]
    ChildMissing(Key),
    #[error("chunk store error: {0}")]
    ChunkStore(#[from] ChunkStoreError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// A raw data-plane write a plan will perform.
#[derive(Debug, Clone)]
pub struct PlannedBlob {
    pub key: Key,
    pub bytes: Bytes,
}

/// A node-plane write a plan will perform.
#[derive(Debug, Clone)]
pub struct PlannedNode {
    pub key: Key,
    pub node: Node,
    pub encoded: Bytes,
}

/// Everything a file write will store, computed before any IO.
///
/// Planning up front gives the write path the root key and the exact
/// physical footprint before a single byte lands, which is what lets
/// the ticket write-once claim and the quota check run first.
#[derive(Debug, Clone)]
pub struct FilePlan {
    pub root: Key,
    pub logical_size: u64,
    /// Total bytes the plan would add to the store if nothing
    /// deduplicates: raw chunk bytes plus encoded node records.
    pub physical_size: u64,
    /// Data-plane writes, dependency-ordered before `nodes`.
    pub blobs: Vec<PlannedBlob>,
    /// Node-plane writes; parents come after the children they
    /// reference.
    pub nodes: Vec<PlannedNode>,
}

/// A collection write, planned the same way.
#[derive(Debug, Clone)]
pub struct CollectionPlan {
    pub root: Key,
    pub logical_size: u64,
    pub physical_size: u64,
    pub node: PlannedNode,
}

/// One node in a root's reachable set, with the sizes refcount
/// bookkeeping bills by.
#[derive(Debug, Clone)]
pub struct ReachableNode {
    pub key: Key,
    pub logical: u64,
    pub physical: u64,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NodeGraph {
    chunks: ChunkStore,
    config: Config,
}

impl NodeGraph {
    pub fn new(chunks: ChunkStore, config: Config) -> Self {
        Self { chunks, config }
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    /// Plan a file write without touching the store.
    ///
    /// `chunk_threshold` comes from the caller's ticket (a snapshot of
    /// config at issuance); content at or under it stays a single
    /// chunk, anything larger splits at fixed offsets. A chunk that
    /// would exceed the blob ceiling becomes a small part-tree.
    pub fn plan_file(
        &self,
        bytes: Bytes,
        content_type: &str,
        chunk_threshold: usize,
    ) -> Result<FilePlan, GraphError> {
        let threshold = chunk_threshold.max(1);
        let mut blobs = Vec::new();
        let mut nodes = Vec::new();
        let mut chunk_keys = Vec::new();
        let mut chunk_sizes = Vec::new();
        let mut physical = 0u64;

        let mut offset = 0;
        while offset < bytes.len() {
            let end = (offset + threshold).min(bytes.len());
            let piece = bytes.slice(offset..end);
            chunk_sizes.push(piece.len() as u64);
            chunk_keys.push(self.plan_chunk(piece, &mut blobs, &mut nodes, &mut physical)?);
            offset = end;
        }

        let file = Node::File {
            size: bytes.len() as u64,
            content_type: content_type.to_string(),
            chunks: chunk_keys,
            chunk_sizes,
        };
        let encoded = file.encode()?;
        let root = Key::digest(&encoded);
        physical += encoded.len() as u64;
        nodes.push(PlannedNode {
            key: root,
            node: file,
            encoded,
        });

        debug!(
            %root,
            size = bytes.len(),
            chunks = blobs.len(),
            "planned file write"
        );
        Ok(FilePlan {
            root,
            logical_size: bytes.len() as u64,
            physical_size: physical,
            blobs,
            nodes,
        })
    }

    /// Plan one chunk: a raw blob, or a part-tree when the chunk would
    /// exceed the blob ceiling.
    fn plan_chunk(
        &self,
        piece: Bytes,
        blobs: &mut Vec<PlannedBlob>,
        nodes: &mut Vec<PlannedNode>,
        physical: &mut u64,
    ) -> Result<Key, GraphError> {
        let ceiling = self.config.chunk_ceiling.max(1);
        if piece.len() <= ceiling {
            let key = Key::digest(&piece);
            *physical += piece.len() as u64;
            blobs.push(PlannedBlob { key, bytes: piece });
            return Ok(key);
        }

        let mut parts = Vec::new();
        let mut offset = 0;
        while offset < piece.len() {
            let end = (offset + ceiling).min(piece.len());
            let part = piece.slice(offset..end);
            let key = Key::digest(&part);
            *physical += part.len() as u64;
            blobs.push(PlannedBlob { key, bytes: part });
            parts.push(key);
            offset = end;
        }

        let tree = Node::Chunk {
            size: piece.len() as u64,
            parts: Some(parts),
        };
        let encoded = tree.encode()?;
        let key = Key::digest(&encoded);
        *physical += encoded.len() as u64;
        nodes.push(PlannedNode {
            key,
            node: tree,
            encoded,
        });
        Ok(key)
    }

    /// Plan a collection over already-stored children.
    ///
    /// Validates the child count against config and that every child
    /// exists; aggregate size is the sum of child sizes.
    pub async fn plan_collection(
        &self,
        children: BTreeMap<String, Key>,
    ) -> Result<CollectionPlan, GraphError> {
        if children.len() > self.config.max_collection_children {
            return Err(GraphError::ConfigLimitExceeded(format!(
                "collection has {} children, max is {}",
                children.len(),
                self.config.max_collection_children
            )));
        }

        let mut size = 0u64;
        for key in children.values() {
            size += self.content_size(key).await?;
        }

        let node = Node::Collection { size, children };
        let encoded = node.encode()?;
        let root = Key::digest(&encoded);
        let physical = encoded.len() as u64;

        Ok(CollectionPlan {
            root,
            logical_size: size,
            physical_size: physical,
            node: PlannedNode {
                key: root,
                node,
                encoded,
            },
        })
    }

    /// Execute a file plan. Chunk bytes land before any node that
    /// references them, and the file node lands last, so a reader can
    /// never observe a node with dangling references.
    pub async fn store_file_plan(&self, plan: &FilePlan) -> Result<(), GraphError> {
        for blob in &plan.blobs {
            self.chunks.put_chunk(blob.key, blob.bytes.clone()).await?;
        }
        for node in &plan.nodes {
            self.chunks.put_node(&node.node).await?;
        }
        Ok(())
    }

    /// Chunk, store, and wrap `bytes` in a file node. Returns its key.
    pub async fn put_file(&self, bytes: Bytes, content_type: &str) -> Result<Key, GraphError> {
        let plan = self.plan_file(bytes, content_type, self.config.chunk_threshold)?;
        self.store_file_plan(&plan).await?;
        Ok(plan.root)
    }

    /// Validate and store a collection node. Returns its key.
    pub async fn put_collection(
        &self,
        children: BTreeMap<String, Key>,
    ) -> Result<Key, GraphError> {
        let plan = self.plan_collection(children).await?;
        self.chunks.put_node(&plan.node.node).await?;
        Ok(plan.root)
    }

    /// Logical byte size of whatever lives at `key` (node or raw
    /// chunk).
    async fn content_size(&self, key: &Key) -> Result<u64, GraphError> {
        if let Some(node) = self.chunks.try_get_node(key).await? {
            return Ok(node.size());
        }
        match self.chunks.get_chunk(key).await {
            Ok(bytes) => Ok(bytes.len() as u64),
            Err(ChunkStoreError::NotFound(_)) => Err(GraphError::ChildMissing(*key)),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a file node for reading.
    pub async fn open_file(&self, key: &Key) -> Result<FileHandle, GraphError> {
        let node = match self.chunks.try_get_node(key).await? {
            Some(node) => node,
            None => return Err(GraphError::NotFound(*key)),
        };
        let Node::File {
            size,
            content_type,
            chunks,
            chunk_sizes,
        } = node
        else {
            return Err(GraphError::NotAFile(*key));
        };

        Ok(FileHandle {
            graph: self.clone(),
            key: *key,
            size,
            content_type,
            chunks,
            chunk_sizes,
        })
    }

    /// Compute the keys reachable from `root` that are absent from
    /// `known`.
    ///
    /// Walks breadth-first; a node already in `known` is neither
    /// fetched nor expanded, so a client that holds a subtree is never
    /// sent any of it. Used for incremental sync: the client reports
    /// what it has, the server answers with what is still missing.
    pub async fn resolve(
        &self,
        root: Key,
        known: &HashSet<Key>,
    ) -> Result<Vec<Key>, GraphError> {
        let mut missing = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([root]);

        while let Some(key) = queue.pop_front() {
            if known.contains(&key) || !visited.insert(key) {
                continue;
            }
            missing.insert(key);
            if let Some(node) = self.chunks.try_get_node(&key).await? {
                queue.extend(node.child_keys());
            }
        }

        Ok(missing.into_iter().collect())
    }

    /// Walk the full reachable set of `root` with the sizes refcount
    /// bookkeeping bills by. Each distinct key appears once.
    pub async fn reachable(&self, root: Key) -> Result<Vec<ReachableNode>, GraphError> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([root]);

        while let Some(key) = queue.pop_front() {
            if !visited.insert(key) {
                continue;
            }
            if let Some(node) = self.chunks.try_get_node(&key).await? {
                let encoded = node.encode()?;
                out.push(ReachableNode {
                    key,
                    logical: node.size(),
                    physical: encoded.len() as u64,
                    content_type: match &node {
                        Node::File { content_type, .. } => Some(content_type.clone()),
                        _ => None,
                    },
                });
                queue.extend(node.child_keys());
            } else {
                let bytes = self.chunks.get_chunk(&key).await?;
                out.push(ReachableNode {
                    key,
                    logical: bytes.len() as u64,
                    physical: bytes.len() as u64,
                    content_type: None,
                });
            }
        }

        Ok(out)
    }
}

/// A read handle over one file node.
#[derive(Debug, Clone)]
pub struct FileHandle {
    graph: NodeGraph,
    key: Key,
    size: u64,
    content_type: String,
    chunks: Vec<Key>,
    chunk_sizes: Vec<u64>,
}

/// One chunk read a slice will perform: chunk index plus the local
/// byte range within that chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkRead {
    index: usize,
    start: usize,
    end: usize,
}

impl FileHandle {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_sizes(&self) -> &[u64] {
        &self.chunk_sizes
    }

    /// The full file content, concatenated in chunk order.
    pub async fn bytes(&self) -> Result<Bytes, GraphError> {
        let mut out = Vec::with_capacity(self.size as usize);
        for key in &self.chunks {
            out.extend_from_slice(&self.graph.chunks.read_chunk(key).await?);
        }
        Ok(Bytes::from(out))
    }

    /// Lazy, finite stream of the file's chunks, strictly in order.
    /// Each call starts a fresh pass from the first chunk.
    pub fn stream(&self) -> BoxStream<'static, Result<Bytes, GraphError>> {
        let reads = (0..self.chunks.len())
            .map(|index| ChunkRead {
                index,
                start: 0,
                end: self.chunk_sizes[index] as usize,
            })
            .collect();
        self.stream_reads(reads)
    }

    /// Stream the byte range `[start, end)`.
    ///
    /// Locates the first overlapping chunk by scanning the chunk-size
    /// prefix sums, emits a partial read of it from the local offset,
    /// then whole or partial chunks until the range is covered.
    pub fn slice(
        &self,
        start: u64,
        end: u64,
    ) -> Result<BoxStream<'static, Result<Bytes, GraphError>>, GraphError> {
        if start > end || end > self.size {
            return Err(GraphError::InvalidRange {
                start,
                end,
                size: self.size,
            });
        }

        let mut reads = Vec::new();
        let mut chunk_start = 0u64;
        for (index, &len) in self.chunk_sizes.iter().enumerate() {
            let chunk_end = chunk_start + len;
            // overlap of [start, end) with [chunk_start, chunk_end)
            let lo = start.max(chunk_start);
            let hi = end.min(chunk_end);
            if lo < hi {
                reads.push(ChunkRead {
                    index,
                    start: (lo - chunk_start) as usize,
                    end: (hi - chunk_start) as usize,
                });
            }
            chunk_start = chunk_end;
            if chunk_start >= end {
                break;
            }
        }

        Ok(self.stream_reads(reads))
    }

    fn stream_reads(
        &self,
        reads: Vec<ChunkRead>,
    ) -> BoxStream<'static, Result<Bytes, GraphError>> {
        let graph = self.graph.clone();
        let chunks = self.chunks.clone();
        futures::stream::try_unfold(
            (graph, chunks, reads.into_iter()),
            |(graph, chunks, mut reads)| async move {
                let Some(read) = reads.next() else {
                    return Ok(None);
                };
                let bytes = graph.chunks.read_chunk(&chunks[read.index]).await?;
                let piece = bytes.slice(read.start..read.end);
                Ok(Some((piece, (graph, chunks, reads))))
            },
        )
        .boxed()
    }
}
