/**
 * Content fingerprints and canonical string keys.
 *  Every piece of stored content is addressed by the
 *  SHA-256 digest of its bytes, rendered `sha256:<hex>`.
 */
pub mod digest;
/**
 * The node model: collections, chunked files, and
 *  (part-tree) chunks, with their canonical DAG-CBOR
 *  encoding. A node's key is the digest of that encoding.
 */
pub mod node;
/**
 * Content-addressed blob access with digest verification
 *  on every write. Split into a data plane (raw chunk
 *  bytes) and a node plane (encoded node metadata).
 */
pub mod chunks;
/**
 * The node graph: file chunking and assembly, streaming
 *  and slicing, and DAG resolve (missing-key) queries.
 */
pub mod graph;
/**
 * Per-realm reference counting keyed by node key, with
 *  GC status bookkeeping for the external sweeper.
 */
pub mod refcount;
/**
 * Per-realm running usage totals and quota enforcement.
 */
pub mod usage;
/**
 * Scoped capability tickets: issuance, scope and expiry
 *  validation, and write-once semantics.
 */
pub mod ticket;
/**
 * Append-only commits and named, versioned depot
 *  pointers into the DAG.
 */
pub mod depot;
/**
 * Engine configuration, passed explicitly into component
 *  constructors.
 */
pub mod config;
/**
 * The engine facade: wires the components together behind
 *  the surface the request front-end dispatches into.
 */
pub mod engine;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::digest::{is_valid_key, Key};
    pub use crate::engine::{Engine, EngineError};
    pub use crate::graph::{FileHandle, NodeGraph};
    pub use crate::node::Node;
    pub use crate::ticket::{Scope, Ticket, Writable};
}
