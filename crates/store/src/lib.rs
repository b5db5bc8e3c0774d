/**
 * Backing store abstraction for the strata engine.
 * The engine only ever talks to two seams:
 *  - a key-value table service with conditional writes,
 *    prefix scans, and atomic counters
 *  - a content-keyed blob store
 * Any backend offering those primitives can host the
 *  engine; the in-memory implementations here back the
 *  test suites and memory-only deployments.
 */
pub mod blob;
pub mod error;
pub mod memory;
pub mod table;

pub use blob::{BlobStore, ByteStream};
pub use error::{Result, StoreError};
pub use memory::{MemoryBlobStore, MemoryTableStore};
pub use table::{ScanPage, Table, TableStore};
