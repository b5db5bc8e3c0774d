//! Blob store trait.
//!
//! Byte storage keyed by content key. Writes are idempotent by key:
//! the engine only ever stores content under its own digest, so two
//! writers racing on the same key are by definition writing the same
//! bytes.

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;

/// A stream of byte frames making up one blob, in order.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Content-keyed byte storage.
///
/// Data moves as [`Bytes`] to keep the chunk path copy-free.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug + 'static {
    /// Store bytes under `key`. Idempotent: re-putting an existing key
    /// succeeds without observable effect.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Fetch a blob. Returns `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Stream a blob's bytes without buffering the whole thing.
    ///
    /// Fails with [`StoreError::NotFound`](crate::StoreError::NotFound)
    /// for absent keys.
    async fn stream(&self, key: &str) -> Result<ByteStream>;

    /// Check whether a blob exists.
    async fn contains(&self, key: &str) -> Result<bool>;
}
