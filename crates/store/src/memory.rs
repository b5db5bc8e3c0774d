//! In-memory backing stores.
//!
//! Back the test suites and memory-only deployments. All mutation goes
//! through a single `parking_lot::RwLock` per store, which makes the
//! conditional-write primitives trivially atomic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use tracing::debug;

use crate::blob::{BlobStore, ByteStream};
use crate::error::{Result, StoreError};
use crate::table::{ScanPage, Table, TableStore};

/// Frame size used when streaming blobs out of memory.
const STREAM_FRAME_BYTES: usize = 64 * 1024;

/// In-memory table service over `BTreeMap`s (sorted sort keys give us
/// prefix scans for free).
#[derive(Debug, Clone, Default)]
pub struct MemoryTableStore {
    inner: Arc<RwLock<MemoryTableStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryTableStoreInner {
    /// (table, pk) -> sk -> value
    records: HashMap<(Table, String), BTreeMap<String, Bytes>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter_value(bytes: &Bytes, key: &str) -> Result<i64> {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| StoreError::NotACounter(key.to_string()))
    }
}

#[async_trait::async_trait]
impl TableStore for MemoryTableStore {
    async fn get(&self, table: Table, pk: &str, sk: &str) -> Result<Option<Bytes>> {
        let inner = self.inner.read();
        Ok(inner
            .records
            .get(&(table, pk.to_string()))
            .and_then(|part| part.get(sk))
            .cloned())
    }

    async fn put(&self, table: Table, pk: &str, sk: &str, value: Bytes) -> Result<()> {
        let mut inner = self.inner.write();
        debug!(%table, pk, sk, size = value.len(), "put record");
        inner
            .records
            .entry((table, pk.to_string()))
            .or_default()
            .insert(sk.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(&self, table: Table, pk: &str, sk: &str, value: Bytes) -> Result<bool> {
        let mut inner = self.inner.write();
        let part = inner.records.entry((table, pk.to_string())).or_default();
        if part.contains_key(sk) {
            return Ok(false);
        }
        debug!(%table, pk, sk, size = value.len(), "put record (was absent)");
        part.insert(sk.to_string(), value);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        table: Table,
        pk: &str,
        sk: &str,
        expected: Option<&[u8]>,
        value: Bytes,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        let part = inner.records.entry((table, pk.to_string())).or_default();
        let current = part.get(sk).map(|b| b.as_ref());
        if current != expected {
            return Ok(false);
        }
        debug!(%table, pk, sk, size = value.len(), "cas applied");
        part.insert(sk.to_string(), value);
        Ok(true)
    }

    async fn scan_prefix(
        &self,
        table: Table,
        pk: &str,
        sk_prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ScanPage> {
        let inner = self.inner.read();
        let Some(part) = inner.records.get(&(table, pk.to_string())) else {
            return Ok(ScanPage::default());
        };

        let mut items: Vec<(String, Bytes)> = Vec::new();
        let mut next = None;
        for (sk, value) in part.range(sk_prefix.to_string()..) {
            if !sk.starts_with(sk_prefix) {
                break;
            }
            // cursors are exclusive: resume strictly after the last
            // sort key the previous page returned
            if let Some(cursor) = cursor {
                if sk.as_str() <= cursor {
                    continue;
                }
            }
            if items.len() == limit {
                next = items.last().map(|(sk, _)| sk.clone());
                break;
            }
            items.push((sk.clone(), value.clone()));
        }

        Ok(ScanPage { items, next })
    }

    async fn update_counter(&self, table: Table, pk: &str, sk: &str, delta: i64) -> Result<i64> {
        let mut inner = self.inner.write();
        let part = inner.records.entry((table, pk.to_string())).or_default();
        let current = match part.get(sk) {
            Some(bytes) => Self::counter_value(bytes, sk)?,
            None => 0,
        };
        let updated = current + delta;
        part.insert(sk.to_string(), Bytes::from(updated.to_string()));
        Ok(updated)
    }

    async fn delete(&self, table: Table, pk: &str, sk: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        Ok(inner
            .records
            .get_mut(&(table, pk.to_string()))
            .map(|part| part.remove(sk).is_some())
            .unwrap_or(false))
    }
}

/// In-memory blob store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently held (test observability).
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let mut blobs = self.blobs.write();
        debug!(key, size = data.len(), "storing blob in memory");
        blobs.entry(key.to_string()).or_insert(data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let blobs = self.blobs.read();
        Ok(blobs.get(key).cloned())
    }

    async fn stream(&self, key: &str) -> Result<ByteStream> {
        let data = self
            .get(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + STREAM_FRAME_BYTES).min(data.len());
            frames.push(Ok(data.slice(offset..end)));
            offset = end;
        }

        Ok(futures::stream::iter(frames).boxed())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let blobs = self.blobs.read();
        Ok(blobs.contains_key(key))
    }
}
