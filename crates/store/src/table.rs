//! Key-value table service trait.
//!
//! Records are addressed by `(table, partition key, sort key)`. Every
//! record scoped to one realm shares that realm's partition key, so a
//! single prefix scan can enumerate all of a realm's state.
//!
//! The conditional write ([`TableStore::compare_and_swap`]) is the
//! engine's only serialization primitive: refcount updates and ticket
//! write-once both linearize through it.

use std::fmt::Display;

use bytes::Bytes;

use crate::error::Result;

/// The logical tables the engine persists into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Ticket records.
    Tokens,
    /// Ownership, commit, depot, and depot-history records,
    /// partitioned by realm with type-prefixed sort keys.
    Realm,
    /// Per-realm refcount and GC bookkeeping.
    RefCount,
    /// Per-realm running usage totals.
    Usage,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Tokens => "tokens",
            Table::Realm => "realm",
            Table::RefCount => "refcount",
            Table::Usage => "usage",
        }
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page of a prefix scan.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    /// `(sort key, value)` pairs in ascending sort-key order.
    pub items: Vec<(String, Bytes)>,
    /// Cursor to pass back for the next page, `None` when exhausted.
    pub next: Option<String>,
}

/// Point get/put, conditional writes, prefix scans, and atomic
/// counters over composite-keyed records.
///
/// Implementations must make `put_if_absent`, `compare_and_swap`, and
/// `update_counter` atomic with respect to each other on the same key;
/// everything the engine guarantees about write-once tickets and
/// refcount consistency rests on that.
#[async_trait::async_trait]
pub trait TableStore: Send + Sync + std::fmt::Debug + 'static {
    /// Fetch a record. Returns `None` if absent.
    async fn get(&self, table: Table, pk: &str, sk: &str) -> Result<Option<Bytes>>;

    /// Unconditionally write a record.
    async fn put(&self, table: Table, pk: &str, sk: &str, value: Bytes) -> Result<()>;

    /// Write a record only if the key is currently absent.
    ///
    /// Returns `false` (leaving the existing record untouched) when the
    /// key already exists.
    async fn put_if_absent(&self, table: Table, pk: &str, sk: &str, value: Bytes) -> Result<bool>;

    /// Optimistic compare-and-swap.
    ///
    /// Writes `value` only if the current record equals `expected`
    /// (`None` meaning "absent"). Returns whether the swap applied.
    async fn compare_and_swap(
        &self,
        table: Table,
        pk: &str,
        sk: &str,
        expected: Option<&[u8]>,
        value: Bytes,
    ) -> Result<bool>;

    /// Scan records whose sort key starts with `sk_prefix`, in
    /// ascending sort-key order, starting after `cursor` if given.
    async fn scan_prefix(
        &self,
        table: Table,
        pk: &str,
        sk_prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ScanPage>;

    /// Atomically add `delta` to a numeric cell, creating it at zero
    /// first if absent. Returns the new value.
    async fn update_counter(&self, table: Table, pk: &str, sk: &str, delta: i64) -> Result<i64>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, table: Table, pk: &str, sk: &str) -> Result<bool>;
}
