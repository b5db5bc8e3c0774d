//! Per-realm reference counting and GC bookkeeping.
//!
//! `(realm, key)` records carry the number of currently-committed
//! parent references plus a GC status. Count and status move together
//! through a bounded optimistic compare-and-swap loop; concurrent
//! commits touching the same record serialize on the store's
//! conditional write, so updates are never lost.
//!
//! First references also record ownership and bill usage; repeat
//! references to already-owned content never double-bill. The
//! asynchronous sweep that physically reclaims `pending-gc` content is
//! an external collaborator reading the gc index; this module only
//! maintains the bookkeeping it consumes.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use store::{StoreError, Table, TableStore};
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use crate::digest::Key;
use crate::usage::{UsageError, UsageLedger};

const REF_PREFIX: &str = "ref/";
const GC_PREFIX: &str = "gc/";
const OWN_PREFIX: &str = "own/";
const GC_SCAN_PAGE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Internal consistency violation (negative refcount, untracked
    /// decrement). Logged loudly, operation rejected, no automatic
    /// repair.
    #[error("ledger corruption: {0}")]
    Corruption(String),
    /// A conditional update lost the race more times than the bounded
    /// retry allows.
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcStatus {
    Live,
    PendingGc,
    Collected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCountRecord {
    pub count: u64,
    pub gc_status: GcStatus,
}

/// Records that a realm has legitimately introduced a node. Content
/// may still be shared across realms through deduplication; ownership
/// gates visibility and billing attribution, not exclusivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub content_type: Option<String>,
    pub logical_size: u64,
    pub physical_size: u64,
    pub created_at: OffsetDateTime,
    pub created_by: String,
}

/// Outcome of a decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decrement {
    pub new_count: u64,
    /// True when the record just reached zero and is now eligible for
    /// physical reclamation. The sweep is asynchronous; nothing is
    /// purged here.
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct RefCountLedger {
    tables: Arc<dyn TableStore>,
    usage: UsageLedger,
    cas_retry_limit: usize,
}

fn ref_sk(key: &Key) -> String {
    format!("{}{}", REF_PREFIX, key)
}

fn gc_sk(key: &Key) -> String {
    format!("{}{}", GC_PREFIX, key)
}

fn own_sk(key: &Key) -> String {
    format!("{}{}", OWN_PREFIX, key)
}

impl RefCountLedger {
    pub fn new(tables: Arc<dyn TableStore>, usage: UsageLedger, cas_retry_limit: usize) -> Self {
        Self {
            tables,
            usage,
            cas_retry_limit,
        }
    }

    async fn record(
        &self,
        realm: &str,
        key: &Key,
    ) -> Result<Option<(Bytes, RefCountRecord)>, LedgerError> {
        match self.tables.get(Table::RefCount, realm, &ref_sk(key)).await? {
            Some(bytes) => {
                let record: RefCountRecord = serde_json::from_slice(&bytes)?;
                Ok(Some((bytes, record)))
            }
            None => Ok(None),
        }
    }

    /// Atomically increment the reference count for `(realm, key)`.
    ///
    /// Returns whether this was the realm's first (or first since
    /// collection) reference to the key; only then are ownership and
    /// usage recorded, so repeat references never double-bill.
    pub async fn increment(
        &self,
        realm: &str,
        key: &Key,
        logical_size: u64,
        physical_size: u64,
        content_type: Option<&str>,
        created_by: &str,
    ) -> Result<bool, LedgerError> {
        for _ in 0..self.cas_retry_limit {
            match self.record(realm, key).await? {
                None => {
                    let fresh = RefCountRecord {
                        count: 1,
                        gc_status: GcStatus::Live,
                    };
                    let applied = self
                        .tables
                        .compare_and_swap(
                            Table::RefCount,
                            realm,
                            &ref_sk(key),
                            None,
                            Bytes::from(serde_json::to_vec(&fresh)?),
                        )
                        .await?;
                    if !applied {
                        continue;
                    }
                    self.record_introduction(
                        realm,
                        key,
                        logical_size,
                        physical_size,
                        content_type,
                        created_by,
                    )
                    .await?;
                    debug!(realm, %key, "first reference in realm");
                    return Ok(true);
                }
                Some((current_bytes, current)) => {
                    let revived = current.gc_status == GcStatus::PendingGc;
                    let reintroduced = current.gc_status == GcStatus::Collected;
                    let updated = RefCountRecord {
                        count: current.count + 1,
                        gc_status: GcStatus::Live,
                    };
                    let applied = self
                        .tables
                        .compare_and_swap(
                            Table::RefCount,
                            realm,
                            &ref_sk(key),
                            Some(&current_bytes),
                            Bytes::from(serde_json::to_vec(&updated)?),
                        )
                        .await?;
                    if !applied {
                        continue;
                    }
                    if revived {
                        // back from the GC queue before the sweep got
                        // to it
                        self.tables
                            .delete(Table::RefCount, realm, &gc_sk(key))
                            .await?;
                        debug!(realm, %key, "revived pending-gc reference");
                    }
                    if reintroduced {
                        // the sweep already reclaimed it; bill again
                        self.record_introduction(
                            realm,
                            key,
                            logical_size,
                            physical_size,
                            content_type,
                            created_by,
                        )
                        .await?;
                        return Ok(true);
                    }
                    return Ok(false);
                }
            }
        }

        warn!(realm, %key, "refcount increment exhausted cas retries");
        Err(LedgerError::Conflict(format!(
            "increment of {} in {}",
            key, realm
        )))
    }

    async fn record_introduction(
        &self,
        realm: &str,
        key: &Key,
        logical_size: u64,
        physical_size: u64,
        content_type: Option<&str>,
        created_by: &str,
    ) -> Result<(), LedgerError> {
        let ownership = Ownership {
            content_type: content_type.map(str::to_string),
            logical_size,
            physical_size,
            created_at: OffsetDateTime::now_utc(),
            created_by: created_by.to_string(),
        };
        self.tables
            .put(
                Table::Realm,
                realm,
                &own_sk(key),
                Bytes::from(serde_json::to_vec(&ownership)?),
            )
            .await?;
        self.usage.update(realm, physical_size as i64, 1).await?;
        Ok(())
    }

    /// Atomically decrement the reference count for `(realm, key)`.
    ///
    /// Reaching zero flips the record to `pending-gc` and queues it on
    /// the gc index. Decrementing an untracked key or below zero is an
    /// internal consistency error, rejected without repair.
    pub async fn decrement(&self, realm: &str, key: &Key) -> Result<Decrement, LedgerError> {
        for _ in 0..self.cas_retry_limit {
            let Some((current_bytes, current)) = self.record(realm, key).await? else {
                error!(realm, %key, "decrement of untracked refcount");
                return Err(LedgerError::Corruption(format!(
                    "decrement of untracked {} in {}",
                    key, realm
                )));
            };
            if current.count == 0 {
                error!(realm, %key, "refcount would go negative");
                return Err(LedgerError::Corruption(format!(
                    "refcount underflow for {} in {}",
                    key, realm
                )));
            }

            let new_count = current.count - 1;
            let updated = RefCountRecord {
                count: new_count,
                gc_status: if new_count == 0 {
                    GcStatus::PendingGc
                } else {
                    current.gc_status
                },
            };
            let applied = self
                .tables
                .compare_and_swap(
                    Table::RefCount,
                    realm,
                    &ref_sk(key),
                    Some(&current_bytes),
                    Bytes::from(serde_json::to_vec(&updated)?),
                )
                .await?;
            if !applied {
                continue;
            }

            if new_count == 0 {
                self.tables
                    .put(
                        Table::RefCount,
                        realm,
                        &gc_sk(key),
                        Bytes::from(serde_json::to_vec(&OffsetDateTime::now_utc())?),
                    )
                    .await?;
                debug!(realm, %key, "reference count reached zero, pending gc");
            }
            return Ok(Decrement {
                new_count,
                deleted: new_count == 0,
            });
        }

        warn!(realm, %key, "refcount decrement exhausted cas retries");
        Err(LedgerError::Conflict(format!(
            "decrement of {} in {}",
            key, realm
        )))
    }

    /// Current record for `(realm, key)`, if any.
    pub async fn get(&self, realm: &str, key: &Key) -> Result<Option<RefCountRecord>, LedgerError> {
        Ok(self.record(realm, key).await?.map(|(_, record)| record))
    }

    /// Ownership record for `(realm, key)`, if the realm introduced it.
    pub async fn ownership(&self, realm: &str, key: &Key) -> Result<Option<Ownership>, LedgerError> {
        match self.tables.get(Table::Realm, realm, &own_sk(key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Keys queued for the external sweep.
    pub async fn list_pending(&self, realm: &str) -> Result<Vec<Key>, LedgerError> {
        let mut pending = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .tables
                .scan_prefix(
                    Table::RefCount,
                    realm,
                    GC_PREFIX,
                    cursor.as_deref(),
                    GC_SCAN_PAGE,
                )
                .await?;
            for (sk, _) in &page.items {
                let raw = &sk[GC_PREFIX.len()..];
                match raw.parse::<Key>() {
                    Ok(key) => pending.push(key),
                    Err(_) => warn!(realm, sk, "malformed gc index entry, skipping"),
                }
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(pending)
    }

    /// Confirm the sweep reclaimed a pending key: `pending-gc` ->
    /// `collected`, gc index entry removed, usage returned.
    pub async fn mark_collected(&self, realm: &str, key: &Key) -> Result<(), LedgerError> {
        for _ in 0..self.cas_retry_limit {
            let Some((current_bytes, current)) = self.record(realm, key).await? else {
                return Err(LedgerError::Corruption(format!(
                    "collect of untracked {} in {}",
                    key, realm
                )));
            };
            if current.gc_status != GcStatus::PendingGc || current.count != 0 {
                // re-referenced since it was queued; nothing to collect
                return Err(LedgerError::Conflict(format!(
                    "{} in {} is no longer pending gc",
                    key, realm
                )));
            }

            let collected = RefCountRecord {
                count: 0,
                gc_status: GcStatus::Collected,
            };
            let applied = self
                .tables
                .compare_and_swap(
                    Table::RefCount,
                    realm,
                    &ref_sk(key),
                    Some(&current_bytes),
                    Bytes::from(serde_json::to_vec(&collected)?),
                )
                .await?;
            if !applied {
                continue;
            }

            self.tables
                .delete(Table::RefCount, realm, &gc_sk(key))
                .await?;
            if let Some(ownership) = self.ownership(realm, key).await? {
                self.usage
                    .update(realm, -(ownership.physical_size as i64), -1)
                    .await?;
            }
            debug!(realm, %key, "collected");
            return Ok(());
        }

        Err(LedgerError::Conflict(format!(
            "collect of {} in {}",
            key, realm
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::MemoryTableStore;

    fn ledger() -> (RefCountLedger, UsageLedger) {
        let tables: Arc<dyn TableStore> = Arc::new(MemoryTableStore::new());
        let usage = UsageLedger::new(tables.clone(), 1_000_000);
        (
            RefCountLedger::new(tables, usage.clone(), 8),
            usage,
        )
    }

    #[tokio::test]
    async fn test_first_reference_introduces() {
        let (refs, usage) = ledger();
        let key = Key::digest(b"node");

        let new = refs
            .increment("realm-a", &key, 100, 120, Some("text/plain"), "caller-1")
            .await
            .unwrap();
        assert!(new);

        let record = refs.get("realm-a", &key).await.unwrap().unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.gc_status, GcStatus::Live);

        let ownership = refs.ownership("realm-a", &key).await.unwrap().unwrap();
        assert_eq!(ownership.physical_size, 120);
        assert_eq!(ownership.created_by, "caller-1");

        let totals = usage.usage("realm-a").await.unwrap();
        assert_eq!(totals.physical_bytes, 120);
        assert_eq!(totals.node_count, 1);
    }

    #[tokio::test]
    async fn test_repeat_reference_does_not_double_bill() {
        let (refs, usage) = ledger();
        let key = Key::digest(b"node");

        assert!(refs
            .increment("realm-a", &key, 100, 120, None, "c")
            .await
            .unwrap());
        assert!(!refs
            .increment("realm-a", &key, 100, 120, None, "c")
            .await
            .unwrap());

        let record = refs.get("realm-a", &key).await.unwrap().unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(usage.usage("realm-a").await.unwrap().physical_bytes, 120);
    }

    #[tokio::test]
    async fn test_inc_dec_symmetry() {
        let (refs, _) = ledger();
        let key = Key::digest(b"node");

        for _ in 0..3 {
            refs.increment("realm-a", &key, 10, 10, None, "c")
                .await
                .unwrap();
        }
        for i in (0..3).rev() {
            let dec = refs.decrement("realm-a", &key).await.unwrap();
            assert_eq!(dec.new_count, i);
            assert_eq!(dec.deleted, i == 0);
        }

        let record = refs.get("realm-a", &key).await.unwrap().unwrap();
        assert_eq!(record.count, 0);
        assert_eq!(record.gc_status, GcStatus::PendingGc);
        assert_eq!(refs.list_pending("realm-a").await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn test_underflow_is_corruption() {
        let (refs, _) = ledger();
        let key = Key::digest(b"node");

        // untracked decrement
        assert!(matches!(
            refs.decrement("realm-a", &key).await.unwrap_err(),
            LedgerError::Corruption(_)
        ));

        refs.increment("realm-a", &key, 1, 1, None, "c")
            .await
            .unwrap();
        refs.decrement("realm-a", &key).await.unwrap();
        // now at zero: a further decrement is corruption, not a clamp
        assert!(matches!(
            refs.decrement("realm-a", &key).await.unwrap_err(),
            LedgerError::Corruption(_)
        ));
    }

    #[tokio::test]
    async fn test_revive_from_pending_gc() {
        let (refs, _) = ledger();
        let key = Key::digest(b"node");

        refs.increment("realm-a", &key, 1, 1, None, "c")
            .await
            .unwrap();
        refs.decrement("realm-a", &key).await.unwrap();
        assert_eq!(refs.list_pending("realm-a").await.unwrap().len(), 1);

        // re-reference before the sweep runs: back to live, dequeued,
        // not billed again
        let new = refs
            .increment("realm-a", &key, 1, 1, None, "c")
            .await
            .unwrap();
        assert!(!new);

        let record = refs.get("realm-a", &key).await.unwrap().unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.gc_status, GcStatus::Live);
        assert!(refs.list_pending("realm-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_collected_reclaims_usage() {
        let (refs, usage) = ledger();
        let key = Key::digest(b"node");

        refs.increment("realm-a", &key, 50, 64, None, "c")
            .await
            .unwrap();
        refs.decrement("realm-a", &key).await.unwrap();
        refs.mark_collected("realm-a", &key).await.unwrap();

        let record = refs.get("realm-a", &key).await.unwrap().unwrap();
        assert_eq!(record.gc_status, GcStatus::Collected);
        assert!(refs.list_pending("realm-a").await.unwrap().is_empty());

        let totals = usage.usage("realm-a").await.unwrap();
        assert_eq!(totals.physical_bytes, 0);
        assert_eq!(totals.node_count, 0);
    }

    #[tokio::test]
    async fn test_reintroduction_after_collect_bills_again() {
        let (refs, usage) = ledger();
        let key = Key::digest(b"node");

        refs.increment("realm-a", &key, 50, 64, None, "c")
            .await
            .unwrap();
        refs.decrement("realm-a", &key).await.unwrap();
        refs.mark_collected("realm-a", &key).await.unwrap();

        let new = refs
            .increment("realm-a", &key, 50, 64, None, "c")
            .await
            .unwrap();
        assert!(new);
        assert_eq!(usage.usage("realm-a").await.unwrap().physical_bytes, 64);
    }

    #[tokio::test]
    async fn test_realms_do_not_share_counts() {
        let (refs, _) = ledger();
        let key = Key::digest(b"shared content");

        assert!(refs
            .increment("realm-a", &key, 1, 1, None, "a")
            .await
            .unwrap());
        // same content introduced by another realm is a fresh
        // introduction there
        assert!(refs
            .increment("realm-b", &key, 1, 1, None, "b")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_increments_serialize() {
        let tables: Arc<dyn TableStore> = Arc::new(MemoryTableStore::new());
        let usage = UsageLedger::new(tables.clone(), 1_000_000);
        let refs = Arc::new(RefCountLedger::new(tables, usage, 64));
        let key = Key::digest(b"contested");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let refs = refs.clone();
            handles.push(tokio::spawn(async move {
                refs.increment("realm-a", &key, 1, 1, None, "c").await
            }));
        }
        let mut first_count = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                first_count += 1;
            }
        }

        assert_eq!(first_count, 1);
        let record = refs.get("realm-a", &key).await.unwrap().unwrap();
        assert_eq!(record.count, 8);
    }
}
