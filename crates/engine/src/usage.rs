//! Per-realm usage totals and quota enforcement.
//!
//! Counters are additive cells updated through the table service's
//! atomic counter primitive, with no cross-request locking. Under
//! heavy concurrency a check-then-update pair can overshoot slightly;
//! that imprecision is accepted here, unlike refcounts and ticket
//! write-once which must not lose updates.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use store::{StoreError, Table, TableStore};
use tracing::debug;

const BYTES_CELL: &str = "physical-bytes";
const NODES_CELL: &str = "node-count";
const QUOTA_CELL: &str = "quota-limit";

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    /// The proposed write does not fit the realm's quota. Reported to
    /// the caller as a rejected write, never retried internally.
    #[error("quota exceeded: requested {requested} bytes, {remaining} remaining")]
    QuotaExceeded { requested: u64, remaining: u64 },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A realm's running totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub physical_bytes: u64,
    pub node_count: u64,
    pub quota_limit: u64,
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCheck {
    pub allowed: bool,
    pub remaining: u64,
}

#[derive(Debug, Clone)]
pub struct UsageLedger {
    tables: Arc<dyn TableStore>,
    default_quota_limit: u64,
}

impl UsageLedger {
    pub fn new(tables: Arc<dyn TableStore>, default_quota_limit: u64) -> Self {
        Self {
            tables,
            default_quota_limit,
        }
    }

    async fn cell(&self, realm: &str, sk: &str) -> Result<Option<i64>, UsageError> {
        // counter cells are decimal strings; reuse the store's
        // representation by nudging them with a zero delta would also
        // work, but a plain read avoids the write lock
        let value = self.tables.get(Table::Usage, realm, sk).await?;
        Ok(value
            .and_then(|b| String::from_utf8(b.to_vec()).ok())
            .and_then(|s| s.parse::<i64>().ok()))
    }

    /// Current totals for a realm. Realms that have never written
    /// report zeros and the default quota.
    pub async fn usage(&self, realm: &str) -> Result<Usage, UsageError> {
        let physical_bytes = self.cell(realm, BYTES_CELL).await?.unwrap_or(0).max(0) as u64;
        let node_count = self.cell(realm, NODES_CELL).await?.unwrap_or(0).max(0) as u64;
        let quota_limit = self
            .cell(realm, QUOTA_CELL)
            .await?
            .map(|v| v.max(0) as u64)
            .unwrap_or(self.default_quota_limit);
        Ok(Usage {
            physical_bytes,
            node_count,
            quota_limit,
        })
    }

    /// Pure comparison of current totals against a proposed delta.
    pub async fn check_quota(&self, realm: &str, proposed: u64) -> Result<QuotaCheck, UsageError> {
        let usage = self.usage(realm).await?;
        let remaining = usage.quota_limit.saturating_sub(usage.physical_bytes);
        Ok(QuotaCheck {
            allowed: proposed <= remaining,
            remaining,
        })
    }

    /// Like [`check_quota`](Self::check_quota) but surfaces the
    /// rejection as an error for write paths.
    pub async fn require_quota(&self, realm: &str, proposed: u64) -> Result<(), UsageError> {
        let check = self.check_quota(realm, proposed).await?;
        if !check.allowed {
            return Err(UsageError::QuotaExceeded {
                requested: proposed,
                remaining: check.remaining,
            });
        }
        Ok(())
    }

    /// Additively update a realm's totals. Negative deltas account for
    /// reclamation.
    pub async fn update(
        &self,
        realm: &str,
        byte_delta: i64,
        node_delta: i64,
    ) -> Result<(), UsageError> {
        if byte_delta != 0 {
            let total = self
                .tables
                .update_counter(Table::Usage, realm, BYTES_CELL, byte_delta)
                .await?;
            debug!(realm, byte_delta, total, "usage bytes updated");
        }
        if node_delta != 0 {
            self.tables
                .update_counter(Table::Usage, realm, NODES_CELL, node_delta)
                .await?;
        }
        Ok(())
    }

    /// Set a realm's quota limit explicitly.
    pub async fn set_quota_limit(&self, realm: &str, limit: u64) -> Result<(), UsageError> {
        self.tables
            .put(
                Table::Usage,
                realm,
                QUOTA_CELL,
                bytes::Bytes::from(limit.to_string()),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::MemoryTableStore;

    fn ledger() -> UsageLedger {
        UsageLedger::new(Arc::new(MemoryTableStore::new()), 1000)
    }

    #[tokio::test]
    async fn test_fresh_realm_defaults() {
        let ledger = ledger();
        let usage = ledger.usage("realm-a").await.unwrap();
        assert_eq!(usage.physical_bytes, 0);
        assert_eq!(usage.node_count, 0);
        assert_eq!(usage.quota_limit, 1000);
    }

    #[tokio::test]
    async fn test_update_and_read_back() {
        let ledger = ledger();
        ledger.update("realm-a", 640, 3).await.unwrap();
        ledger.update("realm-a", -40, -1).await.unwrap();

        let usage = ledger.usage("realm-a").await.unwrap();
        assert_eq!(usage.physical_bytes, 600);
        assert_eq!(usage.node_count, 2);
    }

    #[tokio::test]
    async fn test_quota_rejection_scenario() {
        // quota 1000, usage 800, proposed 300 -> rejected
        let ledger = ledger();
        ledger.update("realm-a", 800, 1).await.unwrap();

        let check = ledger.check_quota("realm-a", 300).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.remaining, 200);

        let err = ledger.require_quota("realm-a", 300).await.unwrap_err();
        assert!(matches!(
            err,
            UsageError::QuotaExceeded {
                requested: 300,
                remaining: 200,
            }
        ));

        // a fitting write is allowed
        assert!(ledger.check_quota("realm-a", 200).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_explicit_quota_limit() {
        let ledger = ledger();
        ledger.set_quota_limit("realm-a", 50).await.unwrap();

        let usage = ledger.usage("realm-a").await.unwrap();
        assert_eq!(usage.quota_limit, 50);
        assert!(!ledger.check_quota("realm-a", 51).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_realms_are_isolated() {
        let ledger = ledger();
        ledger.update("realm-a", 900, 1).await.unwrap();

        assert!(ledger.check_quota("realm-b", 900).await.unwrap().allowed);
    }
}
