//! Commits and depots.
//!
//! A commit is an append-only association of a DAG root with a realm.
//! A depot is a named, versioned pointer at a root, analogous to a
//! branch: `version` starts at 1 and increments by exactly 1 on every
//! root update, and the history sequence is immutable and total
//! (every version 1..=current has exactly one record).
//!
//! Committing and repointing are what drive the refcount ledger:
//! newly-reachable nodes are incremented, nodes reachable only from a
//! superseded root are decremented and drift toward the GC queue.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use store::{StoreError, Table, TableStore};
use time::OffsetDateTime;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::digest::Key;
use crate::graph::{GraphError, NodeGraph, ReachableNode};
use crate::refcount::{LedgerError, RefCountLedger};

const COMMIT_PREFIX: &str = "commit/";
const DEPOT_PREFIX: &str = "depot/";
const DEPOT_NAME_PREFIX: &str = "depot-name/";
const HISTORY_PREFIX: &str = "history/";
const HISTORY_SCAN_PAGE: usize = 256;

/// The depot every realm has, created lazily, never deletable.
pub const MAIN_DEPOT: &str = "main";

#[derive(Debug, thiserror::Error)]
pub enum DepotError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("the main depot cannot be deleted")]
    CannotDeleteMain,
    /// Version gap or duplicate history record. Internal consistency
    /// error; rejected, never repaired automatically.
    #[error("depot corruption: {0}")]
    Corruption(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub title: Option<String>,
    pub created_at: OffsetDateTime,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Depot {
    pub id: Uuid,
    pub name: String,
    pub root: Key,
    pub version: u64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotHistory {
    pub root: Key,
    pub created_at: OffsetDateTime,
    pub message: Option<String>,
}

fn commit_sk(root: &Key) -> String {
    format!("{}{}", COMMIT_PREFIX, root)
}

fn depot_sk(id: Uuid) -> String {
    format!("{}{}", DEPOT_PREFIX, id)
}

fn depot_name_sk(name: &str) -> String {
    format!("{}{}", DEPOT_NAME_PREFIX, name)
}

fn history_sk(id: Uuid, version: u64) -> String {
    // zero-padded so lexicographic scan order is version order
    format!("{}{}/{:010}", HISTORY_PREFIX, id, version)
}

#[derive(Debug, Clone)]
pub struct DepotLayer {
    tables: Arc<dyn TableStore>,
    graph: NodeGraph,
    refs: RefCountLedger,
    cas_retry_limit: usize,
}

impl DepotLayer {
    pub fn new(
        tables: Arc<dyn TableStore>,
        graph: NodeGraph,
        refs: RefCountLedger,
        cas_retry_limit: usize,
    ) -> Self {
        Self {
            tables,
            graph,
            refs,
            cas_retry_limit,
        }
    }

    /// Record that `root` is committed in `realm`.
    ///
    /// Append-only: a duplicate `(realm, root)` commit is an idempotent
    /// no-op (returns `false`), and refcounts are adjusted only on
    /// first insertion. The reachable walk runs before the record is
    /// written: it validates that the root's content is actually
    /// stored, so a commit of a not-yet-uploaded root fails without
    /// leaving a record that a later retry would skip as a duplicate.
    pub async fn create_commit(
        &self,
        realm: &str,
        root: Key,
        created_by: &str,
        title: Option<&str>,
    ) -> Result<bool, DepotError> {
        let reachable = self.graph.reachable(root).await?;

        let commit = Commit {
            title: title.map(str::to_string),
            created_at: OffsetDateTime::now_utc(),
            created_by: created_by.to_string(),
        };
        let created = self
            .tables
            .put_if_absent(
                Table::Realm,
                realm,
                &commit_sk(&root),
                Bytes::from(serde_json::to_vec(&commit)?),
            )
            .await?;
        if !created {
            debug!(realm, %root, "root already committed, no-op");
            return Ok(false);
        }

        self.increment_all(realm, created_by, &reachable).await?;
        info!(realm, %root, nodes = reachable.len(), "created commit");
        Ok(true)
    }

    pub async fn get_commit(&self, realm: &str, root: &Key) -> Result<Option<Commit>, DepotError> {
        match self.tables.get(Table::Realm, realm, &commit_sk(root)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Create a named depot. `root = None` points it at the empty
    /// collection.
    pub async fn create_depot(
        &self,
        realm: &str,
        name: &str,
        root: Option<Key>,
        description: Option<&str>,
        created_by: &str,
    ) -> Result<Depot, DepotError> {
        let root = match root {
            Some(root) => root,
            None => self.graph.put_collection(BTreeMap::new()).await?,
        };
        // validates the root before any record lands
        let reachable = self.graph.reachable(root).await?;
        let id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        // the name index is the uniqueness point for depot names
        let claimed = self
            .tables
            .put_if_absent(
                Table::Realm,
                realm,
                &depot_name_sk(name),
                Bytes::from(id.to_string()),
            )
            .await?;
        if !claimed {
            return Err(DepotError::Conflict(format!(
                "depot named {} already exists in {}",
                name, realm
            )));
        }

        let depot = Depot {
            id,
            name: name.to_string(),
            root,
            version: 1,
            created_at: now,
            updated_at: now,
            description: description.map(str::to_string),
        };
        self.tables
            .put(
                Table::Realm,
                realm,
                &depot_sk(id),
                Bytes::from(serde_json::to_vec(&depot)?),
            )
            .await?;
        let history = DepotHistory {
            root,
            created_at: now,
            message: None,
        };
        self.tables
            .put(
                Table::Realm,
                realm,
                &history_sk(id, 1),
                Bytes::from(serde_json::to_vec(&history)?),
            )
            .await?;

        self.increment_all(realm, created_by, &reachable).await?;
        info!(realm, name, id = %id, %root, "created depot");
        Ok(depot)
    }

    async fn depot_record(
        &self,
        realm: &str,
        id: Uuid,
    ) -> Result<(Bytes, Depot), DepotError> {
        let bytes = self
            .tables
            .get(Table::Realm, realm, &depot_sk(id))
            .await?
            .ok_or_else(|| DepotError::NotFound(format!("depot {} in {}", id, realm)))?;
        let depot = serde_json::from_slice(&bytes)?;
        Ok((bytes, depot))
    }

    pub async fn get_depot(&self, realm: &str, id: Uuid) -> Result<Depot, DepotError> {
        Ok(self.depot_record(realm, id).await?.1)
    }

    pub async fn get_depot_by_name(
        &self,
        realm: &str,
        name: &str,
    ) -> Result<Option<Depot>, DepotError> {
        let Some(bytes) = self
            .tables
            .get(Table::Realm, realm, &depot_name_sk(name))
            .await?
        else {
            return Ok(None);
        };
        let id: Uuid = String::from_utf8(bytes.to_vec())
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                DepotError::Corruption(format!("malformed depot name index for {}", name))
            })?;
        Ok(Some(self.get_depot(realm, id).await?))
    }

    /// The realm's `main` depot, created lazily at the empty
    /// collection on first touch.
    pub async fn main_depot(&self, realm: &str) -> Result<Depot, DepotError> {
        for _ in 0..self.cas_retry_limit {
            if let Some(depot) = self.get_depot_by_name(realm, MAIN_DEPOT).await? {
                return Ok(depot);
            }
            match self
                .create_depot(realm, MAIN_DEPOT, None, None, "system")
                .await
            {
                Ok(depot) => return Ok(depot),
                // another caller created it between our read and claim
                Err(DepotError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(DepotError::Conflict(format!(
            "main depot creation in {}",
            realm
        )))
    }

    /// Point a depot at a new root.
    ///
    /// The conditional swap of the depot record claims `version + 1`
    /// and is the serialization point: a lost race re-reads and
    /// retries, and only the claim's winner appends the history record
    /// for that version, so history stays total and gap-free. Refcounts
    /// are then adjusted over the symmetric difference of old and new
    /// reachable sets. Both reachable walks run before the swap, so a
    /// root whose content is absent fails here without claiming a
    /// version. The record swap, history append, and refcount
    /// adjustment are still separate writes: a crash between them
    /// leaves a claimed version whose history or refcounts lag, which
    /// `list_history` surfaces as `Corruption` rather than repairing.
    pub async fn update_root(
        &self,
        realm: &str,
        id: Uuid,
        new_root: Key,
        message: Option<&str>,
        updated_by: &str,
    ) -> Result<(Depot, DepotHistory), DepotError> {
        let new_set = self.graph.reachable(new_root).await?;

        for _ in 0..self.cas_retry_limit {
            let (current_bytes, current) = self.depot_record(realm, id).await?;
            let old_set = self.graph.reachable(current.root).await?;
            let now = OffsetDateTime::now_utc();
            let updated = Depot {
                root: new_root,
                version: current.version + 1,
                updated_at: now,
                ..current.clone()
            };
            let applied = self
                .tables
                .compare_and_swap(
                    Table::Realm,
                    realm,
                    &depot_sk(id),
                    Some(&current_bytes),
                    Bytes::from(serde_json::to_vec(&updated)?),
                )
                .await?;
            if !applied {
                continue;
            }

            let history = DepotHistory {
                root: new_root,
                created_at: now,
                message: message.map(str::to_string),
            };
            let appended = self
                .tables
                .put_if_absent(
                    Table::Realm,
                    realm,
                    &history_sk(id, updated.version),
                    Bytes::from(serde_json::to_vec(&history)?),
                )
                .await?;
            if !appended {
                // we own this version via the swap above; a record
                // already here means the sequence itself is damaged
                error!(realm, id = %id, version = updated.version, "duplicate depot history record");
                return Err(DepotError::Corruption(format!(
                    "history record for depot {} version {} already exists",
                    id, updated.version
                )));
            }

            self.adjust_refs(realm, updated_by, &new_set, &old_set)
                .await?;
            info!(
                realm,
                id = %id,
                version = updated.version,
                %new_root,
                "depot root updated"
            );
            return Ok((updated, history));
        }

        Err(DepotError::Conflict(format!(
            "update of depot {} in {}",
            id, realm
        )))
    }

    /// Delete a depot, preserving its history for audit. The `main`
    /// depot cannot be deleted.
    pub async fn delete_depot(&self, realm: &str, id: Uuid) -> Result<(), DepotError> {
        let (_, depot) = self.depot_record(realm, id).await?;
        if depot.name == MAIN_DEPOT {
            return Err(DepotError::CannotDeleteMain);
        }
        let reachable = self.graph.reachable(depot.root).await?;

        self.tables
            .delete(Table::Realm, realm, &depot_sk(id))
            .await?;
        self.tables
            .delete(Table::Realm, realm, &depot_name_sk(&depot.name))
            .await?;

        for node in &reachable {
            self.refs.decrement(realm, &node.key).await?;
        }
        info!(realm, id = %id, name = %depot.name, "deleted depot, history preserved");
        Ok(())
    }

    /// Full history of a depot, oldest first. Works for deleted depots
    /// too.
    pub async fn list_history(
        &self,
        realm: &str,
        id: Uuid,
    ) -> Result<Vec<(u64, DepotHistory)>, DepotError> {
        let prefix = format!("{}{}/", HISTORY_PREFIX, id);
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .tables
                .scan_prefix(
                    Table::Realm,
                    realm,
                    &prefix,
                    cursor.as_deref(),
                    HISTORY_SCAN_PAGE,
                )
                .await?;
            for (sk, bytes) in &page.items {
                let version: u64 = sk[prefix.len()..].parse().map_err(|_| {
                    DepotError::Corruption(format!("malformed history key {}", sk))
                })?;
                out.push((version, serde_json::from_slice(bytes)?));
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        // the sequence must be total: versions 1..=current with no gaps
        for (expected, (version, _)) in (1..).zip(out.iter()) {
            if *version != expected {
                error!(realm, id = %id, version, expected, "depot history gap");
                return Err(DepotError::Corruption(format!(
                    "history gap in depot {}: expected version {}, found {}",
                    id, expected, version
                )));
            }
        }
        Ok(out)
    }

    async fn increment_all(
        &self,
        realm: &str,
        created_by: &str,
        nodes: &[ReachableNode],
    ) -> Result<(), DepotError> {
        for node in nodes {
            self.refs
                .increment(
                    realm,
                    &node.key,
                    node.logical,
                    node.physical,
                    node.content_type.as_deref(),
                    created_by,
                )
                .await?;
        }
        Ok(())
    }

    /// Increment nodes only in `new_set`, decrement nodes only in
    /// `old_set`. Shared nodes keep their counts.
    async fn adjust_refs(
        &self,
        realm: &str,
        updated_by: &str,
        new_set: &[ReachableNode],
        old_set: &[ReachableNode],
    ) -> Result<(), DepotError> {
        let new_keys: HashSet<Key> = new_set.iter().map(|n| n.key).collect();
        let old_keys: HashSet<Key> = old_set.iter().map(|n| n.key).collect();

        for node in new_set.iter().filter(|n| !old_keys.contains(&n.key)) {
            self.refs
                .increment(
                    realm,
                    &node.key,
                    node.logical,
                    node.physical,
                    node.content_type.as_deref(),
                    updated_by,
                )
                .await?;
        }
        for node in old_set.iter().filter(|n| !new_keys.contains(&n.key)) {
            self.refs.decrement(realm, &node.key).await?;
        }
        Ok(())
    }
}
