//! The engine facade.
//!
//! One handle wiring every component over a shared table store and
//! blob store. Cheap to clone; clones share the same backends.
//!
//! Read and write operations authenticate through a ticket id; commit,
//! depot, quota, and GC operations are trusted realm-level surfaces
//! for the issuer side of the deployment.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use store::{BlobStore, TableStore};
use time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::chunks::{ChunkStore, ChunkStoreError};
use crate::config::Config;
use crate::depot::{Commit, Depot, DepotError, DepotHistory, DepotLayer};
use crate::digest::Key;
use crate::graph::{FileHandle, GraphError, NodeGraph};
use crate::node::Node;
use crate::refcount::{LedgerError, RefCountLedger, RefCountRecord};
use crate::ticket::{Scope, Ticket, TicketAuthority, TicketError, Writable};
use crate::usage::{Usage, UsageError, UsageLedger};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Ticket(#[from] TicketError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    ChunkStore(#[from] ChunkStoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Depot(#[from] DepotError),
}

#[derive(Debug, Clone)]
pub struct Engine {
    config: Config,
    graph: NodeGraph,
    tickets: TicketAuthority,
    refs: RefCountLedger,
    usage: UsageLedger,
    depots: DepotLayer,
}

impl Engine {
    pub fn new(config: Config, tables: Arc<dyn TableStore>, blobs: Arc<dyn BlobStore>) -> Self {
        let graph = NodeGraph::new(ChunkStore::new(blobs), config.clone());
        let tickets = TicketAuthority::new(tables.clone(), config.clone());
        let usage = UsageLedger::new(tables.clone(), config.default_quota_limit);
        let refs = RefCountLedger::new(tables.clone(), usage.clone(), config.cas_retry_limit);
        let depots = DepotLayer::new(tables, graph.clone(), refs.clone(), config.cas_retry_limit);
        Self {
            config,
            graph,
            tickets,
            refs,
            usage,
            depots,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    // --- tickets ---

    pub async fn issue_ticket(
        &self,
        realm: &str,
        issuer: &str,
        scope: Scope,
        writable: Writable,
        expires_in: Option<Duration>,
    ) -> Result<Ticket, EngineError> {
        Ok(self
            .tickets
            .issue(realm, issuer, scope, writable, expires_in)
            .await?)
    }

    pub async fn get_ticket(&self, id: Uuid) -> Result<Ticket, EngineError> {
        Ok(self.tickets.get(id).await?)
    }

    // --- reads ---

    /// Fetch a node the ticket is entitled to see.
    pub async fn read_node(&self, ticket_id: Uuid, key: Key) -> Result<Node, EngineError> {
        let ticket = self.tickets.get(ticket_id).await?;
        self.tickets.validate_read(&ticket, &key)?;
        Ok(self.graph.chunks().get_node(&key).await?)
    }

    /// Open a file node for assembly, streaming, or slicing.
    pub async fn open_file(&self, ticket_id: Uuid, key: Key) -> Result<FileHandle, EngineError> {
        let ticket = self.tickets.get(ticket_id).await?;
        self.tickets.validate_read(&ticket, &key)?;
        Ok(self.graph.open_file(&key).await?)
    }

    pub async fn read_file(&self, ticket_id: Uuid, key: Key) -> Result<Bytes, EngineError> {
        Ok(self.open_file(ticket_id, key).await?.bytes().await?)
    }

    /// Stream the byte range `[start, end)` of a file.
    pub async fn read_range(
        &self,
        ticket_id: Uuid,
        key: Key,
        start: u64,
        end: u64,
    ) -> Result<BoxStream<'static, Result<Bytes, GraphError>>, EngineError> {
        let handle = self.open_file(ticket_id, key).await?;
        Ok(handle.slice(start, end)?)
    }

    /// Which of `root`'s reachable keys are not yet stored here, minus
    /// anything the caller already holds.
    pub async fn resolve(
        &self,
        ticket_id: Uuid,
        root: Key,
        known: &HashSet<Key>,
    ) -> Result<Vec<Key>, EngineError> {
        let ticket = self.tickets.get(ticket_id).await?;
        self.tickets.validate_read(&ticket, &root)?;
        Ok(self.graph.resolve(root, known).await?)
    }

    // --- writes ---

    /// Write a file through a ticket.
    ///
    /// Chunked at the threshold snapshotted into the ticket. The
    /// ticket's single write is claimed before any byte lands, so a
    /// failure part-way (quota, storage) releases the claim and leaves
    /// the ticket usable again.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn write_file(
        &self,
        ticket_id: Uuid,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<Key, EngineError> {
        let ticket = self.tickets.get(ticket_id).await?;
        self.ensure_writable(&ticket, Some(content_type))?;

        let plan = self
            .graph
            .plan_file(bytes, content_type, ticket.chunk_threshold)?;
        self.ensure_ticket_quota(&ticket, plan.physical_size)?;
        if !self.tickets.mark_written(ticket.id, plan.root).await? {
            return Err(TicketError::AlreadyWritten(ticket.id).into());
        }

        let stored: Result<(), EngineError> = async {
            self.usage
                .require_quota(&ticket.realm, plan.physical_size)
                .await?;
            self.graph.store_file_plan(&plan).await?;
            self.introduce(&ticket, plan.root).await?;
            Ok(())
        }
        .await;
        if let Err(e) = stored {
            self.tickets.revert_write(ticket.id).await?;
            return Err(e);
        }

        info!(
            realm = %ticket.realm,
            root = %plan.root,
            physical = plan.physical_size,
            "file written"
        );
        Ok(plan.root)
    }

    /// Write a collection node through a ticket. Every child must
    /// already exist in the store.
    #[instrument(skip(self, children), fields(children = children.len()))]
    pub async fn write_collection(
        &self,
        ticket_id: Uuid,
        children: BTreeMap<String, Key>,
    ) -> Result<Key, EngineError> {
        let ticket = self.tickets.get(ticket_id).await?;
        self.ensure_writable(&ticket, None)?;

        let plan = self.graph.plan_collection(children).await?;
        self.ensure_ticket_quota(&ticket, plan.physical_size)?;
        if !self.tickets.mark_written(ticket.id, plan.root).await? {
            return Err(TicketError::AlreadyWritten(ticket.id).into());
        }

        let stored: Result<(), EngineError> = async {
            self.usage
                .require_quota(&ticket.realm, plan.physical_size)
                .await?;
            self.graph.chunks().put_node(&plan.node.node).await?;
            self.introduce(&ticket, plan.root).await?;
            Ok(())
        }
        .await;
        if let Err(e) = stored {
            self.tickets.revert_write(ticket.id).await?;
            return Err(e);
        }

        info!(realm = %ticket.realm, root = %plan.root, "collection written");
        Ok(plan.root)
    }

    fn ensure_writable(
        &self,
        ticket: &Ticket,
        content_type: Option<&str>,
    ) -> Result<(), EngineError> {
        if ticket.is_expired(time::OffsetDateTime::now_utc()) {
            return Err(TicketError::Expired(ticket.id).into());
        }
        if !ticket.writable.is_writable() {
            return Err(TicketError::ScopeViolation("ticket is read-only".into()).into());
        }
        if let Some(ct) = content_type {
            if !ticket.accepts_content_type(ct) {
                return Err(TicketError::ScopeViolation(format!(
                    "content type {} not accepted by ticket",
                    ct
                ))
                .into());
            }
        }
        Ok(())
    }

    fn ensure_ticket_quota(&self, ticket: &Ticket, physical: u64) -> Result<(), EngineError> {
        if let Writable::Limited { quota, .. } = &ticket.writable {
            if physical > *quota {
                return Err(TicketError::ScopeViolation(format!(
                    "write of {} bytes exceeds ticket quota of {}",
                    physical, quota
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Reference everything reachable from a freshly written root.
    async fn introduce(&self, ticket: &Ticket, root: Key) -> Result<(), EngineError> {
        for node in self.graph.reachable(root).await? {
            self.refs
                .increment(
                    &ticket.realm,
                    &node.key,
                    node.logical,
                    node.physical,
                    node.content_type.as_deref(),
                    &ticket.issuer,
                )
                .await?;
        }
        Ok(())
    }

    // --- commits and depots ---

    pub async fn commit(
        &self,
        realm: &str,
        root: Key,
        created_by: &str,
        title: Option<&str>,
    ) -> Result<bool, EngineError> {
        Ok(self
            .depots
            .create_commit(realm, root, created_by, title)
            .await?)
    }

    pub async fn get_commit(&self, realm: &str, root: &Key) -> Result<Option<Commit>, EngineError> {
        Ok(self.depots.get_commit(realm, root).await?)
    }

    pub async fn create_depot(
        &self,
        realm: &str,
        name: &str,
        root: Option<Key>,
        description: Option<&str>,
        created_by: &str,
    ) -> Result<Depot, EngineError> {
        Ok(self
            .depots
            .create_depot(realm, name, root, description, created_by)
            .await?)
    }

    pub async fn get_depot(&self, realm: &str, id: Uuid) -> Result<Depot, EngineError> {
        Ok(self.depots.get_depot(realm, id).await?)
    }

    pub async fn get_depot_by_name(
        &self,
        realm: &str,
        name: &str,
    ) -> Result<Option<Depot>, EngineError> {
        Ok(self.depots.get_depot_by_name(realm, name).await?)
    }

    pub async fn main_depot(&self, realm: &str) -> Result<Depot, EngineError> {
        Ok(self.depots.main_depot(realm).await?)
    }

    pub async fn update_depot_root(
        &self,
        realm: &str,
        id: Uuid,
        new_root: Key,
        message: Option<&str>,
        updated_by: &str,
    ) -> Result<(Depot, DepotHistory), EngineError> {
        Ok(self
            .depots
            .update_root(realm, id, new_root, message, updated_by)
            .await?)
    }

    pub async fn delete_depot(&self, realm: &str, id: Uuid) -> Result<(), EngineError> {
        Ok(self.depots.delete_depot(realm, id).await?)
    }

    pub async fn list_depot_history(
        &self,
        realm: &str,
        id: Uuid,
    ) -> Result<Vec<(u64, DepotHistory)>, EngineError> {
        Ok(self.depots.list_history(realm, id).await?)
    }

    // --- usage and GC ---

    pub async fn usage(&self, realm: &str) -> Result<Usage, EngineError> {
        Ok(self.usage.usage(realm).await?)
    }

    pub async fn set_quota_limit(&self, realm: &str, limit: u64) -> Result<(), EngineError> {
        Ok(self.usage.set_quota_limit(realm, limit).await?)
    }

    pub async fn refcount(
        &self,
        realm: &str,
        key: &Key,
    ) -> Result<Option<RefCountRecord>, EngineError> {
        Ok(self.refs.get(realm, key).await?)
    }

    /// Keys queued for the external sweeper.
    pub async fn pending_gc(&self, realm: &str) -> Result<Vec<Key>, EngineError> {
        Ok(self.refs.list_pending(realm).await?)
    }

    /// Confirm the sweeper has reclaimed `key`'s storage for `realm`.
    pub async fn mark_collected(&self, realm: &str, key: &Key) -> Result<(), EngineError> {
        Ok(self.refs.mark_collected(realm, key).await?)
    }
}
