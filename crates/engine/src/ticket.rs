//! Scoped capability tickets.
//!
//! A ticket is a short-lived capability scoped to specific DAG roots
//! (or a whole realm), with read/write and quota limits. Tickets are
//! immutable snapshots of policy: the chunk threshold is captured from
//! config at issuance and never changes afterwards.
//!
//! Lifecycle: `issued -> (read*) -> [written] -> expired`. Writable
//! tickets permit exactly one successful write; the `written` flag
//! moves from absent to the committed root key through a conditional
//! update, so of N racing writers exactly one wins and the rest are
//! told the ticket is spent.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use store::{StoreError, Table, TableStore};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::digest::Key;

const TICKET_SK: &str = "ticket";

#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("ticket not found: {0}")]
    NotFound(Uuid),
    #[error("ticket expired: {0}")]
    Expired(Uuid),
    #[error("ticket already written: {0}")]
    AlreadyWritten(Uuid),
    /// The ticket does not cover the requested key, realm, or
    /// operation.
    #[error("scope violation: {0}")]
    ScopeViolation(String),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// What a ticket may touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// Every key in the ticket's realm.
    Realm,
    /// Only the listed DAG roots.
    Roots(Vec<Key>),
}

/// Write permission carried by a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Writable {
    No,
    Yes,
    /// Writable, but capped in size and restricted in content type.
    Limited {
        quota: u64,
        accepted_content_types: Vec<String>,
    },
}

impl Writable {
    pub fn is_writable(&self) -> bool {
        !matches!(self, Writable::No)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub realm: String,
    pub issuer: String,
    pub scope: Scope,
    pub writable: Writable,
    /// Absent until the ticket's single permitted write lands; then
    /// holds the committed root key.
    pub written: Option<Key>,
    pub expires_at: OffsetDateTime,
    /// Server chunk threshold at issuance time.
    pub chunk_threshold: usize,
}

impl Ticket {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Whether the ticket's scope covers `key`.
    pub fn covers(&self, key: &Key) -> bool {
        match &self.scope {
            Scope::Realm => true,
            Scope::Roots(roots) => roots.contains(key),
        }
    }

    /// Whether the ticket accepts a write of this content type.
    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        match &self.writable {
            Writable::No => false,
            Writable::Yes => true,
            Writable::Limited {
                accepted_content_types,
                ..
            } => {
                accepted_content_types.is_empty()
                    || accepted_content_types.iter().any(|ct| ct == content_type)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TicketAuthority {
    tables: Arc<dyn TableStore>,
    config: Config,
}

impl TicketAuthority {
    pub fn new(tables: Arc<dyn TableStore>, config: Config) -> Self {
        Self { tables, config }
    }

    /// Issue a ticket. The requested TTL is clamped to the configured
    /// maximum; the chunk threshold is snapshotted from current config.
    pub async fn issue(
        &self,
        realm: &str,
        issuer: &str,
        scope: Scope,
        writable: Writable,
        expires_in: Option<Duration>,
    ) -> Result<Ticket, TicketError> {
        let ttl = expires_in
            .unwrap_or(self.config.default_ticket_ttl)
            .min(self.config.max_ticket_ttl);
        let ticket = Ticket {
            id: Uuid::new_v4(),
            realm: realm.to_string(),
            issuer: issuer.to_string(),
            scope,
            writable,
            written: None,
            expires_at: OffsetDateTime::now_utc() + ttl,
            chunk_threshold: self.config.chunk_threshold,
        };

        self.tables
            .put(
                Table::Tokens,
                &ticket.id.to_string(),
                TICKET_SK,
                Bytes::from(serde_json::to_vec(&ticket)?),
            )
            .await?;
        debug!(realm, id = %ticket.id, "issued ticket");
        Ok(ticket)
    }

    async fn record(&self, id: Uuid) -> Result<(Bytes, Ticket), TicketError> {
        let bytes = self
            .tables
            .get(Table::Tokens, &id.to_string(), TICKET_SK)
            .await?
            .ok_or(TicketError::NotFound(id))?;
        let ticket = serde_json::from_slice(&bytes)?;
        Ok((bytes, ticket))
    }

    /// Fetch a ticket by id.
    pub async fn get(&self, id: Uuid) -> Result<Ticket, TicketError> {
        Ok(self.record(id).await?.1)
    }

    /// Validate a ticket for a read of `key` right now. Expiry is
    /// checked on every use; prior validity does not help an expired
    /// ticket.
    pub fn validate_read(&self, ticket: &Ticket, key: &Key) -> Result<(), TicketError> {
        if ticket.is_expired(OffsetDateTime::now_utc()) {
            return Err(TicketError::Expired(ticket.id));
        }
        if !ticket.covers(key) {
            return Err(TicketError::ScopeViolation(format!(
                "ticket {} does not cover {}",
                ticket.id, key
            )));
        }
        Ok(())
    }

    /// Atomically record the ticket's single permitted write.
    ///
    /// Succeeds only while `written` is absent. Returns `false` (not
    /// an error) when another write already landed, so the caller can
    /// reject the second attempt; under concurrency exactly one of N
    /// callers sees `true`.
    pub async fn mark_written(&self, id: Uuid, root: Key) -> Result<bool, TicketError> {
        for _ in 0..self.config.cas_retry_limit {
            let (current_bytes, ticket) = self.record(id).await?;
            if ticket.is_expired(OffsetDateTime::now_utc()) {
                return Err(TicketError::Expired(id));
            }
            if ticket.written.is_some() {
                return Ok(false);
            }

            let mut updated = ticket;
            updated.written = Some(root);
            let applied = self
                .tables
                .compare_and_swap(
                    Table::Tokens,
                    &id.to_string(),
                    TICKET_SK,
                    Some(&current_bytes),
                    Bytes::from(serde_json::to_vec(&updated)?),
                )
                .await?;
            if applied {
                debug!(id = %id, %root, "ticket write claimed");
                return Ok(true);
            }
        }

        warn!(id = %id, "mark_written exhausted cas retries");
        Err(TicketError::Conflict(format!("mark_written on {}", id)))
    }

    /// Roll back a provisional write claim after the surrounding
    /// operation failed, restoring the ticket's single-use
    /// availability.
    pub async fn revert_write(&self, id: Uuid) -> Result<(), TicketError> {
        for _ in 0..self.config.cas_retry_limit {
            let (current_bytes, ticket) = self.record(id).await?;
            if ticket.written.is_none() {
                return Ok(());
            }

            let mut updated = ticket;
            updated.written = None;
            let applied = self
                .tables
                .compare_and_swap(
                    Table::Tokens,
                    &id.to_string(),
                    TICKET_SK,
                    Some(&current_bytes),
                    Bytes::from(serde_json::to_vec(&updated)?),
                )
                .await?;
            if applied {
                debug!(id = %id, "ticket write reverted");
                return Ok(());
            }
        }

        warn!(id = %id, "revert_write exhausted cas retries");
        Err(TicketError::Conflict(format!("revert_write on {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::MemoryTableStore;

    fn authority() -> TicketAuthority {
        TicketAuthority::new(Arc::new(MemoryTableStore::new()), Config::default())
    }

    #[tokio::test]
    async fn test_issue_snapshots_policy() {
        let config = Config {
            chunk_threshold: 4096,
            max_ticket_ttl: Duration::minutes(30),
            ..Config::default()
        };
        let authority = TicketAuthority::new(Arc::new(MemoryTableStore::new()), config);

        let ticket = authority
            .issue(
                "realm-a",
                "issuer-1",
                Scope::Realm,
                Writable::Yes,
                Some(Duration::hours(6)),
            )
            .await
            .unwrap();

        assert_eq!(ticket.chunk_threshold, 4096);
        // requested six hours, clamped to the configured half hour
        let ttl = ticket.expires_at - OffsetDateTime::now_utc();
        assert!(ttl <= Duration::minutes(30));
        assert!(ttl > Duration::minutes(29));

        let fetched = authority.get(ticket.id).await.unwrap();
        assert_eq!(fetched, ticket);
    }

    #[tokio::test]
    async fn test_scope_coverage() {
        let root = Key::digest(b"root");
        let other = Key::digest(b"other");

        let scoped = Ticket {
            id: Uuid::new_v4(),
            realm: "realm-a".to_string(),
            issuer: "i".to_string(),
            scope: Scope::Roots(vec![root]),
            writable: Writable::No,
            written: None,
            expires_at: OffsetDateTime::now_utc() + Duration::minutes(5),
            chunk_threshold: 1024,
        };
        assert!(scoped.covers(&root));
        assert!(!scoped.covers(&other));

        let realm_wide = Ticket {
            scope: Scope::Realm,
            ..scoped.clone()
        };
        assert!(realm_wide.covers(&other));
    }

    #[tokio::test]
    async fn test_validate_read_checks_scope_and_expiry() {
        let authority = authority();
        let root = Key::digest(b"root");
        let ticket = authority
            .issue(
                "realm-a",
                "i",
                Scope::Roots(vec![root]),
                Writable::No,
                None,
            )
            .await
            .unwrap();

        assert!(authority.validate_read(&ticket, &root).is_ok());
        assert!(matches!(
            authority.validate_read(&ticket, &Key::digest(b"elsewhere")),
            Err(TicketError::ScopeViolation(_))
        ));

        let expired = Ticket {
            expires_at: OffsetDateTime::now_utc() - Duration::seconds(1),
            ..ticket
        };
        assert!(matches!(
            authority.validate_read(&expired, &root),
            Err(TicketError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_written_is_single_use() {
        let authority = authority();
        let ticket = authority
            .issue("realm-a", "i", Scope::Realm, Writable::Yes, None)
            .await
            .unwrap();

        let first_root = Key::digest(b"first");
        assert!(authority.mark_written(ticket.id, first_root).await.unwrap());
        // second call reports spent, and the first root is unchanged
        assert!(!authority
            .mark_written(ticket.id, Key::digest(b"second"))
            .await
            .unwrap());
        assert_eq!(
            authority.get(ticket.id).await.unwrap().written,
            Some(first_root)
        );
    }

    #[tokio::test]
    async fn test_mark_written_race_single_winner() {
        let authority = Arc::new(TicketAuthority::new(
            Arc::new(MemoryTableStore::new()),
            Config {
                cas_retry_limit: 64,
                ..Config::default()
            },
        ));
        let ticket = authority
            .issue("realm-a", "i", Scope::Realm, Writable::Yes, None)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..12u8 {
            let authority = authority.clone();
            let id = ticket.id;
            handles.push(tokio::spawn(async move {
                authority.mark_written(id, Key::digest(&[i])).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_revert_restores_single_use() {
        let authority = authority();
        let ticket = authority
            .issue("realm-a", "i", Scope::Realm, Writable::Yes, None)
            .await
            .unwrap();

        assert!(authority
            .mark_written(ticket.id, Key::digest(b"provisional"))
            .await
            .unwrap());
        authority.revert_write(ticket.id).await.unwrap();
        // the claim is available again
        assert!(authority
            .mark_written(ticket.id, Key::digest(b"retry"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_content_type_acceptance() {
        let limited = Writable::Limited {
            quota: 1024,
            accepted_content_types: vec!["image/png".to_string()],
        };
        let ticket = Ticket {
            id: Uuid::new_v4(),
            realm: "r".to_string(),
            issuer: "i".to_string(),
            scope: Scope::Realm,
            writable: limited,
            written: None,
            expires_at: OffsetDateTime::now_utc() + Duration::minutes(5),
            chunk_threshold: 1024,
        };
        assert!(ticket.accepts_content_type("image/png"));
        assert!(!ticket.accepts_content_type("text/html"));

        let open = Ticket {
            writable: Writable::Yes,
            ..ticket
        };
        assert!(open.accepts_content_type("anything/at-all"));
    }

    #[tokio::test]
    async fn test_missing_ticket() {
        let authority = authority();
        assert!(matches!(
            authority.get(Uuid::new_v4()).await.unwrap_err(),
            TicketError::NotFound(_)
        ));
    }
}
