//! Shared test utilities for engine integration tests
#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use engine::config::Config;
use engine::digest::Key;
use engine::engine::Engine;
use engine::ticket::{Scope, Ticket, Writable};
use store::{MemoryBlobStore, MemoryTableStore};

pub const REALM: &str = "realm-a";
pub const ISSUER: &str = "test-issuer";

/// Engine over fresh in-memory backends.
pub fn test_engine() -> Engine {
    engine_with(Config::default())
}

/// Opt into engine logs with `RUST_LOG=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn engine_with(config: Config) -> Engine {
    init_tracing();
    Engine::new(
        config,
        Arc::new(MemoryTableStore::new()),
        Arc::new(MemoryBlobStore::new()),
    )
}

/// A realm-wide writable ticket with the default TTL.
pub async fn write_ticket(engine: &Engine) -> Ticket {
    engine
        .issue_ticket(REALM, ISSUER, Scope::Realm, Writable::Yes, None)
        .await
        .unwrap()
}

pub async fn read_ticket(engine: &Engine, scope: Scope) -> Ticket {
    engine
        .issue_ticket(REALM, ISSUER, scope, Writable::No, None)
        .await
        .unwrap()
}

/// Write `content` through a fresh single-use ticket, returning the root.
pub async fn put_file(engine: &Engine, content: &[u8], content_type: &str) -> Key {
    let ticket = write_ticket(engine).await;
    engine
        .write_file(ticket.id, Bytes::copy_from_slice(content), content_type)
        .await
        .unwrap()
}

/// Deterministic but non-repeating content of `len` bytes.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
