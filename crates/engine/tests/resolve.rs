//! Integration tests for incremental sync resolution

mod common;

use std::collections::{BTreeMap, HashSet};

use engine::engine::EngineError;
use engine::ticket::{Scope, TicketError};

#[tokio::test]
async fn test_resolve_lists_everything_for_empty_client() {
    let engine = common::test_engine();
    let file = common::put_file(&engine, &common::patterned(512), "application/octet-stream").await;
    let ticket = common::write_ticket(&engine).await;
    let root = engine
        .write_collection(ticket.id, BTreeMap::from([("f".to_string(), file)]))
        .await
        .unwrap();

    let reader = common::read_ticket(&engine, Scope::Realm).await;
    let missing = engine
        .resolve(reader.id, root, &HashSet::new())
        .await
        .unwrap();

    // collection node, file node, and the file's single raw chunk
    assert_eq!(missing.len(), 3);
    assert!(missing.contains(&root));
    assert!(missing.contains(&file));
}

#[tokio::test]
async fn test_resolve_skips_known_subtrees() {
    let engine = common::test_engine();
    let file = common::put_file(&engine, &common::patterned(512), "application/octet-stream").await;
    let ticket = common::write_ticket(&engine).await;
    let root = engine
        .write_collection(ticket.id, BTreeMap::from([("f".to_string(), file)]))
        .await
        .unwrap();
    let reader = common::read_ticket(&engine, Scope::Realm).await;

    // a client holding the file subtree is only missing the collection
    let missing = engine
        .resolve(reader.id, root, &HashSet::from([file]))
        .await
        .unwrap();
    assert_eq!(missing, vec![root]);

    // a client holding the root needs nothing
    let missing = engine
        .resolve(reader.id, root, &HashSet::from([root]))
        .await
        .unwrap();
    assert!(missing.is_empty());
}

#[tokio::test]
async fn test_resolve_respects_ticket_scope() {
    let engine = common::test_engine();
    let covered = common::put_file(&engine, b"covered", "text/plain").await;
    let other = common::put_file(&engine, b"uncovered", "text/plain").await;

    let ticket = common::read_ticket(&engine, Scope::Roots(vec![covered])).await;

    assert!(engine
        .resolve(ticket.id, covered, &HashSet::new())
        .await
        .is_ok());
    let err = engine
        .resolve(ticket.id, other, &HashSet::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Ticket(TicketError::ScopeViolation(_))
    ));
}
