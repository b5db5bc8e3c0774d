//! Integration tests for ticket scoping, expiry, write-once, and quota

mod common;

use bytes::Bytes;
use engine::engine::EngineError;
use engine::ticket::{Scope, TicketError, Writable};
use engine::usage::UsageError;
use time::Duration;

#[tokio::test]
async fn test_ticket_write_is_single_use() {
    let engine = common::test_engine();
    let ticket = common::write_ticket(&engine).await;

    let first = engine
        .write_file(ticket.id, Bytes::from_static(b"first write"), "text/plain")
        .await
        .unwrap();

    let err = engine
        .write_file(ticket.id, Bytes::from_static(b"second write"), "text/plain")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Ticket(TicketError::AlreadyWritten(_))
    ));

    // the first root stays recorded on the ticket
    let after = engine.get_ticket(ticket.id).await.unwrap();
    assert_eq!(after.written, Some(first));
}

#[tokio::test]
async fn test_read_only_ticket_cannot_write() {
    let engine = common::test_engine();
    let ticket = common::read_ticket(&engine, Scope::Realm).await;

    let err = engine
        .write_file(ticket.id, Bytes::from_static(b"nope"), "text/plain")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Ticket(TicketError::ScopeViolation(_))
    ));
}

#[tokio::test]
async fn test_root_scoped_ticket_limits_reads() {
    let engine = common::test_engine();
    let covered = common::put_file(&engine, b"covered content", "text/plain").await;
    let other = common::put_file(&engine, b"other content", "text/plain").await;

    let ticket = common::read_ticket(&engine, Scope::Roots(vec![covered])).await;

    assert!(engine.read_file(ticket.id, covered).await.is_ok());
    let err = engine.read_file(ticket.id, other).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Ticket(TicketError::ScopeViolation(_))
    ));
}

#[tokio::test]
async fn test_expired_ticket_rejected() {
    let engine = common::test_engine();
    let ticket = engine
        .issue_ticket(
            common::REALM,
            common::ISSUER,
            Scope::Realm,
            Writable::Yes,
            Some(Duration::ZERO),
        )
        .await
        .unwrap();

    let err = engine
        .write_file(ticket.id, Bytes::from_static(b"too late"), "text/plain")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Ticket(TicketError::Expired(_))));
}

#[tokio::test]
async fn test_content_type_restriction() {
    let engine = common::test_engine();
    let ticket = engine
        .issue_ticket(
            common::REALM,
            common::ISSUER,
            Scope::Realm,
            Writable::Limited {
                quota: 1024 * 1024,
                accepted_content_types: vec!["text/plain".to_string()],
            },
            None,
        )
        .await
        .unwrap();

    let err = engine
        .write_file(
            ticket.id,
            Bytes::from_static(b"{\"k\":1}"),
            "application/json",
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Ticket(TicketError::ScopeViolation(_))
    ));

    // the rejected attempt did not consume the ticket
    let root = engine
        .write_file(ticket.id, Bytes::from_static(b"plain text"), "text/plain")
        .await
        .unwrap();
    let after = engine.get_ticket(ticket.id).await.unwrap();
    assert_eq!(after.written, Some(root));
}

#[tokio::test]
async fn test_ticket_quota_caps_write_size() {
    let engine = common::test_engine();
    let ticket = engine
        .issue_ticket(
            common::REALM,
            common::ISSUER,
            Scope::Realm,
            Writable::Limited {
                quota: 64,
                accepted_content_types: vec![],
            },
            None,
        )
        .await
        .unwrap();

    let err = engine
        .write_file(
            ticket.id,
            Bytes::from(common::patterned(4096)),
            "application/octet-stream",
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Ticket(TicketError::ScopeViolation(_))
    ));
}

#[tokio::test]
async fn test_realm_quota_rejects_and_releases_claim() {
    let engine = common::test_engine();
    engine.set_quota_limit(common::REALM, 512).await.unwrap();

    // physical footprint of a 4 KiB file exceeds the 512-byte limit
    let ticket = common::write_ticket(&engine).await;
    let err = engine
        .write_file(
            ticket.id,
            Bytes::from(common::patterned(4096)),
            "application/octet-stream",
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Usage(UsageError::QuotaExceeded { .. })
    ));

    // the claim was reverted, so a smaller write on the same ticket works
    let root = engine
        .write_file(ticket.id, Bytes::from_static(b"small enough"), "text/plain")
        .await
        .unwrap();
    let after = engine.get_ticket(ticket.id).await.unwrap();
    assert_eq!(after.written, Some(root));

    let usage = engine.usage(common::REALM).await.unwrap();
    assert!(usage.physical_bytes > 0);
    assert!(usage.physical_bytes <= 512);
}

#[tokio::test]
async fn test_ttl_clamped_to_configured_maximum() {
    let engine = common::test_engine();
    let max = engine.config().max_ticket_ttl;

    let ticket = engine
        .issue_ticket(
            common::REALM,
            common::ISSUER,
            Scope::Realm,
            Writable::No,
            Some(max * 10),
        )
        .await
        .unwrap();

    let lifetime = ticket.expires_at - time::OffsetDateTime::now_utc();
    assert!(lifetime <= max);
}
