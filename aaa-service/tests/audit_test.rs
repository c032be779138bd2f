//! Audit pipeline: hash-chain integrity, ordering, retention, and the
//! authenticated query surface.

mod common;

use aaa_service::models::{ActorKind, AuditEventKind, AuditRecord};
use aaa_service::services::AuditEvent;
use aaa_service::store::AuditStore;
use axum::http::StatusCode;
use chrono::{Duration, Utc};
use common::{TestApp, request_json};
use serde_json::json;
use uuid::Uuid;

async fn emit(app: &TestApp, org: Option<Uuid>, n: usize) {
    for i in 0..n {
        app.state
            .audit_sink
            .record(
                AuditEvent::new(AuditEventKind::CheckEvaluated, "u1", ActorKind::User)
                    .organization(org)
                    .resource("doc", Some(format!("d{}", i)))
                    .details(json!({ "seq": i })),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn chain_verifies_after_writes() {
    let app = TestApp::spawn();
    let org = Uuid::new_v4();
    emit(&app, Some(org), 10).await;
    app.wait_for_audit(|r| r.details["seq"] == 9).await;

    let verification = app
        .state
        .audit
        .verify_partition(&org.to_string())
        .await
        .unwrap();
    assert!(verification.valid);
    assert_eq!(verification.checked, 10);
    assert!(verification.broken_at.is_none());
}

#[tokio::test]
async fn events_stay_ordered_per_partition() {
    let app = TestApp::spawn();
    let org = Uuid::new_v4();
    emit(&app, Some(org), 20).await;
    app.wait_for_audit(|r| r.details["seq"] == 19).await;

    let records = app.store.partition_records(&org.to_string()).await.unwrap();
    let sequence: Vec<u64> = records
        .iter()
        .map(|r| r.details["seq"].as_u64().unwrap())
        .collect();
    let expected: Vec<u64> = (0..20).collect();
    assert_eq!(sequence, expected);

    // Each record chains off its predecessor.
    for window in records.windows(2) {
        assert_eq!(window[1].prev_hash, window[0].self_hash);
    }
}

#[tokio::test]
async fn tampered_record_breaks_verification_at_that_row() {
    let app = TestApp::spawn();
    let org = Uuid::new_v4();
    emit(&app, Some(org), 5).await;
    app.wait_for_audit(|r| r.details["seq"] == 4).await;

    // Forge a row: correct linkage, content that does not hash to
    // self_hash.
    let head = app
        .store
        .head_hash(&org.to_string())
        .await
        .unwrap()
        .unwrap();
    let mut forged = AuditRecord {
        id: Uuid::new_v4(),
        ts: Utc::now(),
        actor_id: "intruder".to_string(),
        actor_kind: ActorKind::User,
        organization_id: Some(org),
        action: "CHECK_EVALUATED".to_string(),
        resource_type: "doc".to_string(),
        resource_id: None,
        success: true,
        reason: None,
        details: json!({}),
        prev_hash: String::new(),
        self_hash: String::new(),
    }
    .chain(head);
    forged.success = false;
    let forged_id = forged.id;
    app.store.append(forged).await.unwrap();

    let verification = app
        .state
        .audit
        .verify_partition(&org.to_string())
        .await
        .unwrap();
    assert!(!verification.valid);
    assert_eq!(verification.checked, 5);
    assert_eq!(verification.broken_at, Some(forged_id));
}

#[tokio::test]
async fn service_events_land_in_the_service_partition() {
    let app = TestApp::spawn();
    let _ = app
        .state
        .engine
        .authorize_service("farmers-module", "catalog:seed", Some("wrong"))
        .await;
    app.wait_for_audit(|r| r.action == "SERVICE_AUTH_FAILURE").await;

    let records = app.store.partition_records("__service__").await.unwrap();
    assert!(!records.is_empty());
    let verification = app.state.audit.verify_partition("__service__").await.unwrap();
    assert!(verification.valid);
}

#[tokio::test]
async fn archival_moves_rows_without_breaking_the_tail() {
    let app = TestApp::spawn();
    let org = Uuid::new_v4();
    emit(&app, Some(org), 5).await;
    app.wait_for_audit(|r| r.details["seq"] == 4).await;

    let archived = app
        .store
        .archive_before(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(archived, 5);

    let live = app.store.partition_records(&org.to_string()).await.unwrap();
    assert!(live.is_empty());

    // New writes continue the chain from the stored head.
    emit(&app, Some(org), 3).await;
    app.wait_for_audit(|r| r.details["seq"] == 2).await;
    let verification = app
        .state
        .audit
        .verify_partition(&org.to_string())
        .await
        .unwrap();
    assert!(verification.valid);
    assert_eq!(verification.checked, 3);
}

#[tokio::test]
async fn audit_routes_require_authentication() {
    let app = TestApp::spawn();
    let router = app.router();

    let (status, _) = request_json(&router, "GET", "/audit/security-events", &[], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    app.create_user("auditor", "Password123!").await;
    let (_, body) = request_json(
        &router,
        "POST",
        "/auth/login",
        &[],
        Some(json!({ "username": "auditor", "password": "Password123!" })),
    )
    .await;
    let token = body["data"]["access_token"].as_str().unwrap().to_string();

    let (status, _) = request_json(
        &router,
        "GET",
        "/audit/security-events",
        &[("authorization", &format!("Bearer {}", token))],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn user_trail_filters_by_actor() {
    let app = TestApp::spawn();
    let user_id = Uuid::new_v4();
    app.state
        .audit_sink
        .record(
            AuditEvent::new(
                AuditEventKind::CheckEvaluated,
                user_id.to_string(),
                ActorKind::User,
            )
            .resource("doc", Some("d1".to_string())),
        )
        .await
        .unwrap();
    app.state
        .audit_sink
        .record(
            AuditEvent::new(AuditEventKind::CheckEvaluated, "someone-else", ActorKind::User)
                .resource("doc", Some("d2".to_string())),
        )
        .await
        .unwrap();
    app.wait_for_audit(|r| r.actor_id == "someone-else").await;

    let trail = app
        .state
        .audit
        .user_trail(user_id, 7, aaa_service::store::Page::default())
        .await
        .unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].actor_id, user_id.to_string());
}

#[tokio::test]
async fn integrity_endpoint_reports_chain_state() {
    let app = TestApp::spawn();
    let org = Uuid::new_v4();
    emit(&app, Some(org), 3).await;
    let record = app.wait_for_audit(|r| r.details["seq"] == 2).await;

    app.create_user("checker", "Password123!").await;
    let router = app.router();
    let (_, body) = request_json(
        &router,
        "POST",
        "/auth/login",
        &[],
        Some(json!({ "username": "checker", "password": "Password123!" })),
    )
    .await;
    let token = body["data"]["access_token"].as_str().unwrap().to_string();

    let (status, body) = request_json(
        &router,
        "GET",
        &format!("/audit/integrity/{}", record.id),
        &[("authorization", &format!("Bearer {}", token))],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["valid"], true);
    assert_eq!(body["data"]["checked"], 3);
}
