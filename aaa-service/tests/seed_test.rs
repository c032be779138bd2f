//! Seeding: counts, idempotence, and the seeded admin flow.

mod common;

use aaa_service::services::{CallContext, CheckRequest, PrincipalRef};
use common::TestApp;

#[tokio::test]
async fn fresh_seed_creates_full_catalog() {
    let app = TestApp::spawn();
    let outcome = app.state.catalog.seed("farmers-module", false).await.unwrap();

    assert_eq!(outcome.roles, 6);
    assert_eq!(outcome.permissions, 72);
    assert_eq!(outcome.resources, 8);
    assert_eq!(outcome.actions, 9);

    let mut created = outcome.created_role_names.clone();
    created.sort();
    let mut expected = vec![
        "farmer",
        "kisansathi",
        "CEO",
        "fpo_manager",
        "admin",
        "readonly",
    ];
    expected.sort();
    assert_eq!(created, expected);
}

#[tokio::test]
async fn seeding_twice_creates_nothing_new() {
    let app = TestApp::spawn();
    app.state.catalog.seed("farmers-module", false).await.unwrap();
    let second = app.state.catalog.seed("farmers-module", false).await.unwrap();

    assert_eq!(second.roles, 0);
    assert_eq!(second.permissions, 0);
    assert_eq!(second.resources, 0);
    assert_eq!(second.actions, 0);
    assert!(second.created_role_names.is_empty());
}

#[tokio::test]
async fn force_seed_refreshes_without_new_rows() {
    let app = TestApp::spawn();
    app.state.catalog.seed("farmers-module", false).await.unwrap();

    let role_before = app
        .state
        .catalog
        .role_by_name("admin")
        .await
        .unwrap()
        .unwrap();

    let forced = app.state.catalog.seed("farmers-module", true).await.unwrap();
    assert_eq!(forced.roles, 0);
    assert_eq!(forced.permissions, 0);

    let role_after = app
        .state
        .catalog
        .role_by_name("admin")
        .await
        .unwrap()
        .unwrap();
    // Same id, refreshed row.
    assert_eq!(role_after.id, role_before.id);
    assert!(role_after.version > role_before.version);
}

#[tokio::test]
async fn seeded_admin_can_seed_catalog() {
    let app = TestApp::spawn();
    app.state.catalog.seed("farmers-module", false).await.unwrap();

    let user = app.create_user("asha", "Password123!").await;
    app.assign_role(user.id, "admin").await;

    let ctx = CallContext::background();
    let decision = app
        .state
        .engine
        .check(
            &ctx,
            CheckRequest::new(PrincipalRef::user(user.id, None), "catalog", "*", "seed"),
        )
        .await
        .unwrap();

    assert!(decision.allowed);
    assert_eq!(decision.reason, "matched:catalog:seed");
    assert!(!decision.decision_id.is_empty());
    assert_eq!(decision.consistency_token, decision.decision_id);
}

#[tokio::test]
async fn readonly_role_cannot_seed() {
    let app = TestApp::spawn();
    app.state.catalog.seed("farmers-module", false).await.unwrap();

    let user = app.create_user("viewer", "Password123!").await;
    app.assign_role(user.id, "readonly").await;

    let ctx = CallContext::background();
    let decision = app
        .state
        .engine
        .check(
            &ctx,
            CheckRequest::new(PrincipalRef::user(user.id, None), "catalog", "*", "seed"),
        )
        .await
        .unwrap();

    assert!(!decision.allowed);
    assert_eq!(decision.reason, "no_matching_permission");
}
