//! Decision engine: wildcard matching, cache coherence, batches, reverse
//! lookups, column checks, and explanations.

mod common;

use aaa_service::models::RoleScope;
use aaa_service::services::{CallContext, CheckRequest, PrincipalRef};
use common::TestApp;
use uuid::Uuid;

async fn role_with_perms(app: &TestApp, name: &str, perms: &[&str]) -> Uuid {
    let role = app
        .state
        .catalog
        .create_role(name, RoleScope::Global, None, None, None)
        .await
        .unwrap();
    let perms: Vec<String> = perms.iter().map(|s| s.to_string()).collect();
    app.state
        .catalog
        .attach_permissions(role.id, &perms)
        .await
        .unwrap();
    role.id
}

#[tokio::test]
async fn wildcard_grants_match_any_action() {
    let app = TestApp::spawn();
    let role_id = role_with_perms(&app, "doc-admin", &["doc:*"]).await;
    let user = app.create_user("wild", "Password123!").await;
    app.state
        .graph
        .assign_role_to_user(user.id, role_id)
        .await
        .unwrap();

    let ctx = CallContext::background();
    let principal = PrincipalRef::user(user.id, None);

    let read = app
        .state
        .engine
        .check(&ctx, CheckRequest::new(principal, "doc", "d1", "read"))
        .await
        .unwrap();
    assert!(read.allowed);
    assert_eq!(read.reason, "matched:doc:*");

    let delete = app
        .state
        .engine
        .check(&ctx, CheckRequest::new(principal, "doc", "d1", "delete"))
        .await
        .unwrap();
    assert!(delete.allowed);

    let other_type = app
        .state
        .engine
        .check(&ctx, CheckRequest::new(principal, "user", "u1", "read"))
        .await
        .unwrap();
    assert!(!other_type.allowed);
}

#[tokio::test]
async fn revoking_a_role_is_visible_immediately() {
    let app = TestApp::spawn();
    let role_id = role_with_perms(&app, "writer", &["doc:write"]).await;
    let user = app.create_user("coherent", "Password123!").await;
    app.state
        .graph
        .assign_role_to_user(user.id, role_id)
        .await
        .unwrap();

    let ctx = CallContext::background();
    let principal = PrincipalRef::user(user.id, None);
    let request = CheckRequest::new(principal, "doc", "d1", "write");

    let before = app.state.engine.check(&ctx, request.clone()).await.unwrap();
    assert!(before.allowed);

    // The revoke invalidates the cached snapshot before acknowledging.
    app.state
        .graph
        .remove_role_from_user(user.id, role_id)
        .await
        .unwrap();

    let after = app.state.engine.check(&ctx, request).await.unwrap();
    assert!(!after.allowed);
    assert_eq!(after.reason, "no_matching_permission");
}

#[tokio::test]
async fn batch_check_preserves_input_order() {
    let app = TestApp::spawn();
    let role_id = role_with_perms(&app, "reader", &["doc:read"]).await;
    let user = app.create_user("batcher", "Password123!").await;
    app.state
        .graph
        .assign_role_to_user(user.id, role_id)
        .await
        .unwrap();

    let ctx = CallContext::background();
    let principal = PrincipalRef::user(user.id, None);

    let mut requests = Vec::new();
    for i in 0..40 {
        let action = if i % 2 == 0 { "read" } else { "write" };
        requests.push(CheckRequest::new(principal, "doc", format!("d{}", i), action));
    }

    let decisions = app.state.engine.batch_check(&ctx, requests).await.unwrap();
    assert_eq!(decisions.len(), 40);
    for (i, decision) in decisions.iter().enumerate() {
        assert_eq!(decision.allowed, i % 2 == 0, "item {} out of order", i);
    }
}

#[tokio::test]
async fn resource_ancestor_grant_allows_descendants() {
    let app = TestApp::spawn();
    let region = app
        .state
        .catalog
        .register_resource("north-region", "region", None, None)
        .await
        .unwrap();
    let district = app
        .state
        .catalog
        .register_resource("district-7", "district", None, Some(region.id))
        .await
        .unwrap();

    let role_id = role_with_perms(&app, "region-admin", &["north-region:manage"]).await;
    let user = app.create_user("regional", "Password123!").await;
    app.state
        .graph
        .assign_role_to_user(user.id, role_id)
        .await
        .unwrap();

    let ctx = CallContext::background();
    let principal = PrincipalRef::user(user.id, None);
    let decision = app
        .state
        .engine
        .check(
            &ctx,
            CheckRequest::new(principal, "district", district.id.to_string(), "manage"),
        )
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.reason, "matched:north-region:manage");
}

#[tokio::test]
async fn lookup_resources_returns_sorted_ids() {
    let app = TestApp::spawn();
    let mut expected = Vec::new();
    for name in ["doc-a", "doc-b", "doc-c"] {
        let resource = app
            .state
            .catalog
            .register_resource(name, "doc", None, None)
            .await
            .unwrap();
        expected.push(resource.id);
    }
    expected.sort();

    let role_id = role_with_perms(&app, "doc-reader", &["doc:read"]).await;
    let user = app.create_user("looker", "Password123!").await;
    app.state
        .graph
        .assign_role_to_user(user.id, role_id)
        .await
        .unwrap();

    let ctx = CallContext::background();
    let ids = app
        .state
        .engine
        .lookup_resources(&ctx, PrincipalRef::user(user.id, None), "doc", "read")
        .await
        .unwrap();
    assert_eq!(ids, expected);

    // No grant for the action: nothing comes back.
    let none = app
        .state
        .engine
        .lookup_resources(&ctx, PrincipalRef::user(user.id, None), "doc", "delete")
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn column_check_intersects_requested_columns() {
    let app = TestApp::spawn();
    let role_id = role_with_perms(&app, "pii-reader", &["farmers:read"]).await;
    let group = app
        .state
        .catalog
        .register_column_group(
            "farmers-public",
            "farmers",
            vec!["name".to_string(), "village".to_string()],
        )
        .await
        .unwrap();
    app.state
        .catalog
        .attach_column_group(role_id, group.id)
        .await
        .unwrap();

    let user = app.create_user("columnist", "Password123!").await;
    app.state
        .graph
        .assign_role_to_user(user.id, role_id)
        .await
        .unwrap();

    let ctx = CallContext::background();
    let principal = PrincipalRef::user(user.id, None);
    let requested = vec![
        "name".to_string(),
        "village".to_string(),
        "aadhaar_number".to_string(),
    ];

    let outcome = app
        .state
        .engine
        .check_columns(&ctx, principal, "farmers", "read", &requested)
        .await
        .unwrap();
    assert!(outcome.allowed);
    assert_eq!(outcome.allowed_columns, vec!["name", "village"]);

    // Table-level deny empties the column set.
    let denied = app
        .state
        .engine
        .check_columns(&ctx, principal, "farmers", "delete", &requested)
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert!(denied.allowed_columns.is_empty());
}

#[tokio::test]
async fn explanations_name_the_granting_roles() {
    let app = TestApp::spawn();
    let role_id = role_with_perms(&app, "explainer", &["doc:read"]).await;
    let user = app.create_user("why", "Password123!").await;
    app.state
        .graph
        .assign_role_to_user(user.id, role_id)
        .await
        .unwrap();

    let ctx = CallContext::background();
    let decision = app
        .state
        .engine
        .check(
            &ctx,
            CheckRequest::new(PrincipalRef::user(user.id, None), "doc", "d1", "read").explained(),
        )
        .await
        .unwrap();

    let explanation = decision.explanation.expect("explanation requested");
    assert_eq!(explanation.matched.as_deref(), Some("doc:read"));
    assert_eq!(explanation.roles.len(), 1);
    assert_eq!(explanation.roles[0].role_name, "explainer");
    assert_eq!(explanation.roles[0].source, "DIRECT");
}

#[tokio::test]
async fn inactive_roles_are_ignored() {
    let app = TestApp::spawn();
    let role_id = role_with_perms(&app, "dormant", &["doc:read"]).await;
    let user = app.create_user("sleepy", "Password123!").await;
    app.state
        .graph
        .assign_role_to_user(user.id, role_id)
        .await
        .unwrap();

    // Deactivate the role; the assignment stays in place.
    let role = app.state.catalog.role(role_id).await.unwrap().unwrap();
    let mut inactive = role.clone();
    inactive.is_active = false;
    app.state.catalog.update_role(inactive).await.unwrap();

    let ctx = CallContext::background();
    let decision = app
        .state
        .engine
        .check(
            &ctx,
            CheckRequest::new(PrincipalRef::user(user.id, None), "doc", "d1", "read"),
        )
        .await
        .unwrap();
    assert!(!decision.allowed);
}
