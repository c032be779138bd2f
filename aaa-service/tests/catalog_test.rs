//! Catalog invariants: acyclic graphs, canonical permission names, and
//! optimistic role versioning.

mod common;

use aaa_service::models::RoleScope;
use aaa_service::services::ServiceError;
use common::TestApp;

#[tokio::test]
async fn role_hierarchy_rejects_cycles() {
    let app = TestApp::spawn();
    let parent = app
        .state
        .catalog
        .create_role("ops", RoleScope::Global, None, None, None)
        .await
        .unwrap();
    let child = app
        .state
        .catalog
        .create_role("ops-junior", RoleScope::Global, None, Some(parent.id), None)
        .await
        .unwrap();

    // Completing the loop parent -> child -> parent must fail.
    let mut looped = parent.clone();
    looped.parent_id = Some(child.id);
    let result = app.state.catalog.update_role(looped).await;
    assert!(matches!(result, Err(ServiceError::Cycle(_))));

    // Self-parenting fails outright.
    let mut selfish = child.clone();
    selfish.parent_id = Some(child.id);
    let result = app.state.catalog.update_role(selfish).await;
    assert!(matches!(result, Err(ServiceError::Cycle(_))));
}

#[tokio::test]
async fn resource_forest_rejects_cycles() {
    let app = TestApp::spawn();
    let root = app
        .state
        .catalog
        .register_resource("region", "region", None, None)
        .await
        .unwrap();
    let leaf = app
        .state
        .catalog
        .register_resource("district", "district", None, Some(root.id))
        .await
        .unwrap();

    let result = app
        .state
        .catalog
        .set_resource_parent(root.id, Some(leaf.id))
        .await;
    assert!(matches!(result, Err(ServiceError::Cycle(_))));
}

#[tokio::test]
async fn permission_names_are_normalized_and_idempotent() {
    let app = TestApp::spawn();
    let first = app
        .state
        .catalog
        .create_permission(" Farmers :Read ", None)
        .await
        .unwrap();
    assert_eq!(first.name, "farmers:read");

    // Same canonical name resolves to the same row.
    let second = app
        .state
        .catalog
        .create_permission("FARMERS:READ", None)
        .await
        .unwrap();
    assert_eq!(second.id, first.id);

    let malformed = app.state.catalog.create_permission("farmers", None).await;
    assert!(matches!(
        malformed,
        Err(ServiceError::InvalidPermissionFormat(_))
    ));
}

#[tokio::test]
async fn stale_role_writers_are_rejected() {
    let app = TestApp::spawn();
    let role = app
        .state
        .catalog
        .create_role("auditor", RoleScope::Global, None, None, None)
        .await
        .unwrap();

    // First writer wins and bumps the version.
    let mut first = role.clone();
    first.description = Some("first".to_string());
    let updated = app.state.catalog.update_role(first).await.unwrap();
    assert_eq!(updated.version, role.version + 1);

    // Second writer still holds the old version.
    let mut second = role.clone();
    second.description = Some("second".to_string());
    let result = app.state.catalog.update_role(second).await;
    assert!(matches!(result, Err(ServiceError::VersionConflict { .. })));
}

#[tokio::test]
async fn builtin_actions_cannot_be_redefined() {
    let app = TestApp::spawn();
    app.state
        .catalog
        .register_action("migrate", None, None, true)
        .await
        .unwrap();
    let result = app
        .state
        .catalog
        .register_action("migrate", None, None, false)
        .await;
    assert!(matches!(result, Err(ServiceError::Immutable(_))));
}
