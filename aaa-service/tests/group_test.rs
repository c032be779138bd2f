//! Principal graph: group roles, inheritance, cascades, and source tags.

mod common;

use aaa_service::models::{RoleScope, RoleSource};
use aaa_service::services::{CallContext, CheckRequest, PrincipalRef, ServiceError};
use aaa_service::store::PrincipalStore;
use common::TestApp;
use uuid::Uuid;

struct Fixture {
    org: Uuid,
    writer_role: Uuid,
    user: Uuid,
}

async fn fixture(app: &TestApp) -> Fixture {
    let org = app
        .state
        .graph
        .create_organization("acme")
        .await
        .unwrap()
        .id;
    let role = app
        .state
        .catalog
        .create_role("writer", RoleScope::Global, None, None, None)
        .await
        .unwrap();
    app.state
        .catalog
        .attach_permissions(role.id, &["doc:write".to_string()])
        .await
        .unwrap();
    let user = app.create_user("grouped", "Password123!").await;
    app.state
        .graph
        .add_user_to_organization(org, user.id)
        .await
        .unwrap();
    Fixture {
        org,
        writer_role: role.id,
        user: user.id,
    }
}

#[tokio::test]
async fn group_role_reaches_members() {
    let app = TestApp::spawn();
    let fx = fixture(&app).await;
    let group = app
        .state
        .graph
        .create_group(fx.org, "eng", None)
        .await
        .unwrap();

    app.state
        .graph
        .assign_role_to_group(group.id, fx.writer_role)
        .await
        .unwrap();
    app.state
        .graph
        .add_member(group.id, fx.user)
        .await
        .unwrap();

    let effective = app
        .state
        .graph
        .effective_roles(Some(fx.org), fx.user)
        .await
        .unwrap();
    let entry = effective
        .iter()
        .find(|e| e.role.id == fx.writer_role)
        .expect("writer role is effective");
    assert_eq!(entry.source.to_string(), format!("GROUP_DIRECT:{}", group.id));

    let ctx = CallContext::background();
    let decision = app
        .state
        .engine
        .check(
            &ctx,
            CheckRequest::new(
                PrincipalRef::user(fx.user, Some(fx.org)),
                "doc",
                "d1",
                "write",
            ),
        )
        .await
        .unwrap();
    assert!(decision.allowed);
}

#[tokio::test]
async fn inheritance_gates_role_flow_between_groups() {
    let app = TestApp::spawn();
    let fx = fixture(&app).await;

    let eng = app
        .state
        .graph
        .create_group(fx.org, "eng", None)
        .await
        .unwrap();
    let backend = app
        .state
        .graph
        .create_group(fx.org, "backend", Some(eng.id))
        .await
        .unwrap();

    app.state
        .graph
        .assign_role_to_group(backend.id, fx.writer_role)
        .await
        .unwrap();
    app.state.graph.add_member(eng.id, fx.user).await.unwrap();

    let ctx = CallContext::background();
    let principal = PrincipalRef::user(fx.user, Some(fx.org));
    let request = CheckRequest::new(principal, "doc", "d1", "write");

    // No inheritance edge yet: membership in eng grants nothing.
    let denied = app.state.engine.check(&ctx, request.clone()).await.unwrap();
    assert!(!denied.allowed);

    // backend's roles flow to eng once the edge exists.
    app.state
        .graph
        .add_group_inheritance(backend.id, eng.id)
        .await
        .unwrap();

    let allowed = app.state.engine.check(&ctx, request.clone()).await.unwrap();
    assert!(allowed.allowed);

    let effective = app
        .state
        .graph
        .effective_roles(Some(fx.org), fx.user)
        .await
        .unwrap();
    let entry = effective
        .iter()
        .find(|e| e.role.id == fx.writer_role)
        .unwrap();
    assert_eq!(
        entry.source.to_string(),
        format!("GROUP_INHERITED:{}", backend.id)
    );

    // Removing the edge revokes the flow synchronously.
    app.state
        .graph
        .remove_group_inheritance(backend.id, eng.id)
        .await
        .unwrap();
    let denied_again = app.state.engine.check(&ctx, request).await.unwrap();
    assert!(!denied_again.allowed);
}

#[tokio::test]
async fn inheritance_cycles_are_rejected() {
    let app = TestApp::spawn();
    let fx = fixture(&app).await;
    let a = app.state.graph.create_group(fx.org, "a", None).await.unwrap();
    let b = app.state.graph.create_group(fx.org, "b", None).await.unwrap();
    let c = app.state.graph.create_group(fx.org, "c", None).await.unwrap();

    app.state
        .graph
        .add_group_inheritance(a.id, b.id)
        .await
        .unwrap();
    app.state
        .graph
        .add_group_inheritance(b.id, c.id)
        .await
        .unwrap();

    // c -> a would close the loop a -> b -> c -> a.
    let result = app.state.graph.add_group_inheritance(c.id, a.id).await;
    assert!(matches!(result, Err(ServiceError::Cycle(_))));

    let selfish = app.state.graph.add_group_inheritance(a.id, a.id).await;
    assert!(matches!(selfish, Err(ServiceError::Cycle(_))));
}

#[tokio::test]
async fn removing_a_member_cascades_materialized_roles() {
    let app = TestApp::spawn();
    let fx = fixture(&app).await;
    let group = app
        .state
        .graph
        .create_group(fx.org, "eng", None)
        .await
        .unwrap();

    app.state
        .graph
        .assign_role_to_group(group.id, fx.writer_role)
        .await
        .unwrap();
    app.state.graph.add_member(group.id, fx.user).await.unwrap();

    // Membership materialized a GROUP:<gid> row.
    let rows = app.state.principals.user_roles(fx.user).await.unwrap();
    assert!(
        rows.iter()
            .any(|r| r.source == RoleSource::Group(group.id) && r.role_id == fx.writer_role)
    );

    let ctx = CallContext::background();
    let principal = PrincipalRef::user(fx.user, Some(fx.org));
    let request = CheckRequest::new(principal, "doc", "d1", "write");
    assert!(app.state.engine.check(&ctx, request.clone()).await.unwrap().allowed);

    app.state
        .graph
        .remove_member(group.id, fx.user)
        .await
        .unwrap();

    // No group-sourced rows survive, and the cached decision is gone.
    let rows = app.state.principals.user_roles(fx.user).await.unwrap();
    assert!(rows.iter().all(|r| r.source != RoleSource::Group(group.id)));
    assert!(!app.state.engine.check(&ctx, request).await.unwrap().allowed);
}

#[tokio::test]
async fn revoking_a_group_role_cascades_to_members() {
    let app = TestApp::spawn();
    let fx = fixture(&app).await;
    let group = app
        .state
        .graph
        .create_group(fx.org, "eng", None)
        .await
        .unwrap();

    app.state.graph.add_member(group.id, fx.user).await.unwrap();
    app.state
        .graph
        .assign_role_to_group(group.id, fx.writer_role)
        .await
        .unwrap();

    let rows = app.state.principals.user_roles(fx.user).await.unwrap();
    assert!(rows.iter().any(|r| r.source == RoleSource::Group(group.id)));

    app.state
        .graph
        .remove_role_from_group(group.id, fx.writer_role)
        .await
        .unwrap();

    let rows = app.state.principals.user_roles(fx.user).await.unwrap();
    assert!(rows.iter().all(|r| r.source != RoleSource::Group(group.id)));
}

#[tokio::test]
async fn role_hierarchy_grants_ancestor_roles() {
    let app = TestApp::spawn();
    let fx = fixture(&app).await;

    let base = app
        .state
        .catalog
        .create_role("base-reader", RoleScope::Global, None, None, None)
        .await
        .unwrap();
    app.state
        .catalog
        .attach_permissions(base.id, &["doc:read".to_string()])
        .await
        .unwrap();
    let elevated = app
        .state
        .catalog
        .create_role("elevated", RoleScope::Global, None, Some(base.id), None)
        .await
        .unwrap();

    app.state
        .graph
        .assign_role_to_user(fx.user, elevated.id)
        .await
        .unwrap();

    // The parent role's permission arrives through the hierarchy.
    let perms = app
        .state
        .graph
        .effective_permissions(Some(fx.org), fx.user)
        .await
        .unwrap();
    assert!(perms.contains("doc:read"));

    let effective = app
        .state
        .graph
        .effective_roles(Some(fx.org), fx.user)
        .await
        .unwrap();
    assert!(effective.iter().any(|e| e.role.id == base.id));
    assert!(effective.iter().any(|e| e.role.id == elevated.id));
}

#[tokio::test]
async fn removing_org_membership_clears_group_roles() {
    let app = TestApp::spawn();
    let fx = fixture(&app).await;
    let group = app
        .state
        .graph
        .create_group(fx.org, "eng", None)
        .await
        .unwrap();
    app.state
        .graph
        .assign_role_to_group(group.id, fx.writer_role)
        .await
        .unwrap();
    app.state.graph.add_member(group.id, fx.user).await.unwrap();

    app.state
        .graph
        .remove_user_from_organization(fx.org, fx.user)
        .await
        .unwrap();

    assert!(!app.state.graph.is_org_member(fx.org, fx.user).await.unwrap());
    let rows = app.state.principals.user_roles(fx.user).await.unwrap();
    assert!(rows.iter().all(|r| r.source != RoleSource::Group(group.id)));
    let groups = app
        .state
        .graph
        .list_user_groups(fx.org, fx.user)
        .await
        .unwrap();
    assert!(groups.is_empty());
}

#[tokio::test]
async fn users_with_effective_role_sees_hierarchy_holders() {
    let app = TestApp::spawn();
    let fx = fixture(&app).await;

    let parent = app
        .state
        .catalog
        .create_role("parent-role", RoleScope::Global, None, None, None)
        .await
        .unwrap();
    let child = app
        .state
        .catalog
        .create_role("child-role", RoleScope::Global, None, Some(parent.id), None)
        .await
        .unwrap();

    app.state
        .graph
        .assign_role_to_user(fx.user, child.id)
        .await
        .unwrap();

    let holders = app
        .state
        .graph
        .users_with_effective_role(&parent)
        .await
        .unwrap();
    assert!(holders.contains(&fx.user));
}
