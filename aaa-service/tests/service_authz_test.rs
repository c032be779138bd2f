//! Service-principal authorization against the policy document.

mod common;

use aaa_service::services::ServiceError;
use aaa_service::store::PrincipalStore;
use axum::http::StatusCode;
use common::{TestApp, request_json};
use serde_json::json;

#[tokio::test]
async fn wildcard_service_permissions() {
    let app = TestApp::spawn();

    // catalog:* covers any catalog action...
    app.state
        .engine
        .authorize_service("wildcard-service", "catalog:delete_roles", None)
        .await
        .unwrap();

    // ...but nothing outside the catalog.
    let denied = app
        .state
        .engine
        .authorize_service("wildcard-service", "users:create", None)
        .await;
    assert!(matches!(denied, Err(ServiceError::PermissionDenied(_))));
}

#[tokio::test]
async fn unknown_services_are_denied() {
    let app = TestApp::spawn();
    let result = app
        .state
        .engine
        .authorize_service("rogue-service", "catalog:seed", None)
        .await;
    assert!(matches!(result, Err(ServiceError::PermissionDenied(_))));
}

#[tokio::test]
async fn api_key_mismatch_is_denied_and_audited() {
    let app = TestApp::spawn();

    let result = app
        .state
        .engine
        .authorize_service("farmers-module", "catalog:seed", Some("wrong"))
        .await;
    match result {
        Err(ServiceError::PermissionDenied(message)) => {
            assert_eq!(message, "invalid API key");
        }
        other => panic!("expected permission denied, got {:?}", other.err()),
    }

    let record = app
        .wait_for_audit(|r| r.action == "SERVICE_AUTH_FAILURE" && r.actor_id == "farmers-module")
        .await;
    assert!(!record.success);
    assert_eq!(record.reason.as_deref(), Some("invalid API key"));
}

#[tokio::test]
async fn correct_api_key_is_accepted() {
    let app = TestApp::spawn();
    app.state
        .engine
        .authorize_service("farmers-module", "catalog:seed", Some("secure-key-123"))
        .await
        .unwrap();
}

#[tokio::test]
async fn disabled_policy_follows_default_behavior() {
    let allow_all = r#"
service_authorization:
  enabled: false
  services: {}
default_behavior:
  when_disabled: allow_all
  log_unauthorized_attempts: true
"#;
    let app = TestApp::spawn_with_policy(allow_all);
    app.state
        .engine
        .authorize_service("anyone", "anything:at_all", None)
        .await
        .unwrap();

    let deny_all = r#"
service_authorization:
  enabled: false
  services: {}
default_behavior:
  when_disabled: deny_all
  log_unauthorized_attempts: true
"#;
    let app = TestApp::spawn_with_policy(deny_all);
    let result = app
        .state
        .engine
        .authorize_service("anyone", "anything:at_all", None)
        .await;
    assert!(matches!(result, Err(ServiceError::PermissionDenied(_))));
}

#[tokio::test]
async fn seed_over_http_enforces_ownership() {
    let app = TestApp::spawn();
    let router = app.router();

    // The owning service seeds its own catalog.
    let (status, body) = request_json(
        &router,
        "POST",
        "/catalog/seed",
        &[
            ("x-service-name", "farmers-module"),
            ("x-api-key", "secure-key-123"),
        ],
        Some(json!({ "service_id": "farmers-module", "force": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {}", body);
    assert_eq!(body["data"]["roles"], 6);
    assert_eq!(body["data"]["permissions"], 72);

    // Targeting another service's catalog violates the ownership rule.
    let (status, _) = request_json(
        &router,
        "POST",
        "/catalog/seed",
        &[
            ("x-service-name", "farmers-module"),
            ("x-api-key", "secure-key-123"),
        ],
        Some(json!({ "service_id": "billing-module", "force": false })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Normalized names still count as ownership.
    let (status, _) = request_json(
        &router,
        "POST",
        "/catalog/seed",
        &[
            ("x-service-name", "farmers-module"),
            ("x-api-key", "secure-key-123"),
        ],
        Some(json!({ "service_id": "Farmers_Module", "force": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn seed_without_credentials_is_unauthenticated() {
    let app = TestApp::spawn();
    let router = app.router();
    let (status, _) = request_json(
        &router,
        "POST",
        "/catalog/seed",
        &[],
        Some(json!({ "service_id": "farmers-module", "force": false })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn registered_service_accounts_get_a_verifiable_key() {
    let app = TestApp::spawn();
    let router = app.router();

    let (status, body) = request_json(
        &router,
        "POST",
        "/services",
        &[],
        Some(json!({ "name": "billing-module" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let api_key = body["data"]["api_key"].as_str().unwrap().to_string();
    assert!(api_key.starts_with("svc_"));
    assert_eq!(body["data"]["service"]["kind"], "service");
    // The stored hash never travels over the wire.
    assert!(body["data"]["service"].get("api_key_hash").is_none());

    let account = app
        .state
        .principals
        .service_account_by_name("billing-module")
        .await
        .unwrap()
        .unwrap();
    assert!(aaa_service::utils::verify_secret(&api_key, &account.api_key_hash));

    // Duplicate names conflict.
    let (status, _) = request_json(
        &router,
        "POST",
        "/services",
        &[],
        Some(json!({ "name": "billing-module" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = request_json(&router, "GET", "/services/billing-module", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "billing-module");
}

#[tokio::test]
async fn authorize_service_endpoint_maps_denials_to_403() {
    let app = TestApp::spawn();
    let router = app.router();

    let (status, _) = request_json(
        &router,
        "POST",
        "/authz/service",
        &[("x-service-name", "farmers-module"), ("x-api-key", "wrong")],
        Some(json!({ "service_name": "farmers-module", "permission": "catalog:seed" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = request_json(
        &router,
        "POST",
        "/authz/service",
        &[
            ("x-service-name", "farmers-module"),
            ("x-api-key", "secure-key-123"),
        ],
        Some(json!({ "service_name": "farmers-module", "permission": "catalog:seed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}
