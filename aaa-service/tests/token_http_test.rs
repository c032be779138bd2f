//! Token lifecycle through the HTTP surface.

mod common;

use axum::http::StatusCode;
use common::{TestApp, request_json};
use serde_json::json;

#[tokio::test]
async fn register_login_refresh_flow() {
    let app = TestApp::spawn();
    let router = app.router();

    let (status, body) = request_json(
        &router,
        "POST",
        "/auth/register",
        &[],
        Some(json!({
            "phone": "9876543210",
            "country_code": "+91",
            "username": "asha",
            "password": "Password123!",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["data"]["user_id"].is_string());

    let (status, body) = request_json(
        &router,
        "POST",
        "/auth/login",
        &[],
        Some(json!({ "username": "asha", "password": "Password123!" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let refresh_token = body["data"]["refresh_token"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["token_type"], "Bearer");
    assert_eq!(body["data"]["expires_in"], 900);

    // Rotation: the first refresh succeeds...
    let (status, body) = request_json(
        &router,
        "POST",
        "/auth/refresh",
        &[],
        Some(json!({ "refresh_token": refresh_token })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["access_token"].is_string());

    // ...and replaying the consumed refresh token is rejected.
    let (status, _) = request_json(
        &router,
        "POST",
        "/auth/refresh",
        &[],
        Some(json!({ "refresh_token": refresh_token })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_with_wrong_password_is_unauthenticated() {
    let app = TestApp::spawn();
    app.create_user("careless", "Correct123!").await;
    let router = app.router();

    let (status, body) = request_json(
        &router,
        "POST",
        "/auth/login",
        &[],
        Some(json!({ "username": "careless", "password": "wrong" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    // No details leak on auth failures.
    assert!(body.get("details").is_none());

    app.wait_for_audit(|r| r.action == "LOGIN_FAILURE").await;
}

#[tokio::test]
async fn validate_enforces_required_permissions() {
    let app = TestApp::spawn();
    app.state.catalog.seed("farmers-module", false).await.unwrap();
    let user = app.create_user("validated", "Password123!").await;
    app.assign_role(user.id, "readonly").await;
    let router = app.router();

    let (_, body) = request_json(
        &router,
        "POST",
        "/auth/login",
        &[],
        Some(json!({ "username": "validated", "password": "Password123!" })),
    )
    .await;
    let access_token = body["data"]["access_token"].as_str().unwrap().to_string();

    // readonly grants farmers:read.
    let (status, body) = request_json(
        &router,
        "POST",
        "/auth/validate",
        &[],
        Some(json!({
            "token": access_token,
            "include_permissions": true,
            "required_permissions": ["farmers:read"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["valid"], true);
    assert!(
        body["data"]["permissions"]
            .as_array()
            .unwrap()
            .iter()
            .any(|p| p == "farmers:read")
    );

    // readonly does not grant farmers:delete.
    let (status, _) = request_json(
        &router,
        "POST",
        "/auth/validate",
        &[],
        Some(json!({
            "token": access_token,
            "required_permissions": ["farmers:delete"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn revoked_token_fails_validation() {
    let app = TestApp::spawn();
    app.create_user("revoked", "Password123!").await;
    let router = app.router();

    let (_, body) = request_json(
        &router,
        "POST",
        "/auth/login",
        &[],
        Some(json!({ "username": "revoked", "password": "Password123!" })),
    )
    .await;
    let access_token = body["data"]["access_token"].as_str().unwrap().to_string();

    let (status, _) = request_json(
        &router,
        "POST",
        "/auth/revoke",
        &[],
        Some(json!({ "token": access_token })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request_json(
        &router,
        "POST",
        "/auth/validate",
        &[],
        Some(json!({ "token": access_token })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn introspection_reports_metadata_only() {
    let app = TestApp::spawn();
    app.create_user("meta", "Password123!").await;
    let router = app.router();

    let (_, body) = request_json(
        &router,
        "POST",
        "/auth/login",
        &[],
        Some(json!({ "username": "meta", "password": "Password123!" })),
    )
    .await;
    let access_token = body["data"]["access_token"].as_str().unwrap().to_string();

    let (status, body) = request_json(
        &router,
        "POST",
        "/auth/introspect",
        &[],
        Some(json!({ "token": access_token })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["active"], true);
    assert_eq!(body["data"]["token_type"], "access");
    assert_eq!(body["data"]["username"], "meta");
    assert!(body["data"].get("permissions").is_none());

    let (status, body) = request_json(
        &router,
        "POST",
        "/auth/introspect",
        &[],
        Some(json!({ "token": "garbage" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["active"], false);
}

#[tokio::test]
async fn active_tokens_listed_per_user() {
    let app = TestApp::spawn();
    let user = app.create_user("lister", "Password123!").await;
    let router = app.router();

    for _ in 0..2 {
        let (status, _) = request_json(
            &router,
            "POST",
            "/auth/login",
            &[],
            Some(json!({ "username": "lister", "password": "Password123!" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = request_json(
        &router,
        "GET",
        &format!("/auth/tokens/{}", user.id),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // Two logins, each issuing an access and a refresh token.
    assert_eq!(body["data"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn responses_carry_the_request_id() {
    let app = TestApp::spawn();
    let router = app.router();

    let (status, body) = request_json(
        &router,
        "POST",
        "/auth/register",
        &[("x-request-id", "req-42")],
        Some(json!({
            "phone": "9000000001",
            "country_code": "+91",
            "username": "tracked",
            "password": "Password123!",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["request_id"], "req-42");
}
