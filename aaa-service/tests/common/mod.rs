//! Test helpers: an in-process application over in-memory stores.

#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use secrecy::Secret;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;
use uuid::Uuid;

use aaa_service::config::{
    AppConfig, AuditConfig, CacheConfig, DatabaseConfig, Environment, JwtConfig, RateLimitConfig,
    RedisConfig,
};
use aaa_service::models::{AuditQuery, AuditRecord, User};
use aaa_service::services::{
    AcceptAllOtpVerifier, AuditWriterHandle, MemoryRevocationStore, PolicyDocument,
};
use aaa_service::store::{MemoryStore, Page, PrincipalStore};
use aaa_service::utils::hash_secret;
use aaa_service::{AppState, Stores, build_router, build_state};

pub const TEST_POLICY: &str = r#"
service_authorization:
  enabled: true
  services:
    farmers-module:
      service_id: farmers-module
      display_name: Farmers Module
      description: Owns the farmers catalog
      api_key_required: true
      api_key: secure-key-123
      permissions:
        - "catalog:seed"
        - "farmers:*"
    wildcard-service:
      service_id: wildcard-service
      display_name: Wildcard Service
      description: Full catalog access
      api_key_required: false
      permissions:
        - "catalog:*"
default_behavior:
  when_disabled: deny_all
  log_unauthorized_attempts: true
"#;

pub fn test_config() -> AppConfig {
    AppConfig {
        common: service_core::config::Config {
            port: 8080,
            otlp_endpoint: None,
        },
        environment: Environment::Dev,
        service_name: "aaa-service".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
        },
        redis: RedisConfig {
            url: "redis://unused".to_string(),
        },
        jwt: JwtConfig {
            secret: Secret::new("integration-test-secret-0123456789abcdef".to_string()),
            issuer: "aaa-service".to_string(),
            audience: None,
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
            leeway_seconds: 120,
        },
        cache: CacheConfig {
            perm_ttl_seconds: 300,
            sweep_interval_seconds: 60,
        },
        audit: AuditConfig {
            high_watermark: 256,
            retention_days: 90,
        },
        policy_file: None,
        rate_limit: RateLimitConfig {
            global_ip_limit: 1000,
            global_ip_window_seconds: 60,
        },
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    _writer: AuditWriterHandle,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::spawn_with_policy(TEST_POLICY)
    }

    pub fn spawn_with_policy(policy_yaml: &str) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("error")
            .try_init();

        let store = Arc::new(MemoryStore::new());
        let stores = Stores {
            catalog: store.clone(),
            principals: store.clone(),
            audit: store.clone(),
            tokens: store.clone(),
            revocations: Arc::new(MemoryRevocationStore::new()),
        };
        let policy = PolicyDocument::from_yaml(policy_yaml).expect("test policy parses");
        let (state, writer) = build_state(
            test_config(),
            stores,
            policy,
            Arc::new(AcceptAllOtpVerifier),
        );
        Self {
            state,
            store,
            _writer: writer,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone()).expect("router builds")
    }

    /// Insert a user with a password credential.
    pub async fn create_user(&self, username: &str, password: &str) -> User {
        let mut user = User::new(format!("9{:09}", rand_digits()), "+91");
        user.username = Some(username.to_string());
        user.password_hash = Some(hash_secret(password).unwrap());
        user.is_validated = true;
        self.state
            .principals
            .insert_user(user)
            .await
            .expect("user inserts")
    }

    pub async fn assign_role(&self, user_id: Uuid, role_name: &str) {
        let role = self
            .state
            .catalog
            .role_by_name(role_name)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("role {} exists", role_name));
        self.state
            .graph
            .assign_role_to_user(user_id, role.id)
            .await
            .expect("role assigns");
    }

    /// Wait until the async audit writer has persisted a matching record.
    pub async fn wait_for_audit<F>(&self, predicate: F) -> AuditRecord
    where
        F: Fn(&AuditRecord) -> bool,
    {
        for _ in 0..100 {
            let records = self
                .state
                .audit
                .query(&AuditQuery::default(), Page::new(1, 500))
                .await
                .unwrap();
            if let Some(found) = records.iter().find(|r| predicate(r)) {
                return found.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected audit record was not written");
    }
}

fn rand_digits() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos() as u64;
    nanos.wrapping_mul(2654435761) % 1_000_000_000
}

/// Drive the router with a JSON request and decode the JSON response.
pub async fn request_json(
    router: &Router,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}
