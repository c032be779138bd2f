//! AAA service
//!
//! Authentication, authorization, and audit core with:
//! - Hierarchical RBAC over roles, groups, and group inheritance
//! - A caching decision engine with single-flight permission resolution
//! - HS256 token lifecycle with revocation tombstones
//! - Policy-driven service-to-service authorization
//! - A buffered, hash-chained, queryable audit trail

pub mod config;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

use axum::{
    Router,
    extract::State,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use crate::config::AppConfig;
use crate::handlers::{audit, authz, catalog, org, role, service, token};
use crate::middleware::auth_middleware;
use crate::services::{
    AuditService, AuditSink, AuditWriterHandle, AuthzEngine, CatalogService, DecisionCache,
    OtpVerifier, PolicyDocument, PrincipalGraphService, RevocationStore, ServiceAuthorizer,
    TokenService, start_pipeline,
};
use crate::store::{AuditStore, CatalogStore, PrincipalStore, TokenStore};
use service_core::error::AppError;
use service_core::middleware::{
    create_ip_rate_limiter, ip_rate_limit_middleware, request_id_middleware,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub catalog: CatalogService,
    pub graph: PrincipalGraphService,
    pub cache: Arc<DecisionCache>,
    pub engine: AuthzEngine,
    pub tokens: TokenService,
    pub audit: AuditService,
    pub audit_sink: AuditSink,
    pub principals: Arc<dyn PrincipalStore>,
    pub revocations: Arc<dyn RevocationStore>,
    pub otp: Arc<dyn OtpVerifier>,
}

/// Backing stores the state is assembled over.
pub struct Stores {
    pub catalog: Arc<dyn CatalogStore>,
    pub principals: Arc<dyn PrincipalStore>,
    pub audit: Arc<dyn AuditStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub revocations: Arc<dyn RevocationStore>,
}

/// Wire services over the given stores. The returned writer handle joins
/// the audit writer once every sink clone is dropped.
pub fn build_state(
    config: AppConfig,
    stores: Stores,
    policy: PolicyDocument,
    otp: Arc<dyn OtpVerifier>,
) -> (AppState, AuditWriterHandle) {
    let cache = Arc::new(DecisionCache::new(Duration::from_secs(
        config.cache.perm_ttl_seconds,
    )));

    let (audit_sink, writer_handle) = start_pipeline(stores.audit.clone(), config.audit.high_watermark);

    let catalog = CatalogService::new(stores.catalog.clone(), stores.principals.clone(), cache.clone());
    let graph = PrincipalGraphService::new(stores.principals.clone(), catalog.clone(), cache.clone());
    let authorizer = Arc::new(ServiceAuthorizer::new(
        policy,
        config.policy_file.clone(),
        audit_sink.clone(),
    ));
    let engine = AuthzEngine::new(
        catalog.clone(),
        graph.clone(),
        cache.clone(),
        audit_sink.clone(),
        authorizer,
    );
    let tokens = TokenService::new(&config.jwt, stores.revocations.clone(), stores.tokens.clone());
    let audit = AuditService::new(stores.audit.clone());

    let state = AppState {
        config,
        catalog,
        graph,
        cache,
        engine,
        tokens,
        audit,
        audit_sink,
        principals: stores.principals,
        revocations: stores.revocations,
        otp,
    };
    (state, writer_handle)
}

/// Build the application router.
pub fn build_router(state: AppState) -> Result<Router, AppError> {
    // Token lifecycle routes
    let auth_routes = Router::new()
        .route("/register", post(token::register))
        .route("/login", post(token::login))
        .route("/refresh", post(token::refresh))
        .route("/validate", post(token::validate_token))
        .route("/revoke", post(token::revoke))
        .route("/blacklist", post(token::blacklist))
        .route("/introspect", post(token::introspect))
        .route("/tokens/:user_id", get(token::list_active_tokens));

    // Catalog routes
    let catalog_routes = Router::new()
        .route("/seed", post(catalog::seed))
        .route("/actions", post(catalog::register_action))
        .route("/actions", get(catalog::list_actions))
        .route("/resources", post(catalog::register_resource))
        .route("/resources", get(catalog::list_resources))
        .route("/resources/:resource_id/parent", post(catalog::set_resource_parent))
        .route("/permissions", post(catalog::create_permission))
        .route("/permissions", get(catalog::list_permissions))
        .route("/roles", post(catalog::create_role))
        .route("/roles", get(catalog::list_roles))
        .route("/roles/:role_id/permissions", post(catalog::attach_permissions))
        .route("/roles/:role_id/column-groups", post(catalog::attach_column_group))
        .route("/column-groups", post(catalog::register_column_group));

    // Organization and group routes
    let org_routes = Router::new()
        .route("/", post(org::create_organization))
        .route("/:org_id/users", post(org::add_user_to_organization))
        .route("/:org_id/users/:user_id", delete(org::remove_user_from_organization))
        .route("/:org_id/users/:user_id/groups", get(org::list_user_groups))
        .route("/:org_id/validate-access", post(org::validate_organization_access))
        .route("/:org_id/groups", post(org::create_group));

    let group_routes = Router::new()
        .route("/inheritance", post(org::add_group_inheritance))
        .route("/inheritance", delete(org::remove_group_inheritance))
        .route("/:group_id/members", post(org::add_member))
        .route("/:group_id/members", get(org::list_group_members))
        .route("/:group_id/members/:user_id", delete(org::remove_member))
        .route("/:group_id/roles", post(org::assign_role_to_group))
        .route("/:group_id/roles/:role_name", delete(org::remove_role_from_group));

    // Role assignment routes
    let role_routes = Router::new()
        .route("/assign", post(role::assign_role))
        .route("/remove", post(role::remove_role))
        .route("/check", get(role::check_user_role))
        .route("/:role_name/users", get(role::list_users_with_role));

    // Service registry routes
    let service_routes = Router::new()
        .route("/", post(service::register_service))
        .route("/:name", get(service::get_service));

    // Authorization routes
    let authz_routes = Router::new()
        .route("/check", post(authz::check))
        .route("/batch-check", post(authz::batch_check))
        .route("/lookup-resources", post(authz::lookup_resources))
        .route("/check-columns", post(authz::check_columns))
        .route("/allowed-columns", get(authz::list_allowed_columns))
        .route("/evaluate", post(authz::evaluate))
        .route("/bulk-evaluate", post(authz::bulk_evaluate))
        .route("/service", post(authz::authorize_service));

    // Audit routes, authenticated
    let audit_routes = Router::new()
        .route("/query", post(audit::query))
        .route("/users/:user_id", get(audit::user_trail))
        .route("/orgs/:org_id", get(audit::organization_trail))
        .route("/resources/:resource_type", get(audit::resource_trail))
        .route("/security-events", get(audit::security_events))
        .route("/integrity/:record_id", get(audit::validate_integrity))
        .layer(from_fn_with_state(state.clone(), auth_middleware));

    let ip_limiter = create_ip_rate_limiter(
        state.config.rate_limit.global_ip_limit,
        state.config.rate_limit.global_ip_window_seconds,
    );

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .nest("/auth", auth_routes)
        .nest("/catalog", catalog_routes)
        .nest("/orgs", org_routes)
        .nest("/groups", group_routes)
        .nest("/roles", role_routes)
        .route("/users/:user_id/roles", get(role::get_user_roles))
        .nest("/services", service_routes)
        .nest("/authz", authz_routes)
        .nest("/audit", audit_routes)
        .with_state(state)
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive());

    Ok(app)
}

/// Liveness probe.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "service": "aaa-service",
    }))
}

/// Readiness probe: the revocation store must answer.
async fn readiness_check(
    State(state): State<AppState>,
) -> Result<axum::Json<serde_json::Value>, AppError> {
    state.revocations.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "revocation store not ready");
        AppError::ServiceUnavailable("revocation store not ready".to_string())
    })?;

    Ok(axum::Json(serde_json::json!({
        "status": "ready",
        "service": state.config.service_name,
        "version": state.config.service_version,
    })))
}
