//! Catalog handlers: seeding, actions, resources, permissions, roles,
//! and column groups.

use axum::{
    Extension,
    extract::{Json, Path, Query, State},
    http::HeaderMap,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::handlers::{PageQuery, bearer, call_context, respond};
use crate::middleware::ServiceCaller;
use crate::models::{
    ActorKind, AuditEventKind, Action, ColumnGroup, Permission, Resource, Role, RoleScope,
};
use crate::services::audit::AuditEvent;
use crate::services::catalog::SeedOutcome;
use crate::services::engine::{CheckRequest, PrincipalRef};
use crate::services::token::TokenType;
use service_core::error::AppError;
use service_core::middleware::RequestId;
use service_core::response::ApiResponse;

#[derive(Debug, Deserialize, Validate)]
pub struct SeedRequest {
    #[validate(length(min = 1, max = 128))]
    pub service_id: String,
    #[serde(default)]
    pub force: bool,
}

/// Seed the catalog for a service.
///
/// POST /catalog/seed
///
/// Callable by the owning service (policy-authorized, name must match
/// the target service id) or by a user holding `catalog:seed`.
pub async fn seed(
    State(state): State<AppState>,
    headers: HeaderMap,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<SeedRequest>,
) -> Result<ApiResponse<SeedOutcome>, AppError> {
    req.validate()?;
    let ctx = call_context(&headers);

    let (actor_id, actor_kind) = if let Some(token) = bearer(&headers) {
        let claims = state
            .tokens
            .validate(token, Some(TokenType::Access))
            .await
            .map_err(AppError::from)?;
        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| AppError::Unauthenticated(anyhow::anyhow!("Invalid subject in token")))?;
        let principal = PrincipalRef::user(user_id, None);

        // Holders of admin:* bypass the ownership rule entirely.
        if !state.engine.holds_admin_wildcard(&principal).await.map_err(AppError::from)? {
            let decision = state
                .engine
                .check(&ctx, CheckRequest::new(principal, "catalog", "*", "seed"))
                .await
                .map_err(AppError::from)?;
            if !decision.allowed {
                return Err(AppError::PermissionDenied(anyhow::anyhow!(
                    "caller may not seed the catalog"
                )));
            }
        }
        (claims.sub, ActorKind::User)
    } else if let Some(caller) = headers
        .get(crate::middleware::service_auth::SERVICE_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|name| ServiceCaller {
            service_name: name.to_string(),
            api_key: headers
                .get(crate::middleware::service_auth::API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        })
    {
        state
            .engine
            .authorize_service(&caller.service_name, "catalog:seed", caller.api_key.as_deref())
            .await
            .map_err(AppError::from)?;
        state
            .engine
            .authorizer()
            .verify_ownership(&caller.service_name, &req.service_id)
            .map_err(AppError::from)?;
        (caller.service_name, ActorKind::Service)
    } else {
        return Err(AppError::Unauthenticated(anyhow::anyhow!(
            "seed requires a bearer token or service credentials"
        )));
    };

    let outcome = state
        .catalog
        .seed(&req.service_id, req.force)
        .await
        .map_err(AppError::from)?;

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(AuditEventKind::CatalogSeeded, actor_id, actor_kind)
                .resource("catalog", Some(req.service_id.clone()))
                .details(serde_json::json!({
                    "force": req.force,
                    "created_roles": outcome.created_role_names.clone(),
                })),
        )
        .await;

    Ok(respond(
        request_id,
        ApiResponse::ok("Catalog seeded", outcome),
    ))
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterActionRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    pub description: Option<String>,
    pub service_id: Option<String>,
    #[serde(default)]
    pub is_static: bool,
}

/// POST /catalog/actions
pub async fn register_action(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<RegisterActionRequest>,
) -> Result<ApiResponse<Action>, AppError> {
    req.validate()?;
    let action = state
        .catalog
        .register_action(&req.name, req.description, req.service_id, req.is_static)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::created("Action registered", action)))
}

/// GET /catalog/actions
pub async fn list_actions(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Query(page): Query<PageQuery>,
) -> Result<ApiResponse<Vec<Action>>, AppError> {
    let actions = state
        .catalog
        .list_actions(page.page())
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Actions", actions)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterResourceRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(length(min = 1, max = 128))]
    pub resource_type: String,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
}

/// POST /catalog/resources
pub async fn register_resource(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<RegisterResourceRequest>,
) -> Result<ApiResponse<Resource>, AppError> {
    req.validate()?;
    let resource = state
        .catalog
        .register_resource(&req.name, &req.resource_type, req.description, req.parent_id)
        .await
        .map_err(AppError::from)?;
    Ok(respond(
        request_id,
        ApiResponse::created("Resource registered", resource),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SetResourceParentRequest {
    pub parent_id: Option<Uuid>,
}

/// POST /catalog/resources/:resource_id/parent
pub async fn set_resource_parent(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(resource_id): Path<Uuid>,
    Json(req): Json<SetResourceParentRequest>,
) -> Result<ApiResponse<()>, AppError> {
    state
        .catalog
        .set_resource_parent(resource_id, req.parent_id)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::message("Resource parent updated")))
}

#[derive(Debug, Deserialize)]
pub struct ListResourcesQuery {
    pub resource_type: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// GET /catalog/resources
pub async fn list_resources(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Query(query): Query<ListResourcesQuery>,
) -> Result<ApiResponse<Vec<Resource>>, AppError> {
    let page = crate::store::Page::new(query.page.unwrap_or(1), query.page_size.unwrap_or(50));
    let resources = state
        .catalog
        .list_resources(query.resource_type.as_deref(), page)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Resources", resources)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePermissionRequest {
    #[validate(length(min = 3, max = 256))]
    pub name: String,
    pub description: Option<String>,
}

/// POST /catalog/permissions
pub async fn create_permission(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<CreatePermissionRequest>,
) -> Result<ApiResponse<Permission>, AppError> {
    req.validate()?;
    let permission = state
        .catalog
        .create_permission(&req.name, req.description)
        .await
        .map_err(AppError::from)?;
    Ok(respond(
        request_id,
        ApiResponse::created("Permission created", permission),
    ))
}

/// GET /catalog/permissions
pub async fn list_permissions(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Query(page): Query<PageQuery>,
) -> Result<ApiResponse<Vec<Permission>>, AppError> {
    let permissions = state
        .catalog
        .list_permissions(page.page())
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Permissions", permissions)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRoleRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    pub scope: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
}

/// POST /catalog/roles
pub async fn create_role(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<CreateRoleRequest>,
) -> Result<ApiResponse<Role>, AppError> {
    req.validate()?;
    let scope = match req.scope.as_deref() {
        None => RoleScope::Global,
        Some(raw) => raw
            .parse()
            .map_err(|e: String| AppError::BadRequest(anyhow::anyhow!(e)))?,
    };
    let role = state
        .catalog
        .create_role(&req.name, scope, req.description, req.parent_id, req.organization_id)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::created("Role created", role)))
}

/// GET /catalog/roles
pub async fn list_roles(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Query(page): Query<PageQuery>,
) -> Result<ApiResponse<Vec<Role>>, AppError> {
    let roles = state
        .catalog
        .list_roles(page.page())
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Roles", roles)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct AttachPermissionsRequest {
    #[validate(length(min = 1))]
    pub permissions: Vec<String>,
}

/// POST /catalog/roles/:role_id/permissions
pub async fn attach_permissions(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(role_id): Path<Uuid>,
    Json(req): Json<AttachPermissionsRequest>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    req.validate()?;
    let attached = state
        .catalog
        .attach_permissions(role_id, &req.permissions)
        .await
        .map_err(AppError::from)?;
    Ok(respond(
        request_id,
        ApiResponse::ok(
            "Permissions attached",
            serde_json::json!({ "attached": attached }),
        ),
    ))
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterColumnGroupRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(length(min = 1, max = 128))]
    pub table_name: String,
    #[validate(length(min = 1))]
    pub columns: Vec<String>,
}

/// POST /catalog/column-groups
pub async fn register_column_group(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<RegisterColumnGroupRequest>,
) -> Result<ApiResponse<ColumnGroup>, AppError> {
    req.validate()?;
    let group = state
        .catalog
        .register_column_group(&req.name, &req.table_name, req.columns)
        .await
        .map_err(AppError::from)?;
    Ok(respond(
        request_id,
        ApiResponse::created("Column group registered", group),
    ))
}

#[derive(Debug, Deserialize)]
pub struct AttachColumnGroupRequest {
    pub column_group_id: Uuid,
}

/// POST /catalog/roles/:role_id/column-groups
pub async fn attach_column_group(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(role_id): Path<Uuid>,
    Json(req): Json<AttachColumnGroupRequest>,
) -> Result<ApiResponse<()>, AppError> {
    state
        .catalog
        .attach_column_group(role_id, req.column_group_id)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::message("Column group attached")))
}
