//! Role assignment handlers.

use axum::{
    Extension,
    extract::{Json, Path, Query, State},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::handlers::respond;
use crate::models::{ActorKind, AuditEventKind};
use crate::services::audit::AuditEvent;
use service_core::error::AppError;
use service_core::middleware::RequestId;
use service_core::response::ApiResponse;

#[derive(Debug, Deserialize)]
pub struct AssignRoleRequest {
    pub user_id: Uuid,
    pub role_name: String,
    pub organization_id: Option<Uuid>,
}

/// POST /roles/assign
pub async fn assign_role(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<AssignRoleRequest>,
) -> Result<ApiResponse<()>, AppError> {
    let role = state
        .catalog
        .role_by_name(&req.role_name)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Role {} not found", req.role_name)))?;

    state
        .graph
        .assign_role_to_user(req.user_id, role.id)
        .await
        .map_err(AppError::from)?;

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(
                AuditEventKind::RoleAssigned,
                req.user_id.to_string(),
                ActorKind::User,
            )
            .organization(req.organization_id)
            .resource("role", Some(role.id.to_string()))
            .details(serde_json::json!({ "role": req.role_name })),
        )
        .await;

    Ok(respond(request_id, ApiResponse::message("Role assigned")))
}

/// POST /roles/remove
pub async fn remove_role(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<AssignRoleRequest>,
) -> Result<ApiResponse<()>, AppError> {
    let role = state
        .catalog
        .role_by_name(&req.role_name)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Role {} not found", req.role_name)))?;

    let removed = state
        .graph
        .remove_role_from_user(req.user_id, role.id)
        .await
        .map_err(AppError::from)?;
    if !removed {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "User does not hold role {}",
            req.role_name
        )));
    }

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(
                AuditEventKind::RoleRevoked,
                req.user_id.to_string(),
                ActorKind::User,
            )
            .organization(req.organization_id)
            .resource("role", Some(role.id.to_string()))
            .details(serde_json::json!({ "role": req.role_name })),
        )
        .await;

    Ok(respond(request_id, ApiResponse::message("Role removed")))
}

#[derive(Debug, Deserialize)]
pub struct CheckUserRoleQuery {
    pub user_id: Uuid,
    pub role_name: String,
    pub organization_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct CheckUserRoleResponse {
    pub has_role: bool,
    pub source: Option<String>,
}

/// GET /roles/check
pub async fn check_user_role(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Query(query): Query<CheckUserRoleQuery>,
) -> Result<ApiResponse<CheckUserRoleResponse>, AppError> {
    let effective = state
        .graph
        .effective_roles(query.organization_id, query.user_id)
        .await
        .map_err(AppError::from)?;
    let held = effective.iter().find(|e| e.role.name == query.role_name);
    Ok(respond(
        request_id,
        ApiResponse::ok(
            "Role checked",
            CheckUserRoleResponse {
                has_role: held.is_some(),
                source: held.map(|e| e.source.to_string()),
            },
        ),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UserRolesQuery {
    pub organization_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct EffectiveRoleView {
    pub role_id: Uuid,
    pub role_name: String,
    pub scope: String,
    pub source: String,
}

/// GET /users/:user_id/roles
pub async fn get_user_roles(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<UserRolesQuery>,
) -> Result<ApiResponse<Vec<EffectiveRoleView>>, AppError> {
    let effective = state
        .graph
        .effective_roles(query.organization_id, user_id)
        .await
        .map_err(AppError::from)?;
    let roles = effective
        .into_iter()
        .map(|e| EffectiveRoleView {
            role_id: e.role.id,
            role_name: e.role.name,
            scope: e.role.scope.to_string(),
            source: e.source.to_string(),
        })
        .collect();
    Ok(respond(request_id, ApiResponse::ok("Effective roles", roles)))
}

/// GET /roles/:role_name/users
pub async fn list_users_with_role(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(role_name): Path<String>,
) -> Result<ApiResponse<Vec<Uuid>>, AppError> {
    let role = state
        .catalog
        .role_by_name(&role_name)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Role {} not found", role_name)))?;
    let users = state
        .graph
        .users_with_effective_role(&role)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Users with role", users)))
}
