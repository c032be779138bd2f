//! Organization and group handlers: memberships, group roles, and
//! inheritance edges.

use axum::{
    Extension,
    extract::{Json, Path, State},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::handlers::{call_context, respond};
use crate::models::{ActorKind, AuditEventKind, Group, GroupMembership, Organization};
use crate::services::audit::AuditEvent;
use crate::services::engine::{CheckRequest, PrincipalRef};
use service_core::error::AppError;
use service_core::middleware::RequestId;
use service_core::response::ApiResponse;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrgRequest {
    #[validate(length(min = 1, max = 256))]
    pub name: String,
}

/// POST /orgs
pub async fn create_organization(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<CreateOrgRequest>,
) -> Result<ApiResponse<Organization>, AppError> {
    req.validate()?;
    let org = state
        .graph
        .create_organization(&req.name)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::created("Organization created", org)))
}

#[derive(Debug, Deserialize)]
pub struct AddOrgMemberRequest {
    pub user_id: Uuid,
}

/// POST /orgs/:org_id/users
///
/// Idempotent: re-adding an existing member succeeds with a neutral
/// message.
pub async fn add_user_to_organization(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<AddOrgMemberRequest>,
) -> Result<ApiResponse<()>, AppError> {
    let added = state
        .graph
        .add_user_to_organization(org_id, req.user_id)
        .await
        .map_err(AppError::from)?;

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(
                AuditEventKind::OrgMemberAdded,
                req.user_id.to_string(),
                ActorKind::User,
            )
            .organization(Some(org_id))
            .resource("organization", Some(org_id.to_string()))
            .details(serde_json::json!({ "already_member": !added })),
        )
        .await;

    let message = if added {
        "User added to organization"
    } else {
        "User is already a member of the organization"
    };
    Ok(respond(request_id, ApiResponse::message(message)))
}

/// DELETE /orgs/:org_id/users/:user_id
///
/// Idempotent; removes the user from every group in the organization.
pub async fn remove_user_from_organization(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<ApiResponse<()>, AppError> {
    state
        .graph
        .remove_user_from_organization(org_id, user_id)
        .await
        .map_err(AppError::from)?;

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(
                AuditEventKind::OrgMemberRemoved,
                user_id.to_string(),
                ActorKind::User,
            )
            .organization(Some(org_id))
            .resource("organization", Some(org_id.to_string())),
        )
        .await;

    Ok(respond(
        request_id,
        ApiResponse::message("User removed from organization"),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ValidateAccessRequest {
    pub user_id: Uuid,
    pub resource_type: Option<String>,
    pub action: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidateAccessResponse {
    pub allowed: bool,
    pub reasons: Vec<String>,
}

/// POST /orgs/:org_id/validate-access
pub async fn validate_organization_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    request_id: Option<Extension<RequestId>>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<ValidateAccessRequest>,
) -> Result<ApiResponse<ValidateAccessResponse>, AppError> {
    let mut reasons = Vec::new();

    let member = state
        .graph
        .is_org_member(org_id, req.user_id)
        .await
        .map_err(AppError::from)?;
    if !member {
        reasons.push("user is not a member of the organization".to_string());
    }

    let mut allowed = member;
    if let (Some(resource_type), Some(action)) = (&req.resource_type, &req.action) {
        if member {
            let ctx = call_context(&headers);
            let decision = state
                .engine
                .check(
                    &ctx,
                    CheckRequest::new(
                        PrincipalRef::user(req.user_id, Some(org_id)),
                        resource_type.clone(),
                        "*",
                        action.clone(),
                    ),
                )
                .await
                .map_err(AppError::from)?;
            if !decision.allowed {
                allowed = false;
            }
            reasons.push(decision.reason);
        }
    }

    Ok(respond(
        request_id,
        ApiResponse::ok("Access validated", ValidateAccessResponse { allowed, reasons }),
    ))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateGroupRequest {
    #[validate(length(min = 1, max = 256))]
    pub name: String,
    pub parent_id: Option<Uuid>,
}

/// POST /orgs/:org_id/groups
pub async fn create_group(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(org_id): Path<Uuid>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<ApiResponse<Group>, AppError> {
    req.validate()?;
    let group = state
        .graph
        .create_group(org_id, &req.name, req.parent_id)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::created("Group created", group)))
}

#[derive(Debug, Deserialize)]
pub struct InheritanceRequest {
    pub ancestor_id: Uuid,
    pub descendant_id: Uuid,
}

/// POST /groups/inheritance
pub async fn add_group_inheritance(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<InheritanceRequest>,
) -> Result<ApiResponse<()>, AppError> {
    state
        .graph
        .add_group_inheritance(req.ancestor_id, req.descendant_id)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::message("Inheritance edge added")))
}

/// DELETE /groups/inheritance
pub async fn remove_group_inheritance(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<InheritanceRequest>,
) -> Result<ApiResponse<()>, AppError> {
    state
        .graph
        .remove_group_inheritance(req.ancestor_id, req.descendant_id)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::message("Inheritance edge removed")))
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
}

/// POST /groups/:group_id/members
pub async fn add_member(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(group_id): Path<Uuid>,
    Json(req): Json<AddMemberRequest>,
) -> Result<ApiResponse<()>, AppError> {
    state
        .graph
        .add_member(group_id, req.user_id)
        .await
        .map_err(AppError::from)?;

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(
                AuditEventKind::MemberAdded,
                req.user_id.to_string(),
                ActorKind::User,
            )
            .resource("group", Some(group_id.to_string())),
        )
        .await;

    Ok(respond(request_id, ApiResponse::message("Member added")))
}

/// DELETE /groups/:group_id/members/:user_id
pub async fn remove_member(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path((group_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<ApiResponse<()>, AppError> {
    state
        .graph
        .remove_member(group_id, user_id)
        .await
        .map_err(AppError::from)?;

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(
                AuditEventKind::MemberRemoved,
                user_id.to_string(),
                ActorKind::User,
            )
            .resource("group", Some(group_id.to_string())),
        )
        .await;

    Ok(respond(request_id, ApiResponse::message("Member removed")))
}

#[derive(Debug, Deserialize)]
pub struct GroupRoleRequest {
    pub role_name: String,
}

/// POST /groups/:group_id/roles
pub async fn assign_role_to_group(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(group_id): Path<Uuid>,
    Json(req): Json<GroupRoleRequest>,
) -> Result<ApiResponse<()>, AppError> {
    let role = state
        .catalog
        .role_by_name(&req.role_name)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Role {} not found", req.role_name)))?;
    state
        .graph
        .assign_role_to_group(group_id, role.id)
        .await
        .map_err(AppError::from)?;

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(
                AuditEventKind::GroupRoleAssigned,
                group_id.to_string(),
                ActorKind::System,
            )
            .resource("group", Some(group_id.to_string()))
            .details(serde_json::json!({ "role": req.role_name })),
        )
        .await;

    Ok(respond(request_id, ApiResponse::message("Role assigned to group")))
}

/// DELETE /groups/:group_id/roles/:role_name
pub async fn remove_role_from_group(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path((group_id, role_name)): Path<(Uuid, String)>,
) -> Result<ApiResponse<()>, AppError> {
    let role = state
        .catalog
        .role_by_name(&role_name)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Role {} not found", role_name)))?;
    state
        .graph
        .remove_role_from_group(group_id, role.id)
        .await
        .map_err(AppError::from)?;

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(
                AuditEventKind::GroupRoleRevoked,
                group_id.to_string(),
                ActorKind::System,
            )
            .resource("group", Some(group_id.to_string()))
            .details(serde_json::json!({ "role": role_name })),
        )
        .await;

    Ok(respond(request_id, ApiResponse::message("Role removed from group")))
}

/// GET /orgs/:org_id/users/:user_id/groups
pub async fn list_user_groups(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<ApiResponse<Vec<Group>>, AppError> {
    let groups = state
        .graph
        .list_user_groups(org_id, user_id)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("User groups", groups)))
}

/// GET /groups/:group_id/members
pub async fn list_group_members(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(group_id): Path<Uuid>,
) -> Result<ApiResponse<Vec<GroupMembership>>, AppError> {
    let members = state
        .graph
        .list_group_members(group_id)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Group members", members)))
}
