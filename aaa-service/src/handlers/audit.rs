//! Audit trail handlers. These routes run behind the auth middleware.

use axum::{
    Extension,
    extract::{Json, Path, Query, State},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::handlers::{PageQuery, respond};
use crate::models::{AuditQuery, AuditRecord};
use crate::services::audit::ChainVerification;
use service_core::error::AppError;
use service_core::middleware::RequestId;
use service_core::response::ApiResponse;

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    #[serde(default)]
    pub filters: AuditQuery,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// POST /audit/query
pub async fn query(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<QueryBody>,
) -> Result<ApiResponse<Vec<AuditRecord>>, AppError> {
    let page = crate::store::Page::new(req.page.unwrap_or(1), req.page_size.unwrap_or(50));
    let records = state
        .audit
        .query(&req.filters, page)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Audit records", records)))
}

#[derive(Debug, Deserialize)]
pub struct TrailQuery {
    pub days: Option<i64>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// GET /audit/users/:user_id
pub async fn user_trail(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<TrailQuery>,
) -> Result<ApiResponse<Vec<AuditRecord>>, AppError> {
    let page = crate::store::Page::new(query.page.unwrap_or(1), query.page_size.unwrap_or(50));
    let records = state
        .audit
        .user_trail(user_id, query.days.unwrap_or(30), page)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("User audit trail", records)))
}

/// GET /audit/orgs/:org_id
pub async fn organization_trail(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(org_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Result<ApiResponse<Vec<AuditRecord>>, AppError> {
    let records = state
        .audit
        .organization_trail(org_id, page.page())
        .await
        .map_err(AppError::from)?;
    Ok(respond(
        request_id,
        ApiResponse::ok("Organization audit trail", records),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ResourceTrailQuery {
    pub resource_id: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// GET /audit/resources/:resource_type
pub async fn resource_trail(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(resource_type): Path<String>,
    Query(query): Query<ResourceTrailQuery>,
) -> Result<ApiResponse<Vec<AuditRecord>>, AppError> {
    let page = crate::store::Page::new(query.page.unwrap_or(1), query.page_size.unwrap_or(50));
    let records = state
        .audit
        .resource_trail(&resource_type, query.resource_id, page)
        .await
        .map_err(AppError::from)?;
    Ok(respond(
        request_id,
        ApiResponse::ok("Resource audit trail", records),
    ))
}

/// GET /audit/security-events
pub async fn security_events(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Query(page): Query<PageQuery>,
) -> Result<ApiResponse<Vec<AuditRecord>>, AppError> {
    let records = state
        .audit
        .security_events(page.page())
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Security events", records)))
}

/// GET /audit/integrity/:record_id
pub async fn validate_integrity(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(record_id): Path<Uuid>,
) -> Result<ApiResponse<ChainVerification>, AppError> {
    let verification = state
        .audit
        .verify_record(record_id)
        .await
        .map_err(AppError::from)?;
    Ok(respond(
        request_id,
        ApiResponse::ok("Integrity verification", verification),
    ))
}
