//! Authorization evaluation handlers: point checks, batches, reverse
//! lookups, column checks, and wildcard evaluation.

use axum::{
    Extension,
    extract::{Json, Query, State},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::handlers::{call_context, respond};
use crate::middleware::ServiceCaller;
use crate::models::Decision;
use crate::services::engine::{CheckRequest, ColumnDecision, PrincipalRef};
use service_core::error::AppError;
use service_core::middleware::RequestId;
use service_core::response::ApiResponse;

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CheckBody {
    pub principal_id: Uuid,
    pub organization_id: Option<Uuid>,
    #[validate(length(min = 1, max = 128))]
    pub resource_type: String,
    #[validate(length(min = 1, max = 256))]
    pub resource_id: String,
    #[validate(length(min = 1, max = 128))]
    pub action: String,
    #[serde(default)]
    pub explain: bool,
}

impl CheckBody {
    fn into_request(self) -> CheckRequest {
        let mut request = CheckRequest::new(
            PrincipalRef::user(self.principal_id, self.organization_id),
            self.resource_type,
            self.resource_id,
            self.action,
        );
        if self.explain {
            request = request.explained();
        }
        request
    }
}

/// POST /authz/check
pub async fn check(
    State(state): State<AppState>,
    headers: HeaderMap,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<CheckBody>,
) -> Result<ApiResponse<Decision>, AppError> {
    req.validate()?;
    let ctx = call_context(&headers);
    let decision = state
        .engine
        .check(&ctx, req.into_request())
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Decision", decision)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct BatchCheckBody {
    #[validate(length(min = 1, max = 256))]
    pub checks: Vec<CheckBody>,
}

#[derive(Debug, Serialize)]
pub struct BatchCheckResponse {
    pub decisions: Vec<Decision>,
    pub all_allowed: bool,
}

/// POST /authz/batch-check
pub async fn batch_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<BatchCheckBody>,
) -> Result<ApiResponse<BatchCheckResponse>, AppError> {
    req.validate()?;
    let ctx = call_context(&headers);
    let requests = req.checks.into_iter().map(CheckBody::into_request).collect();
    let decisions = state
        .engine
        .batch_check(&ctx, requests)
        .await
        .map_err(AppError::from)?;
    let all_allowed = decisions.iter().all(|d| d.allowed);
    Ok(respond(
        request_id,
        ApiResponse::ok(
            "Batch evaluated",
            BatchCheckResponse {
                decisions,
                all_allowed,
            },
        ),
    ))
}

#[derive(Debug, Deserialize, Validate)]
pub struct LookupResourcesBody {
    pub principal_id: Uuid,
    pub organization_id: Option<Uuid>,
    #[validate(length(min = 1, max = 128))]
    pub resource_type: String,
    #[validate(length(min = 1, max = 128))]
    pub action: String,
}

/// POST /authz/lookup-resources
pub async fn lookup_resources(
    State(state): State<AppState>,
    headers: HeaderMap,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<LookupResourcesBody>,
) -> Result<ApiResponse<Vec<Uuid>>, AppError> {
    req.validate()?;
    let ctx = call_context(&headers);
    let ids = state
        .engine
        .lookup_resources(
            &ctx,
            PrincipalRef::user(req.principal_id, req.organization_id),
            &req.resource_type,
            &req.action,
        )
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Accessible resources", ids)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CheckColumnsBody {
    pub principal_id: Uuid,
    pub organization_id: Option<Uuid>,
    #[validate(length(min = 1, max = 128))]
    pub table: String,
    #[validate(length(min = 1, max = 128))]
    pub action: String,
    #[validate(length(min = 1))]
    pub columns: Vec<String>,
}

/// POST /authz/check-columns
pub async fn check_columns(
    State(state): State<AppState>,
    headers: HeaderMap,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<CheckColumnsBody>,
) -> Result<ApiResponse<ColumnDecision>, AppError> {
    req.validate()?;
    let ctx = call_context(&headers);
    let decision = state
        .engine
        .check_columns(
            &ctx,
            PrincipalRef::user(req.principal_id, req.organization_id),
            &req.table,
            &req.action,
            &req.columns,
        )
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Columns checked", decision)))
}

#[derive(Debug, Deserialize)]
pub struct AllowedColumnsQuery {
    pub principal_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub table: String,
    pub action: Option<String>,
}

/// GET /authz/allowed-columns
pub async fn list_allowed_columns(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Query(query): Query<AllowedColumnsQuery>,
) -> Result<ApiResponse<Vec<String>>, AppError> {
    let action = query.action.as_deref().unwrap_or("read");
    let columns = state
        .engine
        .allowed_columns(
            &PrincipalRef::user(query.principal_id, query.organization_id),
            &query.table,
            action,
        )
        .await
        .map_err(AppError::from)?;
    let mut columns: Vec<String> = columns.into_iter().collect();
    columns.sort();
    Ok(respond(request_id, ApiResponse::ok("Allowed columns", columns)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct EvaluateBody {
    pub principal_id: Uuid,
    pub organization_id: Option<Uuid>,
    #[validate(length(min = 3, max = 256))]
    pub permission: String,
    #[serde(default)]
    pub explain: bool,
}

/// POST /authz/evaluate
pub async fn evaluate(
    State(state): State<AppState>,
    headers: HeaderMap,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<EvaluateBody>,
) -> Result<ApiResponse<Decision>, AppError> {
    req.validate()?;
    let ctx = call_context(&headers);
    let decision = state
        .engine
        .evaluate(
            &ctx,
            PrincipalRef::user(req.principal_id, req.organization_id),
            &req.permission,
            req.explain,
        )
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Decision", decision)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct BulkEvaluateBody {
    pub principal_id: Uuid,
    pub organization_id: Option<Uuid>,
    #[validate(length(min = 1, max = 256))]
    pub permissions: Vec<String>,
}

/// POST /authz/bulk-evaluate
pub async fn bulk_evaluate(
    State(state): State<AppState>,
    headers: HeaderMap,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<BulkEvaluateBody>,
) -> Result<ApiResponse<Vec<Decision>>, AppError> {
    req.validate()?;
    let ctx = call_context(&headers);
    let decisions = state
        .engine
        .bulk_evaluate(
            &ctx,
            PrincipalRef::user(req.principal_id, req.organization_id),
            &req.permissions,
        )
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Decisions", decisions)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct AuthorizeServiceBody {
    #[validate(length(min = 1, max = 128))]
    pub service_name: String,
    #[validate(length(min = 3, max = 256))]
    pub permission: String,
}

/// POST /authz/service
///
/// The API key travels in `x-api-key`, never in the body.
pub async fn authorize_service(
    State(state): State<AppState>,
    caller: Option<ServiceCaller>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<AuthorizeServiceBody>,
) -> Result<ApiResponse<()>, AppError> {
    req.validate()?;
    let api_key = caller.as_ref().and_then(|c| c.api_key.as_deref());
    state
        .engine
        .authorize_service(&req.service_name, &req.permission, api_key)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::message("Service authorized")))
}
