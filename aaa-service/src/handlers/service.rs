//! Service-account registry handlers.

use axum::{
    Extension,
    extract::{Json, Path, State},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::handlers::respond;
use crate::models::Principal;
use service_core::error::AppError;
use service_core::middleware::RequestId;
use service_core::response::ApiResponse;

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterServiceRequest {
    #[validate(length(min = 3, max = 128))]
    pub name: String,
    pub organization_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct RegisterServiceResponse {
    pub service: Principal,
    /// Shown exactly once; only the hash is stored.
    pub api_key: String,
}

/// POST /services
pub async fn register_service(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<RegisterServiceRequest>,
) -> Result<ApiResponse<RegisterServiceResponse>, AppError> {
    req.validate()?;
    let (account, api_key) = state
        .graph
        .register_service_account(&req.name, req.organization_id)
        .await
        .map_err(AppError::from)?;
    Ok(respond(
        request_id,
        ApiResponse::created(
            "Service registered",
            RegisterServiceResponse {
                service: Principal::Service(account),
                api_key,
            },
        ),
    ))
}

/// GET /services/:name
pub async fn get_service(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(name): Path<String>,
) -> Result<ApiResponse<Principal>, AppError> {
    let principal = state
        .graph
        .find_service_principal(&name)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Service {} not found", name)))?;
    Ok(respond(request_id, ApiResponse::ok("Service", principal)))
}
