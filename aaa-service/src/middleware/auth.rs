//! Bearer-token authentication middleware and extractor.

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::AppState;
use crate::services::token::{Claims, TokenType};
use service_core::error::AppError;

/// Authenticated user context derived from a validated access token.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal_id: Uuid,
    pub username: Option<String>,
    pub claims: Claims,
}

impl AuthContext {
    /// Organization ids snapshotted into the token.
    pub fn organization_ids(&self) -> Vec<Uuid> {
        self.claims
            .user_context
            .organizations
            .iter()
            .filter_map(|org| Uuid::parse_str(&org.id).ok())
            .collect()
    }
}

/// Validate the bearer token and attach an `AuthContext` to the request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            AppError::Unauthenticated(anyhow::anyhow!("Missing or invalid Authorization header"))
        })?;

    let claims = state
        .tokens
        .validate(token, Some(TokenType::Access))
        .await
        .map_err(AppError::from)?;

    let principal_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| AppError::Unauthenticated(anyhow::anyhow!("Invalid subject in token")))?;

    req.extensions_mut().insert(AuthContext {
        principal_id,
        username: claims.username.clone(),
        claims,
    });
    Ok(next.run(req).await)
}

/// Extractor for handlers running behind `auth_middleware`.
pub struct CurrentUser(pub AuthContext);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let context = parts.extensions.get::<AuthContext>().ok_or_else(|| {
            AppError::Unauthenticated(anyhow::anyhow!("Request is not authenticated"))
        })?;
        Ok(CurrentUser(context.clone()))
    }
}
