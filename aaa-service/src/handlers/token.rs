//! Token lifecycle handlers: register, login, refresh, validate, revoke,
//! introspect, blacklist, and the active-token listing.

use axum::{
    Extension,
    extract::{Json, Path, State},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::handlers::respond;
use crate::models::{ActorKind, AuditEventKind, IssuedToken, User, permission_matches};
use crate::services::audit::AuditEvent;
use crate::services::token::{Introspection, OrgRef, TokenPair, TokenSnapshot, TokenType};
use crate::utils::{hash_secret, verify_secret};
use service_core::error::AppError;
use service_core::middleware::RequestId;
use service_core::response::ApiResponse;

/// Snapshot a user's roles, permissions, and organizations for embedding
/// into a token.
async fn snapshot_for(state: &AppState, user: &User) -> Result<TokenSnapshot, AppError> {
    let roles = state
        .graph
        .effective_roles(None, user.id)
        .await
        .map_err(AppError::from)?;
    let permissions = state
        .graph
        .effective_permissions(None, user.id)
        .await
        .map_err(AppError::from)?;
    let organizations = state
        .graph
        .organizations_for_user(user.id)
        .await
        .map_err(AppError::from)?;

    Ok(TokenSnapshot {
        principal_id: user.id,
        username: user.username.clone(),
        roles: roles.into_iter().map(|e| e.role.name).collect(),
        permissions: permissions.into_iter().collect(),
        organizations: organizations
            .into_iter()
            .map(|org| OrgRef {
                id: org.id.to_string(),
                name: org.name,
            })
            .collect(),
    })
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 4, max = 20))]
    pub phone: String,
    #[validate(length(min = 1, max = 8))]
    pub country_code: String,
    #[validate(length(min = 3, max = 64))]
    pub username: Option<String>,
    #[validate(length(min = 8, max = 128))]
    pub password: Option<String>,
    #[validate(length(min = 4, max = 8))]
    pub mpin: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub username: Option<String>,
}

/// POST /auth/register
pub async fn register(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<RegisterRequest>,
) -> Result<ApiResponse<RegisterResponse>, AppError> {
    req.validate()?;
    if req.password.is_none() && req.mpin.is_none() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Either a password or an mPIN is required"
        )));
    }

    if state
        .principals
        .user_by_phone(&req.country_code, &req.phone)
        .await
        .map_err(AppError::from)?
        .is_some()
    {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "A user with this phone number already exists"
        )));
    }

    let mut user = User::new(req.phone, req.country_code);
    user.username = req.username;
    if let Some(password) = &req.password {
        user.password_hash = Some(hash_secret(password).map_err(AppError::from)?);
    }
    if let Some(mpin) = &req.mpin {
        user.mpin_hash = Some(hash_secret(mpin).map_err(AppError::from)?);
        user.has_mpin = true;
    }

    let user = state
        .principals
        .insert_user(user)
        .await
        .map_err(AppError::from)?;

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(
                AuditEventKind::UserRegistered,
                user.id.to_string(),
                ActorKind::User,
            )
            .resource("user", Some(user.id.to_string())),
        )
        .await;

    Ok(respond(
        request_id,
        ApiResponse::created(
            "User registered",
            RegisterResponse {
                user_id: user.id,
                username: user.username,
            },
        ),
    ))
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    pub username: Option<String>,
    pub phone: Option<String>,
    pub country_code: Option<String>,
    pub password: Option<String>,
    pub mpin: Option<String>,
    pub mfa_code: Option<String>,
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<LoginRequest>,
) -> Result<ApiResponse<TokenPair>, AppError> {
    let user = match (&req.username, &req.phone, &req.country_code) {
        (Some(username), _, _) => state
            .principals
            .user_by_username(username)
            .await
            .map_err(AppError::from)?,
        (None, Some(phone), Some(country_code)) => state
            .principals
            .user_by_phone(country_code, phone)
            .await
            .map_err(AppError::from)?,
        _ => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Provide a username or a phone number with country code"
            )));
        }
    };

    // A missing user and a bad credential are indistinguishable to the
    // caller; the audit row keeps the real reason.
    let Some(user) = user else {
        audit_login_failure(&state, "unknown", "user not found").await;
        return Err(AppError::Unauthenticated(anyhow::anyhow!("Invalid credentials")));
    };

    let verified = match (&req.password, &req.mpin) {
        (Some(password), _) => user
            .password_hash
            .as_deref()
            .is_some_and(|hash| verify_secret(password, hash)),
        (None, Some(mpin)) => user
            .mpin_hash
            .as_deref()
            .is_some_and(|hash| verify_secret(mpin, hash)),
        (None, None) => false,
    };
    if !verified {
        audit_login_failure(&state, &user.id.to_string(), "credential mismatch").await;
        return Err(AppError::Unauthenticated(anyhow::anyhow!("Invalid credentials")));
    }

    if let Some(code) = &req.mfa_code {
        let ok = state
            .otp
            .verify(user.id, code)
            .await
            .map_err(AppError::from)?;
        if !ok {
            audit_login_failure(&state, &user.id.to_string(), "mfa rejected").await;
            return Err(AppError::Unauthenticated(anyhow::anyhow!("Invalid credentials")));
        }
    }

    let snapshot = snapshot_for(&state, &user).await?;
    let pair = state
        .tokens
        .issue_pair(&snapshot)
        .await
        .map_err(AppError::from)?;

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(
                AuditEventKind::LoginSuccess,
                user.id.to_string(),
                ActorKind::User,
            )
            .organization(user.organization_id)
            .resource("token", None),
        )
        .await;

    Ok(respond(request_id, ApiResponse::ok("Login successful", pair)))
}

async fn audit_login_failure(state: &AppState, actor: &str, reason: &str) {
    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(AuditEventKind::LoginFailure, actor, ActorKind::User)
                .resource("token", None)
                .outcome(false, Some(reason.to_string())),
        )
        .await;
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefreshRequest {
    #[validate(length(min = 1))]
    pub refresh_token: String,
}

/// POST /auth/refresh
///
/// One-shot: the consumed refresh token is revoked before the new pair
/// is returned.
pub async fn refresh(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<RefreshRequest>,
) -> Result<ApiResponse<TokenPair>, AppError> {
    req.validate()?;
    let claims = state
        .tokens
        .validate(&req.refresh_token, Some(TokenType::Refresh))
        .await
        .map_err(AppError::from)?;
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| AppError::Unauthenticated(anyhow::anyhow!("Invalid subject in token")))?;
    let user = state
        .principals
        .user(user_id)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::Unauthenticated(anyhow::anyhow!("Unknown subject")))?;

    // Fresh snapshot: the rotated pair reflects the permission set as of
    // now, not as of the original login.
    let snapshot = snapshot_for(&state, &user).await?;
    let pair = state
        .tokens
        .refresh(&req.refresh_token, &snapshot)
        .await
        .map_err(AppError::from)?;

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(
                AuditEventKind::TokenRefreshed,
                user.id.to_string(),
                ActorKind::User,
            )
            .resource("token", Some(claims.jti)),
        )
        .await;

    Ok(respond(request_id, ApiResponse::ok("Token refreshed", pair)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ValidateTokenRequest {
    #[validate(length(min = 1))]
    pub token: String,
    #[serde(default)]
    pub include_user_details: bool,
    #[serde(default)]
    pub include_permissions: bool,
    #[serde(default)]
    pub required_permissions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidateTokenResponse {
    pub valid: bool,
    pub sub: String,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_permissions: Vec<String>,
}

/// POST /auth/validate
pub async fn validate_token(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<ValidateTokenRequest>,
) -> Result<ApiResponse<ValidateTokenResponse>, AppError> {
    req.validate()?;
    let claims = match state.tokens.validate(&req.token, None).await {
        Ok(claims) => claims,
        Err(e) => {
            let _ = state
                .audit_sink
                .record(
                    AuditEvent::new(
                        AuditEventKind::TokenValidationFailure,
                        "unknown",
                        ActorKind::User,
                    )
                    .resource("token", None)
                    .outcome(false, Some(e.to_string())),
                )
                .await;
            return Err(AppError::from(e));
        }
    };

    // The token's snapshot answers the requirement check; permissions are
    // never recomputed here.
    let missing: Vec<String> = req
        .required_permissions
        .iter()
        .filter(|required| {
            required.split_once(':').is_none_or(|(resource, action)| {
                !claims
                    .permissions
                    .iter()
                    .any(|granted| permission_matches(granted, resource, action))
            })
        })
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(AppError::PermissionDenied(anyhow::anyhow!(
            "token lacks required permissions"
        )));
    }

    let response = ValidateTokenResponse {
        valid: true,
        sub: claims.sub.clone(),
        token_type: claims.token_type.as_str().to_string(),
        username: req
            .include_user_details
            .then(|| claims.username.clone())
            .flatten(),
        roles: req.include_permissions.then(|| claims.roles.clone()),
        permissions: req.include_permissions.then(|| claims.permissions.clone()),
        missing_permissions: Vec::new(),
    };
    Ok(respond(request_id, ApiResponse::ok("Token is valid", response)))
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    /// Revoke by presenting the token itself...
    pub token: Option<String>,
    /// ...or by jti with a custom tombstone lifetime...
    pub jti: Option<String>,
    pub expires_in_seconds: Option<i64>,
    /// ...or everything a user holds.
    pub user_id: Option<Uuid>,
}

/// POST /auth/revoke
pub async fn revoke(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<RevokeRequest>,
) -> Result<ApiResponse<()>, AppError> {
    let (actor, detail) = if let Some(token) = &req.token {
        let claims = state
            .tokens
            .validate(token, None)
            .await
            .map_err(AppError::from)?;
        state
            .tokens
            .revoke_token(&claims.jti, claims.exp)
            .await
            .map_err(AppError::from)?;
        (claims.sub, claims.jti)
    } else if let Some(jti) = &req.jti {
        let ttl = req.expires_in_seconds.unwrap_or(24 * 60 * 60);
        state
            .tokens
            .blacklist(jti, ttl)
            .await
            .map_err(AppError::from)?;
        ("unknown".to_string(), jti.clone())
    } else if let Some(user_id) = req.user_id {
        state
            .tokens
            .revoke_user(user_id)
            .await
            .map_err(AppError::from)?;
        state.cache.invalidate(&[user_id]);
        (user_id.to_string(), format!("user:{}", user_id))
    } else {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Provide a token, a jti, or a user_id"
        )));
    };

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(AuditEventKind::TokenRevoked, actor, ActorKind::User)
                .resource("token", Some(detail)),
        )
        .await;

    Ok(respond(request_id, ApiResponse::message("Revoked")))
}

#[derive(Debug, Deserialize, Validate)]
pub struct BlacklistRequest {
    #[validate(length(min = 1))]
    pub jti: String,
    pub expires_in_seconds: i64,
}

/// POST /auth/blacklist
pub async fn blacklist(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<BlacklistRequest>,
) -> Result<ApiResponse<()>, AppError> {
    req.validate()?;
    state
        .tokens
        .blacklist(&req.jti, req.expires_in_seconds)
        .await
        .map_err(AppError::from)?;

    let _ = state
        .audit_sink
        .record(
            AuditEvent::new(AuditEventKind::TokenRevoked, "admin", ActorKind::System)
                .resource("token", Some(req.jti.clone())),
        )
        .await;

    Ok(respond(request_id, ApiResponse::message("Token blacklisted")))
}

#[derive(Debug, Deserialize, Validate)]
pub struct IntrospectRequest {
    #[validate(length(min = 1))]
    pub token: String,
}

/// POST /auth/introspect
pub async fn introspect(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Json(req): Json<IntrospectRequest>,
) -> Result<ApiResponse<Introspection>, AppError> {
    req.validate()?;
    let info = state.tokens.introspect(&req.token).await;
    Ok(respond(request_id, ApiResponse::ok("Introspection", info)))
}

/// GET /auth/tokens/:user_id
pub async fn list_active_tokens(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Path(user_id): Path<Uuid>,
) -> Result<ApiResponse<Vec<IssuedToken>>, AppError> {
    let tokens = state
        .tokens
        .list_active(user_id)
        .await
        .map_err(AppError::from)?;
    Ok(respond(request_id, ApiResponse::ok("Active tokens", tokens)))
}
