//! Token service: HS256 bearer tokens carrying a point-in-time snapshot
//! of the principal's roles and permissions.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::IssuedToken;
use crate::services::error::ServiceError;
use crate::services::revocation::RevocationStore;
use crate::store::TokenStore;

/// 24 hours: how long a per-user revocation tombstone stays in force.
const USER_REVOCATION_TTL_SECONDS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrgRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserContext {
    pub organizations: Vec<OrgRef>,
}

/// Claim set. Roles and permissions are the snapshot taken at issue
/// time; validation never recomputes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub jti: String,
    pub sub: String,
    pub iss: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub token_type: TokenType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    #[serde(default)]
    pub user_context: UserContext,
}

/// What gets frozen into a token at issue time.
#[derive(Debug, Clone)]
pub struct TokenSnapshot {
    pub principal_id: Uuid,
    pub username: Option<String>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub organizations: Vec<OrgRef>,
}

/// Token pair returned to the client.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// Introspection result: metadata only, never the full claim set.
#[derive(Debug, Clone, Serialize)]
pub struct Introspection {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Introspection {
    fn inactive() -> Self {
        Self {
            active: false,
            sub: None,
            iss: None,
            exp: None,
            iat: None,
            jti: None,
            token_type: None,
            username: None,
        }
    }
}

#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: Option<String>,
    access_ttl_minutes: i64,
    refresh_ttl_days: i64,
    leeway_seconds: u64,
    revocations: Arc<dyn RevocationStore>,
    tokens: Arc<dyn TokenStore>,
}

impl TokenService {
    pub fn new(
        config: &JwtConfig,
        revocations: Arc<dyn RevocationStore>,
        tokens: Arc<dyn TokenStore>,
    ) -> Self {
        let secret = config.secret.expose_secret().as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_ttl_minutes: config.access_token_expiry_minutes,
            refresh_ttl_days: config.refresh_token_expiry_days,
            leeway_seconds: config.leeway_seconds,
            revocations,
            tokens,
        }
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_ttl_minutes * 60
    }

    fn build_claims(&self, snapshot: &TokenSnapshot, token_type: TokenType) -> Claims {
        let now = Utc::now();
        let ttl = match token_type {
            TokenType::Access => Duration::minutes(self.access_ttl_minutes),
            TokenType::Refresh => Duration::days(self.refresh_ttl_days),
        };
        // Sorted claim lists keep the embedded snapshot stable across
        // issues for the same permission set.
        let mut roles = snapshot.roles.clone();
        roles.sort();
        roles.dedup();
        let mut permissions = snapshot.permissions.clone();
        permissions.sort();
        permissions.dedup();

        Claims {
            jti: Uuid::new_v4().to_string(),
            sub: snapshot.principal_id.to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + ttl).timestamp(),
            token_type,
            username: snapshot.username.clone(),
            roles,
            permissions,
            user_context: UserContext {
                organizations: snapshot.organizations.clone(),
            },
        }
    }

    fn sign(&self, claims: &Claims) -> Result<String, ServiceError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to encode token: {}", e)))
    }

    async fn register(&self, claims: &Claims) -> Result<(), ServiceError> {
        let subject = Uuid::parse_str(&claims.sub)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Invalid subject: {}", e)))?;
        self.tokens
            .record_issued(IssuedToken {
                jti: claims.jti.clone(),
                subject,
                token_type: claims.token_type.as_str().to_string(),
                issued_at: chrono::DateTime::from_timestamp(claims.iat, 0)
                    .unwrap_or_else(Utc::now),
                expires_at: chrono::DateTime::from_timestamp(claims.exp, 0)
                    .unwrap_or_else(Utc::now),
            })
            .await
    }

    /// Issue an access/refresh pair carrying the snapshot.
    pub async fn issue_pair(&self, snapshot: &TokenSnapshot) -> Result<TokenPair, ServiceError> {
        let access_claims = self.build_claims(snapshot, TokenType::Access);
        let refresh_claims = self.build_claims(snapshot, TokenType::Refresh);

        let access_token = self.sign(&access_claims)?;
        let refresh_token = self.sign(&refresh_claims)?;

        self.register(&access_claims).await?;
        self.register(&refresh_claims).await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access_token_expiry_seconds(),
        })
    }

    /// Validate signature, time window (with leeway), and revocation
    /// state. Returns the embedded claims untouched.
    pub async fn validate(
        &self,
        token: &str,
        expected: Option<TokenType>,
    ) -> Result<Claims, ServiceError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.leeway_seconds;
        validation.validate_nbf = true;
        validation.set_issuer(&[self.issuer.clone()]);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience.clone()]),
            None => validation.validate_aud = false,
        }

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => ServiceError::TokenExpired,
                _ => ServiceError::InvalidToken(e.to_string()),
            }
        })?;
        let claims = data.claims;

        if let Some(expected) = expected {
            if claims.token_type != expected {
                return Err(ServiceError::InvalidToken(format!(
                    "expected {} token",
                    expected.as_str()
                )));
            }
        }

        if self
            .revocations
            .is_token_revoked(&claims.jti)
            .await
            .map_err(ServiceError::Internal)?
        {
            return Err(ServiceError::TokenRevoked);
        }
        if let Some(cutoff) = self
            .revocations
            .user_revocation_cutoff(&claims.sub)
            .await
            .map_err(ServiceError::Internal)?
        {
            if claims.iat <= cutoff {
                return Err(ServiceError::TokenRevoked);
            }
        }

        Ok(claims)
    }

    /// One-shot refresh: the consumed refresh token is tombstoned before
    /// the new pair is issued, so replaying it fails.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        snapshot: &TokenSnapshot,
    ) -> Result<TokenPair, ServiceError> {
        let claims = self.validate(refresh_token, Some(TokenType::Refresh)).await?;

        let remaining = (claims.exp - Utc::now().timestamp()).max(1) + self.leeway_seconds as i64;
        self.revocations
            .revoke_token(&claims.jti, remaining)
            .await
            .map_err(ServiceError::Internal)?;

        self.issue_pair(snapshot).await
    }

    /// Tombstone one token until it would have expired anyway.
    pub async fn revoke_token(&self, jti: &str, exp: i64) -> Result<(), ServiceError> {
        let remaining = (exp - Utc::now().timestamp()).max(1) + self.leeway_seconds as i64;
        self.revocations
            .revoke_token(jti, remaining)
            .await
            .map_err(ServiceError::Internal)
    }

    /// Tombstone a token with a caller-chosen expiry.
    pub async fn blacklist(&self, jti: &str, ttl_seconds: i64) -> Result<(), ServiceError> {
        self.revocations
            .revoke_token(jti, ttl_seconds)
            .await
            .map_err(ServiceError::Internal)
    }

    /// End every token the user holds: tokens issued at or before now
    /// fail validation for the next 24 hours.
    pub async fn revoke_user(&self, user_id: Uuid) -> Result<(), ServiceError> {
        self.revocations
            .revoke_user(
                &user_id.to_string(),
                Utc::now().timestamp(),
                USER_REVOCATION_TTL_SECONDS,
            )
            .await
            .map_err(ServiceError::Internal)
    }

    /// Metadata-only introspection; never leaks the claim set.
    pub async fn introspect(&self, token: &str) -> Introspection {
        match self.validate(token, None).await {
            Ok(claims) => Introspection {
                active: true,
                sub: Some(claims.sub),
                iss: Some(claims.iss),
                exp: Some(claims.exp),
                iat: Some(claims.iat),
                jti: Some(claims.jti),
                token_type: Some(claims.token_type.as_str().to_string()),
                username: claims.username,
            },
            Err(_) => Introspection::inactive(),
        }
    }

    pub async fn list_active(&self, user_id: Uuid) -> Result<Vec<IssuedToken>, ServiceError> {
        self.tokens.active_tokens_for(user_id, Utc::now()).await
    }
}

/// MFA verification is delivered by an external collaborator; the core
/// only consumes this interface.
#[async_trait::async_trait]
pub trait OtpVerifier: Send + Sync {
    async fn verify(&self, principal_id: Uuid, code: &str) -> Result<bool, ServiceError>;
}

/// Verifier used when no MFA provider is wired in: accepts everything.
pub struct AcceptAllOtpVerifier;

#[async_trait::async_trait]
impl OtpVerifier for AcceptAllOtpVerifier {
    async fn verify(&self, _principal_id: Uuid, _code: &str) -> Result<bool, ServiceError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::revocation::MemoryRevocationStore;
    use crate::store::MemoryStore;

    fn test_service() -> TokenService {
        let config = JwtConfig {
            secret: Secret::new("test-secret-at-least-32-bytes-long!".to_string()),
            issuer: "aaa-service".to_string(),
            audience: None,
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
            leeway_seconds: 120,
        };
        TokenService::new(
            &config,
            Arc::new(MemoryRevocationStore::new()),
            Arc::new(MemoryStore::new()),
        )
    }

    fn snapshot() -> TokenSnapshot {
        TokenSnapshot {
            principal_id: Uuid::new_v4(),
            username: Some("asha".to_string()),
            roles: vec!["admin".to_string(), "readonly".to_string()],
            permissions: vec!["catalog:seed".to_string(), "farmers:read".to_string()],
            organizations: vec![OrgRef {
                id: Uuid::new_v4().to_string(),
                name: "acme".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn issued_tokens_validate_and_preserve_claims() {
        let service = test_service();
        let snap = snapshot();
        let pair = service.issue_pair(&snap).await.unwrap();

        let claims = service
            .validate(&pair.access_token, Some(TokenType::Access))
            .await
            .unwrap();
        assert_eq!(claims.sub, snap.principal_id.to_string());
        assert_eq!(claims.username.as_deref(), Some("asha"));
        assert_eq!(claims.roles, vec!["admin", "readonly"]);
        assert_eq!(
            claims.permissions,
            vec!["catalog:seed", "farmers:read"]
        );
        assert_eq!(claims.user_context.organizations.len(), 1);
        assert_eq!(claims.nbf, claims.iat);
        assert!(claims.exp > claims.iat);
    }

    #[tokio::test]
    async fn refresh_is_one_shot() {
        let service = test_service();
        let snap = snapshot();
        let pair = service.issue_pair(&snap).await.unwrap();

        let rotated = service.refresh(&pair.refresh_token, &snap).await.unwrap();
        assert_ne!(rotated.refresh_token, pair.refresh_token);

        let replay = service.refresh(&pair.refresh_token, &snap).await;
        assert!(matches!(replay, Err(ServiceError::TokenRevoked)));
    }

    #[tokio::test]
    async fn revoked_token_fails_validation() {
        let service = test_service();
        let snap = snapshot();
        let pair = service.issue_pair(&snap).await.unwrap();
        let claims = service.validate(&pair.access_token, None).await.unwrap();

        service.revoke_token(&claims.jti, claims.exp).await.unwrap();
        let result = service.validate(&pair.access_token, None).await;
        assert!(matches!(result, Err(ServiceError::TokenRevoked)));
    }

    #[tokio::test]
    async fn user_revocation_ends_existing_tokens() {
        let service = test_service();
        let snap = snapshot();
        let pair = service.issue_pair(&snap).await.unwrap();

        service.revoke_user(snap.principal_id).await.unwrap();
        let result = service.validate(&pair.access_token, None).await;
        assert!(matches!(result, Err(ServiceError::TokenRevoked)));
    }

    #[tokio::test]
    async fn access_token_is_rejected_where_refresh_expected() {
        let service = test_service();
        let pair = service.issue_pair(&snapshot()).await.unwrap();
        let result = service
            .validate(&pair.access_token, Some(TokenType::Refresh))
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn introspection_never_reports_permissions() {
        let service = test_service();
        let pair = service.issue_pair(&snapshot()).await.unwrap();
        let info = service.introspect(&pair.access_token).await;
        assert!(info.active);
        assert_eq!(info.token_type.as_deref(), Some("access"));
        let rendered = serde_json::to_string(&info).unwrap();
        assert!(!rendered.contains("permissions"));
        assert!(!rendered.contains("roles"));
    }

    #[tokio::test]
    async fn garbage_tokens_are_inactive_on_introspection() {
        let service = test_service();
        let info = service.introspect("not-a-token").await;
        assert!(!info.active);
    }

    #[tokio::test]
    async fn active_tokens_are_listed_per_user() {
        let service = test_service();
        let snap = snapshot();
        service.issue_pair(&snap).await.unwrap();
        service.issue_pair(&snap).await.unwrap();
        let active = service.list_active(snap.principal_id).await.unwrap();
        // Two pairs: two access and two refresh tokens.
        assert_eq!(active.len(), 4);
    }
}
