//! Issued-token registry entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record of a token handed out, kept until expiry so active tokens can
/// be listed and revoked per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    pub jti: String,
    pub subject: Uuid,
    pub token_type: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IssuedToken {
    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        self.expires_at > t
    }
}
