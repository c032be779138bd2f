//! Principal model - the authenticatable actors (users and services),
//! organizations, and role assignment rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Organization entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// Membership of a user in an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgMembership {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// User principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: Option<String>,
    pub phone: String,
    pub country_code: String,
    pub is_validated: bool,
    pub has_mpin: bool,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    #[serde(skip_serializing)]
    pub mpin_hash: Option<String>,
    pub organization_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(phone: impl Into<String>, country_code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: None,
            phone: phone.into(),
            country_code: country_code.into(),
            is_validated: false,
            has_mpin: false,
            password_hash: None,
            mpin_hash: None,
            organization_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Service (machine) principal. The API key is stored hashed only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing, default)]
    pub api_key_hash: String,
    pub is_active: bool,
    pub organization_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Any authenticatable actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    User(User),
    Service(ServiceAccount),
}

impl Principal {
    pub fn id(&self) -> Uuid {
        match self {
            Principal::User(u) => u.id,
            Principal::Service(s) => s.id,
        }
    }

    pub fn kind(&self) -> PrincipalKind {
        match self {
            Principal::User(_) => PrincipalKind::User,
            Principal::Service(_) => PrincipalKind::Service,
        }
    }

    pub fn organization_id(&self) -> Option<Uuid> {
        match self {
            Principal::User(u) => u.organization_id,
            Principal::Service(s) => s.organization_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    User,
    Service,
}

/// Where a user-role row came from. Only `Direct` rows are writable via
/// the API; the rest are materialized by the engine and cleaned up when
/// their originating assignment goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RoleSource {
    Direct,
    Group(Uuid),
    Inherited(Uuid),
}

impl fmt::Display for RoleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleSource::Direct => write!(f, "DIRECT"),
            RoleSource::Group(gid) => write!(f, "GROUP:{}", gid),
            RoleSource::Inherited(rid) => write!(f, "INHERITED:{}", rid),
        }
    }
}

impl FromStr for RoleSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "DIRECT" {
            return Ok(RoleSource::Direct);
        }
        if let Some(gid) = s.strip_prefix("GROUP:") {
            return Uuid::parse_str(gid)
                .map(RoleSource::Group)
                .map_err(|e| e.to_string());
        }
        if let Some(rid) = s.strip_prefix("INHERITED:") {
            return Uuid::parse_str(rid)
                .map(RoleSource::Inherited)
                .map_err(|e| e.to_string());
        }
        Err(format!("Invalid role source: {}", s))
    }
}

impl From<RoleSource> for String {
    fn from(s: RoleSource) -> Self {
        s.to_string()
    }
}

impl TryFrom<String> for RoleSource {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Role assigned to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRole {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub is_active: bool,
    pub source: RoleSource,
    pub created_at: DateTime<Utc>,
}

impl UserRole {
    pub fn new(user_id: Uuid, role_id: Uuid, source: RoleSource) -> Self {
        Self {
            user_id,
            role_id,
            is_active: true,
            source,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_source_round_trip() {
        let gid = Uuid::new_v4();
        for src in [
            RoleSource::Direct,
            RoleSource::Group(gid),
            RoleSource::Inherited(gid),
        ] {
            let rendered = src.to_string();
            assert_eq!(rendered.parse::<RoleSource>().unwrap(), src);
        }
        assert!("GROUPISH:abc".parse::<RoleSource>().is_err());
    }
}
