//! Role model - hierarchical roles with scope and optimistic versioning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Scope a role applies at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoleScope {
    /// Applies in every organization.
    Global,
    /// Bound to one organization.
    Org,
    /// Bound to one group.
    Group,
}

impl fmt::Display for RoleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleScope::Global => write!(f, "GLOBAL"),
            RoleScope::Org => write!(f, "ORG"),
            RoleScope::Group => write!(f, "GROUP"),
        }
    }
}

impl FromStr for RoleScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GLOBAL" => Ok(RoleScope::Global),
            "ORG" => Ok(RoleScope::Org),
            "GROUP" => Ok(RoleScope::Group),
            other => Err(format!("Invalid role scope: {}", other)),
        }
    }
}

/// Role entity. Roles form an acyclic hierarchy via `parent_id`; a child
/// inherits every permission of its parent, transitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub scope: RoleScope,
    pub is_active: bool,
    /// Bumped on every mutation; stale writers are rejected.
    pub version: i64,
    pub parent_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Role {
    pub fn new(name: impl Into<String>, scope: RoleScope) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            scope,
            is_active: true,
            version: 1,
            parent_id: None,
            organization_id: None,
            group_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Role to permission binding (many-to-many, unique per pair).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolePermission {
    pub role_id: Uuid,
    pub permission_id: Uuid,
}

/// Provenance of a role held by a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleProvenance {
    Direct,
    GroupDirect(Uuid),
    GroupInherited(Uuid),
}

impl fmt::Display for RoleProvenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleProvenance::Direct => write!(f, "DIRECT"),
            RoleProvenance::GroupDirect(gid) => write!(f, "GROUP_DIRECT:{}", gid),
            RoleProvenance::GroupInherited(gid) => write!(f, "GROUP_INHERITED:{}", gid),
        }
    }
}

/// A role resolved for a user, together with where it came from.
#[derive(Debug, Clone)]
pub struct EffectiveRole {
    pub role: Role,
    pub source: RoleProvenance,
}
