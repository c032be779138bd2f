//! Permission model - canonical `"<resource>:<action>"` grants.
//!
//! Either side of the canonical name may be the literal `*`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Wildcard marker for either side of a canonical permission name.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Permission {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub resource_id: Option<Uuid>,
    pub action_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Permission {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            resource_id: None,
            action_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Build the canonical name for a resource/action pair.
pub fn canonical_permission(resource: &str, action: &str) -> String {
    format!(
        "{}:{}",
        resource.trim().to_lowercase(),
        action.trim().to_lowercase()
    )
}

/// Normalize and validate a permission name.
///
/// Both sides are trimmed and lowercased; the result must match
/// `^[^:]+:[^:]+$`.
pub fn normalize_permission_name(name: &str) -> Option<String> {
    let mut parts = name.splitn(2, ':');
    let resource = parts.next()?.trim().to_lowercase();
    let action = parts.next()?.trim().to_lowercase();
    if resource.is_empty() || action.is_empty() || action.contains(':') {
        return None;
    }
    Some(format!("{}:{}", resource, action))
}

/// Whether a granted permission name covers `(resource, action)`.
///
/// `X:Y` matches iff `(X == resource || X == "*") && (Y == action || Y == "*")`.
pub fn permission_matches(granted: &str, resource: &str, action: &str) -> bool {
    let Some((gr, ga)) = granted.split_once(':') else {
        return false;
    };
    (gr == resource || gr == WILDCARD) && (ga == action || ga == WILDCARD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(
            normalize_permission_name(" Farmers :Read "),
            Some("farmers:read".to_string())
        );
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(normalize_permission_name("farmers"), None);
        assert_eq!(normalize_permission_name(":read"), None);
        assert_eq!(normalize_permission_name("farmers:"), None);
        assert_eq!(normalize_permission_name("a:b:c"), None);
        assert_eq!(normalize_permission_name(""), None);
    }

    #[test]
    fn wildcard_matching() {
        assert!(permission_matches("farmers:read", "farmers", "read"));
        assert!(permission_matches("farmers:*", "farmers", "delete"));
        assert!(permission_matches("*:read", "anything", "read"));
        assert!(permission_matches("*:*", "anything", "whatever"));
        assert!(!permission_matches("farmers:read", "farmers", "write"));
        assert!(!permission_matches("farmers:read", "crops", "read"));
        assert!(!permission_matches("not-canonical", "farmers", "read"));
    }
}
