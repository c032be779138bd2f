//! Group model - org-scoped groups with memberships, group roles, and an
//! inheritance DAG.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub organization_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn new(name: impl Into<String>, organization_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            organization_id,
            parent_id: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// Inheritance edge: the ancestor group's roles flow to the descendant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInheritance {
    pub ancestor_id: Uuid,
    pub descendant_id: Uuid,
}

/// Membership of a principal in a group, optionally time-bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group_id: Uuid,
    pub principal_id: Uuid,
    pub is_active: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl GroupMembership {
    pub fn new(group_id: Uuid, principal_id: Uuid) -> Self {
        Self {
            group_id,
            principal_id,
            is_active: true,
            starts_at: None,
            ends_at: None,
        }
    }

    pub fn is_effective_at(&self, t: DateTime<Utc>) -> bool {
        is_effective_at(self.is_active, self.starts_at, self.ends_at, t)
    }
}

/// Role attached to a group, optionally time-bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRole {
    pub group_id: Uuid,
    pub role_id: Uuid,
    pub organization_id: Uuid,
    pub is_active: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl GroupRole {
    pub fn new(group_id: Uuid, role_id: Uuid, organization_id: Uuid) -> Self {
        Self {
            group_id,
            role_id,
            organization_id,
            is_active: true,
            starts_at: None,
            ends_at: None,
        }
    }

    pub fn is_effective_at(&self, t: DateTime<Utc>) -> bool {
        is_effective_at(self.is_active, self.starts_at, self.ends_at, t)
    }
}

/// A time-bounded assignment is effective at `t` iff it is active,
/// `starts_at <= t`, and `ends_at` is unset or strictly after `t`.
pub fn is_effective_at(
    is_active: bool,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    t: DateTime<Utc>,
) -> bool {
    if !is_active {
        return false;
    }
    if let Some(start) = starts_at {
        if start > t {
            return false;
        }
    }
    match ends_at {
        Some(end) => end > t,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn effectiveness_window() {
        let now = Utc::now();
        assert!(is_effective_at(true, None, None, now));
        assert!(is_effective_at(true, Some(now - Duration::hours(1)), None, now));
        assert!(!is_effective_at(true, Some(now + Duration::hours(1)), None, now));
        assert!(!is_effective_at(true, None, Some(now - Duration::hours(1)), now));
        assert!(is_effective_at(true, None, Some(now + Duration::hours(1)), now));
        assert!(!is_effective_at(false, None, None, now));
        // An assignment ending exactly now is no longer effective.
        assert!(!is_effective_at(true, None, Some(now), now));
    }
}
