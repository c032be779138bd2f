//! Audit model - tamper-evident, hash-chained audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Partition key used for events emitted by service principals, which
/// carry no organization.
pub const SERVICE_PARTITION: &str = "__service__";

/// Kind of actor behind an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    User,
    Service,
    System,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::User => "user",
            ActorKind::Service => "service",
            ActorKind::System => "system",
        }
    }
}

/// Audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    CheckEvaluated,
    PermissionEvaluated,
    ResourcesListed,
    ColumnsChecked,
    ServiceAuthSuccess,
    ServiceAuthFailure,
    TokenIssued,
    TokenRefreshed,
    TokenRevoked,
    TokenValidationFailure,
    UserRegistered,
    LoginSuccess,
    LoginFailure,
    RoleAssigned,
    RoleRevoked,
    GroupRoleAssigned,
    GroupRoleRevoked,
    MemberAdded,
    MemberRemoved,
    OrgMemberAdded,
    OrgMemberRemoved,
    CatalogSeeded,
    CatalogUpdated,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::CheckEvaluated => "CHECK_EVALUATED",
            AuditEventKind::PermissionEvaluated => "PERMISSION_EVALUATED",
            AuditEventKind::ResourcesListed => "RESOURCES_LISTED",
            AuditEventKind::ColumnsChecked => "COLUMNS_CHECKED",
            AuditEventKind::ServiceAuthSuccess => "SERVICE_AUTH_SUCCESS",
            AuditEventKind::ServiceAuthFailure => "SERVICE_AUTH_FAILURE",
            AuditEventKind::TokenIssued => "TOKEN_ISSUED",
            AuditEventKind::TokenRefreshed => "TOKEN_REFRESHED",
            AuditEventKind::TokenRevoked => "TOKEN_REVOKED",
            AuditEventKind::TokenValidationFailure => "TOKEN_VALIDATION_FAILURE",
            AuditEventKind::UserRegistered => "USER_REGISTERED",
            AuditEventKind::LoginSuccess => "LOGIN_SUCCESS",
            AuditEventKind::LoginFailure => "LOGIN_FAILURE",
            AuditEventKind::RoleAssigned => "ROLE_ASSIGNED",
            AuditEventKind::RoleRevoked => "ROLE_REVOKED",
            AuditEventKind::GroupRoleAssigned => "GROUP_ROLE_ASSIGNED",
            AuditEventKind::GroupRoleRevoked => "GROUP_ROLE_REVOKED",
            AuditEventKind::MemberAdded => "MEMBER_ADDED",
            AuditEventKind::MemberRemoved => "MEMBER_REMOVED",
            AuditEventKind::OrgMemberAdded => "ORG_MEMBER_ADDED",
            AuditEventKind::OrgMemberRemoved => "ORG_MEMBER_REMOVED",
            AuditEventKind::CatalogSeeded => "CATALOG_SEEDED",
            AuditEventKind::CatalogUpdated => "CATALOG_UPDATED",
        }
    }

    /// Kinds surfaced by the security-events query.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            AuditEventKind::ServiceAuthFailure
                | AuditEventKind::TokenValidationFailure
                | AuditEventKind::LoginFailure
                | AuditEventKind::TokenRevoked
        )
    }
}

/// One committed audit row. Rows never mutate; each hashes its
/// predecessor within the partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub actor_id: String,
    pub actor_kind: ActorKind,
    pub organization_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub success: bool,
    pub reason: Option<String>,
    pub details: serde_json::Value,
    pub prev_hash: String,
    pub self_hash: String,
}

impl AuditRecord {
    /// Partition this record chains under.
    pub fn partition(&self) -> String {
        partition_key(self.organization_id)
    }

    /// Deterministic rendering of the hashed fields. The hash fields
    /// themselves are excluded.
    pub fn canonical(&self) -> String {
        format!(
            "v1|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.ts.to_rfc3339(),
            self.actor_id,
            self.actor_kind.as_str(),
            self.organization_id
                .map(|o| o.to_string())
                .unwrap_or_default(),
            self.action,
            self.resource_type,
            self.resource_id.as_deref().unwrap_or(""),
            self.success,
            self.reason.as_deref().unwrap_or(""),
            self.details,
        )
    }

    /// `self_hash = H(prev_hash || canonical(row))`.
    pub fn compute_hash(&self, prev_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(self.canonical().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Seal the record onto the chain whose head is `prev_hash`.
    pub fn chain(mut self, prev_hash: String) -> Self {
        self.self_hash = self.compute_hash(&prev_hash);
        self.prev_hash = prev_hash;
        self
    }
}

/// Partition key for an optional organization.
pub fn partition_key(organization_id: Option<Uuid>) -> String {
    organization_id
        .map(|o| o.to_string())
        .unwrap_or_else(|| SERVICE_PARTITION.to_string())
}

/// Filters for audit queries. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub actor_id: Option<String>,
    pub organization_id: Option<Uuid>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditQuery {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(actor) = &self.actor_id {
            if &record.actor_id != actor {
                return false;
            }
        }
        if let Some(org) = self.organization_id {
            if record.organization_id != Some(org) {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &record.action != action {
                return false;
            }
        }
        if let Some(rt) = &self.resource_type {
            if &record.resource_type != rt {
                return false;
            }
        }
        if let Some(rid) = &self.resource_id {
            if record.resource_id.as_ref() != Some(rid) {
                return false;
            }
        }
        if let Some(success) = self.success {
            if record.success != success {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.ts < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.ts > until {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AuditRecord {
        AuditRecord {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            actor_id: "u1".to_string(),
            actor_kind: ActorKind::User,
            organization_id: None,
            action: AuditEventKind::CheckEvaluated.as_str().to_string(),
            resource_type: "doc".to_string(),
            resource_id: Some("d1".to_string()),
            success: true,
            reason: None,
            details: serde_json::json!({}),
            prev_hash: String::new(),
            self_hash: String::new(),
        }
    }

    #[test]
    fn chained_hash_verifies() {
        let genesis = hex::encode([0u8; 32]);
        let r = record().chain(genesis.clone());
        assert_eq!(r.prev_hash, genesis);
        assert_eq!(r.self_hash, r.compute_hash(&genesis));
    }

    #[test]
    fn tampering_changes_hash() {
        let genesis = hex::encode([0u8; 32]);
        let mut r = record().chain(genesis);
        let original = r.self_hash.clone();
        r.success = false;
        assert_ne!(r.compute_hash(&r.prev_hash), original);
    }

    #[test]
    fn service_partition_for_missing_org() {
        let r = record();
        assert_eq!(r.partition(), SERVICE_PARTITION);
    }
}
