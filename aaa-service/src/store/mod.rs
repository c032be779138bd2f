//! Storage seams for the catalog, principal graph, audit trail, and
//! issued-token registry.
//!
//! The services own all invariants (cycle checks, normalization,
//! cascades); implementations only persist rows. `memory` backs tests
//! and embedded use, `postgres` backs the deployed binary.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Action, AuditQuery, AuditRecord, ColumnGroup, Group, GroupInheritance, GroupMembership,
    GroupRole, IssuedToken, Organization, OrgMembership, Permission, Resource, Role, RoleSource,
    ServiceAccount, User, UserRole,
};
use crate::services::error::ServiceError;

pub use memory::MemoryStore;
pub use postgres::PgStore;

type Result<T> = std::result::Result<T, ServiceError>;

/// Page selector for list queries. Pages are 1-based.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

pub const MAX_PAGE_SIZE: u32 = 500;

impl Page {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page as usize - 1) * self.page_size as usize
    }

    pub fn limit(&self) -> usize {
        self.page_size as usize
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 50)
    }
}

/// Durable record of actions, resources, permissions, roles, bindings,
/// and column groups.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    // Actions
    async fn upsert_action(&self, action: Action, refresh: bool) -> Result<(Action, bool)>;
    async fn action_by_name(&self, service_id: Option<&str>, name: &str)
        -> Result<Option<Action>>;
    async fn list_actions(&self, page: Page) -> Result<Vec<Action>>;

    // Resources
    async fn upsert_resource(&self, resource: Resource, refresh: bool) -> Result<(Resource, bool)>;
    async fn resource(&self, id: Uuid) -> Result<Option<Resource>>;
    async fn resource_by_name(&self, name: &str) -> Result<Option<Resource>>;
    async fn list_resources(
        &self,
        resource_type: Option<&str>,
        page: Page,
    ) -> Result<Vec<Resource>>;
    async fn set_resource_parent(&self, id: Uuid, parent_id: Option<Uuid>) -> Result<()>;

    // Permissions (idempotent by canonical name)
    async fn upsert_permission(
        &self,
        permission: Permission,
        refresh: bool,
    ) -> Result<(Permission, bool)>;
    async fn permission(&self, id: Uuid) -> Result<Option<Permission>>;
    async fn permission_by_name(&self, name: &str) -> Result<Option<Permission>>;
    async fn list_permissions(&self, page: Page) -> Result<Vec<Permission>>;

    // Roles
    async fn upsert_role(&self, role: Role, refresh: bool) -> Result<(Role, bool)>;
    /// Optimistic update: fails with a version conflict unless the stored
    /// version matches `role.version`; the stored row is bumped.
    async fn update_role(&self, role: Role) -> Result<Role>;
    async fn role(&self, id: Uuid) -> Result<Option<Role>>;
    async fn role_by_name(&self, name: &str) -> Result<Option<Role>>;
    async fn list_roles(&self, page: Page) -> Result<Vec<Role>>;

    // Role-permission bindings
    async fn attach_permission(&self, role_id: Uuid, permission_id: Uuid) -> Result<bool>;
    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<Permission>>;

    // Column groups
    async fn upsert_column_group(
        &self,
        group: ColumnGroup,
        refresh: bool,
    ) -> Result<(ColumnGroup, bool)>;
    async fn attach_column_group(&self, role_id: Uuid, column_group_id: Uuid) -> Result<bool>;
    async fn role_column_groups(&self, role_ids: &[Uuid], table: &str) -> Result<Vec<ColumnGroup>>;
}

/// Users, services, organizations, groups, and every assignment edge
/// between them.
#[async_trait]
pub trait PrincipalStore: Send + Sync {
    // Users
    async fn insert_user(&self, user: User) -> Result<User>;
    async fn user(&self, id: Uuid) -> Result<Option<User>>;
    async fn user_by_username(&self, username: &str) -> Result<Option<User>>;
    async fn user_by_phone(&self, country_code: &str, phone: &str) -> Result<Option<User>>;
    async fn update_user(&self, user: User) -> Result<User>;

    // Service accounts
    async fn insert_service_account(&self, account: ServiceAccount) -> Result<ServiceAccount>;
    async fn service_account_by_name(&self, name: &str) -> Result<Option<ServiceAccount>>;

    // Organizations
    async fn insert_organization(&self, org: Organization) -> Result<Organization>;
    async fn organization(&self, id: Uuid) -> Result<Option<Organization>>;
    async fn organizations_for_user(&self, user_id: Uuid) -> Result<Vec<Organization>>;
    async fn add_org_member(&self, membership: OrgMembership) -> Result<bool>;
    async fn remove_org_member(&self, organization_id: Uuid, user_id: Uuid) -> Result<bool>;
    async fn org_members(&self, organization_id: Uuid) -> Result<Vec<Uuid>>;

    // Groups
    async fn insert_group(&self, group: Group) -> Result<Group>;
    async fn group(&self, id: Uuid) -> Result<Option<Group>>;
    async fn groups_in_org(&self, organization_id: Uuid) -> Result<Vec<Group>>;
    async fn add_group_inheritance(&self, edge: GroupInheritance) -> Result<bool>;
    async fn remove_group_inheritance(&self, ancestor_id: Uuid, descendant_id: Uuid)
        -> Result<bool>;
    /// Direct inheritance ancestors of a group (one hop).
    async fn inheritance_ancestors_of(&self, group_id: Uuid) -> Result<Vec<Uuid>>;

    // Group memberships
    async fn add_membership(&self, membership: GroupMembership) -> Result<bool>;
    async fn remove_membership(&self, group_id: Uuid, principal_id: Uuid) -> Result<bool>;
    async fn memberships_of(&self, principal_id: Uuid) -> Result<Vec<GroupMembership>>;
    async fn group_members(&self, group_id: Uuid) -> Result<Vec<GroupMembership>>;

    // Group roles
    async fn add_group_role(&self, group_role: GroupRole) -> Result<bool>;
    async fn remove_group_role(&self, group_id: Uuid, role_id: Uuid) -> Result<bool>;
    async fn group_roles(&self, group_id: Uuid) -> Result<Vec<GroupRole>>;

    // User roles
    async fn insert_user_role(&self, user_role: UserRole) -> Result<bool>;
    /// Remove rows for a user and role, optionally restricted to one source.
    async fn remove_user_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        source: Option<RoleSource>,
    ) -> Result<usize>;
    /// Remove every row with the given source (optionally one role);
    /// returns the removed rows so callers can invalidate affected users.
    async fn remove_user_roles_by_source(
        &self,
        source: RoleSource,
        role_id: Option<Uuid>,
    ) -> Result<Vec<UserRole>>;
    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<UserRole>>;
    async fn users_with_role(&self, role_id: Uuid) -> Result<Vec<Uuid>>;
}

/// Append-only audit partition plus second-tier archive.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<()>;
    /// Hash of the newest record in a partition.
    async fn head_hash(&self, partition: &str) -> Result<Option<String>>;
    async fn record(&self, id: Uuid) -> Result<Option<AuditRecord>>;
    /// All live records of a partition in insertion order.
    async fn partition_records(&self, partition: &str) -> Result<Vec<AuditRecord>>;
    async fn query(&self, query: &AuditQuery, page: Page) -> Result<Vec<AuditRecord>>;
    /// Move records older than `cutoff` to the archive tier, leaving a
    /// tombstone pointer. Returns the number of archived rows.
    async fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Registry of issued tokens, pruned at expiry.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn record_issued(&self, token: IssuedToken) -> Result<()>;
    async fn active_tokens_for(&self, subject: Uuid, now: DateTime<Utc>)
        -> Result<Vec<IssuedToken>>;
    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}
