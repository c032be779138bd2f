//! In-memory store implementation.
//!
//! Backs the test suite and embedded deployments. A single coarse lock
//! guards all tables; services never hold it across an await point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    Action, AuditQuery, AuditRecord, ColumnGroup, Group, GroupInheritance, GroupMembership,
    GroupRole, IssuedToken, Organization, OrgMembership, Permission, Resource, Role, RoleSource,
    ServiceAccount, User, UserRole,
};
use crate::services::error::ServiceError;
use crate::store::{AuditStore, CatalogStore, Page, PrincipalStore, TokenStore};

type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Default)]
struct Inner {
    actions: HashMap<Uuid, Action>,
    resources: HashMap<Uuid, Resource>,
    permissions: HashMap<Uuid, Permission>,
    roles: HashMap<Uuid, Role>,
    role_permissions: HashSet<(Uuid, Uuid)>,
    column_groups: HashMap<Uuid, ColumnGroup>,
    role_column_groups: HashSet<(Uuid, Uuid)>,

    users: HashMap<Uuid, User>,
    service_accounts: HashMap<Uuid, ServiceAccount>,
    organizations: HashMap<Uuid, Organization>,
    org_memberships: Vec<OrgMembership>,
    groups: HashMap<Uuid, Group>,
    group_inheritance: Vec<GroupInheritance>,
    memberships: Vec<GroupMembership>,
    group_roles: Vec<GroupRole>,
    user_roles: Vec<UserRole>,

    audit_live: Vec<AuditRecord>,
    audit_archive: Vec<AuditRecord>,
    /// Tombstone pointers left behind by archival: record id -> tier.
    audit_tombstones: HashMap<Uuid, String>,
    audit_heads: HashMap<String, String>,

    issued_tokens: HashMap<String, IssuedToken>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("store lock poisoned")
    }
}

fn paginate<T>(mut items: Vec<T>, page: Page) -> Vec<T> {
    let offset = page.offset().min(items.len());
    let end = (offset + page.limit()).min(items.len());
    items.drain(..offset);
    items.truncate(end - offset);
    items
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn upsert_action(&self, action: Action, refresh: bool) -> Result<(Action, bool)> {
        let mut inner = self.write();
        let existing = inner
            .actions
            .values()
            .find(|a| a.name == action.name && a.service_id == action.service_id)
            .cloned();
        match existing {
            Some(mut found) => {
                if refresh {
                    found.description = action.description;
                    inner.actions.insert(found.id, found.clone());
                }
                Ok((found, false))
            }
            None => {
                inner.actions.insert(action.id, action.clone());
                Ok((action, true))
            }
        }
    }

    async fn action_by_name(
        &self,
        service_id: Option<&str>,
        name: &str,
    ) -> Result<Option<Action>> {
        Ok(self
            .read()
            .actions
            .values()
            .find(|a| a.name == name && a.service_id.as_deref() == service_id)
            .cloned())
    }

    async fn list_actions(&self, page: Page) -> Result<Vec<Action>> {
        let mut items: Vec<_> = self.read().actions.values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(paginate(items, page))
    }

    async fn upsert_resource(&self, resource: Resource, refresh: bool) -> Result<(Resource, bool)> {
        let mut inner = self.write();
        let existing = inner
            .resources
            .values()
            .find(|r| r.name == resource.name)
            .cloned();
        match existing {
            Some(mut found) => {
                if refresh {
                    found.description = resource.description;
                    found.is_active = resource.is_active;
                    inner.resources.insert(found.id, found.clone());
                }
                Ok((found, false))
            }
            None => {
                inner.resources.insert(resource.id, resource.clone());
                Ok((resource, true))
            }
        }
    }

    async fn resource(&self, id: Uuid) -> Result<Option<Resource>> {
        Ok(self.read().resources.get(&id).cloned())
    }

    async fn resource_by_name(&self, name: &str) -> Result<Option<Resource>> {
        Ok(self
            .read()
            .resources
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn list_resources(
        &self,
        resource_type: Option<&str>,
        page: Page,
    ) -> Result<Vec<Resource>> {
        let mut items: Vec<_> = self
            .read()
            .resources
            .values()
            .filter(|r| resource_type.is_none_or(|t| r.resource_type == t))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(paginate(items, page))
    }

    async fn set_resource_parent(&self, id: Uuid, parent_id: Option<Uuid>) -> Result<()> {
        let mut inner = self.write();
        let resource = inner
            .resources
            .get_mut(&id)
            .ok_or_else(|| ServiceError::NotFound(format!("Resource {} not found", id)))?;
        resource.parent_id = parent_id;
        Ok(())
    }

    async fn upsert_permission(
        &self,
        permission: Permission,
        refresh: bool,
    ) -> Result<(Permission, bool)> {
        let mut inner = self.write();
        let existing = inner
            .permissions
            .values()
            .find(|p| p.name == permission.name)
            .cloned();
        match existing {
            Some(mut found) => {
                if refresh {
                    found.description = permission.description;
                    inner.permissions.insert(found.id, found.clone());
                }
                Ok((found, false))
            }
            None => {
                inner.permissions.insert(permission.id, permission.clone());
                Ok((permission, true))
            }
        }
    }

    async fn permission(&self, id: Uuid) -> Result<Option<Permission>> {
        Ok(self.read().permissions.get(&id).cloned())
    }

    async fn permission_by_name(&self, name: &str) -> Result<Option<Permission>> {
        Ok(self
            .read()
            .permissions
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn list_permissions(&self, page: Page) -> Result<Vec<Permission>> {
        let mut items: Vec<_> = self.read().permissions.values().cloned().collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(paginate(items, page))
    }

    async fn upsert_role(&self, role: Role, refresh: bool) -> Result<(Role, bool)> {
        let mut inner = self.write();
        let existing = inner.roles.values().find(|r| r.name == role.name).cloned();
        match existing {
            Some(mut found) => {
                if refresh {
                    found.description = role.description;
                    found.is_active = role.is_active;
                    found.version += 1;
                    inner.roles.insert(found.id, found.clone());
                }
                Ok((found, false))
            }
            None => {
                inner.roles.insert(role.id, role.clone());
                Ok((role, true))
            }
        }
    }

    async fn update_role(&self, role: Role) -> Result<Role> {
        let mut inner = self.write();
        let stored = inner
            .roles
            .get(&role.id)
            .ok_or_else(|| ServiceError::NotFound(format!("Role {} not found", role.id)))?;
        if stored.version != role.version {
            return Err(ServiceError::VersionConflict {
                expected: role.version,
                actual: stored.version,
            });
        }
        let mut updated = role;
        updated.version += 1;
        inner.roles.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn role(&self, id: Uuid) -> Result<Option<Role>> {
        Ok(self.read().roles.get(&id).cloned())
    }

    async fn role_by_name(&self, name: &str) -> Result<Option<Role>> {
        Ok(self.read().roles.values().find(|r| r.name == name).cloned())
    }

    async fn list_roles(&self, page: Page) -> Result<Vec<Role>> {
        let mut items: Vec<_> = self.read().roles.values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(paginate(items, page))
    }

    async fn attach_permission(&self, role_id: Uuid, permission_id: Uuid) -> Result<bool> {
        Ok(self.write().role_permissions.insert((role_id, permission_id)))
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<Permission>> {
        let inner = self.read();
        let mut perms: Vec<_> = inner
            .role_permissions
            .iter()
            .filter(|(rid, _)| *rid == role_id)
            .filter_map(|(_, pid)| inner.permissions.get(pid).cloned())
            .collect();
        perms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(perms)
    }

    async fn upsert_column_group(
        &self,
        group: ColumnGroup,
        refresh: bool,
    ) -> Result<(ColumnGroup, bool)> {
        let mut inner = self.write();
        let existing = inner
            .column_groups
            .values()
            .find(|g| g.name == group.name && g.table_name == group.table_name)
            .cloned();
        match existing {
            Some(mut found) => {
                if refresh {
                    found.columns = group.columns;
                    inner.column_groups.insert(found.id, found.clone());
                }
                Ok((found, false))
            }
            None => {
                inner.column_groups.insert(group.id, group.clone());
                Ok((group, true))
            }
        }
    }

    async fn attach_column_group(&self, role_id: Uuid, column_group_id: Uuid) -> Result<bool> {
        Ok(self
            .write()
            .role_column_groups
            .insert((role_id, column_group_id)))
    }

    async fn role_column_groups(&self, role_ids: &[Uuid], table: &str) -> Result<Vec<ColumnGroup>> {
        let inner = self.read();
        let wanted: HashSet<_> = role_ids.iter().collect();
        let mut groups: Vec<_> = inner
            .role_column_groups
            .iter()
            .filter(|(rid, _)| wanted.contains(rid))
            .filter_map(|(_, gid)| inner.column_groups.get(gid))
            .filter(|g| g.table_name == table)
            .cloned()
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups.dedup_by(|a, b| a.id == b.id);
        Ok(groups)
    }
}

#[async_trait]
impl PrincipalStore for MemoryStore {
    async fn insert_user(&self, user: User) -> Result<User> {
        let mut inner = self.write();
        if let Some(username) = &user.username {
            if inner
                .users
                .values()
                .any(|u| u.username.as_ref() == Some(username))
            {
                return Err(ServiceError::Conflict(format!(
                    "Username {} already exists",
                    username
                )));
            }
        }
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.read().users.get(&id).cloned())
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .read()
            .users
            .values()
            .find(|u| u.username.as_deref() == Some(username))
            .cloned())
    }

    async fn user_by_phone(&self, country_code: &str, phone: &str) -> Result<Option<User>> {
        Ok(self
            .read()
            .users
            .values()
            .find(|u| u.country_code == country_code && u.phone == phone)
            .cloned())
    }

    async fn update_user(&self, user: User) -> Result<User> {
        let mut inner = self.write();
        if !inner.users.contains_key(&user.id) {
            return Err(ServiceError::NotFound(format!("User {} not found", user.id)));
        }
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn insert_service_account(&self, account: ServiceAccount) -> Result<ServiceAccount> {
        let mut inner = self.write();
        if inner
            .service_accounts
            .values()
            .any(|s| s.name == account.name)
        {
            return Err(ServiceError::Conflict(format!(
                "Service {} already exists",
                account.name
            )));
        }
        inner.service_accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn service_account_by_name(&self, name: &str) -> Result<Option<ServiceAccount>> {
        Ok(self
            .read()
            .service_accounts
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn insert_organization(&self, org: Organization) -> Result<Organization> {
        self.write().organizations.insert(org.id, org.clone());
        Ok(org)
    }

    async fn organization(&self, id: Uuid) -> Result<Option<Organization>> {
        Ok(self.read().organizations.get(&id).cloned())
    }

    async fn organizations_for_user(&self, user_id: Uuid) -> Result<Vec<Organization>> {
        let inner = self.read();
        let mut orgs: Vec<_> = inner
            .org_memberships
            .iter()
            .filter(|m| m.user_id == user_id && m.is_active)
            .filter_map(|m| inner.organizations.get(&m.organization_id).cloned())
            .collect();
        orgs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(orgs)
    }

    async fn add_org_member(&self, membership: OrgMembership) -> Result<bool> {
        let mut inner = self.write();
        if inner.org_memberships.iter().any(|m| {
            m.organization_id == membership.organization_id && m.user_id == membership.user_id
        }) {
            return Ok(false);
        }
        inner.org_memberships.push(membership);
        Ok(true)
    }

    async fn remove_org_member(&self, organization_id: Uuid, user_id: Uuid) -> Result<bool> {
        let mut inner = self.write();
        let before = inner.org_memberships.len();
        inner
            .org_memberships
            .retain(|m| !(m.organization_id == organization_id && m.user_id == user_id));
        Ok(inner.org_memberships.len() != before)
    }

    async fn org_members(&self, organization_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .read()
            .org_memberships
            .iter()
            .filter(|m| m.organization_id == organization_id && m.is_active)
            .map(|m| m.user_id)
            .collect())
    }

    async fn insert_group(&self, group: Group) -> Result<Group> {
        let mut inner = self.write();
        if inner
            .groups
            .values()
            .any(|g| g.organization_id == group.organization_id && g.name == group.name)
        {
            return Err(ServiceError::Conflict(format!(
                "Group {} already exists in organization",
                group.name
            )));
        }
        inner.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn group(&self, id: Uuid) -> Result<Option<Group>> {
        Ok(self.read().groups.get(&id).cloned())
    }

    async fn groups_in_org(&self, organization_id: Uuid) -> Result<Vec<Group>> {
        let mut groups: Vec<_> = self
            .read()
            .groups
            .values()
            .filter(|g| g.organization_id == organization_id)
            .cloned()
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn add_group_inheritance(&self, edge: GroupInheritance) -> Result<bool> {
        let mut inner = self.write();
        if inner
            .group_inheritance
            .iter()
            .any(|e| e.ancestor_id == edge.ancestor_id && e.descendant_id == edge.descendant_id)
        {
            return Ok(false);
        }
        inner.group_inheritance.push(edge);
        Ok(true)
    }

    async fn remove_group_inheritance(
        &self,
        ancestor_id: Uuid,
        descendant_id: Uuid,
    ) -> Result<bool> {
        let mut inner = self.write();
        let before = inner.group_inheritance.len();
        inner
            .group_inheritance
            .retain(|e| !(e.ancestor_id == ancestor_id && e.descendant_id == descendant_id));
        Ok(inner.group_inheritance.len() != before)
    }

    async fn inheritance_ancestors_of(&self, group_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .read()
            .group_inheritance
            .iter()
            .filter(|e| e.descendant_id == group_id)
            .map(|e| e.ancestor_id)
            .collect())
    }

    async fn add_membership(&self, membership: GroupMembership) -> Result<bool> {
        let mut inner = self.write();
        if inner
            .memberships
            .iter()
            .any(|m| m.group_id == membership.group_id && m.principal_id == membership.principal_id)
        {
            return Ok(false);
        }
        inner.memberships.push(membership);
        Ok(true)
    }

    async fn remove_membership(&self, group_id: Uuid, principal_id: Uuid) -> Result<bool> {
        let mut inner = self.write();
        let before = inner.memberships.len();
        inner
            .memberships
            .retain(|m| !(m.group_id == group_id && m.principal_id == principal_id));
        Ok(inner.memberships.len() != before)
    }

    async fn memberships_of(&self, principal_id: Uuid) -> Result<Vec<GroupMembership>> {
        Ok(self
            .read()
            .memberships
            .iter()
            .filter(|m| m.principal_id == principal_id)
            .cloned()
            .collect())
    }

    async fn group_members(&self, group_id: Uuid) -> Result<Vec<GroupMembership>> {
        Ok(self
            .read()
            .memberships
            .iter()
            .filter(|m| m.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn add_group_role(&self, group_role: GroupRole) -> Result<bool> {
        let mut inner = self.write();
        if inner
            .group_roles
            .iter()
            .any(|g| g.group_id == group_role.group_id && g.role_id == group_role.role_id)
        {
            return Ok(false);
        }
        inner.group_roles.push(group_role);
        Ok(true)
    }

    async fn remove_group_role(&self, group_id: Uuid, role_id: Uuid) -> Result<bool> {
        let mut inner = self.write();
        let before = inner.group_roles.len();
        inner
            .group_roles
            .retain(|g| !(g.group_id == group_id && g.role_id == role_id));
        Ok(inner.group_roles.len() != before)
    }

    async fn group_roles(&self, group_id: Uuid) -> Result<Vec<GroupRole>> {
        Ok(self
            .read()
            .group_roles
            .iter()
            .filter(|g| g.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn insert_user_role(&self, user_role: UserRole) -> Result<bool> {
        let mut inner = self.write();
        if inner.user_roles.iter().any(|r| {
            r.user_id == user_role.user_id
                && r.role_id == user_role.role_id
                && r.source == user_role.source
        }) {
            return Ok(false);
        }
        inner.user_roles.push(user_role);
        Ok(true)
    }

    async fn remove_user_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        source: Option<RoleSource>,
    ) -> Result<usize> {
        let mut inner = self.write();
        let before = inner.user_roles.len();
        inner.user_roles.retain(|r| {
            !(r.user_id == user_id
                && r.role_id == role_id
                && source.is_none_or(|s| r.source == s))
        });
        Ok(before - inner.user_roles.len())
    }

    async fn remove_user_roles_by_source(
        &self,
        source: RoleSource,
        role_id: Option<Uuid>,
    ) -> Result<Vec<UserRole>> {
        let mut inner = self.write();
        let (removed, kept): (Vec<_>, Vec<_>) = inner
            .user_roles
            .drain(..)
            .partition(|r| r.source == source && role_id.is_none_or(|rid| r.role_id == rid));
        inner.user_roles = kept;
        Ok(removed)
    }

    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<UserRole>> {
        Ok(self
            .read()
            .user_roles
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn users_with_role(&self, role_id: Uuid) -> Result<Vec<Uuid>> {
        let mut users: Vec<_> = self
            .read()
            .user_roles
            .iter()
            .filter(|r| r.role_id == role_id && r.is_active)
            .map(|r| r.user_id)
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        let mut inner = self.write();
        inner
            .audit_heads
            .insert(record.partition(), record.self_hash.clone());
        inner.audit_live.push(record);
        Ok(())
    }

    async fn head_hash(&self, partition: &str) -> Result<Option<String>> {
        Ok(self.read().audit_heads.get(partition).cloned())
    }

    async fn record(&self, id: Uuid) -> Result<Option<AuditRecord>> {
        Ok(self
            .read()
            .audit_live
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn partition_records(&self, partition: &str) -> Result<Vec<AuditRecord>> {
        Ok(self
            .read()
            .audit_live
            .iter()
            .filter(|r| r.partition() == partition)
            .cloned()
            .collect())
    }

    async fn query(&self, query: &AuditQuery, page: Page) -> Result<Vec<AuditRecord>> {
        let mut items: Vec<_> = self
            .read()
            .audit_live
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        // Newest first for trails.
        items.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(paginate(items, page))
    }

    async fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.write();
        let (old, live): (Vec<_>, Vec<_>) =
            inner.audit_live.drain(..).partition(|r| r.ts < cutoff);
        inner.audit_live = live;
        let archived = old.len() as u64;
        for record in old {
            inner
                .audit_tombstones
                .insert(record.id, "archive".to_string());
            inner.audit_archive.push(record);
        }
        Ok(archived)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn record_issued(&self, token: IssuedToken) -> Result<()> {
        self.write()
            .issued_tokens
            .insert(token.jti.clone(), token);
        Ok(())
    }

    async fn active_tokens_for(
        &self,
        subject: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<IssuedToken>> {
        let mut tokens: Vec<_> = self
            .read()
            .issued_tokens
            .values()
            .filter(|t| t.subject == subject && t.is_active_at(now))
            .cloned()
            .collect();
        tokens.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        Ok(tokens)
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.write();
        let before = inner.issued_tokens.len();
        inner.issued_tokens.retain(|_, t| t.is_active_at(now));
        Ok((before - inner.issued_tokens.len()) as u64)
    }
}
