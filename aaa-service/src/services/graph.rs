//! Principal graph service: organizations, groups, memberships, role
//! assignments, group inheritance, and effective-role resolution.

use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{
    EffectiveRole, Group, GroupInheritance, GroupMembership, GroupRole, Organization,
    OrgMembership, Principal, Role, RoleProvenance, RoleScope, RoleSource, ServiceAccount,
    UserRole,
};
use crate::services::cache::DecisionCache;
use crate::services::catalog::CatalogService;
use crate::services::error::ServiceError;
use crate::store::PrincipalStore;

/// Bound on group-inheritance closure walks.
const MAX_CLOSURE: usize = 256;

#[derive(Clone)]
pub struct PrincipalGraphService {
    store: Arc<dyn PrincipalStore>,
    catalog: CatalogService,
    cache: Arc<DecisionCache>,
}

impl PrincipalGraphService {
    pub fn new(
        store: Arc<dyn PrincipalStore>,
        catalog: CatalogService,
        cache: Arc<DecisionCache>,
    ) -> Self {
        Self {
            store,
            catalog,
            cache,
        }
    }

    pub fn store(&self) -> &Arc<dyn PrincipalStore> {
        &self.store
    }

    // ==================== Organizations ====================

    pub async fn create_organization(&self, name: &str) -> Result<Organization, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::Validation(
                "Organization name must not be empty".to_string(),
            ));
        }
        self.store
            .insert_organization(Organization::new(name.trim()))
            .await
    }

    /// Idempotent: re-adding an existing member reports `false` without
    /// erroring.
    pub async fn add_user_to_organization(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, ServiceError> {
        self.ensure_org(organization_id).await?;
        self.ensure_user(user_id).await?;
        let added = self
            .store
            .add_org_member(OrgMembership {
                organization_id,
                user_id,
                is_active: true,
                created_at: Utc::now(),
            })
            .await?;
        if added {
            self.cache.invalidate(&[user_id]);
        }
        Ok(added)
    }

    /// Removes the user from the organization and from every group in it.
    pub async fn remove_user_from_organization(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), ServiceError> {
        for group in self.store.groups_in_org(organization_id).await? {
            let member = self
                .store
                .group_members(group.id)
                .await?
                .iter()
                .any(|m| m.principal_id == user_id);
            if member {
                self.remove_member(group.id, user_id).await?;
            }
        }
        self.store
            .remove_org_member(organization_id, user_id)
            .await?;
        self.cache.invalidate(&[user_id]);
        Ok(())
    }

    pub async fn is_org_member(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, ServiceError> {
        Ok(self
            .store
            .org_members(organization_id)
            .await?
            .contains(&user_id))
    }

    pub async fn organizations_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Organization>, ServiceError> {
        self.store.organizations_for_user(user_id).await
    }

    // ==================== Service accounts ====================

    /// Register a machine principal. Returns the account and the
    /// plaintext API key, which is never stored or shown again.
    pub async fn register_service_account(
        &self,
        name: &str,
        organization_id: Option<Uuid>,
    ) -> Result<(ServiceAccount, String), ServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::Validation(
                "Service name must not be empty".to_string(),
            ));
        }
        let api_key = crate::utils::generate_api_key();
        let account = ServiceAccount {
            id: Uuid::new_v4(),
            name: name.to_string(),
            api_key_hash: crate::utils::hash_secret(&api_key)?,
            is_active: true,
            organization_id,
            created_at: Utc::now(),
        };
        let account = self.store.insert_service_account(account).await?;
        Ok((account, api_key))
    }

    /// Resolve any principal by id or service name.
    pub async fn find_service_principal(
        &self,
        name: &str,
    ) -> Result<Option<Principal>, ServiceError> {
        Ok(self
            .store
            .service_account_by_name(name)
            .await?
            .map(Principal::Service))
    }

    // ==================== Groups ====================

    pub async fn create_group(
        &self,
        organization_id: Uuid,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> Result<Group, ServiceError> {
        self.ensure_org(organization_id).await?;
        let mut group = Group::new(name.trim(), organization_id);
        group.parent_id = parent_id;
        self.store.insert_group(group).await
    }

    /// Add an inheritance edge: the ancestor's roles flow to the
    /// descendant. Cycles are rejected.
    pub async fn add_group_inheritance(
        &self,
        ancestor_id: Uuid,
        descendant_id: Uuid,
    ) -> Result<bool, ServiceError> {
        if ancestor_id == descendant_id {
            return Err(ServiceError::Cycle(
                "Group cannot inherit from itself".to_string(),
            ));
        }
        let ancestor = self
            .store
            .group(ancestor_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Group {} not found", ancestor_id)))?;
        let descendant = self
            .store
            .group(descendant_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Group {} not found", descendant_id)))?;
        if ancestor.organization_id != descendant.organization_id {
            return Err(ServiceError::Validation(
                "Group inheritance must stay within one organization".to_string(),
            ));
        }
        // Adding ancestor -> descendant closes a cycle iff the descendant
        // is already (transitively) an ancestor of the ancestor.
        let closure = self.inheritance_closure(ancestor_id).await?;
        if closure.contains(&descendant_id) {
            return Err(ServiceError::Cycle(format!(
                "Inheritance edge {} -> {} would close a cycle",
                ancestor_id, descendant_id
            )));
        }
        let added = self
            .store
            .add_group_inheritance(GroupInheritance {
                ancestor_id,
                descendant_id,
            })
            .await?;
        if added {
            self.invalidate_group_subtree(descendant_id).await?;
        }
        Ok(added)
    }

    pub async fn remove_group_inheritance(
        &self,
        ancestor_id: Uuid,
        descendant_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let removed = self
            .store
            .remove_group_inheritance(ancestor_id, descendant_id)
            .await?;
        if removed {
            self.invalidate_group_subtree(descendant_id).await?;
        }
        Ok(removed)
    }

    /// Transitive inheritance ancestors of a group (excluding itself).
    pub async fn inheritance_closure(&self, group_id: Uuid) -> Result<HashSet<Uuid>, ServiceError> {
        let mut closure = HashSet::new();
        let mut queue = VecDeque::from([group_id]);
        while let Some(current) = queue.pop_front() {
            if closure.len() >= MAX_CLOSURE {
                break;
            }
            for ancestor in self.store.inheritance_ancestors_of(current).await? {
                if ancestor != group_id && closure.insert(ancestor) {
                    queue.push_back(ancestor);
                }
            }
        }
        Ok(closure)
    }

    /// Groups that (transitively) inherit from `group_id`.
    async fn inheritance_descendants(&self, group_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        let Some(group) = self.store.group(group_id).await? else {
            return Ok(Vec::new());
        };
        let mut descendants = Vec::new();
        for candidate in self.store.groups_in_org(group.organization_id).await? {
            if candidate.id == group_id {
                continue;
            }
            if self
                .inheritance_closure(candidate.id)
                .await?
                .contains(&group_id)
            {
                descendants.push(candidate.id);
            }
        }
        Ok(descendants)
    }

    // ==================== Memberships ====================

    /// Add a principal to a group and materialize the group's roles as
    /// `GROUP:<gid>`-sourced user-role rows.
    pub async fn add_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool, ServiceError> {
        self.ensure_group(group_id).await?;
        self.ensure_user(user_id).await?;
        let added = self
            .store
            .add_membership(GroupMembership::new(group_id, user_id))
            .await?;
        if added {
            let now = Utc::now();
            for group_role in self.store.group_roles(group_id).await? {
                if group_role.is_effective_at(now) {
                    self.store
                        .insert_user_role(UserRole::new(
                            user_id,
                            group_role.role_id,
                            RoleSource::Group(group_id),
                        ))
                        .await?;
                }
            }
            self.cache.invalidate(&[user_id]);
        }
        Ok(added)
    }

    /// Remove a membership, cascade-deleting every user-role row sourced
    /// from this group. The principal's cached decisions are invalidated
    /// within the same call.
    pub async fn remove_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool, ServiceError> {
        let removed = self.store.remove_membership(group_id, user_id).await?;
        let source = RoleSource::Group(group_id);
        for row in self.store.user_roles(user_id).await? {
            if row.source == source {
                self.store
                    .remove_user_role(user_id, row.role_id, Some(source))
                    .await?;
            }
        }
        self.cache.invalidate(&[user_id]);
        Ok(removed)
    }

    pub async fn list_user_groups(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Group>, ServiceError> {
        let now = Utc::now();
        let mut groups = Vec::new();
        for membership in self.store.memberships_of(user_id).await? {
            if !membership.is_effective_at(now) {
                continue;
            }
            if let Some(group) = self.store.group(membership.group_id).await? {
                if group.organization_id == organization_id && group.is_active {
                    groups.push(group);
                }
            }
        }
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    pub async fn list_group_members(
        &self,
        group_id: Uuid,
    ) -> Result<Vec<GroupMembership>, ServiceError> {
        self.store.group_members(group_id).await
    }

    // ==================== Role assignments ====================

    /// Directly assign a role to a user. Only DIRECT rows are writable
    /// through this path; group-sourced rows are materialized by the
    /// membership machinery.
    pub async fn assign_role_to_user(
        &self,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<bool, ServiceError> {
        self.ensure_user(user_id).await?;
        let role = self
            .catalog
            .role(role_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Role {} not found", role_id)))?;
        let added = self
            .store
            .insert_user_role(UserRole::new(user_id, role.id, RoleSource::Direct))
            .await?;
        if added {
            self.cache.invalidate(&[user_id]);
        }
        Ok(added)
    }

    pub async fn remove_role_from_user(
        &self,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let removed = self
            .store
            .remove_user_role(user_id, role_id, Some(RoleSource::Direct))
            .await?;
        self.cache.invalidate(&[user_id]);
        Ok(removed > 0)
    }

    /// Attach a role to a group; materializes rows for current members
    /// and invalidates everyone the role can reach through inheritance.
    pub async fn assign_role_to_group(
        &self,
        group_id: Uuid,
        role_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let group = self
            .store
            .group(group_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Group {} not found", group_id)))?;
        self.catalog
            .role(role_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Role {} not found", role_id)))?;

        let added = self
            .store
            .add_group_role(GroupRole::new(group_id, role_id, group.organization_id))
            .await?;
        if added {
            let mut affected = Vec::new();
            for membership in self.store.group_members(group_id).await? {
                self.store
                    .insert_user_role(UserRole::new(
                        membership.principal_id,
                        role_id,
                        RoleSource::Group(group_id),
                    ))
                    .await?;
                affected.push(membership.principal_id);
            }
            for descendant in self.inheritance_descendants(group_id).await? {
                for membership in self.store.group_members(descendant).await? {
                    affected.push(membership.principal_id);
                }
            }
            self.cache.invalidate(&affected);
        }
        Ok(added)
    }

    /// Revoke a group role, cascade-deleting every `GROUP:<gid>` row it
    /// materialized for members.
    pub async fn remove_role_from_group(
        &self,
        group_id: Uuid,
        role_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let removed = self.store.remove_group_role(group_id, role_id).await?;
        let cascaded = self
            .store
            .remove_user_roles_by_source(RoleSource::Group(group_id), Some(role_id))
            .await?;

        let mut affected: Vec<Uuid> = cascaded.iter().map(|r| r.user_id).collect();
        for membership in self.store.group_members(group_id).await? {
            affected.push(membership.principal_id);
        }
        for descendant in self.inheritance_descendants(group_id).await? {
            for membership in self.store.group_members(descendant).await? {
                affected.push(membership.principal_id);
            }
        }
        affected.sort();
        affected.dedup();
        self.cache.invalidate(&affected);
        Ok(removed)
    }

    // ==================== Effective roles ====================

    /// Resolve the user's effective roles in an organization: direct
    /// assignments, group roles, inherited group roles, and every role
    /// ancestor, deduplicated by role id with the strongest source kept.
    pub async fn effective_roles(
        &self,
        organization_id: Option<Uuid>,
        user_id: Uuid,
    ) -> Result<Vec<EffectiveRole>, ServiceError> {
        let now = Utc::now();
        let mut collected: Vec<EffectiveRole> = Vec::new();

        // 1. Direct assignments.
        for row in self.store.user_roles(user_id).await? {
            if !row.is_active || row.source != RoleSource::Direct {
                continue;
            }
            if let Some(role) = self.catalog.role(row.role_id).await? {
                if role.is_active && role_applies(&role, organization_id) {
                    collected.push(EffectiveRole {
                        role,
                        source: RoleProvenance::Direct,
                    });
                }
            }
        }

        // 2 + 3. Group roles, including those inherited from ancestor groups.
        for membership in self.store.memberships_of(user_id).await? {
            if !membership.is_effective_at(now) {
                continue;
            }
            let Some(group) = self.store.group(membership.group_id).await? else {
                continue;
            };
            if !group.is_active {
                continue;
            }
            if let Some(org) = organization_id {
                if group.organization_id != org {
                    continue;
                }
            }

            self.collect_group_roles(
                group.id,
                RoleProvenance::GroupDirect(group.id),
                organization_id,
                now,
                &mut collected,
            )
            .await?;

            for ancestor_id in self.inheritance_closure(group.id).await? {
                let Some(ancestor) = self.store.group(ancestor_id).await? else {
                    continue;
                };
                if !ancestor.is_active {
                    continue;
                }
                self.collect_group_roles(
                    ancestor_id,
                    RoleProvenance::GroupInherited(ancestor_id),
                    organization_id,
                    now,
                    &mut collected,
                )
                .await?;
            }
        }

        // 4. Role hierarchy: every ancestor of a held role is held too.
        let mut index = 0;
        while index < collected.len() {
            let parent_id = collected[index].role.parent_id;
            let source = collected[index].source;
            if let Some(parent_id) = parent_id {
                let already = collected.iter().any(|e| e.role.id == parent_id);
                if !already {
                    if let Some(parent) = self.catalog.role(parent_id).await? {
                        if parent.is_active {
                            collected.push(EffectiveRole {
                                role: parent,
                                source,
                            });
                        }
                    }
                }
            }
            index += 1;
        }

        // Dedup by role id, keeping the strongest source.
        let mut best: HashMap<Uuid, EffectiveRole> = HashMap::new();
        for entry in collected {
            match best.get(&entry.role.id) {
                Some(current) if source_rank(current.source) <= source_rank(entry.source) => {}
                _ => {
                    best.insert(entry.role.id, entry);
                }
            }
        }
        let mut result: Vec<EffectiveRole> = best.into_values().collect();
        result.sort_by(|a, b| {
            source_rank(a.source)
                .cmp(&source_rank(b.source))
                .then(a.role.name.cmp(&b.role.name))
        });
        Ok(result)
    }

    async fn collect_group_roles(
        &self,
        group_id: Uuid,
        source: RoleProvenance,
        organization_id: Option<Uuid>,
        now: chrono::DateTime<Utc>,
        out: &mut Vec<EffectiveRole>,
    ) -> Result<(), ServiceError> {
        for group_role in self.store.group_roles(group_id).await? {
            if !group_role.is_effective_at(now) {
                continue;
            }
            if let Some(role) = self.catalog.role(group_role.role_id).await? {
                if role.is_active && role_applies(&role, organization_id) {
                    out.push(EffectiveRole { role, source });
                }
            }
        }
        Ok(())
    }

    /// Canonical permission names reachable through the user's effective
    /// roles. This is the reference computation the decision cache keeps
    /// snapshots of.
    pub async fn effective_permissions(
        &self,
        organization_id: Option<Uuid>,
        user_id: Uuid,
    ) -> Result<HashSet<String>, ServiceError> {
        let mut permissions = HashSet::new();
        for entry in self.effective_roles(organization_id, user_id).await? {
            for permission in self.catalog.store().role_permissions(entry.role.id).await? {
                permissions.insert(permission.name);
            }
        }
        Ok(permissions)
    }

    /// Every user whose effective role set contains the role: direct and
    /// materialized holders, members of groups that inherit the role, and
    /// holders of descendant roles.
    pub async fn users_with_effective_role(&self, role: &Role) -> Result<Vec<Uuid>, ServiceError> {
        let mut users: HashSet<Uuid> = self
            .store
            .users_with_role(role.id)
            .await?
            .into_iter()
            .collect();

        // Holders of descendant roles inherit this role through the
        // hierarchy.
        let all_roles = self
            .catalog
            .list_roles(crate::store::Page::new(1, 500))
            .await?;
        let mut descendant_ids = vec![role.id];
        let mut changed = true;
        while changed {
            changed = false;
            for candidate in &all_roles {
                if let Some(parent) = candidate.parent_id {
                    if descendant_ids.contains(&parent) && !descendant_ids.contains(&candidate.id) {
                        descendant_ids.push(candidate.id);
                        changed = true;
                    }
                }
            }
        }
        for role_id in descendant_ids.iter().skip(1) {
            for user in self.store.users_with_role(*role_id).await? {
                users.insert(user);
            }
        }

        let mut result: Vec<Uuid> = users.into_iter().collect();
        result.sort();
        Ok(result)
    }

    // ==================== Helpers ====================

    async fn ensure_org(&self, id: Uuid) -> Result<Organization, ServiceError> {
        self.store
            .organization(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Organization {} not found", id)))
    }

    async fn ensure_group(&self, id: Uuid) -> Result<Group, ServiceError> {
        self.store
            .group(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Group {} not found", id)))
    }

    async fn ensure_user(&self, id: Uuid) -> Result<(), ServiceError> {
        self.store
            .user(id)
            .await?
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotFound(format!("User {} not found", id)))
    }

    async fn invalidate_group_subtree(&self, group_id: Uuid) -> Result<(), ServiceError> {
        let mut affected = Vec::new();
        for membership in self.store.group_members(group_id).await? {
            affected.push(membership.principal_id);
        }
        for descendant in self.inheritance_descendants(group_id).await? {
            for membership in self.store.group_members(descendant).await? {
                affected.push(membership.principal_id);
            }
        }
        affected.sort();
        affected.dedup();
        self.cache.invalidate(&affected);
        Ok(())
    }
}

/// Whether a role is applicable inside the queried organization. GLOBAL
/// roles apply everywhere; ORG roles require a match; GROUP roles apply
/// wherever their group reaches.
fn role_applies(role: &Role, organization_id: Option<Uuid>) -> bool {
    match role.scope {
        RoleScope::Global => true,
        RoleScope::Org => match (role.organization_id, organization_id) {
            (Some(role_org), Some(org)) => role_org == org,
            (None, _) => true,
            (Some(_), None) => false,
        },
        RoleScope::Group => true,
    }
}

/// Lower is stronger: DIRECT beats GROUP_DIRECT beats GROUP_INHERITED.
fn source_rank(source: RoleProvenance) -> u8 {
    match source {
        RoleProvenance::Direct => 0,
        RoleProvenance::GroupDirect(_) => 1,
        RoleProvenance::GroupInherited(_) => 2,
    }
}
