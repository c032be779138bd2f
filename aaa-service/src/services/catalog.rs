//! Catalog service: actions, resources, permissions, roles, bindings,
//! column groups, and idempotent seeding.

use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{
    Action, ColumnGroup, Permission, Resource, Role, RoleScope, canonical_permission,
    normalize_permission_name,
};
use crate::services::cache::DecisionCache;
use crate::services::error::ServiceError;
use crate::store::{CatalogStore, Page, PrincipalStore};

/// Upper bound on ancestor walks; anything deeper is treated as a cycle.
const MAX_ANCESTOR_DEPTH: usize = 64;

#[derive(Clone)]
pub struct CatalogService {
    store: Arc<dyn CatalogStore>,
    principals: Arc<dyn PrincipalStore>,
    cache: Arc<DecisionCache>,
}

/// Counts reported by `seed`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SeedOutcome {
    pub roles: usize,
    pub permissions: usize,
    pub resources: usize,
    pub actions: usize,
    pub created_role_names: Vec<String>,
}

/// Declarative seed content applied per service.
#[derive(Debug, Clone)]
pub struct SeedDefinition {
    pub resources: Vec<&'static str>,
    pub actions: Vec<&'static str>,
    /// role name -> granted (resource, action) pairs; `None` grants the
    /// full resource/action grid.
    pub roles: Vec<SeedRole>,
}

#[derive(Debug, Clone)]
pub struct SeedRole {
    pub name: &'static str,
    pub grants: SeedGrants,
}

#[derive(Debug, Clone)]
pub enum SeedGrants {
    /// Every resource crossed with every action.
    All,
    /// Every resource crossed with the listed actions.
    Actions(&'static [&'static str]),
    /// Explicit (resource, action) pairs.
    Pairs(&'static [(&'static str, &'static str)]),
}

impl SeedDefinition {
    /// Built-in seed applied when a service has no bespoke definition.
    pub fn default_for_service() -> Self {
        Self {
            resources: vec![
                "farmers",
                "crops",
                "documents",
                "schemes",
                "catalog",
                "users",
                "groups",
                "reports",
            ],
            actions: vec![
                "create", "read", "update", "delete", "list", "approve", "export", "assign",
                "seed",
            ],
            roles: vec![
                SeedRole {
                    name: "farmer",
                    grants: SeedGrants::Pairs(&[
                        ("farmers", "read"),
                        ("farmers", "update"),
                        ("crops", "read"),
                        ("crops", "list"),
                        ("documents", "create"),
                        ("documents", "read"),
                        ("schemes", "read"),
                        ("schemes", "list"),
                    ]),
                },
                SeedRole {
                    name: "kisansathi",
                    grants: SeedGrants::Pairs(&[
                        ("farmers", "create"),
                        ("farmers", "read"),
                        ("farmers", "update"),
                        ("farmers", "list"),
                        ("crops", "read"),
                        ("crops", "list"),
                        ("documents", "create"),
                        ("documents", "read"),
                        ("documents", "list"),
                        ("schemes", "read"),
                        ("schemes", "list"),
                        ("schemes", "assign"),
                    ]),
                },
                SeedRole {
                    name: "CEO",
                    grants: SeedGrants::Actions(&["read", "list", "approve", "export"]),
                },
                SeedRole {
                    name: "fpo_manager",
                    grants: SeedGrants::Actions(&[
                        "create", "read", "update", "list", "approve", "assign",
                    ]),
                },
                SeedRole {
                    name: "admin",
                    grants: SeedGrants::All,
                },
                SeedRole {
                    name: "readonly",
                    grants: SeedGrants::Actions(&["read", "list"]),
                },
            ],
        }
    }
}

impl CatalogService {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        principals: Arc<dyn PrincipalStore>,
        cache: Arc<DecisionCache>,
    ) -> Self {
        Self {
            store,
            principals,
            cache,
        }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    // ==================== Actions ====================

    pub async fn register_action(
        &self,
        name: &str,
        description: Option<String>,
        service_id: Option<String>,
        is_static: bool,
    ) -> Result<Action, ServiceError> {
        let name = name.trim().to_lowercase();
        if name.is_empty() || name.contains(':') {
            return Err(ServiceError::Validation(format!(
                "Invalid action name: {:?}",
                name
            )));
        }
        if let Some(existing) = self.store.action_by_name(service_id.as_deref(), &name).await? {
            if existing.is_static {
                return Err(ServiceError::Immutable(format!(
                    "Action {} is built-in and cannot be redefined",
                    name
                )));
            }
        }
        let mut action = Action::new(name, service_id);
        action.description = description;
        action.is_static = is_static;
        let (action, _) = self.store.upsert_action(action, true).await?;
        Ok(action)
    }

    pub async fn list_actions(&self, page: Page) -> Result<Vec<Action>, ServiceError> {
        self.store.list_actions(page).await
    }

    // ==================== Resources ====================

    pub async fn register_resource(
        &self,
        name: &str,
        resource_type: &str,
        description: Option<String>,
        parent_id: Option<Uuid>,
    ) -> Result<Resource, ServiceError> {
        let name = name.trim().to_lowercase();
        if name.is_empty() || name.contains(':') {
            return Err(ServiceError::Validation(format!(
                "Invalid resource name: {:?}",
                name
            )));
        }
        let mut resource = Resource::new(name, resource_type.trim().to_lowercase());
        resource.description = description;
        let (resource, created) = self.store.upsert_resource(resource, true).await?;
        if let Some(parent) = parent_id {
            self.set_resource_parent(resource.id, Some(parent)).await?;
            return Ok(Resource {
                parent_id: Some(parent),
                ..resource
            });
        }
        let _ = created;
        Ok(resource)
    }

    pub async fn set_resource_parent(
        &self,
        id: Uuid,
        parent_id: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        if let Some(parent) = parent_id {
            if parent == id {
                return Err(ServiceError::Cycle(format!("Resource {} cannot parent itself", id)));
            }
            // Walk up from the new parent; finding `id` means a cycle.
            let mut cursor = Some(parent);
            let mut depth = 0;
            while let Some(current) = cursor {
                if depth >= MAX_ANCESTOR_DEPTH {
                    return Err(ServiceError::Cycle(format!(
                        "Resource ancestry deeper than {}",
                        MAX_ANCESTOR_DEPTH
                    )));
                }
                if current == id {
                    return Err(ServiceError::Cycle(format!(
                        "Resource {} is an ancestor of itself",
                        id
                    )));
                }
                let node = self
                    .store
                    .resource(current)
                    .await?
                    .ok_or_else(|| ServiceError::NotFound(format!("Resource {} not found", current)))?;
                cursor = node.parent_id;
                depth += 1;
            }
        }
        self.store.set_resource_parent(id, parent_id).await
    }

    pub async fn resource(&self, id: Uuid) -> Result<Option<Resource>, ServiceError> {
        self.store.resource(id).await
    }

    pub async fn resource_by_name(&self, name: &str) -> Result<Option<Resource>, ServiceError> {
        self.store.resource_by_name(name).await
    }

    /// Ancestor ids of a resource, nearest first.
    pub async fn resource_ancestors(&self, id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        let mut ancestors = Vec::new();
        let Some(resource) = self.store.resource(id).await? else {
            return Ok(ancestors);
        };
        let mut cursor = resource.parent_id;
        while let Some(current) = cursor {
            if ancestors.len() >= MAX_ANCESTOR_DEPTH || ancestors.contains(&current) {
                break;
            }
            ancestors.push(current);
            cursor = self
                .store
                .resource(current)
                .await?
                .and_then(|r| r.parent_id);
        }
        Ok(ancestors)
    }

    pub async fn list_resources(
        &self,
        resource_type: Option<&str>,
        page: Page,
    ) -> Result<Vec<Resource>, ServiceError> {
        self.store.list_resources(resource_type, page).await
    }

    // ==================== Permissions ====================

    pub async fn create_permission(
        &self,
        name: &str,
        description: Option<String>,
    ) -> Result<Permission, ServiceError> {
        let canonical = normalize_permission_name(name)
            .ok_or_else(|| ServiceError::InvalidPermissionFormat(name.to_string()))?;
        let (resource_side, action_side) = canonical
            .split_once(':')
            .expect("normalized name always has both sides");

        let mut permission = Permission::new(canonical.clone());
        permission.description = description;
        if resource_side != "*" {
            permission.resource_id = self
                .store
                .resource_by_name(resource_side)
                .await?
                .map(|r| r.id);
        }
        if action_side != "*" {
            permission.action_id = self
                .store
                .action_by_name(None, action_side)
                .await?
                .map(|a| a.id);
        }
        let (permission, _) = self.store.upsert_permission(permission, false).await?;
        Ok(permission)
    }

    pub async fn list_permissions(&self, page: Page) -> Result<Vec<Permission>, ServiceError> {
        self.store.list_permissions(page).await
    }

    // ==================== Roles ====================

    pub async fn create_role(
        &self,
        name: &str,
        scope: RoleScope,
        description: Option<String>,
        parent_id: Option<Uuid>,
        organization_id: Option<Uuid>,
    ) -> Result<Role, ServiceError> {
        let mut role = Role::new(name.trim(), scope);
        role.description = description;
        role.organization_id = organization_id;
        if let Some(parent) = parent_id {
            self.ensure_role_parent_acyclic(role.id, parent).await?;
            role.parent_id = Some(parent);
        }
        let (role, _) = self.store.upsert_role(role, false).await?;
        Ok(role)
    }

    /// Optimistic role update; bumps the stored version, rejecting stale
    /// writers, and invalidates every principal that can see the role.
    pub async fn update_role(&self, role: Role) -> Result<Role, ServiceError> {
        if let Some(parent) = role.parent_id {
            self.ensure_role_parent_acyclic(role.id, parent).await?;
        }
        let updated = self.store.update_role(role).await?;
        self.invalidate_role_holders(updated.id).await?;
        Ok(updated)
    }

    async fn ensure_role_parent_acyclic(&self, role_id: Uuid, parent: Uuid) -> Result<(), ServiceError> {
        if parent == role_id {
            return Err(ServiceError::Cycle(format!("Role {} cannot parent itself", role_id)));
        }
        let mut cursor = Some(parent);
        let mut depth = 0;
        while let Some(current) = cursor {
            if depth >= MAX_ANCESTOR_DEPTH {
                return Err(ServiceError::Cycle(format!(
                    "Role ancestry deeper than {}",
                    MAX_ANCESTOR_DEPTH
                )));
            }
            if current == role_id {
                return Err(ServiceError::Cycle(format!(
                    "Role {} is an ancestor of itself",
                    role_id
                )));
            }
            let node = self
                .store
                .role(current)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Role {} not found", current)))?;
            cursor = node.parent_id;
            depth += 1;
        }
        Ok(())
    }

    pub async fn role(&self, id: Uuid) -> Result<Option<Role>, ServiceError> {
        self.store.role(id).await
    }

    pub async fn role_by_name(&self, name: &str) -> Result<Option<Role>, ServiceError> {
        self.store.role_by_name(name).await
    }

    pub async fn list_roles(&self, page: Page) -> Result<Vec<Role>, ServiceError> {
        self.store.list_roles(page).await
    }

    /// Permissions bound to a role, including those inherited through the
    /// role hierarchy.
    pub async fn role_permissions_with_ancestors(
        &self,
        role_id: Uuid,
    ) -> Result<Vec<Permission>, ServiceError> {
        let mut seen = HashSet::new();
        let mut permissions = Vec::new();
        let mut cursor = Some(role_id);
        let mut depth = 0;
        while let Some(current) = cursor {
            if depth >= MAX_ANCESTOR_DEPTH || !seen.insert(current) {
                break;
            }
            for permission in self.store.role_permissions(current).await? {
                if permissions.iter().all(|p: &Permission| p.id != permission.id) {
                    permissions.push(permission);
                }
            }
            cursor = self.store.role(current).await?.and_then(|r| r.parent_id);
            depth += 1;
        }
        Ok(permissions)
    }

    pub async fn attach_permissions(
        &self,
        role_id: Uuid,
        permission_names: &[String],
    ) -> Result<usize, ServiceError> {
        let mut attached = 0;
        for name in permission_names {
            let canonical = normalize_permission_name(name)
                .ok_or_else(|| ServiceError::InvalidPermissionFormat(name.clone()))?;
            let permission = match self.store.permission_by_name(&canonical).await? {
                Some(p) => p,
                None => self.create_permission(&canonical, None).await?,
            };
            if self.store.attach_permission(role_id, permission.id).await? {
                attached += 1;
            }
        }
        if attached > 0 {
            self.invalidate_role_holders(role_id).await?;
        }
        Ok(attached)
    }

    // ==================== Column groups ====================

    pub async fn register_column_group(
        &self,
        name: &str,
        table_name: &str,
        columns: Vec<String>,
    ) -> Result<ColumnGroup, ServiceError> {
        if columns.is_empty() {
            return Err(ServiceError::Validation(
                "Column group needs at least one column".to_string(),
            ));
        }
        let group = ColumnGroup::new(name.trim(), table_name.trim().to_lowercase(), columns);
        let (group, _) = self.store.upsert_column_group(group, true).await?;
        Ok(group)
    }

    pub async fn attach_column_group(
        &self,
        role_id: Uuid,
        column_group_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let attached = self.store.attach_column_group(role_id, column_group_id).await?;
        if attached {
            self.invalidate_role_holders(role_id).await?;
        }
        Ok(attached)
    }

    pub async fn role_column_groups(
        &self,
        role_ids: &[Uuid],
        table: &str,
    ) -> Result<Vec<ColumnGroup>, ServiceError> {
        self.store.role_column_groups(role_ids, table).await
    }

    // ==================== Seeding ====================

    /// Apply the built-in seed for a service. Idempotent: a second run
    /// with `force=false` creates nothing; `force=true` refreshes mutable
    /// fields but never changes ids.
    pub async fn seed(&self, service_id: &str, force: bool) -> Result<SeedOutcome, ServiceError> {
        let service_id = service_id.trim();
        if service_id.is_empty() {
            return Err(ServiceError::Validation("service_id must not be empty".to_string()));
        }
        let definition = SeedDefinition::default_for_service();

        let mut outcome = SeedOutcome {
            roles: 0,
            permissions: 0,
            resources: 0,
            actions: 0,
            created_role_names: Vec::new(),
        };

        for action_name in &definition.actions {
            let action = Action::builtin(*action_name, Some(service_id.to_string()));
            let (_, created) = self.store.upsert_action(action, force).await?;
            if created {
                outcome.actions += 1;
            }
        }

        for resource_name in &definition.resources {
            let resource = Resource::new(*resource_name, *resource_name);
            let (_, created) = self.store.upsert_resource(resource, force).await?;
            if created {
                outcome.resources += 1;
            }
        }

        for resource_name in &definition.resources {
            for action_name in &definition.actions {
                let canonical = canonical_permission(resource_name, action_name);
                let permission = Permission::new(canonical);
                let (_, created) = self.store.upsert_permission(permission, force).await?;
                if created {
                    outcome.permissions += 1;
                }
            }
        }

        let mut affected_roles = Vec::new();
        for seed_role in &definition.roles {
            let role = Role::new(seed_role.name, RoleScope::Global);
            let (role, created) = self.store.upsert_role(role, force).await?;
            if created {
                outcome.roles += 1;
                outcome.created_role_names.push(role.name.clone());
            }
            affected_roles.push(role.id);

            let grants: Vec<String> = match &seed_role.grants {
                SeedGrants::All => definition
                    .resources
                    .iter()
                    .flat_map(|r| {
                        definition
                            .actions
                            .iter()
                            .map(move |a| canonical_permission(r, a))
                    })
                    .collect(),
                SeedGrants::Actions(actions) => definition
                    .resources
                    .iter()
                    .flat_map(|r| actions.iter().map(move |a| canonical_permission(r, a)))
                    .collect(),
                SeedGrants::Pairs(pairs) => pairs
                    .iter()
                    .map(|(r, a)| canonical_permission(r, a))
                    .collect(),
            };
            for canonical in grants {
                let permission = self
                    .store
                    .permission_by_name(&canonical)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::Internal(anyhow::anyhow!(
                            "Seed permission {} missing after upsert",
                            canonical
                        ))
                    })?;
                self.store.attach_permission(role.id, permission.id).await?;
            }
        }

        for role_id in affected_roles {
            self.invalidate_role_holders(role_id).await?;
        }

        tracing::info!(
            service_id = %service_id,
            roles = outcome.roles,
            permissions = outcome.permissions,
            resources = outcome.resources,
            actions = outcome.actions,
            "catalog seed applied"
        );
        Ok(outcome)
    }

    // ==================== Invalidation ====================

    /// Invalidate after a change to a role's reachable permission set.
    /// Role hierarchy and group inheritance can carry a role to
    /// principals the catalog cannot enumerate, so the whole cache is
    /// flushed; direct and materialized holders are named for the log.
    async fn invalidate_role_holders(&self, role_id: Uuid) -> Result<(), ServiceError> {
        let holders = self.principals.users_with_role(role_id).await?;
        self.cache.invalidate_all();
        tracing::debug!(
            role_id = %role_id,
            direct_holders = holders.len(),
            "decision cache flushed after catalog change"
        );
        Ok(())
    }
}
