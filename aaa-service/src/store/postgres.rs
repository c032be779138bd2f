//! PostgreSQL store implementation.
//!
//! Runtime-bound sqlx queries; the schema lives in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use uuid::Uuid;

use crate::models::{
    Action, ActorKind, AuditQuery, AuditRecord, ColumnGroup, Group, GroupInheritance,
    GroupMembership, GroupRole, IssuedToken, Organization, OrgMembership, Permission, Resource,
    Role, RoleScope, RoleSource, ServiceAccount, User, UserRole,
};
use crate::services::error::ServiceError;
use crate::store::{AuditStore, CatalogStore, Page, PrincipalStore, TokenStore};

type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn parse_role(row: &PgRow) -> Result<Role> {
    let scope: String = row.try_get("scope")?;
    Ok(Role {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        scope: scope
            .parse::<RoleScope>()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!(e)))?,
        is_active: row.try_get("is_active")?,
        version: row.try_get("version")?,
        parent_id: row.try_get("parent_id")?,
        organization_id: row.try_get("organization_id")?,
        group_id: row.try_get("group_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_user(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        phone: row.try_get("phone")?,
        country_code: row.try_get("country_code")?,
        is_validated: row.try_get("is_validated")?,
        has_mpin: row.try_get("has_mpin")?,
        password_hash: row.try_get("password_hash")?,
        mpin_hash: row.try_get("mpin_hash")?,
        organization_id: row.try_get("organization_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_user_role(row: &PgRow) -> Result<UserRole> {
    let source: String = row.try_get("source")?;
    Ok(UserRole {
        user_id: row.try_get("user_id")?,
        role_id: row.try_get("role_id")?,
        is_active: row.try_get("is_active")?,
        source: source
            .parse::<RoleSource>()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!(e)))?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_audit_record(row: &PgRow) -> Result<AuditRecord> {
    let kind: String = row.try_get("actor_kind")?;
    let actor_kind = match kind.as_str() {
        "user" => ActorKind::User,
        "service" => ActorKind::Service,
        "system" => ActorKind::System,
        other => {
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "Unknown actor kind: {}",
                other
            )));
        }
    };
    Ok(AuditRecord {
        id: row.try_get("id")?,
        ts: row.try_get("ts")?,
        actor_id: row.try_get("actor_id")?,
        actor_kind,
        organization_id: row.try_get("organization_id")?,
        action: row.try_get("action")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        success: row.try_get("success")?,
        reason: row.try_get("reason")?,
        details: row.try_get("details")?,
        prev_hash: row.try_get("prev_hash")?,
        self_hash: row.try_get("self_hash")?,
    })
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn upsert_action(&self, action: Action, refresh: bool) -> Result<(Action, bool)> {
        let existing = self
            .action_by_name(action.service_id.as_deref(), &action.name)
            .await?;
        if let Some(mut found) = existing {
            if refresh {
                sqlx::query("UPDATE actions SET description = $1 WHERE id = $2")
                    .bind(&action.description)
                    .bind(found.id)
                    .execute(&self.pool)
                    .await?;
                found.description = action.description;
            }
            return Ok((found, false));
        }
        sqlx::query(
            r#"
            INSERT INTO actions (id, name, description, is_static, service_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(action.id)
        .bind(&action.name)
        .bind(&action.description)
        .bind(action.is_static)
        .bind(&action.service_id)
        .bind(action.created_at)
        .execute(&self.pool)
        .await?;
        Ok((action, true))
    }

    async fn action_by_name(
        &self,
        service_id: Option<&str>,
        name: &str,
    ) -> Result<Option<Action>> {
        Ok(sqlx::query_as::<_, Action>(
            "SELECT * FROM actions WHERE name = $1 AND service_id IS NOT DISTINCT FROM $2",
        )
        .bind(name)
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_actions(&self, page: Page) -> Result<Vec<Action>> {
        Ok(sqlx::query_as::<_, Action>(
            "SELECT * FROM actions ORDER BY created_at, name LIMIT $1 OFFSET $2",
        )
        .bind(page.limit() as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn upsert_resource(&self, resource: Resource, refresh: bool) -> Result<(Resource, bool)> {
        if let Some(mut found) = self.resource_by_name(&resource.name).await? {
            if refresh {
                sqlx::query("UPDATE resources SET description = $1, is_active = $2 WHERE id = $3")
                    .bind(&resource.description)
                    .bind(resource.is_active)
                    .bind(found.id)
                    .execute(&self.pool)
                    .await?;
                found.description = resource.description;
                found.is_active = resource.is_active;
            }
            return Ok((found, false));
        }
        sqlx::query(
            r#"
            INSERT INTO resources (id, name, resource_type, description, parent_id, owner_id, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(resource.id)
        .bind(&resource.name)
        .bind(&resource.resource_type)
        .bind(&resource.description)
        .bind(resource.parent_id)
        .bind(resource.owner_id)
        .bind(resource.is_active)
        .bind(resource.created_at)
        .execute(&self.pool)
        .await?;
        Ok((resource, true))
    }

    async fn resource(&self, id: Uuid) -> Result<Option<Resource>> {
        Ok(
            sqlx::query_as::<_, Resource>("SELECT * FROM resources WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn resource_by_name(&self, name: &str) -> Result<Option<Resource>> {
        Ok(
            sqlx::query_as::<_, Resource>("SELECT * FROM resources WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_resources(
        &self,
        resource_type: Option<&str>,
        page: Page,
    ) -> Result<Vec<Resource>> {
        Ok(sqlx::query_as::<_, Resource>(
            r#"
            SELECT * FROM resources
            WHERE $1::text IS NULL OR resource_type = $1
            ORDER BY created_at, name LIMIT $2 OFFSET $3
            "#,
        )
        .bind(resource_type)
        .bind(page.limit() as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn set_resource_parent(&self, id: Uuid, parent_id: Option<Uuid>) -> Result<()> {
        let result = sqlx::query("UPDATE resources SET parent_id = $1 WHERE id = $2")
            .bind(parent_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound(format!("Resource {} not found", id)));
        }
        Ok(())
    }

    async fn upsert_permission(
        &self,
        permission: Permission,
        refresh: bool,
    ) -> Result<(Permission, bool)> {
        if let Some(mut found) = self.permission_by_name(&permission.name).await? {
            if refresh {
                sqlx::query("UPDATE permissions SET description = $1 WHERE id = $2")
                    .bind(&permission.description)
                    .bind(found.id)
                    .execute(&self.pool)
                    .await?;
                found.description = permission.description;
            }
            return Ok((found, false));
        }
        sqlx::query(
            r#"
            INSERT INTO permissions (id, name, description, resource_id, action_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(permission.id)
        .bind(&permission.name)
        .bind(&permission.description)
        .bind(permission.resource_id)
        .bind(permission.action_id)
        .bind(permission.created_at)
        .execute(&self.pool)
        .await?;
        Ok((permission, true))
    }

    async fn permission(&self, id: Uuid) -> Result<Option<Permission>> {
        Ok(
            sqlx::query_as::<_, Permission>("SELECT * FROM permissions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn permission_by_name(&self, name: &str) -> Result<Option<Permission>> {
        Ok(
            sqlx::query_as::<_, Permission>("SELECT * FROM permissions WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_permissions(&self, page: Page) -> Result<Vec<Permission>> {
        Ok(sqlx::query_as::<_, Permission>(
            "SELECT * FROM permissions ORDER BY name LIMIT $1 OFFSET $2",
        )
        .bind(page.limit() as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn upsert_role(&self, role: Role, refresh: bool) -> Result<(Role, bool)> {
        if let Some(mut found) = self.role_by_name(&role.name).await? {
            if refresh {
                sqlx::query(
                    "UPDATE roles SET description = $1, is_active = $2, version = version + 1 WHERE id = $3",
                )
                .bind(&role.description)
                .bind(role.is_active)
                .bind(found.id)
                .execute(&self.pool)
                .await?;
                found.description = role.description;
                found.is_active = role.is_active;
                found.version += 1;
            }
            return Ok((found, false));
        }
        sqlx::query(
            r#"
            INSERT INTO roles (id, name, description, scope, is_active, version, parent_id, organization_id, group_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(role.id)
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.scope.to_string())
        .bind(role.is_active)
        .bind(role.version)
        .bind(role.parent_id)
        .bind(role.organization_id)
        .bind(role.group_id)
        .bind(role.created_at)
        .execute(&self.pool)
        .await?;
        Ok((role, true))
    }

    async fn update_role(&self, role: Role) -> Result<Role> {
        let result = sqlx::query(
            r#"
            UPDATE roles
            SET name = $1, description = $2, scope = $3, is_active = $4,
                parent_id = $5, organization_id = $6, group_id = $7, version = version + 1
            WHERE id = $8 AND version = $9
            "#,
        )
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.scope.to_string())
        .bind(role.is_active)
        .bind(role.parent_id)
        .bind(role.organization_id)
        .bind(role.group_id)
        .bind(role.id)
        .bind(role.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual = self
                .role(role.id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Role {} not found", role.id)))?;
            return Err(ServiceError::VersionConflict {
                expected: role.version,
                actual: actual.version,
            });
        }
        let mut updated = role;
        updated.version += 1;
        Ok(updated)
    }

    async fn role(&self, id: Uuid) -> Result<Option<Role>> {
        let row = sqlx::query("SELECT * FROM roles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_role(&r)).transpose()
    }

    async fn role_by_name(&self, name: &str) -> Result<Option<Role>> {
        let row = sqlx::query("SELECT * FROM roles WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_role(&r)).transpose()
    }

    async fn list_roles(&self, page: Page) -> Result<Vec<Role>> {
        let rows = sqlx::query("SELECT * FROM roles ORDER BY created_at, name LIMIT $1 OFFSET $2")
            .bind(page.limit() as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_role).collect()
    }

    async fn attach_permission(&self, role_id: Uuid, permission_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO role_permissions (role_id, permission_id)
            VALUES ($1, $2) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(role_id)
        .bind(permission_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<Permission>> {
        Ok(sqlx::query_as::<_, Permission>(
            r#"
            SELECT p.* FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            WHERE rp.role_id = $1
            ORDER BY p.name
            "#,
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn upsert_column_group(
        &self,
        group: ColumnGroup,
        refresh: bool,
    ) -> Result<(ColumnGroup, bool)> {
        let existing = sqlx::query(
            "SELECT * FROM column_groups WHERE name = $1 AND table_name = $2",
        )
        .bind(&group.name)
        .bind(&group.table_name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            let mut found = ColumnGroup {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                table_name: row.try_get("table_name")?,
                columns: row.try_get("columns")?,
                created_at: row.try_get("created_at")?,
            };
            if refresh {
                sqlx::query("UPDATE column_groups SET columns = $1 WHERE id = $2")
                    .bind(&group.columns)
                    .bind(found.id)
                    .execute(&self.pool)
                    .await?;
                found.columns = group.columns;
            }
            return Ok((found, false));
        }

        sqlx::query(
            r#"
            INSERT INTO column_groups (id, name, table_name, columns, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(group.id)
        .bind(&group.name)
        .bind(&group.table_name)
        .bind(&group.columns)
        .bind(group.created_at)
        .execute(&self.pool)
        .await?;
        Ok((group, true))
    }

    async fn attach_column_group(&self, role_id: Uuid, column_group_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO role_column_groups (role_id, column_group_id)
            VALUES ($1, $2) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(role_id)
        .bind(column_group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn role_column_groups(&self, role_ids: &[Uuid], table: &str) -> Result<Vec<ColumnGroup>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT cg.* FROM column_groups cg
            JOIN role_column_groups rcg ON rcg.column_group_id = cg.id
            WHERE rcg.role_id = ANY($1) AND cg.table_name = $2
            ORDER BY cg.name
            "#,
        )
        .bind(role_ids.to_vec())
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ColumnGroup {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    table_name: row.try_get("table_name")?,
                    columns: row.try_get("columns")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl PrincipalStore for PgStore {
    async fn insert_user(&self, user: User) -> Result<User> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, phone, country_code, is_validated, has_mpin,
                               password_hash, mpin_hash, organization_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.phone)
        .bind(&user.country_code)
        .bind(user.is_validated)
        .bind(user.has_mpin)
        .bind(&user.password_hash)
        .bind(&user.mpin_hash)
        .bind(user.organization_id)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                ServiceError::Conflict("User already exists".to_string())
            }
            other => ServiceError::Database(other),
        })?;
        Ok(user)
    }

    async fn user(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_user(&r)).transpose()
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_user(&r)).transpose()
    }

    async fn user_by_phone(&self, country_code: &str, phone: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE country_code = $1 AND phone = $2")
            .bind(country_code)
            .bind(phone)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_user(&r)).transpose()
    }

    async fn update_user(&self, user: User) -> Result<User> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET username = $1, is_validated = $2, has_mpin = $3,
                password_hash = $4, mpin_hash = $5, organization_id = $6
            WHERE id = $7
            "#,
        )
        .bind(&user.username)
        .bind(user.is_validated)
        .bind(user.has_mpin)
        .bind(&user.password_hash)
        .bind(&user.mpin_hash)
        .bind(user.organization_id)
        .bind(user.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound(format!("User {} not found", user.id)));
        }
        Ok(user)
    }

    async fn insert_service_account(&self, account: ServiceAccount) -> Result<ServiceAccount> {
        sqlx::query(
            r#"
            INSERT INTO service_accounts (id, name, api_key_hash, is_active, organization_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(account.id)
        .bind(&account.name)
        .bind(&account.api_key_hash)
        .bind(account.is_active)
        .bind(account.organization_id)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                ServiceError::Conflict(format!("Service {} already exists", account.name))
            }
            other => ServiceError::Database(other),
        })?;
        Ok(account)
    }

    async fn service_account_by_name(&self, name: &str) -> Result<Option<ServiceAccount>> {
        let row = sqlx::query("SELECT * FROM service_accounts WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(ServiceAccount {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
                api_key_hash: r.try_get("api_key_hash")?,
                is_active: r.try_get("is_active")?,
                organization_id: r.try_get("organization_id")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn insert_organization(&self, org: Organization) -> Result<Organization> {
        sqlx::query(
            "INSERT INTO organizations (id, name, is_active, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(org.id)
        .bind(&org.name)
        .bind(org.is_active)
        .bind(org.created_at)
        .execute(&self.pool)
        .await?;
        Ok(org)
    }

    async fn organization(&self, id: Uuid) -> Result<Option<Organization>> {
        let row = sqlx::query("SELECT * FROM organizations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(Organization {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
                is_active: r.try_get("is_active")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn organizations_for_user(&self, user_id: Uuid) -> Result<Vec<Organization>> {
        let rows = sqlx::query(
            r#"
            SELECT o.* FROM organizations o
            JOIN org_memberships m ON m.organization_id = o.id
            WHERE m.user_id = $1 AND m.is_active
            ORDER BY o.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(Organization {
                    id: r.try_get("id")?,
                    name: r.try_get("name")?,
                    is_active: r.try_get("is_active")?,
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn add_org_member(&self, membership: OrgMembership) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO org_memberships (organization_id, user_id, is_active, created_at)
            VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(membership.organization_id)
        .bind(membership.user_id)
        .bind(membership.is_active)
        .bind(membership.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_org_member(&self, organization_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM org_memberships WHERE organization_id = $1 AND user_id = $2")
                .bind(organization_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn org_members(&self, organization_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT user_id FROM org_memberships WHERE organization_id = $1 AND is_active",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get("user_id").map_err(ServiceError::from))
            .collect()
    }

    async fn insert_group(&self, group: Group) -> Result<Group> {
        sqlx::query(
            r#"
            INSERT INTO groups (id, name, organization_id, parent_id, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(group.id)
        .bind(&group.name)
        .bind(group.organization_id)
        .bind(group.parent_id)
        .bind(group.is_active)
        .bind(group.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                ServiceError::Conflict(format!("Group {} already exists in organization", group.name))
            }
            other => ServiceError::Database(other),
        })?;
        Ok(group)
    }

    async fn group(&self, id: Uuid) -> Result<Option<Group>> {
        let row = sqlx::query("SELECT * FROM groups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(Group {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
                organization_id: r.try_get("organization_id")?,
                parent_id: r.try_get("parent_id")?,
                is_active: r.try_get("is_active")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn groups_in_org(&self, organization_id: Uuid) -> Result<Vec<Group>> {
        let rows = sqlx::query("SELECT * FROM groups WHERE organization_id = $1 ORDER BY name")
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                Ok(Group {
                    id: r.try_get("id")?,
                    name: r.try_get("name")?,
                    organization_id: r.try_get("organization_id")?,
                    parent_id: r.try_get("parent_id")?,
                    is_active: r.try_get("is_active")?,
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn add_group_inheritance(&self, edge: GroupInheritance) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO group_inheritance (ancestor_id, descendant_id)
            VALUES ($1, $2) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(edge.ancestor_id)
        .bind(edge.descendant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_group_inheritance(
        &self,
        ancestor_id: Uuid,
        descendant_id: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM group_inheritance WHERE ancestor_id = $1 AND descendant_id = $2",
        )
        .bind(ancestor_id)
        .bind(descendant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn inheritance_ancestors_of(&self, group_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT ancestor_id FROM group_inheritance WHERE descendant_id = $1")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get("ancestor_id").map_err(ServiceError::from))
            .collect()
    }

    async fn add_membership(&self, membership: GroupMembership) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO group_memberships (group_id, principal_id, is_active, starts_at, ends_at)
            VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(membership.group_id)
        .bind(membership.principal_id)
        .bind(membership.is_active)
        .bind(membership.starts_at)
        .bind(membership.ends_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_membership(&self, group_id: Uuid, principal_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM group_memberships WHERE group_id = $1 AND principal_id = $2",
        )
        .bind(group_id)
        .bind(principal_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn memberships_of(&self, principal_id: Uuid) -> Result<Vec<GroupMembership>> {
        let rows = sqlx::query("SELECT * FROM group_memberships WHERE principal_id = $1")
            .bind(principal_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                Ok(GroupMembership {
                    group_id: r.try_get("group_id")?,
                    principal_id: r.try_get("principal_id")?,
                    is_active: r.try_get("is_active")?,
                    starts_at: r.try_get("starts_at")?,
                    ends_at: r.try_get("ends_at")?,
                })
            })
            .collect()
    }

    async fn group_members(&self, group_id: Uuid) -> Result<Vec<GroupMembership>> {
        let rows = sqlx::query("SELECT * FROM group_memberships WHERE group_id = $1")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                Ok(GroupMembership {
                    group_id: r.try_get("group_id")?,
                    principal_id: r.try_get("principal_id")?,
                    is_active: r.try_get("is_active")?,
                    starts_at: r.try_get("starts_at")?,
                    ends_at: r.try_get("ends_at")?,
                })
            })
            .collect()
    }

    async fn add_group_role(&self, group_role: GroupRole) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO group_roles (group_id, role_id, organization_id, is_active, starts_at, ends_at)
            VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(group_role.group_id)
        .bind(group_role.role_id)
        .bind(group_role.organization_id)
        .bind(group_role.is_active)
        .bind(group_role.starts_at)
        .bind(group_role.ends_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_group_role(&self, group_id: Uuid, role_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM group_roles WHERE group_id = $1 AND role_id = $2")
            .bind(group_id)
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn group_roles(&self, group_id: Uuid) -> Result<Vec<GroupRole>> {
        let rows = sqlx::query("SELECT * FROM group_roles WHERE group_id = $1")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                Ok(GroupRole {
                    group_id: r.try_get("group_id")?,
                    role_id: r.try_get("role_id")?,
                    organization_id: r.try_get("organization_id")?,
                    is_active: r.try_get("is_active")?,
                    starts_at: r.try_get("starts_at")?,
                    ends_at: r.try_get("ends_at")?,
                })
            })
            .collect()
    }

    async fn insert_user_role(&self, user_role: UserRole) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id, is_active, source, created_at)
            VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_role.user_id)
        .bind(user_role.role_id)
        .bind(user_role.is_active)
        .bind(user_role.source.to_string())
        .bind(user_role.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_user_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        source: Option<RoleSource>,
    ) -> Result<usize> {
        let result = sqlx::query(
            r#"
            DELETE FROM user_roles
            WHERE user_id = $1 AND role_id = $2 AND ($3::text IS NULL OR source = $3)
            "#,
        )
        .bind(user_id)
        .bind(role_id)
        .bind(source.map(|s| s.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn remove_user_roles_by_source(
        &self,
        source: RoleSource,
        role_id: Option<Uuid>,
    ) -> Result<Vec<UserRole>> {
        let rows = sqlx::query(
            r#"
            DELETE FROM user_roles
            WHERE source = $1 AND ($2::uuid IS NULL OR role_id = $2)
            RETURNING *
            "#,
        )
        .bind(source.to_string())
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_user_role).collect()
    }

    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<UserRole>> {
        let rows = sqlx::query("SELECT * FROM user_roles WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_user_role).collect()
    }

    async fn users_with_role(&self, role_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT DISTINCT user_id FROM user_roles WHERE role_id = $1 AND is_active ORDER BY user_id",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get("user_id").map_err(ServiceError::from))
            .collect()
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, ts, actor_id, actor_kind, organization_id, action,
                                   resource_type, resource_id, success, reason, details,
                                   prev_hash, self_hash, partition)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(record.id)
        .bind(record.ts)
        .bind(&record.actor_id)
        .bind(record.actor_kind.as_str())
        .bind(record.organization_id)
        .bind(&record.action)
        .bind(&record.resource_type)
        .bind(&record.resource_id)
        .bind(record.success)
        .bind(&record.reason)
        .bind(&record.details)
        .bind(&record.prev_hash)
        .bind(&record.self_hash)
        .bind(record.partition())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn head_hash(&self, partition: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT self_hash FROM audit_log WHERE partition = $1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(partition)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("self_hash").map_err(ServiceError::from))
            .transpose()
    }

    async fn record(&self, id: Uuid) -> Result<Option<AuditRecord>> {
        let row = sqlx::query("SELECT * FROM audit_log WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_audit_record(&r)).transpose()
    }

    async fn partition_records(&self, partition: &str) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query("SELECT * FROM audit_log WHERE partition = $1 ORDER BY seq")
            .bind(partition)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_audit_record).collect()
    }

    async fn query(&self, query: &AuditQuery, page: Page) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM audit_log
            WHERE ($1::text IS NULL OR actor_id = $1)
              AND ($2::uuid IS NULL OR organization_id = $2)
              AND ($3::text IS NULL OR action = $3)
              AND ($4::text IS NULL OR resource_type = $4)
              AND ($5::text IS NULL OR resource_id = $5)
              AND ($6::boolean IS NULL OR success = $6)
              AND ($7::timestamptz IS NULL OR ts >= $7)
              AND ($8::timestamptz IS NULL OR ts <= $8)
            ORDER BY ts DESC
            LIMIT $9 OFFSET $10
            "#,
        )
        .bind(&query.actor_id)
        .bind(query.organization_id)
        .bind(&query.action)
        .bind(&query.resource_type)
        .bind(&query.resource_id)
        .bind(query.success)
        .bind(query.since)
        .bind(query.until)
        .bind(page.limit() as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_audit_record).collect()
    }

    async fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO audit_archive
            SELECT *, now() AS archived_at FROM audit_log WHERE ts < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO audit_tombstones (record_id, tier, archived_at)
            SELECT id, 'archive', now() FROM audit_log WHERE ts < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM audit_log WHERE ts < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected())
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn record_issued(&self, token: IssuedToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO issued_tokens (jti, subject, token_type, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5) ON CONFLICT (jti) DO NOTHING
            "#,
        )
        .bind(&token.jti)
        .bind(token.subject)
        .bind(&token.token_type)
        .bind(token.issued_at)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_tokens_for(
        &self,
        subject: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<IssuedToken>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM issued_tokens
            WHERE subject = $1 AND expires_at > $2
            ORDER BY issued_at
            "#,
        )
        .bind(subject)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(IssuedToken {
                    jti: r.try_get("jti")?,
                    subject: r.try_get("subject")?,
                    token_type: r.try_get("token_type")?,
                    issued_at: r.try_get("issued_at")?,
                    expires_at: r.try_get("expires_at")?,
                })
            })
            .collect()
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM issued_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
