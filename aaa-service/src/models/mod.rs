//! Domain entities for the AAA service.

pub mod action;
pub mod audit;
pub mod column_group;
pub mod decision;
pub mod group;
pub mod permission;
pub mod principal;
pub mod resource;
pub mod role;
pub mod token;

pub use action::Action;
pub use audit::{ActorKind, AuditEventKind, AuditQuery, AuditRecord, SERVICE_PARTITION, partition_key};
pub use column_group::ColumnGroup;
pub use decision::{Decision, Explanation, RoleTrace};
pub use group::{Group, GroupInheritance, GroupMembership, GroupRole, is_effective_at};
pub use permission::{Permission, canonical_permission, normalize_permission_name, permission_matches};
pub use principal::{
    Organization, OrgMembership, Principal, PrincipalKind, RoleSource, ServiceAccount, User,
    UserRole,
};
pub use resource::Resource;
pub use role::{EffectiveRole, Role, RolePermission, RoleProvenance, RoleScope};
pub use token::IssuedToken;
