//! Authorization engine: point checks, batch checks, reverse lookups,
//! column checks, and wildcard evaluation over the principal graph and
//! catalog, fronted by the decision cache.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::models::{
    ActorKind, AuditEventKind, Decision, Explanation, RoleTrace, permission_matches,
};
use crate::services::audit::{AuditEvent, AuditSink};
use crate::services::cache::{DecisionCache, PermSet};
use crate::services::catalog::CatalogService;
use crate::services::context::CallContext;
use crate::services::error::ServiceError;
use crate::services::graph::PrincipalGraphService;
use crate::services::policy::ServiceAuthorizer;
use crate::store::Page;

/// Concurrency bound for batch evaluation.
const CHECKER_POOL_SIZE: usize = 16;

/// The principal a check runs for.
#[derive(Debug, Clone, Copy)]
pub struct PrincipalRef {
    pub id: Uuid,
    pub kind: ActorKind,
    pub organization_id: Option<Uuid>,
}

impl PrincipalRef {
    pub fn user(id: Uuid, organization_id: Option<Uuid>) -> Self {
        Self {
            id,
            kind: ActorKind::User,
            organization_id,
        }
    }

    pub fn service(id: Uuid) -> Self {
        Self {
            id,
            kind: ActorKind::Service,
            organization_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub principal: PrincipalRef,
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
    pub explain: bool,
}

impl CheckRequest {
    pub fn new(
        principal: PrincipalRef,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            principal,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            action: action.into(),
            explain: false,
        }
    }

    pub fn explained(mut self) -> Self {
        self.explain = true;
        self
    }
}

/// Outcome of a column-level check.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnDecision {
    pub allowed: bool,
    pub allowed_columns: Vec<String>,
    pub decision: Decision,
}

#[derive(Clone)]
pub struct AuthzEngine {
    catalog: CatalogService,
    graph: PrincipalGraphService,
    cache: Arc<DecisionCache>,
    audit: AuditSink,
    authorizer: Arc<ServiceAuthorizer>,
    checker_permits: Arc<Semaphore>,
}

impl AuthzEngine {
    pub fn new(
        catalog: CatalogService,
        graph: PrincipalGraphService,
        cache: Arc<DecisionCache>,
        audit: AuditSink,
        authorizer: Arc<ServiceAuthorizer>,
    ) -> Self {
        Self {
            catalog,
            graph,
            cache,
            audit,
            authorizer,
            checker_permits: Arc::new(Semaphore::new(CHECKER_POOL_SIZE)),
        }
    }

    pub fn authorizer(&self) -> &Arc<ServiceAuthorizer> {
        &self.authorizer
    }

    /// Effective permission snapshot for a principal, via the cache's
    /// single-flight path.
    pub async fn permissions_for(&self, principal: &PrincipalRef) -> Result<PermSet, ServiceError> {
        let graph = self.graph.clone();
        let org = principal.organization_id;
        let id = principal.id;
        self.cache
            .get_or_compute_perms(id, move || {
                let graph = graph.clone();
                async move { graph.effective_permissions(org, id).await }
            })
            .await
    }

    /// Point check. The evaluation itself honors the call deadline; the
    /// audit record is finalized on every exit path, including
    /// cancellation.
    pub async fn check(
        &self,
        ctx: &CallContext,
        request: CheckRequest,
    ) -> Result<Decision, ServiceError> {
        if !request.explain {
            if let Some(hit) = self.cache.get_decision(
                request.principal.id,
                &request.resource_type,
                &request.resource_id,
                &request.action,
            ) {
                self.audit_check(&request, Some(&hit), None).await;
                return Ok(hit);
            }
        }

        let outcome = ctx.run(self.compute_decision(&request)).await;

        match outcome {
            Ok(decision) => {
                // Explained decisions stay out of the cache so plain
                // lookups never carry a stale explanation.
                if !request.explain {
                    self.cache.put_decision(
                        request.principal.id,
                        &request.resource_type,
                        &request.resource_id,
                        &request.action,
                        decision.clone(),
                    );
                }
                self.audit_check(&request, Some(&decision), None).await;
                Ok(decision)
            }
            Err(e) => {
                self.audit_check(&request, None, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn compute_decision(&self, request: &CheckRequest) -> Result<Decision, ServiceError> {
        let perms = self.permissions_for(&request.principal).await?;

        let matched = self
            .find_match(&perms, &request.resource_type, &request.resource_id, &request.action)
            .await?;

        let mut decision = match &matched {
            Some(granted) => Decision::allow(format!("matched:{}", granted)),
            None => Decision::deny("no_matching_permission"),
        };

        if request.explain {
            decision = decision.with_explanation(
                self.explain(&request.principal, matched.as_deref()).await?,
            );
        }
        Ok(decision)
    }

    /// Wildcard match per the canonical rules, plus the resource-ancestor
    /// walk: a grant naming an ancestor of the concrete resource matches.
    async fn find_match(
        &self,
        perms: &HashSet<String>,
        resource_type: &str,
        resource_id: &str,
        action: &str,
    ) -> Result<Option<String>, ServiceError> {
        for granted in perms.iter() {
            if permission_matches(granted, resource_type, action) {
                return Ok(Some(granted.clone()));
            }
        }

        if let Ok(rid) = Uuid::parse_str(resource_id) {
            for ancestor_id in self.catalog.resource_ancestors(rid).await? {
                let Some(ancestor) = self.catalog.resource(ancestor_id).await? else {
                    continue;
                };
                let ancestor_id_str = ancestor_id.to_string();
                for granted in perms.iter() {
                    if permission_matches(granted, &ancestor.name, action)
                        || permission_matches(granted, &ancestor_id_str, action)
                    {
                        return Ok(Some(granted.clone()));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn explain(
        &self,
        principal: &PrincipalRef,
        matched: Option<&str>,
    ) -> Result<Explanation, ServiceError> {
        let effective = self
            .graph
            .effective_roles(principal.organization_id, principal.id)
            .await?;
        let mut roles = Vec::new();
        for entry in &effective {
            let include = match matched {
                None => false,
                Some(matched) => self
                    .catalog
                    .role_permissions_with_ancestors(entry.role.id)
                    .await?
                    .iter()
                    .any(|p| p.name == matched),
            };
            if include {
                roles.push(RoleTrace {
                    role_name: entry.role.name.clone(),
                    source: entry.source.to_string(),
                });
            }
        }
        Ok(Explanation {
            matched: matched.map(str::to_string),
            roles,
        })
    }

    /// Evaluate a batch concurrently on the checker pool. Each distinct
    /// principal's snapshot is fetched once; the response preserves
    /// input order.
    pub async fn batch_check(
        &self,
        ctx: &CallContext,
        requests: Vec<CheckRequest>,
    ) -> Result<Vec<Decision>, ServiceError> {
        let mut warmed = HashSet::new();
        for request in &requests {
            if warmed.insert(request.principal.id) {
                self.permissions_for(&request.principal).await?;
            }
        }

        let results: Vec<Result<Decision, ServiceError>> = stream::iter(
            requests.into_iter().map(|request| {
                let engine = self.clone();
                let ctx = ctx.clone();
                async move {
                    let _permit = engine
                        .checker_permits
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| {
                            ServiceError::Internal(anyhow::anyhow!("checker pool closed"))
                        })?;
                    engine.check(&ctx, request).await
                }
            }),
        )
        .buffered(CHECKER_POOL_SIZE)
        .collect()
        .await;

        results.into_iter().collect()
    }

    /// Reverse index: every resource id of the type the principal could
    /// pass a check for, ascending and deduplicated.
    pub async fn lookup_resources(
        &self,
        ctx: &CallContext,
        principal: PrincipalRef,
        resource_type: &str,
        action: &str,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let result = ctx
            .run(self.compute_lookup(&principal, resource_type, action))
            .await;

        let _ = self
            .audit
            .record(
                AuditEvent::new(
                    AuditEventKind::ResourcesListed,
                    principal.id.to_string(),
                    principal.kind,
                )
                .organization(principal.organization_id)
                .resource(resource_type, None)
                .outcome(result.is_ok(), result.as_ref().err().map(|e| e.to_string())),
            )
            .await;
        result
    }

    async fn compute_lookup(
        &self,
        principal: &PrincipalRef,
        resource_type: &str,
        action: &str,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let perms = self.permissions_for(principal).await?;
        let mut ids: Vec<Uuid> = Vec::new();

        let type_level = perms
            .iter()
            .any(|granted| permission_matches(granted, resource_type, action));
        if type_level {
            for resource in self
                .catalog
                .list_resources(Some(resource_type), Page::new(1, 500))
                .await?
            {
                ids.push(resource.id);
            }
        } else {
            // Grants naming concrete resources, plus their descendants of
            // the requested type.
            let all_of_type = self
                .catalog
                .list_resources(Some(resource_type), Page::new(1, 500))
                .await?;
            for granted in perms.iter() {
                let Some((resource_side, action_side)) = granted.split_once(':') else {
                    continue;
                };
                if action_side != action && action_side != "*" {
                    continue;
                }
                let named = match Uuid::parse_str(resource_side) {
                    Ok(id) => self.catalog.resource(id).await?,
                    Err(_) => self.catalog.resource_by_name(resource_side).await?,
                };
                let Some(named) = named else { continue };
                if named.resource_type == resource_type {
                    ids.push(named.id);
                }
                for candidate in &all_of_type {
                    if self
                        .catalog
                        .resource_ancestors(candidate.id)
                        .await?
                        .contains(&named.id)
                    {
                        ids.push(candidate.id);
                    }
                }
            }
        }

        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Column-level check: a table-level check first, then the requested
    /// columns intersected with the column groups of the roles that can
    /// perform the action.
    pub async fn check_columns(
        &self,
        ctx: &CallContext,
        principal: PrincipalRef,
        table: &str,
        action: &str,
        requested_columns: &[String],
    ) -> Result<ColumnDecision, ServiceError> {
        let decision = self
            .check(
                ctx,
                CheckRequest::new(principal, table, "*", action),
            )
            .await?;

        if !decision.allowed {
            return Ok(ColumnDecision {
                allowed: false,
                allowed_columns: Vec::new(),
                decision,
            });
        }

        let allowed_set = self
            .allowed_columns(&principal, table, action)
            .await?;
        let allowed_columns: Vec<String> = requested_columns
            .iter()
            .filter(|c| allowed_set.contains(c.as_str()))
            .cloned()
            .collect();

        let _ = self
            .audit
            .record(
                AuditEvent::new(
                    AuditEventKind::ColumnsChecked,
                    principal.id.to_string(),
                    principal.kind,
                )
                .organization(principal.organization_id)
                .resource(table, None)
                .details(serde_json::json!({
                    "requested": requested_columns,
                    "allowed": allowed_columns.clone(),
                })),
            )
            .await;

        Ok(ColumnDecision {
            allowed: true,
            allowed_columns,
            decision,
        })
    }

    /// Union of column-group columns over the roles that hold a matching
    /// permission for `(table, action)`.
    pub async fn allowed_columns(
        &self,
        principal: &PrincipalRef,
        table: &str,
        action: &str,
    ) -> Result<HashSet<String>, ServiceError> {
        let effective = self
            .graph
            .effective_roles(principal.organization_id, principal.id)
            .await?;

        let mut granting_roles = Vec::new();
        for entry in &effective {
            let grants = self
                .catalog
                .role_permissions_with_ancestors(entry.role.id)
                .await?;
            if grants
                .iter()
                .any(|p| permission_matches(&p.name, table, action))
            {
                granting_roles.push(entry.role.id);
            }
        }

        let mut columns = HashSet::new();
        for group in self
            .catalog
            .role_column_groups(&granting_roles, table)
            .await?
        {
            for column in group.columns {
                columns.insert(column);
            }
        }
        Ok(columns)
    }

    /// Wildcard-aware single-permission evaluation.
    pub async fn evaluate(
        &self,
        ctx: &CallContext,
        principal: PrincipalRef,
        permission: &str,
        explain: bool,
    ) -> Result<Decision, ServiceError> {
        let Some((resource, action)) = permission.split_once(':') else {
            return Err(ServiceError::InvalidPermissionFormat(permission.to_string()));
        };
        let mut request = CheckRequest::new(principal, resource, "*", action);
        if explain {
            request = request.explained();
        }
        self.check(ctx, request).await
    }

    pub async fn bulk_evaluate(
        &self,
        ctx: &CallContext,
        principal: PrincipalRef,
        permissions: &[String],
    ) -> Result<Vec<Decision>, ServiceError> {
        let requests = permissions
            .iter()
            .map(|permission| {
                let (resource, action) = permission
                    .split_once(':')
                    .ok_or_else(|| ServiceError::InvalidPermissionFormat(permission.clone()))?;
                Ok(CheckRequest::new(principal, resource, "*", action))
            })
            .collect::<Result<Vec<_>, ServiceError>>()?;
        self.batch_check(ctx, requests).await
    }

    /// Machine-to-machine authorization against the policy document.
    pub async fn authorize_service(
        &self,
        service_name: &str,
        permission: &str,
        api_key: Option<&str>,
    ) -> Result<(), ServiceError> {
        self.authorizer
            .authorize(service_name, permission, api_key)
            .await
    }

    /// Whether the principal's grants cover `admin:*`; used to bypass the
    /// service-ownership rule for seed-like operations.
    pub async fn holds_admin_wildcard(
        &self,
        principal: &PrincipalRef,
    ) -> Result<bool, ServiceError> {
        let perms = self.permissions_for(principal).await?;
        Ok(perms
            .iter()
            .any(|granted| permission_matches(granted, "admin", "*")))
    }

    async fn audit_check(
        &self,
        request: &CheckRequest,
        decision: Option<&Decision>,
        failure: Option<String>,
    ) {
        let (success, reason) = match (decision, failure) {
            (Some(d), _) => (d.allowed, Some(d.reason.clone())),
            (None, failure) => (false, failure),
        };
        let _ = self
            .audit
            .record(
                AuditEvent::new(
                    AuditEventKind::CheckEvaluated,
                    request.principal.id.to_string(),
                    request.principal.kind,
                )
                .organization(request.principal.organization_id)
                .resource(
                    request.resource_type.clone(),
                    Some(request.resource_id.clone()),
                )
                .outcome(success, reason)
                .details(serde_json::json!({
                    "action": request.action,
                    "decision_id": decision.map(|d| d.decision_id.clone()),
                })),
            )
            .await;
    }
}
