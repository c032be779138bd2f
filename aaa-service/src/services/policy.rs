//! Service-authorization policy: a declarative YAML document validated at
//! load, held behind a copy-on-write snapshot, and hot-reloaded on SIGHUP.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

use crate::models::{ActorKind, AuditEventKind, normalize_permission_name, permission_matches};
use crate::services::audit::{AuditEvent, AuditSink};
use crate::services::error::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub service_authorization: ServiceAuthorizationSection,
    #[serde(default)]
    pub default_behavior: DefaultBehavior,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAuthorizationSection {
    pub enabled: bool,
    #[serde(default)]
    pub services: BTreeMap<String, ServicePolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePolicy {
    pub service_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub api_key_required: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenDisabled {
    AllowAll,
    DenyAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultBehavior {
    pub when_disabled: WhenDisabled,
    #[serde(default = "default_true")]
    pub log_unauthorized_attempts: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DefaultBehavior {
    fn default() -> Self {
        Self {
            when_disabled: WhenDisabled::DenyAll,
            log_unauthorized_attempts: true,
        }
    }
}

impl PolicyDocument {
    /// An empty, enabled policy with no services listed.
    pub fn empty() -> Self {
        Self {
            service_authorization: ServiceAuthorizationSection {
                enabled: true,
                services: BTreeMap::new(),
            },
            default_behavior: DefaultBehavior::default(),
        }
    }

    pub fn from_yaml(input: &str) -> Result<Self, ServiceError> {
        let document: PolicyDocument = serde_yaml::from_str(input)
            .map_err(|e| ServiceError::Validation(format!("Invalid policy document: {}", e)))?;
        document.validate()?;
        Ok(document)
    }

    pub fn load(path: &Path) -> Result<Self, ServiceError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::Internal(anyhow::anyhow!(
                "Failed to read policy file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&raw)
    }

    /// Every map key must equal the entry's `service_id` and every
    /// declared permission must be canonical.
    pub fn validate(&self) -> Result<(), ServiceError> {
        for (key, entry) in &self.service_authorization.services {
            if key != &entry.service_id {
                return Err(ServiceError::Validation(format!(
                    "Policy key {:?} does not match service_id {:?}",
                    key, entry.service_id
                )));
            }
            for permission in &entry.permissions {
                if normalize_permission_name(permission).as_deref() != Some(permission.as_str()) {
                    return Err(ServiceError::Validation(format!(
                        "Service {:?} declares malformed permission {:?}",
                        key, permission
                    )));
                }
            }
            if entry.api_key_required && entry.api_key.is_none() {
                return Err(ServiceError::Validation(format!(
                    "Service {:?} requires an API key but declares none",
                    key
                )));
            }
        }
        Ok(())
    }
}

/// Lowercase with runs of spaces and underscores collapsed to hyphens.
pub fn normalize_service_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_separator = false;
    for c in name.trim().to_lowercase().chars() {
        if c == ' ' || c == '_' || c == '-' {
            pending_separator = !out.is_empty();
        } else {
            if pending_separator {
                out.push('-');
                pending_separator = false;
            }
            out.push(c);
        }
    }
    out
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    // Digest first so lengths never leak.
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    da.ct_eq(&db).into()
}

/// Authorizer for machine-to-machine calls, driven entirely by the
/// policy document.
pub struct ServiceAuthorizer {
    policy: ArcSwap<PolicyDocument>,
    path: Option<PathBuf>,
    audit: AuditSink,
}

impl ServiceAuthorizer {
    pub fn new(policy: PolicyDocument, path: Option<PathBuf>, audit: AuditSink) -> Self {
        Self {
            policy: ArcSwap::from_pointee(policy),
            path,
            audit,
        }
    }

    /// Consistent snapshot for the duration of one decision.
    pub fn snapshot(&self) -> Arc<PolicyDocument> {
        self.policy.load_full()
    }

    /// Authorize a service request for one permission. The API key, when
    /// required, is compared in constant time.
    pub async fn authorize(
        &self,
        service_name: &str,
        permission: &str,
        api_key: Option<&str>,
    ) -> Result<(), ServiceError> {
        let policy = self.snapshot();

        if !policy.service_authorization.enabled {
            return match policy.default_behavior.when_disabled {
                WhenDisabled::AllowAll => Ok(()),
                WhenDisabled::DenyAll => {
                    self.audit_failure(&policy, service_name, permission, "service authorization disabled")
                        .await;
                    Err(ServiceError::PermissionDenied(
                        "service authorization disabled".to_string(),
                    ))
                }
            };
        }

        let Some(entry) = policy.service_authorization.services.get(service_name) else {
            self.audit_failure(&policy, service_name, permission, "unknown service")
                .await;
            return Err(ServiceError::PermissionDenied(format!(
                "unknown service: {}",
                service_name
            )));
        };

        if entry.api_key_required {
            let stored = entry.api_key.as_deref().unwrap_or_default();
            let provided = api_key.unwrap_or_default();
            if !constant_time_eq(stored, provided) {
                self.audit_failure(&policy, service_name, permission, "invalid API key")
                    .await;
                return Err(ServiceError::PermissionDenied("invalid API key".to_string()));
            }
        }

        let Some((resource, action)) = permission.split_once(':') else {
            return Err(ServiceError::InvalidPermissionFormat(permission.to_string()));
        };
        let granted = entry
            .permissions
            .iter()
            .any(|declared| permission_matches(declared, resource, action));
        if !granted {
            self.audit_failure(&policy, service_name, permission, "no matching permission")
                .await;
            return Err(ServiceError::PermissionDenied(format!(
                "service {} is not granted {}",
                service_name, permission
            )));
        }

        let _ = self
            .audit
            .record(
                AuditEvent::new(
                    AuditEventKind::ServiceAuthSuccess,
                    service_name,
                    ActorKind::Service,
                )
                .resource("service_authorization", Some(permission.to_string())),
            )
            .await;
        Ok(())
    }

    /// Ownership rule for seed-like operations: the caller must be the
    /// service it targets, up to name normalization.
    pub fn verify_ownership(
        &self,
        service_name: &str,
        target_service_id: &str,
    ) -> Result<(), ServiceError> {
        if normalize_service_name(service_name) == normalize_service_name(target_service_id) {
            Ok(())
        } else {
            Err(ServiceError::ServiceScopeViolation(format!(
                "service {} may not operate on {}",
                service_name, target_service_id
            )))
        }
    }

    async fn audit_failure(
        &self,
        policy: &PolicyDocument,
        service_name: &str,
        permission: &str,
        reason: &str,
    ) {
        if !policy.default_behavior.log_unauthorized_attempts {
            return;
        }
        let _ = self
            .audit
            .record(
                AuditEvent::new(
                    AuditEventKind::ServiceAuthFailure,
                    service_name,
                    ActorKind::Service,
                )
                .resource("service_authorization", Some(permission.to_string()))
                .outcome(false, Some(reason.to_string())),
            )
            .await;
    }

    /// Re-read the policy file and swap in the new snapshot. In-flight
    /// decisions keep the one they loaded.
    pub fn reload(&self) -> Result<(), ServiceError> {
        let Some(path) = &self.path else {
            return Err(ServiceError::Validation(
                "no policy file configured".to_string(),
            ));
        };
        let document = PolicyDocument::load(path)?;
        self.policy.store(Arc::new(document));
        tracing::info!(path = %path.display(), "service authorization policy reloaded");
        Ok(())
    }

    /// Reload the policy on SIGHUP until shutdown.
    #[cfg(unix)]
    pub fn spawn_sighup_reload(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let authorizer = self;
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                tracing::error!("failed to install SIGHUP handler");
                return;
            };
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = hangup.recv() => {
                        if let Err(e) = authorizer.reload() {
                            tracing::error!(error = %e, "policy reload failed; keeping previous policy");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_service_names() {
        assert_eq!(normalize_service_name("Farmers Module"), "farmers-module");
        assert_eq!(normalize_service_name("farmers_module"), "farmers-module");
        assert_eq!(normalize_service_name("  Farmers __ Module "), "farmers-module");
        assert_eq!(normalize_service_name("farmers-module"), "farmers-module");
    }

    #[test]
    fn rejects_mismatched_service_keys() {
        let yaml = r#"
service_authorization:
  enabled: true
  services:
    farmers-module:
      service_id: other-module
      permissions: ["catalog:seed"]
default_behavior:
  when_disabled: deny_all
  log_unauthorized_attempts: true
"#;
        assert!(PolicyDocument::from_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_malformed_permissions() {
        let yaml = r#"
service_authorization:
  enabled: true
  services:
    svc:
      service_id: svc
      permissions: ["not-canonical"]
default_behavior:
  when_disabled: deny_all
  log_unauthorized_attempts: true
"#;
        assert!(PolicyDocument::from_yaml(yaml).is_err());
    }

    #[test]
    fn parses_a_complete_document() {
        let yaml = r#"
service_authorization:
  enabled: true
  services:
    farmers-module:
      service_id: farmers-module
      display_name: Farmers Module
      description: Seeds and reads the farmers catalog
      api_key_required: true
      api_key: secure-key-123
      permissions: ["catalog:*", "farmers:read"]
default_behavior:
  when_disabled: allow_all
  log_unauthorized_attempts: true
"#;
        let doc = PolicyDocument::from_yaml(yaml).unwrap();
        assert!(doc.service_authorization.enabled);
        let entry = &doc.service_authorization.services["farmers-module"];
        assert!(entry.api_key_required);
        assert_eq!(doc.default_behavior.when_disabled, WhenDisabled::AllowAll);
    }

    #[test]
    fn constant_time_compare_matches_equal_strings() {
        assert!(constant_time_eq("secure-key-123", "secure-key-123"));
        assert!(!constant_time_eq("secure-key-123", "wrong"));
    }

    #[tokio::test]
    async fn reload_swaps_in_the_new_document() {
        use crate::services::audit::start_pipeline;
        use crate::store::MemoryStore;
        use std::io::Write;
        use std::sync::Arc;

        let initial = r#"
service_authorization:
  enabled: true
  services:
    svc:
      service_id: svc
      permissions: ["catalog:read"]
default_behavior:
  when_disabled: deny_all
  log_unauthorized_attempts: true
"#;
        let updated = initial.replace("catalog:read", "catalog:*");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(initial.as_bytes()).unwrap();

        let (sink, _writer) = start_pipeline(Arc::new(MemoryStore::new()), 16);
        let authorizer = ServiceAuthorizer::new(
            PolicyDocument::load(file.path()).unwrap(),
            Some(file.path().to_path_buf()),
            sink,
        );

        assert!(authorizer.authorize("svc", "catalog:read", None).await.is_ok());
        assert!(authorizer.authorize("svc", "catalog:seed", None).await.is_err());

        std::fs::write(file.path(), updated).unwrap();
        authorizer.reload().unwrap();

        assert!(authorizer.authorize("svc", "catalog:seed", None).await.is_ok());
    }
}
