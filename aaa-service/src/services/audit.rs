//! Audit pipeline: a bounded channel between the engine and a durable,
//! ordering-preserving writer, plus the queryable trail on top.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{
    ActorKind, AuditEventKind, AuditQuery, AuditRecord, partition_key,
};
use crate::services::error::ServiceError;
use crate::store::{AuditStore, Page};

/// Hash the first record of each partition chains from.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Event handed to the pipeline; the writer assigns id, timestamp, and
/// chain hashes.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub actor_id: String,
    pub actor_kind: ActorKind,
    pub organization_id: Option<Uuid>,
    pub kind: AuditEventKind,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub success: bool,
    pub reason: Option<String>,
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, actor_id: impl Into<String>, actor_kind: ActorKind) -> Self {
        Self {
            actor_id: actor_id.into(),
            actor_kind,
            organization_id: None,
            kind,
            resource_type: String::new(),
            resource_id: None,
            success: true,
            reason: None,
            details: json!({}),
        }
    }

    pub fn organization(mut self, organization_id: Option<Uuid>) -> Self {
        self.organization_id = organization_id;
        self
    }

    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: Option<String>) -> Self {
        self.resource_type = resource_type.into();
        self.resource_id = resource_id;
        self
    }

    pub fn outcome(mut self, success: bool, reason: Option<String>) -> Self {
        self.success = success;
        self.reason = reason;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Enqueue half of the pipeline. Cheap to clone. `record` is
/// non-blocking while the buffer has room and blocks the caller past the
/// high-watermark; events are never silently dropped.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditSink {
    pub async fn record(&self, event: AuditEvent) -> Result<(), ServiceError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ServiceError::Internal(anyhow::anyhow!("audit pipeline closed")))
    }
}

/// Join handle for the writer task; awaiting it drains the buffer.
pub struct AuditWriterHandle {
    handle: JoinHandle<()>,
}

impl AuditWriterHandle {
    /// Wait for the writer to drain and exit. Every `AuditSink` clone
    /// must be dropped first or this never completes.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "audit writer task failed");
        }
    }
}

/// Start the pipeline: a bounded buffer sized at the high-watermark and
/// one writer preserving per-partition order.
pub fn start_pipeline(
    store: Arc<dyn AuditStore>,
    high_watermark: usize,
) -> (AuditSink, AuditWriterHandle) {
    let (tx, rx) = mpsc::channel(high_watermark.max(1));
    let handle = tokio::spawn(writer_loop(store, rx));
    (AuditSink { tx }, AuditWriterHandle { handle })
}

async fn writer_loop(store: Arc<dyn AuditStore>, mut rx: mpsc::Receiver<AuditEvent>) {
    let mut heads: HashMap<String, String> = HashMap::new();

    while let Some(event) = rx.recv().await {
        let partition = partition_key(event.organization_id);
        let prev_hash = match heads.get(&partition) {
            Some(hash) => hash.clone(),
            None => match store.head_hash(&partition).await {
                Ok(Some(hash)) => hash,
                Ok(None) => GENESIS_HASH.to_string(),
                Err(e) => {
                    tracing::error!(error = %e, partition = %partition, "failed to load chain head");
                    GENESIS_HASH.to_string()
                }
            },
        };

        let record = AuditRecord {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            actor_id: event.actor_id,
            actor_kind: event.actor_kind,
            organization_id: event.organization_id,
            action: event.kind.as_str().to_string(),
            resource_type: event.resource_type,
            resource_id: event.resource_id,
            success: event.success,
            reason: event.reason,
            details: event.details,
            prev_hash: String::new(),
            self_hash: String::new(),
        }
        .chain(prev_hash);

        match persist_with_retry(&store, &record).await {
            Ok(()) => {
                heads.insert(partition, record.self_hash.clone());
            }
            Err(e) => {
                // The row is lost to the store but not to the operator.
                tracing::error!(
                    error = %e,
                    record = %serde_json::to_string(&record).unwrap_or_default(),
                    "audit write failed after retries"
                );
            }
        }
    }
}

/// Exponential backoff, capped at three attempts.
async fn persist_with_retry(
    store: &Arc<dyn AuditStore>,
    record: &AuditRecord,
) -> Result<(), ServiceError> {
    let attempts = std::sync::atomic::AtomicU32::new(0);
    let policy = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_interval(Duration::from_millis(500))
        .with_max_elapsed_time(None)
        .build();

    backoff::future::retry(policy, || async {
        match store.append(record.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                if n >= 3 {
                    Err(backoff::Error::permanent(e))
                } else {
                    Err(backoff::Error::transient(e))
                }
            }
        }
    })
    .await
}

/// Result of walking a partition's hash chain.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChainVerification {
    pub partition: String,
    pub valid: bool,
    pub checked: usize,
    /// First record whose hash does not verify.
    pub broken_at: Option<Uuid>,
}

/// Query surface over the durable trail, plus integrity verification and
/// the retention archiver.
#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn AuditStore>,
}

impl AuditService {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub async fn query(
        &self,
        query: &AuditQuery,
        page: Page,
    ) -> Result<Vec<AuditRecord>, ServiceError> {
        self.store.query(query, page).await
    }

    pub async fn user_trail(
        &self,
        user_id: Uuid,
        days: i64,
        page: Page,
    ) -> Result<Vec<AuditRecord>, ServiceError> {
        let query = AuditQuery {
            actor_id: Some(user_id.to_string()),
            since: Some(Utc::now() - ChronoDuration::days(days.max(1))),
            ..Default::default()
        };
        self.store.query(&query, page).await
    }

    pub async fn organization_trail(
        &self,
        organization_id: Uuid,
        page: Page,
    ) -> Result<Vec<AuditRecord>, ServiceError> {
        let query = AuditQuery {
            organization_id: Some(organization_id),
            ..Default::default()
        };
        self.store.query(&query, page).await
    }

    pub async fn resource_trail(
        &self,
        resource_type: &str,
        resource_id: Option<String>,
        page: Page,
    ) -> Result<Vec<AuditRecord>, ServiceError> {
        let query = AuditQuery {
            resource_type: Some(resource_type.to_string()),
            resource_id,
            ..Default::default()
        };
        self.store.query(&query, page).await
    }

    /// Authentication and authorization failures, revocations, and other
    /// events a security review starts from.
    pub async fn security_events(&self, page: Page) -> Result<Vec<AuditRecord>, ServiceError> {
        let kinds = [
            AuditEventKind::ServiceAuthFailure,
            AuditEventKind::TokenValidationFailure,
            AuditEventKind::LoginFailure,
            AuditEventKind::TokenRevoked,
        ];
        let mut merged = Vec::new();
        for kind in kinds {
            let query = AuditQuery {
                action: Some(kind.as_str().to_string()),
                ..Default::default()
            };
            merged.extend(
                self.store
                    .query(&query, Page::new(1, page.page * page.page_size))
                    .await?,
            );
        }
        merged.sort_by(|a, b| b.ts.cmp(&a.ts));
        let offset = page.offset().min(merged.len());
        let end = (offset + page.limit()).min(merged.len());
        Ok(merged[offset..end].to_vec())
    }

    /// Walk one partition's chain and fail at the first mismatch.
    pub async fn verify_partition(&self, partition: &str) -> Result<ChainVerification, ServiceError> {
        let records = self.store.partition_records(partition).await?;
        let mut prev_hash = records
            .first()
            .map(|r| r.prev_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let mut checked = 0;
        for record in &records {
            if record.prev_hash != prev_hash
                || record.compute_hash(&prev_hash) != record.self_hash
            {
                return Ok(ChainVerification {
                    partition: partition.to_string(),
                    valid: false,
                    checked,
                    broken_at: Some(record.id),
                });
            }
            prev_hash = record.self_hash.clone();
            checked += 1;
        }
        Ok(ChainVerification {
            partition: partition.to_string(),
            valid: true,
            checked,
            broken_at: None,
        })
    }

    /// Verify the chain containing one record.
    pub async fn verify_record(&self, id: Uuid) -> Result<ChainVerification, ServiceError> {
        let record = self
            .store
            .record(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Audit record {} not found", id)))?;
        self.verify_partition(&record.partition()).await
    }

    /// Archive rows older than the retention window. Never deletes in
    /// place; rows move to the second tier with a tombstone pointer.
    pub async fn archive_expired(&self, retention_days: i64) -> Result<u64, ServiceError> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days.max(1));
        let archived = self.store.archive_before(cutoff).await?;
        if archived > 0 {
            tracing::info!(archived, retention_days, "audit records archived");
        }
        Ok(archived)
    }

    /// Background retention task; checks daily.
    pub fn spawn_retention(
        &self,
        retention_days: i64,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            // Skip the immediate first tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = service.archive_expired(retention_days).await {
                            tracing::error!(error = %e, "audit retention pass failed");
                        }
                    }
                }
            }
        })
    }
}
