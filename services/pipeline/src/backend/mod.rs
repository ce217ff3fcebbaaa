//! Storage primitives on a tenant shard.
//!
//! A [`ShardBackend`] is one physical shard. Every backend runs the same
//! [`decide`] function inside its own atomicity primitive (a row-locking
//! transaction for Postgres, a mutex for the in-memory shard), so mutation
//! semantics never drift between them.

mod memory;
mod postgres;

pub use memory::{MemoryBackend, MemoryShards};
pub use postgres::PgBackend;

use crate::config::ShardPoolConfig;
use crate::model::{
    ApplyOutcome, Document, Operation, RejectReason, ResourceRecord, ResourceScope, TenantKey,
};
use crate::shard_directory::ConnectionDescriptor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors reported by a shard backend
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("Shard unavailable: {0}")]
    Unavailable(String),

    #[error("Shard call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Shard query failed: {0}")]
    Query(String),

    #[error("Unsupported shard url scheme: {0}")]
    UnsupportedUrl(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Timeout(_))
    }
}

/// Identity of one allocation counter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub tenant_key: TenantKey,
    pub resource_type: String,
    /// `YYMM`
    pub period: String,
}

/// A fully resolved mutation, ready to apply
#[derive(Debug, Clone)]
pub struct ApplyCommand {
    pub tenant_key: TenantKey,
    pub resource_type: String,
    pub resource_id: String,
    pub operation: Operation,
    pub payload: Document,
    pub request_id: String,
}

impl ApplyCommand {
    pub fn scope(&self) -> ResourceScope {
        ResourceScope {
            tenant_key: self.tenant_key.clone(),
            resource_type: self.resource_type.clone(),
        }
    }
}

/// One physical tenant shard
#[async_trait]
pub trait ShardBackend: Send + Sync {
    /// Atomically increment the counter and return the new value, or `None`
    /// when it already reached `limit`.
    async fn increment_counter(&self, key: &CounterKey, limit: u32)
        -> Result<Option<u32>, BackendError>;

    /// Resource id minted by the create carrying `request_id`, if that create
    /// was applied. Other operations are not matched.
    async fn find_create(
        &self,
        scope: &ResourceScope,
        request_id: &str,
    ) -> Result<Option<String>, BackendError>;

    async fn apply(&self, command: &ApplyCommand) -> Result<ApplyOutcome, BackendError>;

    async fn fetch(
        &self,
        scope: &ResourceScope,
        resource_id: &str,
    ) -> Result<Option<ResourceRecord>, BackendError>;

    async fn ping(&self) -> Result<(), BackendError>;
}

/// What a backend should do with a command
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Persist this record state and record the request as applied
    Write(ResourceRecord),
    /// Leave the shard untouched
    Skip(ApplyOutcome),
}

/// Decide how `command` changes `existing`.
///
/// `already_applied` is whether the ledger holds the command's request id
/// for this same resource. The same request id on another resource is an
/// unrelated mutation. Deletes write a tombstone even for unknown ids so a
/// create replayed after the delete cannot bring the record back.
pub fn decide(
    existing: Option<&ResourceRecord>,
    already_applied: bool,
    command: &ApplyCommand,
    now: DateTime<Utc>,
) -> Decision {
    if already_applied {
        return Decision::Skip(ApplyOutcome::Duplicate);
    }

    let reject = |reason| Decision::Skip(ApplyOutcome::Rejected(reason));

    let data = match (command.operation, existing) {
        (Operation::Create, Some(_)) => return reject(RejectReason::IdCollision),
        (Operation::Create, None) => command.payload.clone(),

        (Operation::Update | Operation::Patch | Operation::Delete, Some(record))
            if record.deleted =>
        {
            return reject(RejectReason::Tombstoned)
        }
        (Operation::Update | Operation::Patch, None) => return reject(RejectReason::NotFound),
        (Operation::Update, Some(_)) => command.payload.clone(),
        (Operation::Patch, Some(record)) => shallow_merge(&record.data, &command.payload),

        (Operation::Delete, Some(record)) => record.data.clone(),
        (Operation::Delete, None) => Document::new(),
    };

    Decision::Write(ResourceRecord {
        tenant_key: command.tenant_key.clone(),
        resource_type: command.resource_type.clone(),
        resource_id: command.resource_id.clone(),
        data,
        deleted: command.operation == Operation::Delete,
        last_request_id: command.request_id.clone(),
        created_at: existing.map(|r| r.created_at).unwrap_or(now),
        updated_at: now,
    })
}

/// Top-level merge: patch keys replace base keys wholesale, nested objects included
pub fn shallow_merge(base: &Document, patch: &Document) -> Document {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Opens backends for connection descriptors
#[async_trait]
pub trait ShardConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn ShardBackend>, BackendError>;
}

/// Chooses the backend from the descriptor url scheme:
/// `postgres://` / `postgresql://` or `memory://<name>`.
pub struct UrlConnector {
    pool_config: ShardPoolConfig,
    memory: Arc<MemoryShards>,
}

impl UrlConnector {
    pub fn new(pool_config: ShardPoolConfig, memory: Arc<MemoryShards>) -> Self {
        Self {
            pool_config,
            memory,
        }
    }
}

#[async_trait]
impl ShardConnector for UrlConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn ShardBackend>, BackendError> {
        let url = descriptor.url.as_str();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            let backend: Arc<dyn ShardBackend> =
                Arc::new(PgBackend::connect(descriptor, &self.pool_config).await?);
            Ok(backend)
        } else if let Some(name) = url.strip_prefix("memory://") {
            let backend: Arc<dyn ShardBackend> = self.memory.get_or_create(name);
            Ok(backend)
        } else {
            Err(BackendError::UnsupportedUrl(descriptor.redacted_url()))
        }
    }
}

struct PooledShard {
    url: String,
    backend: Arc<dyn ShardBackend>,
}

/// Open shard connections keyed by shard id.
///
/// Every write for a tenant goes through the pool registered for its shard,
/// so reads that follow on the same shard see it. A descriptor whose url
/// changed (the tenant was moved) replaces the pooled connection.
pub struct ShardPools {
    connector: Arc<dyn ShardConnector>,
    pools: RwLock<HashMap<String, PooledShard>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ShardPools {
    pub fn new(connector: Arc<dyn ShardConnector>) -> Self {
        Self {
            connector,
            pools: RwLock::new(HashMap::new()),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn cached(&self, descriptor: &ConnectionDescriptor) -> Option<Arc<dyn ShardBackend>> {
        self.pools
            .read()
            .get(&descriptor.shard_id)
            .filter(|pooled| pooled.url == descriptor.url)
            .map(|pooled| pooled.backend.clone())
    }

    pub async fn get(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn ShardBackend>, BackendError> {
        if let Some(backend) = self.cached(descriptor) {
            return Ok(backend);
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(backend) = self.cached(descriptor) {
            return Ok(backend);
        }

        let backend = self.connector.connect(descriptor).await?;
        info!(shard_id = %descriptor.shard_id, url = %descriptor.redacted_url(), "Connected to shard");
        self.pools.write().insert(
            descriptor.shard_id.clone(),
            PooledShard {
                url: descriptor.url.clone(),
                backend: backend.clone(),
            },
        );
        Ok(backend)
    }

    pub fn connected_shards(&self) -> usize {
        self.pools.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn command(operation: Operation, payload: serde_json::Value, request_id: &str) -> ApplyCommand {
        ApplyCommand {
            tenant_key: TenantKey::new("B1", "L1"),
            resource_type: "appointments".to_string(),
            resource_id: "ap2501-00001".to_string(),
            operation,
            payload: doc(payload),
            request_id: request_id.to_string(),
        }
    }

    fn record(data: serde_json::Value, deleted: bool) -> ResourceRecord {
        let created = Utc::now() - chrono::Duration::hours(1);
        ResourceRecord {
            tenant_key: TenantKey::new("B1", "L1"),
            resource_type: "appointments".to_string(),
            resource_id: "ap2501-00001".to_string(),
            data: doc(data),
            deleted,
            last_request_id: "r1".to_string(),
            created_at: created,
            updated_at: created,
        }
    }

    fn written(decision: Decision) -> ResourceRecord {
        match decision {
            Decision::Write(record) => record,
            Decision::Skip(outcome) => panic!("Expected write, got {:?}", outcome),
        }
    }

    #[test]
    fn test_patch_is_shallow() {
        let existing = record(
            json!({"status": "open", "notes": "x", "slot": {"start": 9, "end": 10}}),
            false,
        );
        let cmd = command(Operation::Patch, json!({"status": "done", "slot": {"start": 11}}), "r2");

        let updated = written(decide(Some(&existing), false, &cmd, Utc::now()));

        assert_eq!(
            serde_json::Value::Object(updated.data),
            json!({"status": "done", "notes": "x", "slot": {"start": 11}})
        );
        assert_eq!(updated.created_at, existing.created_at);
        assert_eq!(updated.last_request_id, "r2");
    }

    #[test]
    fn test_update_replaces_document() {
        let existing = record(json!({"status": "open", "notes": "x"}), false);
        let cmd = command(Operation::Update, json!({"status": "moved"}), "r2");

        let updated = written(decide(Some(&existing), false, &cmd, Utc::now()));
        assert_eq!(serde_json::Value::Object(updated.data), json!({"status": "moved"}));
    }

    #[test]
    fn test_mutations_on_missing_or_deleted_records_are_rejected() {
        let now = Utc::now();
        let update = command(Operation::Update, json!({"status": "x"}), "r3");
        let patch = command(Operation::Patch, json!({"status": "x"}), "r4");
        let tombstone = record(json!({"status": "open"}), true);

        assert_eq!(
            decide(None, false, &update, now),
            Decision::Skip(ApplyOutcome::Rejected(RejectReason::NotFound))
        );
        assert_eq!(
            decide(Some(&tombstone), false, &update, now),
            Decision::Skip(ApplyOutcome::Rejected(RejectReason::Tombstoned))
        );
        assert_eq!(
            decide(Some(&tombstone), false, &patch, now),
            Decision::Skip(ApplyOutcome::Rejected(RejectReason::Tombstoned))
        );
    }

    #[test]
    fn test_delete_keeps_tombstone() {
        let existing = record(json!({"status": "open"}), false);
        let cmd = command(Operation::Delete, json!({}), "r5");

        let deleted = written(decide(Some(&existing), false, &cmd, Utc::now()));
        assert!(deleted.deleted);
        assert_eq!(deleted.data, existing.data);

        let unknown = written(decide(None, false, &cmd, Utc::now()));
        assert!(unknown.deleted);
        assert!(unknown.data.is_empty());
    }

    #[test]
    fn test_create_collision_and_request_dedup() {
        let now = Utc::now();
        let existing = record(json!({"status": "open"}), false);
        let create = command(Operation::Create, json!({"status": "open"}), "r7");

        assert_eq!(
            decide(Some(&existing), false, &create, now),
            Decision::Skip(ApplyOutcome::Rejected(RejectReason::IdCollision))
        );
        assert_eq!(
            decide(Some(&existing), true, &create, now),
            Decision::Skip(ApplyOutcome::Duplicate)
        );
    }

    #[tokio::test]
    async fn test_pools_reuse_and_reconnect_on_move() {
        let memory = Arc::new(MemoryShards::new());
        let pools = ShardPools::new(Arc::new(UrlConnector::new(
            ShardPoolConfig::default(),
            memory.clone(),
        )));

        let a = ConnectionDescriptor::new("shard-a", "memory://one");
        let first = pools.get(&a).await.unwrap();
        let again = pools.get(&a).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let moved = ConnectionDescriptor::new("shard-a", "memory://two");
        let second = pools.get(&moved).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pools.connected_shards(), 1);
        assert_eq!(memory.len(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let pools = ShardPools::new(Arc::new(UrlConnector::new(
            ShardPoolConfig::default(),
            Arc::new(MemoryShards::new()),
        )));
        let err = pools
            .get(&ConnectionDescriptor::new("shard-x", "mysql://db/tenants"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BackendError::UnsupportedUrl(_)));
        assert!(!err.is_transient());
    }
}
