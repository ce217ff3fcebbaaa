//! Fixtures shared by the worker and supervisor tests.

use crate::allocator::ResourceIdAllocator;
use crate::backend::{MemoryBackend, MemoryShards, ShardPools, UrlConnector};
use crate::checkpoint::{MemoryCheckpointStore, PartitionId};
use crate::config::{AllocatorConfig, ShardPoolConfig, WorkerConfig};
use crate::model::{MutationEvent, Operation, ResourceScope, TenantKey};
use crate::notifier::{BroadcastNotificationSink, NotificationEmitter, NotificationSink};
use crate::shard_directory::{ConnectionDescriptor, ShardDirectory, StaticAssignmentSource};
use crate::source::{EventSource, LogRecord, MemoryEventSource};
use crate::store::ResourceStore;
use crate::worker::WorkerContext;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const TOPIC: &str = "tenantflow.mutations";

pub struct Harness {
    pub source: Arc<MemoryEventSource>,
    pub shards: Arc<MemoryShards>,
    pub assignments: Arc<StaticAssignmentSource>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub notifications: Arc<BroadcastNotificationSink>,
    pub allocator: Arc<ResourceIdAllocator>,
    pub ctx: Arc<WorkerContext>,
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        max_attempts: 3,
        initial_backoff_ms: 10,
        max_backoff_ms: 40,
        apply_timeout_ms: 500,
        ..Default::default()
    }
}

impl Harness {
    /// B1/L1 lives on `memory://shard-a`
    pub fn new() -> Self {
        Self::with_config(worker_config())
    }

    pub fn with_config(config: WorkerConfig) -> Self {
        Self::build(
            config,
            Arc::new(MemoryEventSource::new(TOPIC)),
            Arc::new(MemoryShards::new()),
            Arc::new(MemoryCheckpointStore::new()),
        )
    }

    /// Same shards and checkpoints, new consumer: a process restart
    pub fn restart(&self, source: MemoryEventSource) -> Self {
        Self::build(
            self.ctx.config.clone(),
            Arc::new(source),
            self.shards.clone(),
            self.checkpoints.clone(),
        )
    }

    fn build(
        config: WorkerConfig,
        source: Arc<MemoryEventSource>,
        shards: Arc<MemoryShards>,
        checkpoints: Arc<MemoryCheckpointStore>,
    ) -> Self {
        let assignments = Arc::new(StaticAssignmentSource::new());
        assignments.assign(
            tenant(),
            ConnectionDescriptor::new("shard-a", "memory://shard-a"),
        );

        let directory = Arc::new(ShardDirectory::new(
            assignments.clone(),
            Duration::from_secs(60),
        ));
        let pools = Arc::new(ShardPools::new(Arc::new(UrlConnector::new(
            ShardPoolConfig::default(),
            shards.clone(),
        ))));
        let store = Arc::new(ResourceStore::new(directory, pools, config.apply_timeout()));

        let notifications = Arc::new(BroadcastNotificationSink::new(64));
        let sinks: Vec<Arc<dyn NotificationSink>> = vec![notifications.clone()];
        let emitter = Arc::new(NotificationEmitter::new(sinks, Duration::from_secs(1)));
        let allocator = Arc::new(ResourceIdAllocator::new(&AllocatorConfig::default()));

        let event_source: Arc<dyn EventSource> = source.clone();
        let ctx = Arc::new(WorkerContext {
            store,
            allocator: allocator.clone(),
            emitter,
            checkpoints: checkpoints.clone(),
            source: event_source,
            config,
        });

        Self {
            source,
            shards,
            assignments,
            checkpoints,
            notifications,
            allocator,
            ctx,
        }
    }

    pub fn shard(&self) -> Arc<MemoryBackend> {
        self.shards.get_or_create("shard-a")
    }

    pub fn push(&self, partition: i32, event: &MutationEvent) -> i64 {
        self.source
            .push_json(partition, Some(&event.partition_key()), event)
            .unwrap()
    }

    pub fn partition(&self, partition: i32) -> PartitionId {
        PartitionId::new(TOPIC, partition)
    }
}

pub fn tenant() -> TenantKey {
    TenantKey::new("B1", "L1")
}

pub fn scope() -> ResourceScope {
    ResourceScope {
        tenant_key: tenant(),
        resource_type: "appointments".to_string(),
    }
}

/// An `appointments` event for B1/L1 produced in January 2025
pub fn event(
    operation: Operation,
    resource_id: Option<&str>,
    payload: serde_json::Value,
    request_id: &str,
) -> MutationEvent {
    MutationEvent {
        operation,
        tenant_key: tenant(),
        resource_type: "appointments".to_string(),
        resource_id: resource_id.map(str::to_string),
        payload: payload.as_object().cloned().unwrap_or_default(),
        request_id: request_id.to_string(),
        produced_at: Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap(),
    }
}

pub fn record(partition: i32, offset: i64, event: &MutationEvent) -> LogRecord {
    LogRecord {
        partition: PartitionId::new(TOPIC, partition),
        offset,
        key: Some(event.partition_key().into_bytes()),
        payload: serde_json::to_vec(event).unwrap(),
        timestamp: None,
        headers: HashMap::new(),
    }
}
