//! Resource store: routes each tenant to its shard and bounds every call.

use crate::backend::{ApplyCommand, BackendError, CounterKey, ShardBackend, ShardPools};
use crate::model::{ApplyOutcome, ResourceRecord, ResourceScope, TenantKey};
use crate::shard_directory::{ConnectionDescriptor, DirectoryError, ShardDirectory};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("No shard assigned to tenant {0}")]
    UnknownTenant(TenantKey),

    #[error("Shard directory unavailable: {0}")]
    Directory(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Whether retrying the same call can succeed without outside action
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::UnknownTenant(_) => false,
            StoreError::Directory(_) | StoreError::Timeout(_) => true,
            StoreError::Backend(e) => e.is_transient(),
        }
    }
}

impl From<DirectoryError> for StoreError {
    fn from(error: DirectoryError) -> Self {
        match error {
            DirectoryError::UnknownTenant(tenant) => StoreError::UnknownTenant(tenant),
            DirectoryError::Lookup(message) => StoreError::Directory(message),
        }
    }
}

pub struct ResourceStore {
    directory: Arc<ShardDirectory>,
    pools: Arc<ShardPools>,
    call_timeout: Duration,
}

impl ResourceStore {
    pub fn new(directory: Arc<ShardDirectory>, pools: Arc<ShardPools>, call_timeout: Duration) -> Self {
        Self {
            directory,
            pools,
            call_timeout,
        }
    }

    pub fn directory(&self) -> &Arc<ShardDirectory> {
        &self.directory
    }

    /// Resolve the tenant and hand back a handle bound to its shard.
    ///
    /// The handle pins the connection for the duration of one event, so the
    /// idempotency lookup, allocation and apply all land on the same shard.
    #[instrument(skip(self), fields(tenant = %tenant))]
    pub async fn shard(&self, tenant: &TenantKey) -> Result<ShardHandle, StoreError> {
        let descriptor = with_timeout(self.call_timeout, async {
            self.directory.resolve(tenant).await.map_err(StoreError::from)
        })
        .await?;

        let backend = with_timeout(self.call_timeout, async {
            self.pools.get(&descriptor).await.map_err(StoreError::from)
        })
        .await?;

        Ok(ShardHandle::new(descriptor, backend, self.call_timeout))
    }
}

/// One tenant shard, with per-call timeouts
#[derive(Clone)]
pub struct ShardHandle {
    descriptor: ConnectionDescriptor,
    backend: Arc<dyn ShardBackend>,
    call_timeout: Duration,
}

impl ShardHandle {
    pub fn new(
        descriptor: ConnectionDescriptor,
        backend: Arc<dyn ShardBackend>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            descriptor,
            backend,
            call_timeout,
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.descriptor.shard_id
    }

    pub async fn apply(&self, command: &ApplyCommand) -> Result<ApplyOutcome, StoreError> {
        let started = Instant::now();
        let result = with_timeout(self.call_timeout, async {
            self.backend.apply(command).await.map_err(StoreError::from)
        })
        .await;

        metrics::histogram!("pipeline.apply.duration_seconds").record(started.elapsed().as_secs_f64());
        debug!(
            shard_id = %self.descriptor.shard_id,
            resource_id = %command.resource_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Shard apply finished"
        );
        result
    }

    /// Resource id an already applied create with this request id minted
    pub async fn lookup_create(
        &self,
        scope: &ResourceScope,
        request_id: &str,
    ) -> Result<Option<String>, StoreError> {
        with_timeout(self.call_timeout, async {
            self.backend
                .find_create(scope, request_id)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    pub async fn fetch(
        &self,
        scope: &ResourceScope,
        resource_id: &str,
    ) -> Result<Option<ResourceRecord>, StoreError> {
        with_timeout(self.call_timeout, async {
            self.backend
                .fetch(scope, resource_id)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    pub(crate) async fn increment_counter(
        &self,
        key: &CounterKey,
        limit: u32,
    ) -> Result<Option<u32>, StoreError> {
        with_timeout(self.call_timeout, async {
            self.backend
                .increment_counter(key, limit)
                .await
                .map_err(StoreError::from)
        })
        .await
    }
}

async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryShards, UrlConnector};
    use crate::config::ShardPoolConfig;
    use crate::model::{Document, Operation};
    use crate::shard_directory::StaticAssignmentSource;
    use async_trait::async_trait;

    fn store_with(source: StaticAssignmentSource, memory: Arc<MemoryShards>) -> ResourceStore {
        let directory = Arc::new(ShardDirectory::new(Arc::new(source), Duration::from_secs(60)));
        let pools = Arc::new(ShardPools::new(Arc::new(UrlConnector::new(
            ShardPoolConfig::default(),
            memory,
        ))));
        ResourceStore::new(directory, pools, Duration::from_secs(1))
    }

    fn create(tenant: &TenantKey) -> ApplyCommand {
        ApplyCommand {
            tenant_key: tenant.clone(),
            resource_type: "appointments".to_string(),
            resource_id: "ap2501-00001".to_string(),
            operation: Operation::Create,
            payload: Document::new(),
            request_id: "r1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_routes_tenants_to_their_shards() {
        let memory = Arc::new(MemoryShards::new());
        let source = StaticAssignmentSource::new();
        let b1 = TenantKey::new("B1", "L1");
        let b2 = TenantKey::new("B2", "L1");
        source.assign(b1.clone(), ConnectionDescriptor::new("one", "memory://one"));
        source.assign(b2.clone(), ConnectionDescriptor::new("two", "memory://two"));
        let store = store_with(source, memory.clone());

        let shard = store.shard(&b1).await.unwrap();
        assert_eq!(shard.shard_id(), "one");
        shard.apply(&create(&b1)).await.unwrap();

        let scope = create(&b1).scope();
        assert_eq!(memory.get("one").unwrap().records(&scope).len(), 1);
        assert!(store
            .shard(&b2)
            .await
            .unwrap()
            .fetch(&scope, "ap2501-00001")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_permanent() {
        let store = store_with(StaticAssignmentSource::new(), Arc::new(MemoryShards::new()));

        let err = store.shard(&TenantKey::new("B9", "L9")).await.err().unwrap();
        assert!(matches!(err, StoreError::UnknownTenant(_)));
        assert!(!err.is_transient());
    }

    struct StalledBackend;

    #[async_trait]
    impl ShardBackend for StalledBackend {
        async fn increment_counter(&self, _: &CounterKey, _: u32) -> Result<Option<u32>, BackendError> {
            std::future::pending().await
        }
        async fn find_create(&self, _: &ResourceScope, _: &str) -> Result<Option<String>, BackendError> {
            std::future::pending().await
        }
        async fn apply(&self, _: &ApplyCommand) -> Result<ApplyOutcome, BackendError> {
            std::future::pending().await
        }
        async fn fetch(&self, _: &ResourceScope, _: &str) -> Result<Option<ResourceRecord>, BackendError> {
            std::future::pending().await
        }
        async fn ping(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_shard_times_out_as_transient() {
        let backend: Arc<dyn ShardBackend> = Arc::new(StalledBackend);
        let handle = ShardHandle::new(
            ConnectionDescriptor::new("slow", "memory://slow"),
            backend,
            Duration::from_millis(250),
        );

        let err = handle.apply(&create(&TenantKey::new("B1", "L1"))).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert!(err.is_transient());
    }
}
