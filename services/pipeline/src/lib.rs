//! Tenantflow Pipeline - partitioned ingestion of resource mutations
//!
//! Mutation events arrive on a partitioned log keyed by tenant and resource
//! type. Each partition is applied strictly in order against the tenant's
//! shard, with:
//!
//! - Idempotent application keyed by request id
//! - Per-tenant, per-month resource id allocation for creates
//! - A durable per-partition checkpoint committed after every apply
//! - Best-effort notifications once a mutation is durable
//!
//! A partition that hits a permanent failure, or runs out of retries, is
//! parked at the failing offset while the other partitions keep flowing.
//! Operators resume it over the HTTP API.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tenantflow_pipeline::{PipelineSupervisor, WorkerContext};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run(ctx: Arc<WorkerContext>) {
//!     let supervisor = Arc::new(PipelineSupervisor::new(ctx, CancellationToken::new()));
//!     supervisor.run().await;
//! }
//! ```

pub mod allocator;
pub mod api;
pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod model;
pub mod notifier;
pub mod shard_directory;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
mod testing;

pub use allocator::{AllocationError, ResourceIdAllocator};
pub use checkpoint::{CheckpointError, CheckpointStore, PartitionId};
pub use config::{Config, ConfigError, KafkaConfig, WorkerConfig};
pub use model::{MutationEvent, Notification, Operation, TenantKey};
pub use notifier::{NotificationEmitter, NotificationSink, NotifyError};
pub use shard_directory::{ConnectionDescriptor, DirectoryError, ShardDirectory};
pub use source::{EventSource, LogRecord, SourceError};
pub use store::{ResourceStore, ShardHandle, StoreError};
pub use supervisor::{PipelineHealth, PipelineSupervisor, SupervisorError};
pub use worker::{PartitionSnapshot, PartitionWorker, WorkerContext};
