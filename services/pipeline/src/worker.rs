//! Partition worker.
//!
//! One worker owns one log partition and handles its records strictly in
//! offset order. A record is resolved to one of three dispositions (applied,
//! duplicate or rejected) and then checkpointed, or the partition is parked.
//! Parking is the only way a record is left behind; the worker never skips
//! past a record it could not handle.

use crate::allocator::{AllocationError, ResourceIdAllocator};
use crate::backend::ApplyCommand;
use crate::checkpoint::{CheckpointError, CheckpointStore, PartitionId};
use crate::config::WorkerConfig;
use crate::model::{ApplyOutcome, EventError, MutationEvent, Notification, Operation};
use crate::notifier::NotificationEmitter;
use crate::source::{EventSource, LogRecord};
use crate::store::{ResourceStore, StoreError};
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Why handling a record failed
#[derive(Error, Debug)]
pub enum EventFailure {
    #[error("Undecodable record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid mutation event: {0}")]
    Invalid(#[from] EventError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl EventFailure {
    pub fn is_transient(&self) -> bool {
        match self {
            EventFailure::Decode(_) | EventFailure::Invalid(_) => false,
            EventFailure::Store(e) => e.is_transient(),
            EventFailure::Allocation(e) => e.is_transient(),
            EventFailure::Checkpoint(_) => true,
        }
    }

    /// Short label for metrics and the operator surface
    pub fn kind(&self) -> &'static str {
        match self {
            EventFailure::Decode(_) | EventFailure::Invalid(_) => "malformed",
            EventFailure::Store(StoreError::UnknownTenant(_)) => "unknown_tenant",
            EventFailure::Store(_) => "store",
            EventFailure::Allocation(AllocationError::Exhausted { .. }) => "allocation_exhausted",
            EventFailure::Allocation(_) => "store",
            EventFailure::Checkpoint(_) => "checkpoint",
        }
    }
}

/// Record that stopped a partition
#[derive(Debug, Clone, Serialize)]
pub struct ParkedInfo {
    pub offset: i64,
    pub kind: &'static str,
    pub reason: String,
    pub attempts: u32,
    pub since: DateTime<Utc>,
}

#[derive(Default)]
struct FlowControl {
    queued: usize,
    paused: bool,
    parked: Option<ParkedInfo>,
}

/// Shared view of one partition, updated by its worker and the dispatcher
pub struct PartitionState {
    id: PartitionId,
    /// Last checkpointed offset, -1 before the first
    checkpoint: AtomicI64,
    processed: AtomicU64,
    flow: Mutex<FlowControl>,
}

/// Point-in-time view of a partition for operators
#[derive(Debug, Clone, Serialize)]
pub struct PartitionSnapshot {
    pub topic: String,
    pub partition: i32,
    pub checkpoint: Option<i64>,
    pub processed: u64,
    pub queued: usize,
    pub paused: bool,
    pub parked: Option<ParkedInfo>,
}

impl PartitionState {
    pub fn new(id: PartitionId) -> Self {
        Self {
            id,
            checkpoint: AtomicI64::new(-1),
            processed: AtomicU64::new(0),
            flow: Mutex::new(FlowControl::default()),
        }
    }

    pub fn id(&self) -> &PartitionId {
        &self.id
    }

    pub fn checkpoint(&self) -> Option<i64> {
        let offset = self.checkpoint.load(Ordering::Acquire);
        (offset >= 0).then_some(offset)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn parked(&self) -> Option<ParkedInfo> {
        self.flow.lock().parked.clone()
    }

    pub fn is_parked(&self) -> bool {
        self.flow.lock().parked.is_some()
    }

    pub fn snapshot(&self) -> PartitionSnapshot {
        let flow = self.flow.lock();
        PartitionSnapshot {
            topic: self.id.topic.clone(),
            partition: self.id.partition,
            checkpoint: self.checkpoint(),
            processed: self.processed(),
            queued: flow.queued,
            paused: flow.paused,
            parked: flow.parked.clone(),
        }
    }

    fn record_checkpoint(&self, offset: i64) {
        self.checkpoint.fetch_max(offset, Ordering::AcqRel);
    }

    /// Count a record handed to the worker; pause the partition at the high watermark
    pub(crate) fn enqueued(&self, source: &dyn EventSource, high_watermark: usize) {
        let mut flow = self.flow.lock();
        flow.queued += 1;
        if flow.queued >= high_watermark && !flow.paused {
            match source.pause(&self.id) {
                Ok(()) => {
                    flow.paused = true;
                    debug!(partition = %self.id, queued = flow.queued, "Partition paused for backpressure");
                }
                Err(e) => warn!(partition = %self.id, error = %e, "Failed to pause partition"),
            }
        }
    }

    /// Count a record taken by the worker; resume at the low watermark unless parked
    pub(crate) fn dequeued(&self, source: &dyn EventSource, low_watermark: usize) {
        let mut flow = self.flow.lock();
        flow.queued = flow.queued.saturating_sub(1);
        if flow.paused && flow.parked.is_none() && flow.queued <= low_watermark {
            match source.resume(&self.id) {
                Ok(()) => {
                    flow.paused = false;
                    debug!(partition = %self.id, queued = flow.queued, "Partition resumed");
                }
                Err(e) => warn!(partition = %self.id, error = %e, "Failed to resume partition"),
            }
        }
    }

    fn park(&self, source: &dyn EventSource, info: ParkedInfo) {
        let mut flow = self.flow.lock();
        if let Err(e) = source.pause(&self.id) {
            warn!(partition = %self.id, error = %e, "Failed to pause parked partition");
        }
        flow.paused = true;
        flow.parked = Some(info);
    }

    /// Park after the worker task died. `offset` is the first record not yet
    /// checkpointed, so a resume replays everything the dead worker held.
    pub(crate) fn park_failed_worker(&self, source: &dyn EventSource, offset: i64, reason: String) {
        error!(
            partition = %self.id,
            offset,
            reason = %reason,
            "Partition worker died, partition parked"
        );
        metrics::counter!("pipeline.events.parked", "kind" => "worker_failed").increment(1);
        metrics::gauge!("pipeline.partitions.parked").increment(1.0);

        self.park(
            source,
            ParkedInfo {
                offset,
                kind: "worker_failed",
                reason,
                attempts: 1,
                since: Utc::now(),
            },
        );
    }

    /// Clear the parked state ahead of a restart. Returns the parked record.
    pub(crate) fn unpark(&self) -> Option<ParkedInfo> {
        let mut flow = self.flow.lock();
        let parked = flow.parked.take()?;
        flow.queued = 0;
        flow.paused = false;
        Some(parked)
    }
}

/// Everything a worker needs, shared by all partitions
pub struct WorkerContext {
    pub store: Arc<ResourceStore>,
    pub allocator: Arc<ResourceIdAllocator>,
    pub emitter: Arc<NotificationEmitter>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub source: Arc<dyn EventSource>,
    pub config: WorkerConfig,
}

/// How a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The dispatcher went away and the queue is empty
    Drained,
    Cancelled,
    Parked,
    /// The task panicked; the supervisor parked the partition
    Failed,
}

/// What happened to a handled record
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Applied { resource_id: String, notified: usize },
    Duplicate { resource_id: String },
    Rejected { resource_id: String, reason: &'static str },
    /// At or below the checkpoint; handled by an earlier run
    Skipped,
}

enum Halt {
    Cancelled,
    Park { failure: EventFailure, attempts: u32 },
}

struct RetryState {
    backoff: ExponentialBackoff,
    attempts: u32,
}

/// State that must survive retries of one event
#[derive(Default)]
struct ApplyAttempt {
    allocated: Option<String>,
    /// An apply failed in a way that may still have committed
    uncertain: bool,
}

pub struct PartitionWorker {
    ctx: Arc<WorkerContext>,
    state: Arc<PartitionState>,
    cancel: CancellationToken,
    checkpoint_loaded: bool,
}

impl PartitionWorker {
    pub fn new(ctx: Arc<WorkerContext>, state: Arc<PartitionState>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            state,
            cancel,
            checkpoint_loaded: false,
        }
    }

    /// Consume records from the dispatcher until cancelled, drained or parked
    pub async fn run(mut self, mut records: mpsc::UnboundedReceiver<LogRecord>) -> WorkerExit {
        let partition = self.state.id().clone();
        info!(partition = %partition, "Partition worker started");

        let exit = loop {
            let record = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break WorkerExit::Cancelled,
                record = records.recv() => match record {
                    Some(record) => record,
                    None => break WorkerExit::Drained,
                },
            };
            self.state
                .dequeued(self.ctx.source.as_ref(), self.ctx.config.queue_low_watermark);

            match self.handle(&record).await {
                Ok(disposition) => {
                    debug!(partition = %partition, offset = record.offset, ?disposition, "Record handled");
                }
                Err(Halt::Cancelled) => break WorkerExit::Cancelled,
                Err(Halt::Park { failure, attempts }) => {
                    self.park(&record, failure, attempts);
                    break WorkerExit::Parked;
                }
            }
        };

        info!(partition = %partition, ?exit, "Partition worker stopped");
        exit
    }

    /// Resolve a record to a disposition and checkpoint it
    #[instrument(skip(self, record), fields(partition = %record.partition, offset = record.offset))]
    async fn handle(&mut self, record: &LogRecord) -> Result<Disposition, Halt> {
        if !self.checkpoint_loaded {
            let mut retry = self.retry_state();
            let loaded = loop {
                match self.ctx.checkpoints.load(self.state.id()).await {
                    Ok(loaded) => break loaded,
                    Err(e) => self.back_off(&mut retry, "load checkpoint", e.into()).await?,
                }
            };
            if let Some(offset) = loaded {
                self.state.record_checkpoint(offset);
            }
            self.checkpoint_loaded = true;
        }

        if self.state.checkpoint().is_some_and(|c| record.offset <= c) {
            metrics::counter!("pipeline.events.skipped").increment(1);
            self.acknowledge(record.offset);
            return Ok(Disposition::Skipped);
        }

        let event = decode(record).map_err(|failure| Halt::Park {
            failure,
            attempts: 1,
        })?;
        let disposition = self.process(&event).await?;

        let mut retry = self.retry_state();
        while let Err(e) = self
            .ctx
            .checkpoints
            .commit(self.state.id(), record.offset)
            .await
        {
            self.back_off(&mut retry, "commit checkpoint", e.into()).await?;
        }

        self.state.record_checkpoint(record.offset);
        self.state.processed.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!(
            "pipeline.partition.checkpoint",
            "topic" => self.state.id().topic.clone(),
            "partition" => self.state.id().partition.to_string()
        )
        .set(record.offset as f64);
        self.acknowledge(record.offset);

        Ok(disposition)
    }

    async fn process(&self, event: &MutationEvent) -> Result<Disposition, Halt> {
        let mut attempt = ApplyAttempt::default();
        let mut retry = self.retry_state();

        let (resource_id, outcome) = loop {
            match self.try_apply(event, &mut attempt).await {
                Ok(applied) => break applied,
                Err(failure) => self.back_off(&mut retry, "apply mutation", failure).await?,
            }
        };

        let disposition = match outcome {
            ApplyOutcome::Applied(_) => {
                metrics::counter!("pipeline.events.applied", "operation" => event.operation.as_str())
                    .increment(1);
                let notified = self.notify(event, &resource_id).await;
                Disposition::Applied {
                    resource_id,
                    notified,
                }
            }
            ApplyOutcome::Duplicate => {
                metrics::counter!("pipeline.events.duplicate").increment(1);
                debug!(
                    request_id = %event.request_id,
                    resource_id = %resource_id,
                    "Request already applied"
                );
                // A timed out attempt may have committed without us seeing it,
                // in which case nobody was notified yet.
                if attempt.uncertain {
                    self.notify(event, &resource_id).await;
                }
                Disposition::Duplicate { resource_id }
            }
            ApplyOutcome::Rejected(reason) => {
                metrics::counter!("pipeline.events.rejected", "reason" => reason.as_str()).increment(1);
                warn!(
                    tenant = %event.tenant_key,
                    resource_type = %event.resource_type,
                    resource_id = %resource_id,
                    operation = %event.operation,
                    request_id = %event.request_id,
                    reason = %reason,
                    "Mutation rejected"
                );
                Disposition::Rejected {
                    resource_id,
                    reason: reason.as_str(),
                }
            }
        };

        Ok(disposition)
    }

    /// One pass of resolve, allocate and apply
    async fn try_apply(
        &self,
        event: &MutationEvent,
        attempt: &mut ApplyAttempt,
    ) -> Result<(String, ApplyOutcome), EventFailure> {
        let shard = self.ctx.store.shard(&event.tenant_key).await?;

        let resource_id = match (event.operation, &event.resource_id) {
            (Operation::Create, _) => match &attempt.allocated {
                Some(id) => id.clone(),
                None => {
                    // A redelivered create keeps the id its first delivery got
                    let id = match shard.lookup_create(&event.scope(), &event.request_id).await? {
                        Some(applied_to) => applied_to,
                        None => {
                            self.ctx
                                .allocator
                                .allocate(
                                    &shard,
                                    &event.tenant_key,
                                    &event.resource_type,
                                    event.produced_at,
                                )
                                .await?
                        }
                    };
                    attempt.allocated = Some(id.clone());
                    id
                }
            },
            (_, Some(id)) => id.clone(),
            (operation, None) => return Err(EventError::MissingResourceId(operation).into()),
        };

        let command = ApplyCommand {
            tenant_key: event.tenant_key.clone(),
            resource_type: event.resource_type.clone(),
            resource_id,
            operation: event.operation,
            payload: event.payload.clone(),
            request_id: event.request_id.clone(),
        };

        match shard.apply(&command).await {
            Ok(outcome) => Ok((command.resource_id, outcome)),
            Err(e) => {
                attempt.uncertain = true;
                Err(e.into())
            }
        }
    }

    async fn notify(&self, event: &MutationEvent, resource_id: &str) -> usize {
        let notification = Notification {
            tenant_key: event.tenant_key.clone(),
            resource_type: event.resource_type.clone(),
            resource_id: resource_id.to_string(),
            operation: event.operation,
        };
        self.ctx.emitter.emit(&notification, &event.request_id).await
    }

    fn retry_state(&self) -> RetryState {
        RetryState {
            backoff: ExponentialBackoff {
                initial_interval: self.ctx.config.initial_backoff(),
                max_interval: self.ctx.config.max_backoff(),
                max_elapsed_time: None,
                ..Default::default()
            },
            attempts: 0,
        }
    }

    /// Decide what to do after a failed attempt: sleep before the next one,
    /// or halt when the failure is permanent or the attempt budget is spent.
    /// The sleep ends early on shutdown; a running attempt is never interrupted.
    async fn back_off(
        &self,
        retry: &mut RetryState,
        what: &str,
        failure: EventFailure,
    ) -> Result<(), Halt> {
        let max_attempts = self.ctx.config.max_attempts;
        retry.attempts += 1;

        if !failure.is_transient() || retry.attempts >= max_attempts {
            return Err(Halt::Park {
                failure,
                attempts: retry.attempts,
            });
        }

        let delay = retry
            .backoff
            .next_backoff()
            .unwrap_or_else(|| self.ctx.config.max_backoff());
        metrics::counter!("pipeline.events.retried").increment(1);
        warn!(
            partition = %self.state.id(),
            attempt = retry.attempts,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Failed to {}, retrying",
            what
        );

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn acknowledge(&self, offset: i64) {
        if let Err(e) = self.ctx.source.acknowledge(self.state.id(), offset) {
            // The checkpoint is authoritative; a lagging source offset only
            // means more records are skipped after a restart.
            warn!(partition = %self.state.id(), offset, error = %e, "Failed to acknowledge offset");
        }
    }

    fn park(&self, record: &LogRecord, failure: EventFailure, attempts: u32) {
        let info = ParkedInfo {
            offset: record.offset,
            kind: failure.kind(),
            reason: failure.to_string(),
            attempts,
            since: Utc::now(),
        };

        error!(
            partition = %self.state.id(),
            offset = record.offset,
            kind = info.kind,
            attempts,
            error = %failure,
            "Partition parked, operator action required"
        );
        metrics::counter!("pipeline.events.parked", "kind" => info.kind).increment(1);
        metrics::gauge!("pipeline.partitions.parked").increment(1.0);

        self.state.park(self.ctx.source.as_ref(), info);
    }
}

fn decode(record: &LogRecord) -> Result<MutationEvent, EventFailure> {
    let event: MutationEvent = record.decode_json()?;
    event.validate()?;
    Ok(event)
}
