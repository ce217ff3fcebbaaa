//! Pipeline supervisor.
//!
//! Reads the source and hands each record to the worker for its partition,
//! spawning workers on first sight of a partition. Channels to workers are
//! unbounded; per-partition watermarks pause the partition at the source
//! instead, so a slow partition never blocks dispatch for the others.

use crate::checkpoint::PartitionId;
use crate::source::{LogRecord, SourceError};
use crate::worker::{PartitionSnapshot, PartitionState, PartitionWorker, WorkerContext, WorkerExit};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Unknown partition {0}")]
    UnknownPartition(PartitionId),

    #[error("Partition {0} is not parked")]
    NotParked(PartitionId),

    #[error("Pipeline is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Source(#[from] SourceError),
}

struct PartitionSlot {
    state: Arc<PartitionState>,
    sender: Option<mpsc::UnboundedSender<LogRecord>>,
    handle: Option<JoinHandle<WorkerExit>>,
}

/// Health of the whole pipeline as reported to operators
#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealth {
    pub partitions: Vec<PartitionSnapshot>,
    pub parked_partitions: usize,
    pub allocator_rollovers: u64,
    pub exhausted_allocation_keys: usize,
    pub shutting_down: bool,
}

pub struct PipelineSupervisor {
    ctx: Arc<WorkerContext>,
    partitions: Mutex<HashMap<PartitionId, PartitionSlot>>,
    cancel: CancellationToken,
}

impl PipelineSupervisor {
    pub fn new(ctx: Arc<WorkerContext>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            partitions: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Dispatch until shutdown or until the source closes, then wait for
    /// workers to stop. On shutdown each worker finishes its in-flight record.
    pub async fn run(&self) {
        info!("Pipeline supervisor started");

        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                received = self.ctx.source.recv() => received,
            };

            match received {
                Ok(record) => self.dispatch(record),
                Err(SourceError::Closed) => {
                    info!("Event source closed");
                    break;
                }
                Err(e) => {
                    metrics::counter!("pipeline.source.errors").increment(1);
                    error!(error = %e, "Event source error");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            }
        }

        self.drain().await;
        info!("Pipeline supervisor stopped");
    }

    /// Stop pulling records. `run` returns once workers have stopped.
    pub fn shutdown(&self) {
        info!("Pipeline shutdown requested");
        self.cancel.cancel();
    }

    fn dispatch(&self, record: LogRecord) {
        let mut partitions = self.partitions.lock();
        let slot = partitions
            .entry(record.partition.clone())
            .or_insert_with(|| PartitionSlot {
                state: Arc::new(PartitionState::new(record.partition.clone())),
                sender: None,
                handle: None,
            });

        if slot.state.is_parked() {
            // Redelivered from the parked offset once an operator resumes
            debug!(partition = %record.partition, offset = record.offset, "Dropping record for parked partition");
            return;
        }

        if slot.sender.is_none() {
            self.spawn_worker(slot, record.offset);
        }

        slot.state
            .enqueued(self.ctx.source.as_ref(), self.ctx.config.queue_high_watermark);
        if let Some(sender) = &slot.sender {
            if let Err(mpsc::error::SendError(record)) = sender.send(record) {
                // The worker parked, died or stopped between the check and the
                // send. A parked partition replays from its parked offset.
                if slot.state.is_parked() {
                    debug!(partition = %record.partition, offset = record.offset, "Worker gone, record dropped");
                } else {
                    warn!(partition = %record.partition, offset = record.offset, "Worker stopped, record dropped");
                }
            }
        }
    }

    /// Start a worker whose first record is at `from_offset`. A panicking
    /// worker parks the partition at its first unchecked record instead of
    /// vanishing.
    fn spawn_worker(&self, slot: &mut PartitionSlot, from_offset: i64) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = PartitionWorker::new(
            self.ctx.clone(),
            slot.state.clone(),
            self.cancel.child_token(),
        );
        let state = slot.state.clone();
        let source = self.ctx.source.clone();

        slot.sender = Some(sender);
        slot.handle = Some(tokio::spawn(async move {
            match AssertUnwindSafe(worker.run(receiver)).catch_unwind().await {
                Ok(exit) => exit,
                Err(panic) => {
                    let offset = state
                        .checkpoint()
                        .map_or(from_offset, |checkpoint| (checkpoint + 1).max(from_offset));
                    state.park_failed_worker(source.as_ref(), offset, panic_message(&*panic));
                    WorkerExit::Failed
                }
            }
        }));
        info!(partition = %slot.state.id(), from_offset, "Spawned partition worker");
    }

    async fn drain(&self) {
        let handles: Vec<(PartitionId, JoinHandle<WorkerExit>)> = {
            let mut partitions = self.partitions.lock();
            partitions
                .iter_mut()
                .filter_map(|(id, slot)| {
                    slot.sender = None;
                    slot.handle.take().map(|handle| (id.clone(), handle))
                })
                .collect()
        };

        info!(workers = handles.len(), "Waiting for partition workers");
        for (partition, handle) in handles {
            match handle.await {
                Ok(exit) => debug!(partition = %partition, ?exit, "Worker joined"),
                Err(e) => error!(partition = %partition, error = %e, "Worker task failed"),
            }
        }
    }

    pub fn partition(&self, partition: &PartitionId) -> Option<PartitionSnapshot> {
        self.partitions
            .lock()
            .get(partition)
            .map(|slot| slot.state.snapshot())
    }

    pub fn snapshot(&self) -> PipelineHealth {
        let mut partitions: Vec<PartitionSnapshot> = self
            .partitions
            .lock()
            .values()
            .map(|slot| slot.state.snapshot())
            .collect();
        partitions.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));

        PipelineHealth {
            parked_partitions: partitions.iter().filter(|p| p.parked.is_some()).count(),
            partitions,
            allocator_rollovers: self.ctx.allocator.rollovers(),
            exhausted_allocation_keys: self.ctx.allocator.exhausted_keys(),
            shutting_down: self.cancel.is_cancelled(),
        }
    }

    /// Operator action: replay a parked partition from the record that parked it.
    ///
    /// Call once the cause is fixed (tenant provisioned, shard back). If it is
    /// not, the partition simply parks again on the same record.
    pub fn resume_partition(&self, partition: &PartitionId) -> Result<PartitionSnapshot, SupervisorError> {
        if self.cancel.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }

        let mut partitions = self.partitions.lock();
        let slot = partitions
            .get_mut(partition)
            .ok_or_else(|| SupervisorError::UnknownPartition(partition.clone()))?;

        let parked = slot
            .state
            .parked()
            .ok_or_else(|| SupervisorError::NotParked(partition.clone()))?;

        self.ctx.source.rewind(partition, parked.offset)?;
        if parked.kind == "allocation_exhausted" {
            // The operator reset the counter; let the shard decide again
            self.ctx.allocator.release_exhausted();
        }
        slot.state.unpark();
        // The parked worker has already returned
        slot.handle = None;
        self.spawn_worker(slot, parked.offset);

        if let Err(e) = self.ctx.source.resume(partition) {
            warn!(partition = %partition, error = %e, "Failed to resume partition at source");
            return Err(e.into());
        }

        metrics::gauge!("pipeline.partitions.parked").decrement(1.0);
        info!(
            partition = %partition,
            offset = parked.offset,
            kind = parked.kind,
            "Parked partition resumed by operator"
        );
        Ok(slot.state.snapshot())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}
