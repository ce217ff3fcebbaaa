//! Per-partition checkpoints.
//!
//! A checkpoint is the offset of the last event whose store mutation is
//! durable. It is written after the apply commits and never moves backwards,
//! so a restart replays at most the event that was in flight.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::postgres::PgPool;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint store error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One partition of the inbound log
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PartitionId {
    pub topic: String,
    pub partition: i32,
}

impl PartitionId {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Offset of the last durably applied event, if any
    async fn load(&self, partition: &PartitionId) -> Result<Option<i64>, CheckpointError>;

    /// Record `offset` as applied. Lower offsets than the stored one are ignored.
    async fn commit(&self, partition: &PartitionId, offset: i64) -> Result<(), CheckpointError>;
}

/// Checkpoints in the control database, scoped by consumer group
pub struct PgCheckpointStore {
    pool: PgPool,
    consumer_group: String,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool, consumer_group: impl Into<String>) -> Self {
        Self {
            pool,
            consumer_group: consumer_group.into(),
        }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, partition: &PartitionId) -> Result<Option<i64>, CheckpointError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT log_offset FROM partition_checkpoints
            WHERE consumer_group = $1 AND topic = $2 AND partition = $3
            "#,
        )
        .bind(&self.consumer_group)
        .bind(&partition.topic)
        .bind(partition.partition)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(offset,)| offset))
    }

    #[instrument(skip(self), fields(partition = %partition))]
    async fn commit(&self, partition: &PartitionId, offset: i64) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            INSERT INTO partition_checkpoints (consumer_group, topic, partition, log_offset, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (consumer_group, topic, partition)
            DO UPDATE SET log_offset = GREATEST(partition_checkpoints.log_offset, EXCLUDED.log_offset),
                          updated_at = NOW()
            "#,
        )
        .bind(&self.consumer_group)
        .bind(&partition.topic)
        .bind(partition.partition)
        .bind(offset)
        .execute(&self.pool)
        .await?;

        debug!(offset, "Checkpoint committed");
        Ok(())
    }
}

/// Process-local checkpoints for tests and single-node runs without a control database
#[derive(Default)]
pub struct MemoryCheckpointStore {
    offsets: Mutex<HashMap<PartitionId, i64>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: &PartitionId) -> Option<i64> {
        self.offsets.lock().get(partition).copied()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, partition: &PartitionId) -> Result<Option<i64>, CheckpointError> {
        Ok(self.get(partition))
    }

    async fn commit(&self, partition: &PartitionId, offset: i64) -> Result<(), CheckpointError> {
        let mut offsets = self.offsets.lock();
        let current = offsets.entry(partition.clone()).or_insert(offset);
        if offset > *current {
            *current = offset;
        }
        Ok(())
    }
}
