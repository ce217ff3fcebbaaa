//! Partitioned log input.
//!
//! [`EventSource`] is the consumer side of the inbound mutation log. The
//! pipeline acknowledges an offset only after its checkpoint is durable and
//! pauses partitions for flow control or when they are parked.

use crate::checkpoint::PartitionId;
use crate::config::KafkaConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Errors that can occur while consuming the log
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to create consumer: {0}")]
    Creation(String),

    #[error("Failed to subscribe to topics: {0}")]
    Subscription(String),

    #[error("Consumer receive error: {0}")]
    Receive(String),

    #[error("Failed to commit offset: {0}")]
    Commit(String),

    #[error("Partition control failed for {partition}: {message}")]
    Control { partition: PartitionId, message: String },

    #[error("Source closed")]
    Closed,
}

/// A record read from the log
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub partition: PartitionId,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    /// Producer timestamp in milliseconds, when the broker has one
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl LogRecord {
    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Get the record key as a string
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Next record from any unpaused partition
    async fn recv(&self) -> Result<LogRecord, SourceError>;

    /// Mark everything up to and including `offset` as consumed
    fn acknowledge(&self, partition: &PartitionId, offset: i64) -> Result<(), SourceError>;

    fn pause(&self, partition: &PartitionId) -> Result<(), SourceError>;

    fn resume(&self, partition: &PartitionId) -> Result<(), SourceError>;

    /// Redeliver the partition starting at `offset`. Records fetched before
    /// the rewind are not delivered.
    fn rewind(&self, partition: &PartitionId, offset: i64) -> Result<(), SourceError>;
}

/// Kafka consumer over the mutations topic
pub struct KafkaEventSource {
    consumer: StreamConsumer,
    seek_timeout: Duration,
}

impl KafkaEventSource {
    pub fn new(config: &KafkaConfig) -> Result<Self, SourceError> {
        info!(
            brokers = %config.bootstrap_servers,
            group_id = %config.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| SourceError::Creation(e.to_string()))?;

        let topic = config.topics.mutations.as_str();
        consumer
            .subscribe(&[topic])
            .map_err(|e| SourceError::Subscription(e.to_string()))?;
        info!(topic, "Subscribed to mutation topic");

        Ok(Self {
            consumer,
            seek_timeout: config.request_timeout(),
        })
    }

    fn partition_list(partition: &PartitionId) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&partition.topic, partition.partition);
        tpl
    }

    fn convert_message<M: KafkaMessage>(msg: &M) -> LogRecord {
        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for header in h.iter() {
                if let Some(value) = header.value {
                    if let Ok(v) = std::str::from_utf8(value) {
                        headers.insert(header.key.to_string(), v.to_string());
                    }
                }
            }
        }

        LogRecord {
            partition: PartitionId::new(msg.topic(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().unwrap_or(&[]).to_vec(),
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }
}

#[async_trait]
impl EventSource for KafkaEventSource {
    async fn recv(&self) -> Result<LogRecord, SourceError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| SourceError::Receive(e.to_string()))?;
        Ok(Self::convert_message(&message))
    }

    fn acknowledge(&self, partition: &PartitionId, offset: i64) -> Result<(), SourceError> {
        // Kafka commits the next offset to read
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&partition.topic, partition.partition, Offset::Offset(offset + 1))
            .map_err(|e| SourceError::Commit(e.to_string()))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| SourceError::Commit(e.to_string()))
    }

    fn pause(&self, partition: &PartitionId) -> Result<(), SourceError> {
        self.consumer
            .pause(&Self::partition_list(partition))
            .map_err(|e| SourceError::Control {
                partition: partition.clone(),
                message: e.to_string(),
            })
    }

    fn resume(&self, partition: &PartitionId) -> Result<(), SourceError> {
        self.consumer
            .resume(&Self::partition_list(partition))
            .map_err(|e| SourceError::Control {
                partition: partition.clone(),
                message: e.to_string(),
            })
    }

    fn rewind(&self, partition: &PartitionId, offset: i64) -> Result<(), SourceError> {
        // librdkafka drops messages fetched before the seek
        self.consumer
            .seek(
                &partition.topic,
                partition.partition,
                Offset::Offset(offset),
                self.seek_timeout,
            )
            .map_err(|e| SourceError::Control {
                partition: partition.clone(),
                message: e.to_string(),
            })
    }
}

#[derive(Default, Clone)]
struct PartitionLog {
    records: Vec<LogRecord>,
    /// Index of the next record to deliver; offsets equal indices
    position: usize,
    /// Next offset to read, as Kafka would store it
    committed: Option<i64>,
    paused: bool,
}

#[derive(Default)]
struct MemoryState {
    partitions: BTreeMap<i32, PartitionLog>,
    cursor: usize,
    closed: bool,
    pause_calls: u64,
}

/// In-memory partitioned log with consumer-group style commits.
///
/// Used for tests and local runs. Delivery round-robins across unpaused
/// partitions, one record at a time, so every partition makes progress.
pub struct MemoryEventSource {
    topic: String,
    state: Mutex<MemoryState>,
    wakeup: Notify,
}

impl MemoryEventSource {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: Mutex::new(MemoryState::default()),
            wakeup: Notify::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append a record and return its offset
    pub fn push(&self, partition: i32, key: Option<&str>, payload: Vec<u8>) -> i64 {
        let offset = {
            let mut state = self.state.lock();
            let log = state.partitions.entry(partition).or_default();
            let offset = log.records.len() as i64;
            log.records.push(LogRecord {
                partition: PartitionId::new(self.topic.clone(), partition),
                offset,
                key: key.map(|k| k.as_bytes().to_vec()),
                payload,
                timestamp: Some(chrono::Utc::now().timestamp_millis()),
                headers: HashMap::new(),
            });
            offset
        };
        self.wakeup.notify_one();
        offset
    }

    pub fn push_json<T: serde::Serialize>(
        &self,
        partition: i32,
        key: Option<&str>,
        value: &T,
    ) -> Result<i64, serde_json::Error> {
        Ok(self.push(partition, key, serde_json::to_vec(value)?))
    }

    /// Stop delivering once every unpaused partition is drained
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.wakeup.notify_one();
    }

    /// Offset a restarted consumer would resume from
    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .partitions
            .get(&partition)
            .and_then(|log| log.committed)
    }

    pub fn is_paused(&self, partition: i32) -> bool {
        self.state
            .lock()
            .partitions
            .get(&partition)
            .map(|log| log.paused)
            .unwrap_or(false)
    }

    pub fn pause_calls(&self) -> u64 {
        self.state.lock().pause_calls
    }

    /// Records not yet delivered on a partition
    pub fn pending(&self, partition: i32) -> usize {
        self.state
            .lock()
            .partitions
            .get(&partition)
            .map(|log| log.records.len() - log.position)
            .unwrap_or(0)
    }

    /// A fresh consumer over the same log, positioned at the committed
    /// offsets like a restarted group member.
    pub fn reopen(&self) -> Self {
        self.reopen_with(|log| log.committed.unwrap_or(0) as usize)
    }

    /// A fresh consumer that redelivers every partition from the beginning
    pub fn reopen_from_start(&self) -> Self {
        self.reopen_with(|_| 0)
    }

    fn reopen_with(&self, position: impl Fn(&PartitionLog) -> usize) -> Self {
        let state = self.state.lock();
        let partitions = state
            .partitions
            .iter()
            .map(|(id, log)| {
                let mut log = log.clone();
                log.position = position(&log).min(log.records.len());
                log.paused = false;
                (*id, log)
            })
            .collect();

        Self {
            topic: self.topic.clone(),
            state: Mutex::new(MemoryState {
                partitions,
                ..Default::default()
            }),
            wakeup: Notify::new(),
        }
    }

    fn next_deliverable(state: &mut MemoryState) -> Option<LogRecord> {
        let ids: Vec<i32> = state.partitions.keys().copied().collect();
        if ids.is_empty() {
            return None;
        }
        for step in 0..ids.len() {
            let id = ids[(state.cursor + step) % ids.len()];
            let Some(log) = state.partitions.get_mut(&id) else {
                continue;
            };
            if log.paused || log.position >= log.records.len() {
                continue;
            }
            let record = log.records[log.position].clone();
            log.position += 1;
            state.cursor = (state.cursor + step + 1) % ids.len();
            return Some(record);
        }
        None
    }

    fn with_partition<R>(
        &self,
        partition: &PartitionId,
        f: impl FnOnce(&mut PartitionLog) -> R,
    ) -> Result<R, SourceError> {
        if partition.topic != self.topic {
            return Err(SourceError::Control {
                partition: partition.clone(),
                message: "unknown topic".to_string(),
            });
        }
        let mut state = self.state.lock();
        Ok(f(state.partitions.entry(partition.partition).or_default()))
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn recv(&self) -> Result<LogRecord, SourceError> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(record) = Self::next_deliverable(&mut state) {
                    return Ok(record);
                }
                if state.closed {
                    return Err(SourceError::Closed);
                }
            }
            self.wakeup.notified().await;
        }
    }

    fn acknowledge(&self, partition: &PartitionId, offset: i64) -> Result<(), SourceError> {
        self.with_partition(partition, |log| {
            let next = offset + 1;
            if log.committed.map_or(true, |c| next > c) {
                log.committed = Some(next);
            }
        })
    }

    fn pause(&self, partition: &PartitionId) -> Result<(), SourceError> {
        self.with_partition(partition, |log| log.paused = true)?;
        self.state.lock().pause_calls += 1;
        debug!(partition = %partition, "Partition paused");
        Ok(())
    }

    fn resume(&self, partition: &PartitionId) -> Result<(), SourceError> {
        self.with_partition(partition, |log| log.paused = false)?;
        self.wakeup.notify_one();
        debug!(partition = %partition, "Partition resumed");
        Ok(())
    }

    fn rewind(&self, partition: &PartitionId, offset: i64) -> Result<(), SourceError> {
        self.with_partition(partition, |log| {
            let target = offset.max(0) as usize;
            if target > log.records.len() {
                warn!(partition = %partition, offset, "Rewind past end of log");
            }
            log.position = target.min(log.records.len());
        })?;
        self.wakeup.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> MemoryEventSource {
        MemoryEventSource::new("tenantflow.mutations")
    }

    #[tokio::test]
    async fn test_round_robin_across_partitions() {
        let source = source();
        source.push(0, Some("a"), b"a0".to_vec());
        source.push(0, Some("a"), b"a1".to_vec());
        source.push(1, Some("b"), b"b0".to_vec());
        source.close();

        let mut seen = Vec::new();
        while let Ok(record) = source.recv().await {
            seen.push((record.partition.partition, record.offset));
        }

        assert_eq!(seen, vec![(0, 0), (1, 0), (0, 1)]);
    }

    #[tokio::test]
    async fn test_paused_partition_is_skipped_until_resumed() {
        let source = source();
        let p0 = PartitionId::new("tenantflow.mutations", 0);
        source.push(0, None, b"x".to_vec());
        source.push(1, None, b"y".to_vec());
        source.pause(&p0).unwrap();

        let record = source.recv().await.unwrap();
        assert_eq!(record.partition.partition, 1);
        assert!(source.is_paused(0));

        source.resume(&p0).unwrap();
        let record = source.recv().await.unwrap();
        assert_eq!(record.partition, p0);
    }

    #[tokio::test]
    async fn test_rewind_and_reopen() {
        let source = source();
        let p0 = PartitionId::new("tenantflow.mutations", 0);
        for i in 0..3 {
            source.push(0, None, vec![i]);
        }
        for _ in 0..3 {
            source.recv().await.unwrap();
        }
        source.acknowledge(&p0, 0).unwrap();
        assert_eq!(source.committed(0), Some(1));

        source.rewind(&p0, 1).unwrap();
        assert_eq!(source.recv().await.unwrap().offset, 1);

        let restarted = source.reopen();
        assert_eq!(restarted.pending(0), 2);
        assert_eq!(restarted.recv().await.unwrap().offset, 1);
        assert_eq!(source.reopen_from_start().pending(0), 3);
    }

    #[test]
    fn test_log_record_accessors() {
        let mut headers = HashMap::new();
        headers.insert("correlation-id".to_string(), "r1".to_string());
        let record = LogRecord {
            partition: PartitionId::new("t", 0),
            offset: 100,
            key: Some(b"B1:L1:appointments".to_vec()),
            payload: br#"{"a":1}"#.to_vec(),
            timestamp: Some(1234567890),
            headers,
        };

        assert_eq!(record.key_str(), Some("B1:L1:appointments"));
        assert_eq!(record.header("correlation-id"), Some("r1"));
        let value: serde_json::Value = record.decode_json().unwrap();
        assert_eq!(value["a"], 1);
    }
}
