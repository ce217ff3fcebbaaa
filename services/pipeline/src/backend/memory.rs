use super::{decide, ApplyCommand, BackendError, CounterKey, Decision, ShardBackend};
use crate::model::{ApplyOutcome, Operation, ResourceRecord, ResourceScope};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering};

type RecordKey = (ResourceScope, String);
/// (scope, resource id, request id)
type LedgerKey = (ResourceScope, String, String);

#[derive(Default)]
struct ShardState {
    records: HashMap<RecordKey, ResourceRecord>,
    requests: HashSet<LedgerKey>,
    /// (scope, request id) of applied creates to the id they minted
    creates: HashMap<RecordKey, String>,
    counters: HashMap<CounterKey, u32>,
}

/// In-process shard. The mutex plays the role of the database transaction.
pub struct MemoryBackend {
    name: String,
    state: Mutex<ShardState>,
    #[cfg(test)]
    pending_failures: AtomicU32,
    #[cfg(test)]
    pending_apply_failures: AtomicU32,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ShardState::default()),
            #[cfg(test)]
            pending_failures: AtomicU32::new(0),
            #[cfg(test)]
            pending_apply_failures: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All records of one type, tombstones included, ordered by id
    pub fn records(&self, scope: &ResourceScope) -> Vec<ResourceRecord> {
        let state = self.state.lock();
        let mut records: Vec<_> = state
            .records
            .iter()
            .filter(|((s, _), _)| s == scope)
            .map(|(_, r)| r.clone())
            .collect();
        records.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        records
    }

    pub fn counter(&self, key: &CounterKey) -> Option<u32> {
        self.state.lock().counters.get(key).copied()
    }

    pub fn set_counter(&self, key: CounterKey, value: u32) {
        self.state.lock().counters.insert(key, value);
    }

    /// Make the next `n` calls fail as if the shard were unreachable
    #[cfg(test)]
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Fail only the next `n` applies, leaving lookups and counters working
    #[cfg(test)]
    pub fn fail_next_applies(&self, n: u32) {
        self.pending_apply_failures.store(n, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_available(&self) -> Result<(), BackendError> {
        #[cfg(test)]
        {
            if Self::take_injected(&self.pending_failures) {
                return Err(BackendError::Unavailable(format!(
                    "injected failure on {}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ShardBackend for MemoryBackend {
    async fn increment_counter(
        &self,
        key: &CounterKey,
        limit: u32,
    ) -> Result<Option<u32>, BackendError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let value = state.counters.entry(key.clone()).or_insert(0);
        if *value >= limit {
            return Ok(None);
        }
        *value += 1;
        Ok(Some(*value))
    }

    async fn find_create(
        &self,
        scope: &ResourceScope,
        request_id: &str,
    ) -> Result<Option<String>, BackendError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .creates
            .get(&(scope.clone(), request_id.to_string()))
            .cloned())
    }

    async fn apply(&self, command: &ApplyCommand) -> Result<ApplyOutcome, BackendError> {
        self.check_available()?;
        #[cfg(test)]
        {
            if Self::take_injected(&self.pending_apply_failures) {
                return Err(BackendError::Timeout(std::time::Duration::from_millis(1)));
            }
        }
        let scope = command.scope();
        let record_key = (scope.clone(), command.resource_id.clone());
        let ledger_key = (
            scope.clone(),
            command.resource_id.clone(),
            command.request_id.clone(),
        );

        let mut state = self.state.lock();
        let decision = decide(
            state.records.get(&record_key),
            state.requests.contains(&ledger_key),
            command,
            Utc::now(),
        );

        match decision {
            Decision::Skip(outcome) => Ok(outcome),
            Decision::Write(record) => {
                state.records.insert(record_key, record.clone());
                state.requests.insert(ledger_key);
                if command.operation == Operation::Create {
                    state
                        .creates
                        .insert((scope, command.request_id.clone()), command.resource_id.clone());
                }
                Ok(ApplyOutcome::Applied(record))
            }
        }
    }

    async fn fetch(
        &self,
        scope: &ResourceScope,
        resource_id: &str,
    ) -> Result<Option<ResourceRecord>, BackendError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .records
            .get(&(scope.clone(), resource_id.to_string()))
            .cloned())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.check_available()
    }
}

/// Named in-memory shards, shared by everything that resolves `memory://` urls
#[derive(Default)]
pub struct MemoryShards {
    shards: RwLock<HashMap<String, Arc<MemoryBackend>>>,
}

impl MemoryShards {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<MemoryBackend> {
        if let Some(shard) = self.shards.read().get(name) {
            return shard.clone();
        }
        self.shards
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryBackend::new(name)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<MemoryBackend>> {
        self.shards.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.shards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.read().is_empty()
    }
}
