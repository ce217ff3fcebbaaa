//! Resource id minting.
//!
//! Ids look like `ap2501-00001`: a two letter type prefix, the `YYMM` period
//! and a five digit sequence. The sequence lives in a counter row on the
//! tenant's own shard and is advanced with a single atomic increment, so
//! several pipeline instances can allocate for the same key without
//! coordinating in process.

use crate::backend::CounterKey;
use crate::config::AllocatorConfig;
use crate::model::TenantKey;
use crate::store::{ShardHandle, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{error, info};

/// Highest sequence a period can hold
pub const MAX_SEQUENCE: u32 = 99_999;

#[derive(Error, Debug, Clone)]
pub enum AllocationError {
    #[error("Sequence exhausted for {tenant} {resource_type} in period {period}")]
    Exhausted {
        tenant: TenantKey,
        resource_type: String,
        period: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AllocationError {
    pub fn is_transient(&self) -> bool {
        match self {
            AllocationError::Exhausted { .. } => false,
            AllocationError::Store(e) => e.is_transient(),
        }
    }
}

pub struct ResourceIdAllocator {
    prefixes: HashMap<String, String>,
    exhausted: RwLock<HashSet<CounterKey>>,
    rollovers: AtomicU64,
}

impl ResourceIdAllocator {
    pub fn new(config: &AllocatorConfig) -> Self {
        let prefixes = config
            .prefixes
            .iter()
            .map(|(resource_type, prefix)| (resource_type.clone(), prefix.to_ascii_lowercase()))
            .collect();

        Self {
            prefixes,
            exhausted: RwLock::new(HashSet::new()),
            rollovers: AtomicU64::new(0),
        }
    }

    /// Mint the next id for (tenant, resource type) in the period `at` falls in.
    ///
    /// Exhaustion is sticky: once a key runs out, later calls fail without
    /// touching the shard until [`release_exhausted`](Self::release_exhausted)
    /// or a restart.
    pub async fn allocate(
        &self,
        shard: &ShardHandle,
        tenant: &TenantKey,
        resource_type: &str,
        at: DateTime<Utc>,
    ) -> Result<String, AllocationError> {
        let key = CounterKey {
            tenant_key: tenant.clone(),
            resource_type: resource_type.to_string(),
            period: period(at),
        };

        if self.exhausted.read().contains(&key) {
            return Err(exhausted(key));
        }

        let sequence = match shard.increment_counter(&key, MAX_SEQUENCE).await? {
            Some(sequence) => sequence,
            None => {
                error!(
                    tenant = %key.tenant_key,
                    resource_type = %key.resource_type,
                    period = %key.period,
                    "Resource id sequence exhausted, allocation halted for this key"
                );
                self.exhausted.write().insert(key.clone());
                return Err(exhausted(key));
            }
        };

        if sequence == 1 {
            self.rollovers.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("pipeline.allocator.rollovers").increment(1);
            info!(
                tenant = %key.tenant_key,
                resource_type = %key.resource_type,
                period = %key.period,
                "Allocation counter started a new period"
            );
        }

        Ok(format_id(&self.type_prefix(resource_type), &key.period, sequence))
    }

    /// Two letter prefix for a resource type
    pub fn type_prefix(&self, resource_type: &str) -> String {
        if let Some(prefix) = self.prefixes.get(resource_type) {
            return prefix.clone();
        }
        let mut prefix: String = resource_type
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(2)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        while prefix.len() < 2 {
            prefix.push('x');
        }
        prefix
    }

    /// Counters that minted sequence 1 since startup
    pub fn rollovers(&self) -> u64 {
        self.rollovers.load(Ordering::Relaxed)
    }

    pub fn exhausted_keys(&self) -> usize {
        self.exhausted.read().len()
    }

    /// Forget halted keys so the next allocation asks the shard again.
    /// Keys whose counter is still at the limit halt again on first use.
    pub fn release_exhausted(&self) -> usize {
        let released = std::mem::take(&mut *self.exhausted.write()).len();
        if released > 0 {
            info!(released, "Released exhausted allocation keys");
        }
        released
    }
}

fn exhausted(key: CounterKey) -> AllocationError {
    AllocationError::Exhausted {
        tenant: key.tenant_key,
        resource_type: key.resource_type,
        period: key.period,
    }
}

/// `YYMM` period of a timestamp
pub fn period(at: DateTime<Utc>) -> String {
    at.format("%y%m").to_string()
}

pub fn format_id(prefix: &str, period: &str, sequence: u32) -> String {
    format!("{}{}-{:05}", prefix, period, sequence)
}
