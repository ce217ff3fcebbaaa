//! Wire and domain types for the mutation pipeline.
//!
//! Mutation events arrive as camelCase JSON on the inbound log. The payload is
//! an opaque document: the pipeline stores and merges it but never looks
//! inside.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque resource payload.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Identifies the tenant that owns a resource and, through the shard
/// directory, the physical shard it lives on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantKey {
    pub business_id: String,
    pub location_id: String,
}

impl TenantKey {
    pub fn new(business_id: impl Into<String>, location_id: impl Into<String>) -> Self {
        Self {
            business_id: business_id.into(),
            location_id: location_id.into(),
        }
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.business_id, self.location_id)
    }
}

/// Kind of mutation carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Patch,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Patch => "patch",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons an event is structurally unusable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("resourceType must not be empty")]
    MissingResourceType,

    #[error("requestId must not be empty")]
    MissingRequestId,

    #[error("resourceId is required for {0}")]
    MissingResourceId(Operation),

    #[error("tenantKey has an empty component")]
    IncompleteTenantKey,
}

/// A single resource mutation read from the inbound log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    pub operation: Operation,
    pub tenant_key: TenantKey,
    pub resource_type: String,
    /// Absent for creates; the allocator assigns one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub payload: Document,
    /// Client-supplied idempotency token
    pub request_id: String,
    pub produced_at: DateTime<Utc>,
}

impl MutationEvent {
    /// Key used when producing to the log; events sharing it are ordered.
    pub fn partition_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.tenant_key.business_id, self.tenant_key.location_id, self.resource_type
        )
    }

    pub fn validate(&self) -> Result<(), EventError> {
        if self.tenant_key.business_id.is_empty() || self.tenant_key.location_id.is_empty() {
            return Err(EventError::IncompleteTenantKey);
        }
        if self.resource_type.is_empty() {
            return Err(EventError::MissingResourceType);
        }
        if self.request_id.is_empty() {
            return Err(EventError::MissingRequestId);
        }
        match (self.operation, self.resource_id.as_deref()) {
            (Operation::Create, _) => Ok(()),
            (op, None) | (op, Some("")) => Err(EventError::MissingResourceId(op)),
            _ => Ok(()),
        }
    }

    pub fn scope(&self) -> ResourceScope {
        ResourceScope {
            tenant_key: self.tenant_key.clone(),
            resource_type: self.resource_type.clone(),
        }
    }
}

/// (tenant, resource type) pair; the unit of ordering and of request dedup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceScope {
    pub tenant_key: TenantKey,
    pub resource_type: String,
}

/// Persisted resource state on a tenant shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub tenant_key: TenantKey,
    pub resource_type: String,
    pub resource_id: String,
    pub data: Document,
    /// Tombstone flag; a deleted record is kept to reject stale mutations
    pub deleted: bool,
    pub last_request_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why the store declined to apply a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Create for an id that already exists under another request
    IdCollision,
    /// Mutation targets a deleted record
    Tombstoned,
    /// Update or patch for a record that was never created
    NotFound,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::IdCollision => "id_collision",
            RejectReason::Tombstoned => "tombstoned",
            RejectReason::NotFound => "not_found",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of applying a mutation to the store
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(ResourceRecord),
    Duplicate,
    Rejected(RejectReason),
}

/// Downstream event published after a successful apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub tenant_key: TenantKey,
    pub resource_type: String,
    pub resource_id: String,
    pub operation: Operation,
}
