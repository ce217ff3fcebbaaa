use super::{decide, ApplyCommand, BackendError, CounterKey, Decision, ShardBackend};
use crate::config::ShardPoolConfig;
use crate::model::{ApplyOutcome, Document, ResourceRecord, ResourceScope, TenantKey};
use crate::shard_directory::ConnectionDescriptor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// SQLSTATEs worth retrying: unique violation (lost an insert race),
/// serialization failure, deadlock, too many connections.
const RETRYABLE_SQLSTATES: &[&str] = &["23505", "40001", "40P01", "53300"];

pub(crate) fn classify(error: sqlx::Error) -> BackendError {
    match &error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => BackendError::Unavailable(error.to_string()),
        sqlx::Error::Database(db)
            if db
                .code()
                .map(|code| RETRYABLE_SQLSTATES.iter().any(|c| code == *c))
                .unwrap_or(false) =>
        {
            BackendError::Unavailable(error.to_string())
        }
        _ => BackendError::Query(error.to_string()),
    }
}

#[derive(FromRow)]
struct RecordRow {
    business_id: String,
    location_id: String,
    resource_type: String,
    resource_id: String,
    data: Json<Document>,
    deleted: bool,
    last_request_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RecordRow> for ResourceRecord {
    fn from(row: RecordRow) -> Self {
        Self {
            tenant_key: TenantKey::new(row.business_id, row.location_id),
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            data: row.data.0,
            deleted: row.deleted,
            last_request_id: row.last_request_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Tenant shard backed by PostgreSQL
pub struct PgBackend {
    shard_id: String,
    pool: PgPool,
}

impl PgBackend {
    /// Open a pool for the shard and bring its schema up to date
    pub async fn connect(
        descriptor: &ConnectionDescriptor,
        config: &ShardPoolConfig,
    ) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&descriptor.url)
            .await
            .map_err(classify)?;

        if config.run_migrations {
            sqlx::migrate!("./migrations/shard")
                .run(&pool)
                .await
                .map_err(|e| BackendError::Query(format!("shard migration failed: {}", e)))?;
            info!(shard_id = %descriptor.shard_id, "Shard schema up to date");
        }

        Ok(Self::from_pool(descriptor.shard_id.clone(), pool))
    }

    pub fn from_pool(shard_id: String, pool: PgPool) -> Self {
        Self { shard_id, pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ShardBackend for PgBackend {
    #[instrument(skip(self), fields(shard_id = %self.shard_id, tenant = %key.tenant_key))]
    async fn increment_counter(
        &self,
        key: &CounterKey,
        limit: u32,
    ) -> Result<Option<u32>, BackendError> {
        // The conditional upsert is the only writer of the counter row, so
        // concurrent pipeline instances serialize on the row lock it takes.
        let value: Option<(i32,)> = sqlx::query_as(
            r#"
            INSERT INTO allocation_counters (
                business_id, location_id, resource_type, period, value, updated_at
            ) VALUES ($1, $2, $3, $4, 1, NOW())
            ON CONFLICT (business_id, location_id, resource_type, period)
            DO UPDATE SET value = allocation_counters.value + 1, updated_at = NOW()
            WHERE allocation_counters.value < $5
            RETURNING value
            "#,
        )
        .bind(&key.tenant_key.business_id)
        .bind(&key.tenant_key.location_id)
        .bind(&key.resource_type)
        .bind(&key.period)
        .bind(limit as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(value.map(|(v,)| v as u32))
    }

    async fn find_create(
        &self,
        scope: &ResourceScope,
        request_id: &str,
    ) -> Result<Option<String>, BackendError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT resource_id FROM applied_requests
            WHERE business_id = $1 AND location_id = $2
              AND resource_type = $3 AND request_id = $4
              AND operation = 'create'
            LIMIT 1
            "#,
        )
        .bind(&scope.tenant_key.business_id)
        .bind(&scope.tenant_key.location_id)
        .bind(&scope.resource_type)
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.map(|(id,)| id))
    }

    #[instrument(
        skip(self, command),
        fields(
            shard_id = %self.shard_id,
            resource_id = %command.resource_id,
            operation = %command.operation,
        )
    )]
    async fn apply(&self, command: &ApplyCommand) -> Result<ApplyOutcome, BackendError> {
        let tenant = &command.tenant_key;
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let already_applied: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM applied_requests
            WHERE business_id = $1 AND location_id = $2
              AND resource_type = $3 AND resource_id = $4 AND request_id = $5
            "#,
        )
        .bind(&tenant.business_id)
        .bind(&tenant.location_id)
        .bind(&command.resource_type)
        .bind(&command.resource_id)
        .bind(&command.request_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify)?;

        let existing: Option<ResourceRecord> = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT business_id, location_id, resource_type, resource_id,
                   data, deleted, last_request_id, created_at, updated_at
            FROM resource_records
            WHERE business_id = $1 AND location_id = $2
              AND resource_type = $3 AND resource_id = $4
            FOR UPDATE
            "#,
        )
        .bind(&tenant.business_id)
        .bind(&tenant.location_id)
        .bind(&command.resource_type)
        .bind(&command.resource_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify)?
        .map(Into::into);

        let decision = decide(
            existing.as_ref(),
            already_applied.is_some(),
            command,
            Utc::now(),
        );

        let record = match decision {
            Decision::Skip(outcome) => {
                tx.rollback().await.map_err(classify)?;
                debug!(?outcome, "Mutation not applied");
                return Ok(outcome);
            }
            Decision::Write(record) => record,
        };

        if existing.is_some() {
            sqlx::query(
                r#"
                UPDATE resource_records
                SET data = $5, deleted = $6, last_request_id = $7, updated_at = $8,
                    deleted_at = CASE WHEN $6 THEN $8 ELSE NULL END
                WHERE business_id = $1 AND location_id = $2
                  AND resource_type = $3 AND resource_id = $4
                "#,
            )
            .bind(&tenant.business_id)
            .bind(&tenant.location_id)
            .bind(&record.resource_type)
            .bind(&record.resource_id)
            .bind(Json(&record.data))
            .bind(record.deleted)
            .bind(&record.last_request_id)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        } else {
            // A concurrent insert of the same id fails with a unique violation,
            // which is retried and then resolves against the winner's row.
            sqlx::query(
                r#"
                INSERT INTO resource_records (
                    business_id, location_id, resource_type, resource_id,
                    data, deleted, last_request_id, created_at, updated_at, deleted_at
                ) VALUES (
                    $1, $2, $3, $4,
                    $5, $6, $7, $8, $9, CASE WHEN $6 THEN $9 ELSE NULL END
                )
                "#,
            )
            .bind(&tenant.business_id)
            .bind(&tenant.location_id)
            .bind(&record.resource_type)
            .bind(&record.resource_id)
            .bind(Json(&record.data))
            .bind(record.deleted)
            .bind(&record.last_request_id)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        sqlx::query(
            r#"
            INSERT INTO applied_requests (
                business_id, location_id, resource_type, resource_id,
                request_id, operation, applied_at
            ) VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(&tenant.business_id)
        .bind(&tenant.location_id)
        .bind(&command.resource_type)
        .bind(&command.resource_id)
        .bind(&command.request_id)
        .bind(command.operation.as_str())
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;

        Ok(ApplyOutcome::Applied(record))
    }

    async fn fetch(
        &self,
        scope: &ResourceScope,
        resource_id: &str,
    ) -> Result<Option<ResourceRecord>, BackendError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT business_id, location_id, resource_type, resource_id,
                   data, deleted, last_request_id, created_at, updated_at
            FROM resource_records
            WHERE business_id = $1 AND location_id = $2
              AND resource_type = $3 AND resource_id = $4
            "#,
        )
        .bind(&scope.tenant_key.business_id)
        .bind(&scope.tenant_key.location_id)
        .bind(&scope.resource_type)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        Ok(row.map(Into::into))
    }

    async fn ping(&self) -> Result<(), BackendError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
