//! Postgres-backed job store.
//!
//! Schema lives in `migrations/0001_jobs.sql`: one `jobs` table plus a
//! `job_exception_payloads` side table (cascade-deleted with the job).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | JobStoreError | Scenario |
//! |------------|-----------------|---------------|----------|
//! | Database (unique violation) | `23505` | `AlreadyExists` / `Conflict` | Duplicate insert |
//! | Database (other) | Any other | `Storage` | Constraint or server errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, decode failures |
//!
//! A revision-checked update or delete that touches zero rows maps to
//! `Conflict`.
//!
//! ## Claiming
//!
//! Candidates are selected `FOR UPDATE SKIP LOCKED` so competing workers
//! never block on each other's rows. Exclusive jobs additionally try a
//! transaction-scoped advisory lock on their process instance and are
//! skipped when another worker holds it, which serializes sibling claims
//! across workers without waiting.
//!
//! ## Runtime
//!
//! [`JobStore`] is synchronous. The sync methods drive the async ones on the
//! tokio runtime captured at construction, so they must be called from
//! threads that are not runtime workers (executor threads are fine).

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use jobforge_core::{ExecutionId, JobId, ProcessDefinitionId, ProcessInstanceId, TenantId};

use crate::jobs::types::{ExceptionPayload, Job, JobKind, Lease, TimerSpec};

use super::query::{DueFilter, JobQuery, Page};
use super::r#trait::{JobStore, JobStoreError, StoreOp};

/// DDL applied by [`PostgresJobStore::ensure_schema`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_jobs.sql");

const JOB_COLUMNS: &str = r#"
    j.id, j.revision, j.kind, j.timer, j.execution_id, j.process_instance_id,
    j.process_definition_id, j.process_definition_key, j.tenant_id, j.due_date,
    j.lock_owner, j.lock_expires_at, j.retries, j.exclusive, j.handler_type,
    j.handler_configuration,
    p.message AS exception_message, p.details AS exception_details,
    p.recorded_at AS exception_recorded_at
"#;

const JOB_FROM: &str = "FROM jobs j LEFT JOIN job_exception_payloads p ON p.job_id = j.id";

const ORDER_BY_DUE: &str = "ORDER BY j.due_date ASC NULLS FIRST, j.id ASC";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    /// Create a store on the current tokio runtime.
    pub fn new(pool: PgPool) -> Result<Self, JobStoreError> {
        let runtime = Handle::try_current().map_err(|_| {
            JobStoreError::Storage("PostgresJobStore must be created inside a tokio runtime".to_string())
        })?;
        Ok(Self::with_runtime(pool, runtime))
    }

    pub fn with_runtime(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Apply the bundled schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Apply a batch of operations in one transaction.
    #[instrument(skip(self, batch), fields(op_count = batch.len()), err)]
    pub async fn apply_batch(&self, batch: Vec<StoreOp>) -> Result<(), JobStoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Dropping the transaction on an early return rolls it back.
        for op in batch {
            match op {
                StoreOp::Insert(job) => insert_job(&mut tx, &job).await?,
                StoreOp::Update(job) => update_job(&mut tx, &job).await?,
                StoreOp::Delete { id, revision } => delete_job(&mut tx, id, revision).await?,
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn load_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} {JOB_FROM} WHERE j.id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?;
        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn load_exception_payload(&self, id: JobId) -> Result<Option<ExceptionPayload>, JobStoreError> {
        let row = sqlx::query("SELECT message, details, recorded_at FROM job_exception_payloads WHERE job_id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_exception_payload", e))?;
        row.map(|r| {
            Ok(ExceptionPayload {
                message: r.try_get("message").map_err(decode_error)?,
                details: r.try_get("details").map_err(decode_error)?,
                recorded_at: r.try_get("recorded_at").map_err(decode_error)?,
            })
        })
        .transpose()
    }

    /// Jobs a worker could pick up at `now`, oldest due first.
    #[instrument(skip(self), err)]
    pub async fn load_due_jobs(
        &self,
        now: DateTime<Utc>,
        filter: DueFilter,
        page: Page,
    ) -> Result<Vec<Job>, JobStoreError> {
        let kind_clause = match filter {
            DueFilter::All => "",
            DueFilter::TimersOnly => "AND j.kind = 'timer'",
            DueFilter::AsyncOnly => "AND j.kind <> 'timer'",
        };
        let sql = format!(
            "SELECT {JOB_COLUMNS} {JOB_FROM}
             WHERE j.retries > 0
               AND (j.due_date IS NULL OR j.due_date <= $1)
               AND (j.lock_expires_at IS NULL OR j.lock_expires_at <= $1)
               {kind_clause}
             {ORDER_BY_DUE} LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(to_i64(page.limit))
            .bind(to_i64(page.offset))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_due_jobs", e))?;
        decode_jobs(&rows)
    }

    #[instrument(skip(self), err)]
    pub async fn load_by_lock_owner(&self, owner: &str, page: Page) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} {JOB_FROM} WHERE j.lock_owner = $1 {ORDER_BY_DUE} LIMIT $2 OFFSET $3"
        ))
        .bind(owner)
        .bind(to_i64(page.limit))
        .bind(to_i64(page.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_by_lock_owner", e))?;
        decode_jobs(&rows)
    }

    #[instrument(skip(self), fields(execution_id = %execution_id), err)]
    pub async fn load_by_execution(
        &self,
        execution_id: &ExecutionId,
        timers_only: bool,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} {JOB_FROM}
             WHERE j.execution_id = $1 AND (NOT $2 OR j.kind = 'timer')
             {ORDER_BY_DUE}"
        ))
        .bind(execution_id.as_str())
        .bind(timers_only)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_by_execution", e))?;
        decode_jobs(&rows)
    }

    #[instrument(skip(self, definitions), fields(definition_count = definitions.len()), err)]
    pub async fn load_by_handler_and_definitions(
        &self,
        handler_type: &str,
        definitions: &[ProcessDefinitionId],
    ) -> Result<Vec<Job>, JobStoreError> {
        let ids: Vec<String> = definitions.iter().map(|d| d.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} {JOB_FROM}
             WHERE j.handler_type = $1
               AND (cardinality($2::text[]) = 0 OR j.process_definition_id = ANY($2))
             {ORDER_BY_DUE}"
        ))
        .bind(handler_type)
        .bind(&ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_by_handler_and_definitions", e))?;
        decode_jobs(&rows)
    }

    #[instrument(skip(self), err)]
    pub async fn load_by_handler_and_definition_key(
        &self,
        handler_type: &str,
        definition_key: &str,
        tenant: Option<&TenantId>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} {JOB_FROM}
             WHERE j.handler_type = $1
               AND j.process_definition_key = $2
               AND j.tenant_id IS NOT DISTINCT FROM $3
             {ORDER_BY_DUE}"
        ))
        .bind(handler_type)
        .bind(definition_key)
        .bind(tenant.map(|t| t.as_str()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_by_handler_and_definition_key", e))?;
        decode_jobs(&rows)
    }

    /// Acquirable exclusive jobs of an instance, or nothing while a sibling
    /// holds a live lease.
    #[instrument(skip(self), fields(process_instance_id = %process_instance_id), err)]
    pub async fn load_exclusive_jobs_to_execute(
        &self,
        process_instance_id: &ProcessInstanceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} {JOB_FROM}
             WHERE j.process_instance_id = $1
               AND j.exclusive
               AND j.retries > 0
               AND (j.due_date IS NULL OR j.due_date <= $2)
               AND (j.lock_expires_at IS NULL OR j.lock_expires_at <= $2)
               AND NOT EXISTS (
                   SELECT 1 FROM jobs o
                   WHERE o.process_instance_id = $1 AND o.exclusive AND o.lock_expires_at > $2
               )
             {ORDER_BY_DUE}"
        ))
        .bind(process_instance_id.as_str())
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_exclusive_jobs_to_execute", e))?;
        decode_jobs(&rows)
    }

    #[instrument(skip(self), err)]
    pub async fn load_unlocked_timers_due_before(
        &self,
        due: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} {JOB_FROM}
             WHERE j.kind = 'timer'
               AND j.lock_owner IS NULL
               AND (j.due_date IS NULL OR j.due_date <= $1)
             {ORDER_BY_DUE} LIMIT $2 OFFSET $3"
        ))
        .bind(due)
        .bind(to_i64(page.limit))
        .bind(to_i64(page.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_unlocked_timers_due_before", e))?;
        decode_jobs(&rows)
    }

    #[instrument(skip(self, query), err)]
    pub async fn query_jobs(&self, query: &JobQuery, page: Page) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} {JOB_FROM} WHERE {} {ORDER_BY_DUE} LIMIT $12 OFFSET $13",
            QUERY_FILTER
        );
        let rows = bind_query(sqlx::query(&sql), query)
            .bind(to_i64(page.limit))
            .bind(to_i64(page.offset))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query_jobs", e))?;
        decode_jobs(&rows)
    }

    #[instrument(skip(self, query), err)]
    pub async fn count_jobs(&self, query: &JobQuery) -> Result<usize, JobStoreError> {
        let sql = format!("SELECT COUNT(*) AS total {JOB_FROM} WHERE {QUERY_FILTER}");
        let row = bind_query(sqlx::query(&sql), query)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;
        let total: i64 = row.try_get("total").map_err(decode_error)?;
        Ok(usize::try_from(total).unwrap_or(0))
    }

    /// Claim one job regardless of its due date.
    #[instrument(skip(self, lease), fields(job_id = %id, owner = %lease.owner), err)]
    pub async fn claim_job(&self, id: JobId, lease: Lease, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let candidate = sqlx::query("SELECT process_instance_id, exclusive FROM jobs WHERE id = $1 FOR UPDATE SKIP LOCKED")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_job", e))?;
        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let instance: Option<String> = candidate.try_get("process_instance_id").map_err(decode_error)?;
        let exclusive: bool = candidate.try_get("exclusive").map_err(decode_error)?;

        let claimed = claim_in_tx(&mut tx, id, instance.as_deref(), exclusive, &lease, now, false).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(claimed)
    }

    /// Claim up to `limit` due jobs, oldest due first.
    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    pub async fn claim_due_jobs(
        &self,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Over-fetch: exclusive siblings may be skipped below.
        let candidates = sqlx::query(
            r#"
            SELECT id, process_instance_id, exclusive
            FROM jobs
            WHERE retries > 0
              AND (due_date IS NULL OR due_date <= $1)
              AND (lock_expires_at IS NULL OR lock_expires_at <= $1)
            ORDER BY due_date ASC NULLS FIRST, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(to_i64(limit.saturating_mul(4)))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_due_jobs", e))?;

        let lease = Lease::new(owner, lease_expires_at);
        let mut acquired = Vec::new();
        for candidate in candidates {
            if acquired.len() >= limit {
                break;
            }
            let id: uuid::Uuid = candidate.try_get("id").map_err(decode_error)?;
            let instance: Option<String> = candidate.try_get("process_instance_id").map_err(decode_error)?;
            let exclusive: bool = candidate.try_get("exclusive").map_err(decode_error)?;
            if let Some(job) =
                claim_in_tx(&mut tx, JobId::from_uuid(id), instance.as_deref(), exclusive, &lease, now, true).await?
            {
                acquired.push(job);
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Span::current().record("claimed", acquired.len());
        Ok(acquired)
    }

    #[instrument(skip(self, definitions), fields(definition_count = definitions.len()), err)]
    pub async fn set_tenant_for_definitions(
        &self,
        definitions: &[ProcessDefinitionId],
        tenant: Option<&TenantId>,
    ) -> Result<usize, JobStoreError> {
        let ids: Vec<String> = definitions.iter().map(|d| d.as_str().to_string()).collect();
        let result = sqlx::query(
            "UPDATE jobs SET tenant_id = $1, revision = revision + 1 WHERE process_definition_id = ANY($2)",
        )
        .bind(tenant.map(|t| t.as_str()))
        .bind(&ids)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_tenant_for_definitions", e))?;
        Ok(result.rows_affected() as usize)
    }

    fn block_on<T>(&self, fut: impl std::future::Future<Output = T>) -> T {
        self.runtime.block_on(fut)
    }
}

/// `$1..$11` bind the [`JobQuery`] fields in declaration order.
const QUERY_FILTER: &str = r#"
    ($1::text IS NULL OR j.process_instance_id = $1)
    AND ($2::text IS NULL OR j.execution_id = $2)
    AND ($3::text IS NULL OR j.handler_type = $3)
    AND (NOT $4 OR j.kind = 'timer')
    AND (NOT $5 OR j.kind = 'message')
    AND ($6::timestamptz IS NULL OR (
        j.retries > 0
        AND (j.due_date IS NULL OR j.due_date <= $6)
        AND (j.lock_expires_at IS NULL OR j.lock_expires_at <= $6)))
    AND (NOT $7 OR p.job_id IS NOT NULL)
    AND (NOT $8 OR j.retries = 0)
    AND ($9::text IS NULL OR j.tenant_id = $9)
    AND (NOT $10 OR j.tenant_id IS NULL)
    AND ($11::timestamptz IS NULL OR j.lock_expires_at > $11)
"#;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_query<'q>(sql: PgQuery<'q>, query: &'q JobQuery) -> PgQuery<'q> {
    sql.bind(query.process_instance_id.as_ref().map(|p| p.as_str()))
        .bind(query.execution_id.as_ref().map(|e| e.as_str()))
        .bind(query.handler_type.as_deref())
        .bind(query.timers_only)
        .bind(query.messages_only)
        .bind(query.executable_at)
        .bind(query.with_exception)
        .bind(query.no_retries_left)
        .bind(query.tenant_id.as_ref().map(|t| t.as_str()))
        .bind(query.without_tenant)
        .bind(query.locked_at)
}

/// Claim `id` inside `tx` if it is still eligible.
async fn claim_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: JobId,
    instance: Option<&str>,
    exclusive: bool,
    lease: &Lease,
    now: DateTime<Utc>,
    require_due: bool,
) -> Result<Option<Job>, JobStoreError> {
    if let (true, Some(instance)) = (exclusive, instance) {
        // Never wait: a worker blocked here while holding row locks from its
        // batch can deadlock with a worker claiming in the opposite order.
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(instance)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_process_instance", e))?;
        if !locked {
            return Ok(None);
        }
    }

    let result = sqlx::query(
        r#"
        UPDATE jobs j
        SET lock_owner = $2, lock_expires_at = $3, revision = j.revision + 1
        WHERE j.id = $1
          AND j.retries > 0
          AND (j.lock_expires_at IS NULL OR j.lock_expires_at <= $4)
          AND (NOT $5 OR j.due_date IS NULL OR j.due_date <= $4)
          AND NOT (
              j.exclusive AND j.process_instance_id IS NOT NULL AND EXISTS (
                  SELECT 1 FROM jobs o
                  WHERE o.process_instance_id = j.process_instance_id
                    AND o.id <> j.id
                    AND o.exclusive
                    AND o.lock_expires_at > $4
              )
          )
        "#,
    )
    .bind(id.as_uuid())
    .bind(&lease.owner)
    .bind(lease.expires_at)
    .bind(now)
    .bind(require_due)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("claim", e))?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }

    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} {JOB_FROM} WHERE j.id = $1"))
        .bind(id.as_uuid())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("reload_claimed", e))?;
    decode_job(&row).map(Some)
}

async fn insert_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), JobStoreError> {
    let row = JobRow::encode(job)?;
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, revision, kind, timer, execution_id, process_instance_id,
            process_definition_id, process_definition_key, tenant_id, due_date,
            lock_owner, lock_expires_at, retries, exclusive, handler_type,
            handler_configuration
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(row.id)
    .bind(row.revision)
    .bind(&row.kind)
    .bind(&row.timer)
    .bind(&row.execution_id)
    .bind(&row.process_instance_id)
    .bind(&row.process_definition_id)
    .bind(&row.process_definition_key)
    .bind(&row.tenant_id)
    .bind(row.due_date)
    .bind(&row.lock_owner)
    .bind(row.lock_expires_at)
    .bind(row.retries)
    .bind(row.exclusive)
    .bind(&row.handler_type)
    .bind(&row.handler_configuration)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            JobStoreError::AlreadyExists(job.id)
        } else {
            map_sqlx_error("insert_job", e)
        }
    })?;

    write_payload(tx, job).await
}

async fn update_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), JobStoreError> {
    let row = JobRow::encode(job)?;
    let result = sqlx::query(
        r#"
        UPDATE jobs SET
            revision = revision + 1,
            kind = $3, timer = $4, execution_id = $5, process_instance_id = $6,
            process_definition_id = $7, process_definition_key = $8, tenant_id = $9,
            due_date = $10, lock_owner = $11, lock_expires_at = $12, retries = $13,
            exclusive = $14, handler_type = $15, handler_configuration = $16
        WHERE id = $1 AND revision = $2
        "#,
    )
    .bind(row.id)
    .bind(row.revision)
    .bind(&row.kind)
    .bind(&row.timer)
    .bind(&row.execution_id)
    .bind(&row.process_instance_id)
    .bind(&row.process_definition_id)
    .bind(&row.process_definition_key)
    .bind(&row.tenant_id)
    .bind(row.due_date)
    .bind(&row.lock_owner)
    .bind(row.lock_expires_at)
    .bind(row.retries)
    .bind(row.exclusive)
    .bind(&row.handler_type)
    .bind(&row.handler_configuration)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_job", e))?;

    if result.rows_affected() == 0 {
        return Err(stale_revision(job.id, job.revision));
    }
    write_payload(tx, job).await
}

async fn delete_job(tx: &mut Transaction<'_, Postgres>, id: JobId, revision: u32) -> Result<(), JobStoreError> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND revision = $2")
        .bind(id.as_uuid())
        .bind(revision as i32)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("delete_job", e))?;
    if result.rows_affected() == 0 {
        return Err(stale_revision(id, revision));
    }
    Ok(())
}

/// Payload follows the record: present means upsert, absent means delete.
async fn write_payload(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), JobStoreError> {
    match &job.exception {
        Some(payload) => {
            sqlx::query(
                r#"
                INSERT INTO job_exception_payloads (job_id, message, details, recorded_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (job_id)
                DO UPDATE SET
                    message = EXCLUDED.message,
                    details = EXCLUDED.details,
                    recorded_at = EXCLUDED.recorded_at
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(&payload.message)
            .bind(&payload.details)
            .bind(payload.recorded_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("write_payload", e))?;
        }
        None => {
            sqlx::query("DELETE FROM job_exception_payloads WHERE job_id = $1")
                .bind(job.id.as_uuid())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("clear_payload", e))?;
        }
    }
    Ok(())
}

fn stale_revision(id: JobId, revision: u32) -> JobStoreError {
    JobStoreError::Conflict(format!("job {id} was deleted or is past revision {revision}"))
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn decode_error(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode job row: {err}"))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Conflict(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed in {operation}")),
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    revision: i32,
    kind: String,
    timer: Option<serde_json::Value>,
    execution_id: Option<String>,
    process_instance_id: Option<String>,
    process_definition_id: Option<String>,
    process_definition_key: Option<String>,
    tenant_id: Option<String>,
    due_date: Option<DateTime<Utc>>,
    lock_owner: Option<String>,
    lock_expires_at: Option<DateTime<Utc>>,
    retries: i32,
    exclusive: bool,
    handler_type: String,
    handler_configuration: Option<String>,
    exception_message: Option<String>,
    exception_details: Option<String>,
    exception_recorded_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            revision: row.try_get("revision")?,
            kind: row.try_get("kind")?,
            timer: row.try_get("timer")?,
            execution_id: row.try_get("execution_id")?,
            process_instance_id: row.try_get("process_instance_id")?,
            process_definition_id: row.try_get("process_definition_id")?,
            process_definition_key: row.try_get("process_definition_key")?,
            tenant_id: row.try_get("tenant_id")?,
            due_date: row.try_get("due_date")?,
            lock_owner: row.try_get("lock_owner")?,
            lock_expires_at: row.try_get("lock_expires_at")?,
            retries: row.try_get("retries")?,
            exclusive: row.try_get("exclusive")?,
            handler_type: row.try_get("handler_type")?,
            handler_configuration: row.try_get("handler_configuration")?,
            exception_message: row.try_get("exception_message")?,
            exception_details: row.try_get("exception_details")?,
            exception_recorded_at: row.try_get("exception_recorded_at")?,
        })
    }
}

impl JobRow {
    fn encode(job: &Job) -> Result<Self, JobStoreError> {
        let timer = match &job.kind {
            JobKind::Timer(spec) => Some(
                serde_json::to_value(spec)
                    .map_err(|e| JobStoreError::Storage(format!("failed to encode timer spec: {e}")))?,
            ),
            _ => None,
        };
        Ok(JobRow {
            id: *job.id.as_uuid(),
            revision: job.revision as i32,
            kind: job.kind.name().to_string(),
            timer,
            execution_id: job.execution_id.as_ref().map(|e| e.as_str().to_string()),
            process_instance_id: job.process_instance_id.as_ref().map(|p| p.as_str().to_string()),
            process_definition_id: job.process_definition_id.as_ref().map(|d| d.as_str().to_string()),
            process_definition_key: job.process_definition_key.clone(),
            tenant_id: job.tenant_id.as_ref().map(|t| t.as_str().to_string()),
            due_date: job.due_date,
            lock_owner: job.lease.as_ref().map(|l| l.owner.clone()),
            lock_expires_at: job.lease.as_ref().map(|l| l.expires_at),
            retries: job.retries as i32,
            exclusive: job.exclusive,
            handler_type: job.handler_type.clone(),
            handler_configuration: job.handler_configuration.clone(),
            exception_message: None,
            exception_details: None,
            exception_recorded_at: None,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let kind = match (row.kind.as_str(), row.timer) {
            ("async_continuation", _) => JobKind::AsyncContinuation,
            ("message", _) => JobKind::Message,
            ("timer", Some(timer)) => JobKind::Timer(
                serde_json::from_value::<TimerSpec>(timer)
                    .map_err(|e| JobStoreError::Storage(format!("failed to decode timer spec: {e}")))?,
            ),
            (other, _) => {
                return Err(JobStoreError::Storage(format!("unknown job kind '{other}'")));
            }
        };
        let lease = match (row.lock_owner, row.lock_expires_at) {
            (Some(owner), Some(expires_at)) => Some(Lease::new(owner, expires_at)),
            _ => None,
        };
        let exception = match (row.exception_message, row.exception_details, row.exception_recorded_at) {
            (Some(message), Some(details), Some(recorded_at)) => {
                Some(ExceptionPayload::new(message, details, recorded_at))
            }
            _ => None,
        };
        Ok(Job {
            id: JobId::from_uuid(row.id),
            revision: row.revision as u32,
            kind,
            execution_id: row.execution_id.map(ExecutionId::new),
            process_instance_id: row.process_instance_id.map(ProcessInstanceId::new),
            process_definition_id: row.process_definition_id.map(ProcessDefinitionId::new),
            process_definition_key: row.process_definition_key,
            tenant_id: row.tenant_id.map(TenantId::new),
            due_date: row.due_date,
            lease,
            retries: row.retries.max(0) as u32,
            exclusive: row.exclusive,
            handler_type: row.handler_type,
            handler_configuration: row.handler_configuration,
            exception,
        })
    }
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row).map_err(decode_error)?.try_into()
}

fn decode_jobs(rows: &[PgRow]) -> Result<Vec<Job>, JobStoreError> {
    rows.iter().map(decode_job).collect()
}

impl JobStore for PostgresJobStore {
    fn apply(&self, batch: Vec<StoreOp>) -> Result<(), JobStoreError> {
        self.block_on(self.apply_batch(batch))
    }

    fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.load_job(id))
    }

    fn exception_payload(&self, id: JobId) -> Result<Option<ExceptionPayload>, JobStoreError> {
        self.block_on(self.load_exception_payload(id))
    }

    fn find_due_jobs(
        &self,
        now: DateTime<Utc>,
        filter: DueFilter,
        page: Page,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.load_due_jobs(now, filter, page))
    }

    fn find_by_lock_owner(&self, owner: &str, page: Page) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.load_by_lock_owner(owner, page))
    }

    fn find_by_execution(
        &self,
        execution_id: &ExecutionId,
        timers_only: bool,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.load_by_execution(execution_id, timers_only))
    }

    fn find_by_handler_and_definitions(
        &self,
        handler_type: &str,
        definitions: &[ProcessDefinitionId],
    ) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.load_by_handler_and_definitions(handler_type, definitions))
    }

    fn find_by_handler_and_definition_key(
        &self,
        handler_type: &str,
        definition_key: &str,
        tenant: Option<&TenantId>,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.load_by_handler_and_definition_key(handler_type, definition_key, tenant))
    }

    fn find_exclusive_jobs_to_execute(
        &self,
        process_instance_id: &ProcessInstanceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.load_exclusive_jobs_to_execute(process_instance_id, now))
    }

    fn find_unlocked_timers_due_before(
        &self,
        due: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.load_unlocked_timers_due_before(due, page))
    }

    fn find_by_query(&self, query: &JobQuery, page: Page) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.query_jobs(query, page))
    }

    fn count_by_query(&self, query: &JobQuery) -> Result<usize, JobStoreError> {
        self.block_on(self.count_jobs(query))
    }

    fn acquire(&self, id: JobId, lease: Lease, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.claim_job(id, lease, now))
    }

    fn acquire_due_jobs(
        &self,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.claim_due_jobs(owner, lease_expires_at, now, limit))
    }

    fn update_tenant_for_definitions(
        &self,
        definitions: &[ProcessDefinitionId],
        tenant: Option<&TenantId>,
    ) -> Result<usize, JobStoreError> {
        self.block_on(self.set_tenant_for_definitions(definitions, tenant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::recurrence::Recurrence;
    use crate::jobs::types::TRIGGER_TIMER;
    use chrono::TimeZone;

    #[test]
    fn timer_round_trips_through_row() {
        let due = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();
        let recurrence: Recurrence = "R3/PT10M".parse().unwrap();
        let mut job = Job::timer(TRIGGER_TIMER, TimerSpec::recurring(recurrence))
            .due_at(due)
            .with_tenant(TenantId::new("acme"));
        job.lease = Some(Lease::new("node-1", due));

        let row = JobRow::encode(&job).unwrap();
        assert_eq!(row.kind, "timer");
        assert_eq!(row.lock_owner.as_deref(), Some("node-1"));
        assert_eq!(Job::try_from(row).unwrap(), job);
    }

    #[test]
    fn unknown_kind_is_a_storage_error() {
        let mut row = JobRow::encode(&Job::message("notify")).unwrap();
        row.kind = "bogus".to_string();
        assert!(matches!(Job::try_from(row), Err(JobStoreError::Storage(_))));
    }

    #[test]
    fn schema_declares_both_tables() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS jobs"));
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS job_exception_payloads"));
    }

    /// Needs a live database at `DATABASE_URL`; skipped otherwise.
    #[test]
    fn exclusive_claim_skips_an_instance_locked_by_another_worker() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("skipping postgres test: DATABASE_URL not set");
            return;
        };
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(4)
                .connect(&url)
                .await
                .unwrap();
            let store = PostgresJobStore::with_runtime(pool.clone(), Handle::current());
            store.ensure_schema().await.unwrap();

            let now = Utc::now();
            let instance = format!("pi-{}", JobId::new());
            let sibling = || Job::message("notify").in_process_instance(ProcessInstanceId::new(instance.clone())).due_at(now);
            let (first, second) = (sibling(), sibling());
            store
                .apply_batch(vec![StoreOp::Insert(first.clone()), StoreOp::Insert(second.clone())])
                .await
                .unwrap();

            let mut holder = pool.begin().await.unwrap();
            let lease = Lease::new("node-1", now + chrono::Duration::minutes(5));
            let claimed = claim_in_tx(&mut holder, first.id, Some(&instance), true, &lease, now, true)
                .await
                .unwrap();
            assert!(claimed.is_some());

            // A waiting lock would trip the timeout instead of returning.
            let mut contender = pool.begin().await.unwrap();
            sqlx::query("SET LOCAL lock_timeout = '2s'")
                .execute(&mut *contender)
                .await
                .unwrap();
            let lease = Lease::new("node-2", now + chrono::Duration::minutes(5));
            let skipped = claim_in_tx(&mut contender, second.id, Some(&instance), true, &lease, now, true)
                .await
                .unwrap();
            assert!(skipped.is_none());

            contender.rollback().await.unwrap();
            holder.rollback().await.unwrap();
            sqlx::query("DELETE FROM jobs WHERE process_instance_id = $1")
                .bind(&instance)
                .execute(&pool)
                .await
                .unwrap();
        });
    }
}
