//! Repository for the `jobs` and `job_events` tables.

use plandiff_core::job::{JobEvent, JobStatus};
use sqlx::postgres::PgExecutor;

use crate::models::job::{metadata_value, JobEventRow, JobRow};

/// Column list for `jobs` queries.
const COLUMNS: &str = "id, job_type, status_id, payload";

/// Column list for `job_events` queries.
const EVENT_COLUMNS: &str = "\
    id, job_id, job_type, status_id, event_type, \
    drawing_id, sheet_id, block_id, metadata, llm_usage, created_at";

pub struct JobRepo;

impl JobRepo {
    pub async fn find_by_id<'e, E: PgExecutor<'e>>(
        executor: E,
        id: &str,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Lock the job row for the rest of the transaction.
    pub async fn find_for_update<'e, E: PgExecutor<'e>>(
        executor: E,
        id: &str,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Insert a queued job. Used by producers and local tooling.
    pub async fn insert<'e, E: PgExecutor<'e>>(
        executor: E,
        id: &str,
        job_type: &str,
        payload: &serde_json::Value,
    ) -> Result<JobRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO jobs (id, job_type, status_id, payload) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(job_type)
            .bind(JobStatus::Queued.id())
            .bind(payload)
            .fetch_one(executor)
            .await
    }

    pub async fn update_status<'e, E: PgExecutor<'e>>(
        executor: E,
        id: &str,
        status: JobStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE jobs SET status_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.id())
            .execute(executor)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Timeline of a job in append order.
    pub async fn list_events<'e, E: PgExecutor<'e>>(
        executor: E,
        job_id: &str,
    ) -> Result<Vec<JobEventRow>, sqlx::Error> {
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM job_events WHERE job_id = $1 ORDER BY created_at, id"
        );
        sqlx::query_as::<_, JobEventRow>(&query)
            .bind(job_id)
            .fetch_all(executor)
            .await
    }

    /// Insert an event unless one of the same type already exists.
    ///
    /// Returns `true` if the row was inserted.
    pub async fn append_event<'e, E: PgExecutor<'e>>(
        executor: E,
        event: &JobEvent,
    ) -> Result<bool, sqlx::Error> {
        let llm_usage = event
            .llm_usage
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let result = sqlx::query(
            "INSERT INTO job_events \
                (id, job_id, job_type, status_id, event_type, \
                 drawing_id, sheet_id, block_id, metadata, llm_usage, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (job_id, event_type) DO NOTHING",
        )
        .bind(event.id)
        .bind(&event.job_id)
        .bind(&event.job_type)
        .bind(event.status.id())
        .bind(event.event_type.as_str())
        .bind(&event.drawing_id)
        .bind(&event.sheet_id)
        .bind(&event.block_id)
        .bind(metadata_value(&event.metadata))
        .bind(llm_usage)
        .bind(event.created_at)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
