//! Repository for the `job_queue` table.

use std::collections::HashMap;

use sqlx::postgres::PgExecutor;
use sqlx::types::Json;

use crate::models::queue::QueueRow;

const COLUMNS: &str = "id, message_id, body, attributes, delivery_attempt, lease_token";

pub struct QueueRepo;

impl QueueRepo {
    pub async fn enqueue<'e, E: PgExecutor<'e>>(
        executor: E,
        message_id: &str,
        body: &[u8],
        attributes: &HashMap<String, String>,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "INSERT INTO job_queue (message_id, body, attributes) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(message_id)
        .bind(body)
        .bind(Json(attributes))
        .fetch_one(executor)
        .await
    }

    /// Atomically lease the oldest available message.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent workers never
    /// lease the same row.
    pub async fn lease_next<'e, E: PgExecutor<'e>>(
        executor: E,
        lease_token: uuid::Uuid,
        lease_secs: f64,
    ) -> Result<Option<QueueRow>, sqlx::Error> {
        let query = format!(
            "UPDATE job_queue \
             SET lease_token = $1, \
                 leased_until = NOW() + make_interval(secs => $2), \
                 delivery_attempt = delivery_attempt + 1 \
             WHERE id = ( \
                 SELECT id FROM job_queue \
                 WHERE leased_until IS NULL OR leased_until < NOW() \
                 ORDER BY id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QueueRow>(&query)
            .bind(lease_token)
            .bind(lease_secs)
            .fetch_optional(executor)
            .await
    }

    /// Delete a message still held under `lease_token`.
    pub async fn delete<'e, E: PgExecutor<'e>>(
        executor: E,
        id: i64,
        lease_token: uuid::Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM job_queue WHERE id = $1 AND lease_token = $2")
            .bind(id)
            .bind(lease_token)
            .execute(executor)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Make a message immediately available again.
    pub async fn release<'e, E: PgExecutor<'e>>(
        executor: E,
        id: i64,
        lease_token: uuid::Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE job_queue SET lease_token = NULL, leased_until = NULL \
             WHERE id = $1 AND lease_token = $2",
        )
        .bind(id)
        .bind(lease_token)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn extend<'e, E: PgExecutor<'e>>(
        executor: E,
        id: i64,
        lease_token: uuid::Uuid,
        secs: f64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE job_queue SET leased_until = NOW() + make_interval(secs => $3) \
             WHERE id = $1 AND lease_token = $2",
        )
        .bind(id)
        .bind(lease_token)
        .bind(secs)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
