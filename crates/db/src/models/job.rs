//! Rows of `jobs` and `job_events`.

use plandiff_core::job::{Job, JobEvent, JobEventType, JobStatus, StatusId};
use plandiff_core::store::StoreError;
use plandiff_core::types::{EntityId, JsonMap, Timestamp};
use plandiff_core::usage::LlmUsage;
use sqlx::FromRow;

use crate::error::decode_error;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: EntityId,
    pub job_type: String,
    pub status_id: StatusId,
    pub payload: serde_json::Value,
}

/// A row from the `job_events` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobEventRow {
    pub id: uuid::Uuid,
    pub job_id: EntityId,
    pub job_type: String,
    pub status_id: StatusId,
    pub event_type: String,
    pub drawing_id: Option<EntityId>,
    pub sheet_id: Option<EntityId>,
    pub block_id: Option<EntityId>,
    pub metadata: Option<serde_json::Value>,
    pub llm_usage: Option<serde_json::Value>,
    pub created_at: Timestamp,
}

impl JobRow {
    pub fn into_job(self, events: Vec<JobEventRow>) -> Result<Job, StoreError> {
        let status = JobStatus::from_id(self.status_id).ok_or_else(|| {
            decode_error("job", &self.id, format!("unknown status id {}", self.status_id))
        })?;
        let events = events
            .into_iter()
            .map(JobEventRow::into_event)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Job {
            id: self.id,
            job_type: self.job_type,
            status,
            payload: self.payload,
            events,
        })
    }
}

impl JobEventRow {
    pub fn into_event(self) -> Result<JobEvent, StoreError> {
        let id = self.id.to_string();
        let status = JobStatus::from_id(self.status_id).ok_or_else(|| {
            decode_error("job event", &id, format!("unknown status id {}", self.status_id))
        })?;
        let event_type = JobEventType::parse(&self.event_type).ok_or_else(|| {
            decode_error("job event", &id, format!("unknown event type {}", self.event_type))
        })?;
        let metadata = match self.metadata {
            Some(serde_json::Value::Object(map)) => Some(map),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => {
                return Err(decode_error(
                    "job event",
                    &id,
                    format!("metadata is not an object: {other}"),
                ))
            }
        };
        let llm_usage = self
            .llm_usage
            .map(serde_json::from_value::<LlmUsage>)
            .transpose()
            .map_err(|e| decode_error("job event", &id, e))?;
        Ok(JobEvent {
            id: self.id,
            job_type: self.job_type,
            job_id: self.job_id,
            status,
            event_type,
            created_at: self.created_at,
            drawing_id: self.drawing_id,
            sheet_id: self.sheet_id,
            block_id: self.block_id,
            metadata,
            llm_usage,
        })
    }
}

/// Serialise optional event metadata for a JSONB bind.
pub fn metadata_value(metadata: &Option<JsonMap>) -> Option<serde_json::Value> {
    metadata.clone().map(serde_json::Value::Object)
}
