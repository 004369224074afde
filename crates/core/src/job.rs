//! Persisted job state and its append-only event timeline.

use serde::{Deserialize, Serialize};

use crate::types::{EntityId, JsonMap, Timestamp};
use crate::usage::LlmUsage;

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Status ID type matching the SMALLINT status column.
pub type StatusId = i16;

/// Job lifecycle status.
///
/// `Queued -> Started -> {Completed | Failed}`; `Canceled` is set by an
/// external actor from `Queued` or `Started`. Discriminants match the seed
/// order of the `job_statuses` lookup table.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued = 1,
    Started = 2,
    Completed = 3,
    Failed = 4,
    Canceled = 5,
}

impl JobStatus {
    /// Return the database status ID.
    pub fn id(self) -> StatusId {
        self as StatusId
    }

    pub fn from_id(id: StatusId) -> Option<Self> {
        match id {
            1 => Some(Self::Queued),
            2 => Some(Self::Started),
            3 => Some(Self::Completed),
            4 => Some(Self::Failed),
            5 => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    Started,
    Completed,
    Failed,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// The job status this event records.
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Started => JobStatus::Started,
            Self::Completed => JobStatus::Completed,
            Self::Failed => JobStatus::Failed,
        }
    }
}

/// One entry on a job's timeline.
///
/// Constructed via [`JobEvent::new`] and enriched with the builder methods
/// [`with_subject`](JobEvent::with_subject),
/// [`with_metadata`](JobEvent::with_metadata) and
/// [`with_llm_usage`](JobEvent::with_llm_usage).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub id: uuid::Uuid,
    pub job_type: String,
    pub job_id: EntityId,
    pub status: JobStatus,
    pub event_type: JobEventType,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drawing_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_usage: Option<LlmUsage>,
}

/// Entity ids an event is attributed to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventSubject {
    pub drawing_id: Option<EntityId>,
    pub sheet_id: Option<EntityId>,
    pub block_id: Option<EntityId>,
}

impl JobEvent {
    pub fn new(job_type: impl Into<String>, job_id: impl Into<String>, event_type: JobEventType) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            job_type: job_type.into(),
            job_id: job_id.into(),
            status: event_type.status(),
            event_type,
            created_at: chrono::Utc::now(),
            drawing_id: None,
            sheet_id: None,
            block_id: None,
            metadata: None,
            llm_usage: None,
        }
    }

    pub fn with_subject(mut self, subject: &EventSubject) -> Self {
        self.drawing_id = subject.drawing_id.clone();
        self.sheet_id = subject.sheet_id.clone();
        self.block_id = subject.block_id.clone();
        self
    }

    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_llm_usage(mut self, usage: Option<LlmUsage>) -> Self {
        self.llm_usage = usage;
        self
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A persisted job as seen by the worker.
///
/// Only `status` and `events` are mutated here; the row itself is created
/// upstream in `Queued`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: EntityId,
    pub job_type: String,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    /// Append-only timeline, oldest first.
    pub events: Vec<JobEvent>,
}

impl Job {
    pub fn has_event(&self, event_type: JobEventType) -> bool {
        self.events.iter().any(|e| e.event_type == event_type)
    }

    /// Append `event` unless an event of the same type is already recorded.
    ///
    /// Returns `true` when the event was appended.
    pub fn append_event(&mut self, event: JobEvent) -> bool {
        if self.has_event(event.event_type) {
            return false;
        }
        self.events.push(event);
        true
    }
}
