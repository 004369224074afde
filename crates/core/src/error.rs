use serde::{Deserialize, Serialize};

/// Retry classification attached to every failure.
///
/// - `Permanent` -- the request itself cannot succeed; the job is marked
///   failed and the delivery is acknowledged instead of redelivered.
/// - `Transient` -- an infrastructure hiccup; the job is left as-is and the
///   delivery is handed back to the queue for redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Permanent,
    Transient,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Transient => "transient",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-level errors raised while parsing, routing and validating work.
///
/// All variants are permanent: re-delivering the same message cannot make
/// them succeed.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Job type mismatch: expected {expected}, got {actual}")]
    JobTypeMismatch { expected: String, actual: String },

    #[error("Unsupported job type: {0}")]
    UnsupportedJobType(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid image {path}: {reason}")]
    InvalidImage { path: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Convenience constructor for missing entities.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Permanent
    }

    /// Stable name recorded as `errorType` in failed-event metadata.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope(_) => "MalformedEnvelope",
            Self::JobTypeMismatch { .. } => "JobTypeMismatch",
            Self::UnsupportedJobType(_) => "UnsupportedJobType",
            Self::Validation(_) => "ValidationError",
            Self::NotFound { .. } => "NotFound",
            Self::InvalidImage { .. } => "InvalidImage",
            Self::Internal(_) => "InternalError",
        }
    }
}
