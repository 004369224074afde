use plandiff_core::error::{CoreError, ErrorKind};
use plandiff_core::queue::QueueError;
use plandiff_core::storage::StorageError;
use plandiff_core::store::StoreError;
use plandiff_pipeline::VisionError;

/// Failure of one job execution.
///
/// Wraps the error of every layer a handler touches. [`kind`](Self::kind)
/// decides between acknowledging (permanent) and redelivery (transient).
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Vision(#[from] VisionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A blocking compute task panicked or was cancelled.
    #[error("Compute task failed: {0}")]
    Compute(String),
}

pub type JobResult<T> = Result<T, JobError>;

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Core(e) => e.kind(),
            Self::Vision(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::Queue(e) => e.kind(),
            Self::Compute(_) => ErrorKind::Permanent,
        }
    }

    /// Stable identifier recorded as `errorType` on failed events.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Core(e) => e.error_type(),
            Self::Vision(e) => e.error_type(),
            Self::Store(e) => e.error_type(),
            Self::Storage(e) => e.error_type(),
            Self::Queue(QueueError::Unavailable(_)) => "QueueUnavailable",
            Self::Queue(QueueError::LeaseExpired(_)) => "LeaseExpired",
            Self::Compute(_) => "ComputeFailed",
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

impl From<tokio::task::JoinError> for JobError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Compute(err.to_string())
    }
}
