//! Classification of sqlx failures into collaborator errors.

use plandiff_core::queue::QueueError;
use plandiff_core::store::StoreError;

/// Postgres SQLSTATEs that ask the client to retry the transaction.
const RETRYABLE_STATES: [&str; 2] = [
    "40001", // serialization_failure
    "40P01", // deadlock_detected
];

/// Connection-level failures are transient; retryable SQLSTATEs are
/// conflicts; everything else is a backend error.
pub fn store_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        sqlx::Error::Database(db)
            if db
                .code()
                .is_some_and(|code| RETRYABLE_STATES.contains(&code.as_ref())) =>
        {
            StoreError::Conflict(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

pub fn queue_error(err: sqlx::Error) -> QueueError {
    QueueError::Unavailable(err.to_string())
}

/// Wrap a row that failed to convert into a domain value.
pub(crate) fn decode_error(entity: &str, id: &str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("{entity} {id} has invalid data: {reason}"))
}
