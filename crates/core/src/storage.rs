//! Object storage collaborator interface.

use async_trait::async_trait;

use crate::error::ErrorKind;

pub const CONTENT_TYPE_PNG: &str = "image/png";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    #[error("Storage I/O error for {path}: {message}")]
    Io { path: String, message: String },
}

impl StorageError {
    /// Missing objects and bad paths are permanent; I/O failures are
    /// assumed to be timeouts or outages and retried.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::InvalidPath(_) => ErrorKind::Permanent,
            Self::Io { .. } => ErrorKind::Transient,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "MissingFile",
            Self::InvalidPath(_) => "InvalidPath",
            Self::Io { .. } => "StorageIo",
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download_to_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    async fn upload_bytes(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;
}
