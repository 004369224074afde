//! Object-store implementations.
//!
//! [`LocalObjectStore`] keeps objects as files under a root directory;
//! [`MemoryObjectStore`] keeps them in a map for tests and local runs.

use std::collections::BTreeMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use plandiff_core::storage::{ObjectStore, StorageError};

// ---------------------------------------------------------------------------
// LocalObjectStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an object path onto the filesystem. Only plain relative
    /// components are accepted.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        if path.trim().is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(path: &str, err: std::io::Error) -> StorageError {
    match err.kind() {
        IoErrorKind::NotFound => StorageError::NotFound(path.to_string()),
        _ => StorageError::Io {
            path: path.to_string(),
            message: err.to_string(),
        },
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn download_to_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        let bytes = tokio::fs::read(&full).await.map_err(|e| io_error(path, e))?;
        tracing::debug!(path, bytes = bytes.len(), "Object downloaded");
        Ok(bytes)
    }

    async fn upload_bytes(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }
        let len = bytes.len();
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| io_error(path, e))?;
        tracing::debug!(path, bytes = len, content_type, "Object uploaded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryObjectStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn put(&self, path: impl Into<String>, bytes: Vec<u8>) {
        self.lock().insert(path.into(), bytes);
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn download_to_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn upload_bytes(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        self.put(path, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use plandiff_core::storage::CONTENT_TYPE_PNG;

    use super::*;

    #[tokio::test]
    async fn local_store_round_trips_nested_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store
            .upload_bytes("overlays/ov-1/overlay.png", vec![1, 2, 3], CONTENT_TYPE_PNG)
            .await
            .unwrap();

        assert!(dir.path().join("overlays/ov-1/overlay.png").exists());
        let bytes = store.download_to_bytes("overlays/ov-1/overlay.png").await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn local_store_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert_matches!(
            store.download_to_bytes("sheets/missing.png").await,
            Err(StorageError::NotFound(p)) if p == "sheets/missing.png"
        );
    }

    #[tokio::test]
    async fn local_store_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        for path in ["../secret", "/etc/passwd", "a/../../b", ""] {
            assert_matches!(
                store.download_to_bytes(path).await,
                Err(StorageError::InvalidPath(_)),
                "{path} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn memory_store_behaves_like_a_map() {
        let store = MemoryObjectStore::new();
        store.upload_bytes("a.png", vec![9], CONTENT_TYPE_PNG).await.unwrap();
        assert_eq!(store.download_to_bytes("a.png").await.unwrap(), vec![9]);
        assert_eq!(store.paths(), vec!["a.png".to_string()]);
        assert_matches!(
            store.download_to_bytes("b.png").await,
            Err(StorageError::NotFound(_))
        );
    }
}
