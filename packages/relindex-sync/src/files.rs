//! File capability for record services
//!
//! Tracks the file manifest of each record (keys, metadata, declared size,
//! status). File bytes are not stored here.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub key: String,
    pub metadata: Value,
    pub size: Option<u64>,
    pub status: FileStatus,
}

/// Per-record file manifests
#[async_trait]
pub trait FileSubsystem: Send + Sync {
    async fn list_files(&self, record_id: Uuid) -> Result<Vec<FileEntry>>;

    /// Register pending files; fails if any key already exists
    async fn init_files(
        &self,
        record_id: Uuid,
        files: Vec<(String, Value)>,
    ) -> Result<Vec<FileEntry>>;

    async fn read_file_metadata(&self, record_id: Uuid, key: &str) -> Result<FileEntry>;

    /// Replace a file's metadata
    async fn update_file_metadata(
        &self,
        record_id: Uuid,
        key: &str,
        metadata: Value,
    ) -> Result<FileEntry>;

    /// Record the size of an upload
    ///
    /// # Errors
    ///
    /// - `SizeLimitExceeded` if the bucket has a limit below `length`
    /// - `Validation` if the file already has content
    async fn set_content_length(&self, record_id: Uuid, key: &str, length: u64)
        -> Result<FileEntry>;

    /// Mark a file complete; its size must be known
    async fn commit_file(&self, record_id: Uuid, key: &str) -> Result<FileEntry>;

    async fn delete_file(&self, record_id: Uuid, key: &str) -> Result<FileEntry>;

    /// Remove every file of a record; returns the removed entries
    async fn delete_all_files(&self, record_id: Uuid) -> Result<Vec<FileEntry>>;
}

/// In-memory manifests with an optional per-file size limit
#[derive(Default)]
pub struct InMemoryFileSubsystem {
    manifests: DashMap<Uuid, BTreeMap<String, FileEntry>>,
    size_limit: Option<u64>,
}

impl InMemoryFileSubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size_limit(size_limit: u64) -> Self {
        Self {
            size_limit: Some(size_limit),
            ..Default::default()
        }
    }

    fn update<F>(&self, record_id: Uuid, key: &str, f: F) -> Result<FileEntry>
    where
        F: FnOnce(&mut FileEntry) -> Result<()>,
    {
        let mut manifest = self
            .manifests
            .get_mut(&record_id)
            .ok_or_else(|| SyncError::NotFound(format!("files of record {}", record_id)))?;
        let entry = manifest
            .get_mut(key)
            .ok_or_else(|| SyncError::NotFound(format!("file {}", key)))?;
        f(entry)?;
        Ok(entry.clone())
    }
}

#[async_trait]
impl FileSubsystem for InMemoryFileSubsystem {
    async fn list_files(&self, record_id: Uuid) -> Result<Vec<FileEntry>> {
        Ok(self
            .manifests
            .get(&record_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn init_files(
        &self,
        record_id: Uuid,
        files: Vec<(String, Value)>,
    ) -> Result<Vec<FileEntry>> {
        let mut manifest = self.manifests.entry(record_id).or_default();
        if let Some((key, _)) = files.iter().find(|(key, _)| manifest.contains_key(key)) {
            return Err(SyncError::validation(format!(
                "File with key {} already exists",
                key
            )));
        }

        let mut created = Vec::with_capacity(files.len());
        for (key, metadata) in files {
            let entry = FileEntry {
                key: key.clone(),
                metadata,
                size: None,
                status: FileStatus::Pending,
            };
            manifest.insert(key, entry.clone());
            created.push(entry);
        }
        debug!(record_id = %record_id, files = created.len(), "Files initialized");
        Ok(created)
    }

    async fn read_file_metadata(&self, record_id: Uuid, key: &str) -> Result<FileEntry> {
        self.manifests
            .get(&record_id)
            .and_then(|manifest| manifest.get(key).cloned())
            .ok_or_else(|| SyncError::NotFound(format!("file {}", key)))
    }

    async fn update_file_metadata(
        &self,
        record_id: Uuid,
        key: &str,
        metadata: Value,
    ) -> Result<FileEntry> {
        self.update(record_id, key, |entry| {
            entry.metadata = metadata;
            Ok(())
        })
    }

    async fn set_content_length(
        &self,
        record_id: Uuid,
        key: &str,
        length: u64,
    ) -> Result<FileEntry> {
        if let Some(limit) = self.size_limit {
            if length > limit {
                return Err(SyncError::SizeLimitExceeded {
                    size: length,
                    limit,
                });
            }
        }
        self.update(record_id, key, |entry| {
            if entry.size.is_some() {
                return Err(SyncError::validation(format!(
                    "File {} already has content",
                    entry.key
                )));
            }
            entry.size = Some(length);
            Ok(())
        })
    }

    async fn commit_file(&self, record_id: Uuid, key: &str) -> Result<FileEntry> {
        self.update(record_id, key, |entry| {
            if entry.size.is_none() {
                return Err(SyncError::validation(format!(
                    "File {} has no content",
                    entry.key
                )));
            }
            entry.status = FileStatus::Completed;
            Ok(())
        })
    }

    async fn delete_file(&self, record_id: Uuid, key: &str) -> Result<FileEntry> {
        let mut manifest = self
            .manifests
            .get_mut(&record_id)
            .ok_or_else(|| SyncError::NotFound(format!("files of record {}", record_id)))?;
        manifest
            .remove(key)
            .ok_or_else(|| SyncError::NotFound(format!("file {}", key)))
    }

    async fn delete_all_files(&self, record_id: Uuid) -> Result<Vec<FileEntry>> {
        let removed: Vec<FileEntry> = self
            .manifests
            .remove(&record_id)
            .map(|(_, manifest)| manifest.into_values().collect())
            .unwrap_or_default();
        debug!(record_id = %record_id, files = removed.len(), "Files deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_file_lifecycle() {
        let files = InMemoryFileSubsystem::new();
        let id = Uuid::new_v4();

        files
            .init_files(id, vec![("article.txt".into(), json!({"title": "A"}))])
            .await
            .unwrap();
        assert!(files.commit_file(id, "article.txt").await.is_err());

        files.set_content_length(id, "article.txt", 12).await.unwrap();
        let committed = files.commit_file(id, "article.txt").await.unwrap();
        assert_eq!(committed.status, FileStatus::Completed);
        assert_eq!(committed.size, Some(12));

        files.delete_file(id, "article.txt").await.unwrap();
        assert!(files.list_files(id).await.unwrap().is_empty());
        assert!(files.delete_file(id, "article.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let files = InMemoryFileSubsystem::new();
        let id = Uuid::new_v4();
        files.init_files(id, vec![("a".into(), json!({}))]).await.unwrap();

        let err = files
            .init_files(id, vec![("b".into(), json!({})), ("a".into(), json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(files.list_files(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_content_set_once() {
        let files = InMemoryFileSubsystem::new();
        let id = Uuid::new_v4();
        files.init_files(id, vec![("a".into(), json!({}))]).await.unwrap();

        files.set_content_length(id, "a", 10).await.unwrap();
        let err = files.set_content_length(id, "a", 20).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(files.read_file_metadata(id, "a").await.unwrap().size, Some(10));
    }

    #[tokio::test]
    async fn test_file_metadata_and_bulk_delete() {
        let files = InMemoryFileSubsystem::new();
        let id = Uuid::new_v4();
        files
            .init_files(
                id,
                vec![("a".into(), json!({"title": "A"})), ("b".into(), json!({}))],
            )
            .await
            .unwrap();

        let updated = files
            .update_file_metadata(id, "a", json!({"title": "A2"}))
            .await
            .unwrap();
        assert_eq!(updated.metadata["title"], "A2");
        assert_eq!(files.read_file_metadata(id, "a").await.unwrap(), updated);
        assert!(files.read_file_metadata(id, "c").await.unwrap_err().is_not_found());
        assert!(files
            .update_file_metadata(id, "c", json!({}))
            .await
            .unwrap_err()
            .is_not_found());

        let removed = files.delete_all_files(id).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(files.list_files(id).await.unwrap().is_empty());
        assert!(files.delete_all_files(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_size_limit() {
        let files = InMemoryFileSubsystem::with_size_limit(1024);
        let id = Uuid::new_v4();
        files.init_files(id, vec![("big".into(), json!({}))]).await.unwrap();

        let err = files.set_content_length(id, "big", 2048).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::SizeLimitExceeded { size: 2048, limit: 1024 }
        ));
        assert!(files.set_content_length(id, "big", 1024).await.is_ok());
    }
}
