//! Document record store contract.
//!
//! The relational database itself lives outside the core; the worker
//! and upload path depend only on these operations. Status transitions
//! are monotonic except the explicit retry reset.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{DocumentRecord, NewDocument, ProcessingStatus};

/// Operations on document descriptors.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a record in `pending` state.
    async fn create(&self, new: NewDocument) -> Result<DocumentRecord>;

    async fn get(&self, id: i64) -> Result<Option<DocumentRecord>>;

    /// Dedupe lookup: (content hash, group) is unique.
    async fn find_by_hash(&self, content_hash: &str, group_id: i64)
        -> Result<Option<DocumentRecord>>;

    /// `pending|done|failed -> processing`, recording the task handle.
    async fn mark_processing(&self, id: i64, task_handle: &str) -> Result<()>;

    /// `processing -> done`, storing the chunk count and clearing the
    /// error field.
    async fn mark_done(&self, id: i64, chunk_count: u32) -> Result<()>;

    /// `processing -> failed` with a truncated message.
    async fn mark_failed(&self, id: i64, message: &str) -> Result<()>;

    /// Explicit retry: `done|failed -> pending`.
    async fn reset_for_retry(&self, id: i64) -> Result<()>;

    async fn delete(&self, id: i64) -> Result<()>;
}

fn apply_processing(record: &mut DocumentRecord, task_handle: &str) {
    record.status = ProcessingStatus::Processing;
    record.task_handle = Some(task_handle.to_string());
}

fn apply_done(record: &mut DocumentRecord, chunk_count: u32) {
    record.status = ProcessingStatus::Done;
    record.chunk_count = chunk_count;
    record.error = None;
}

fn apply_failed(record: &mut DocumentRecord, message: &str) {
    record.status = ProcessingStatus::Failed;
    record.error = Some(crate::error::truncate_chars(
        message,
        crate::error::MAX_PERSISTED_ERROR_LEN,
    ));
}

fn apply_retry(record: &mut DocumentRecord) -> Result<()> {
    if !record.status.is_terminal() {
        return Err(Error::InputInvalid(format!(
            "document {} is {}, only done or failed records can be retried",
            record.id,
            record.status.as_str()
        )));
    }
    record.status = ProcessingStatus::Pending;
    record.error = None;
    record.task_handle = None;
    Ok(())
}

/// In-memory document store.
#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default, Serialize, Deserialize)]
struct MemoryInner {
    next_id: i64,
    records: HashMap<i64, DocumentRecord>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records (test support).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update<F>(&self, id: i64, f: F) -> Result<()>
    where
        F: FnOnce(&mut DocumentRecord) -> Result<()>,
    {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::DataConsistency(format!("document {id} not found")))?;
        f(record)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, new: NewDocument) -> Result<DocumentRecord> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let record = DocumentRecord {
            id: inner.next_id,
            filename: new.filename,
            content_hash: new.content_hash,
            group_id: new.group_id,
            object_key: new.object_key,
            local_path: new.local_path,
            status: ProcessingStatus::Pending,
            error: None,
            chunk_count: 0,
            task_handle: None,
            uploaded_at: Utc::now(),
        };
        inner.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: i64) -> Result<Option<DocumentRecord>> {
        Ok(self.inner.lock().unwrap().records.get(&id).cloned())
    }

    async fn find_by_hash(
        &self,
        content_hash: &str,
        group_id: i64,
    ) -> Result<Option<DocumentRecord>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .records
            .values()
            .find(|r| r.content_hash == content_hash && r.group_id == group_id)
            .cloned())
    }

    async fn mark_processing(&self, id: i64, task_handle: &str) -> Result<()> {
        self.update(id, |record| {
            apply_processing(record, task_handle);
            Ok(())
        })
    }

    async fn mark_done(&self, id: i64, chunk_count: u32) -> Result<()> {
        self.update(id, |record| {
            apply_done(record, chunk_count);
            Ok(())
        })
    }

    async fn mark_failed(&self, id: i64, message: &str) -> Result<()> {
        self.update(id, |record| {
            apply_failed(record, message);
            Ok(())
        })
    }

    async fn reset_for_retry(&self, id: i64) -> Result<()> {
        self.update(id, apply_retry)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.inner.lock().unwrap().records.remove(&id);
        Ok(())
    }
}

/// File-backed document store for single-node deployments. The record
/// set serializes to one JSON file after every mutation, so upload CLI
/// and worker processes share state. Assumes a single writer at a time.
pub struct JsonDocumentStore {
    path: PathBuf,
    inner: Mutex<MemoryInner>,
}

impl JsonDocumentStore {
    pub fn open(path: &Path) -> Result<Self> {
        let inner = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)
                .map_err(|e| Error::DataConsistency(format!("corrupt document store: {e}")))?
        } else {
            MemoryInner::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(inner),
        })
    }

    fn persist(&self, inner: &MemoryInner) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(inner)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let fresh: MemoryInner = serde_json::from_str(&raw)
            .map_err(|e| Error::DataConsistency(format!("corrupt document store: {e}")))?;
        *self.inner.lock().unwrap() = fresh;
        Ok(())
    }

    fn update<F>(&self, id: i64, f: F) -> Result<()>
    where
        F: FnOnce(&mut DocumentRecord) -> Result<()>,
    {
        self.reload()?;
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::DataConsistency(format!("document {id} not found")))?;
        f(record)?;
        self.persist(&inner)
    }
}

#[async_trait]
impl DocumentStore for JsonDocumentStore {
    async fn create(&self, new: NewDocument) -> Result<DocumentRecord> {
        self.reload()?;
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let record = DocumentRecord {
            id: inner.next_id,
            filename: new.filename,
            content_hash: new.content_hash,
            group_id: new.group_id,
            object_key: new.object_key,
            local_path: new.local_path,
            status: ProcessingStatus::Pending,
            error: None,
            chunk_count: 0,
            task_handle: None,
            uploaded_at: Utc::now(),
        };
        inner.records.insert(record.id, record.clone());
        self.persist(&inner)?;
        Ok(record)
    }

    async fn get(&self, id: i64) -> Result<Option<DocumentRecord>> {
        self.reload()?;
        Ok(self.inner.lock().unwrap().records.get(&id).cloned())
    }

    async fn find_by_hash(
        &self,
        content_hash: &str,
        group_id: i64,
    ) -> Result<Option<DocumentRecord>> {
        self.reload()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .records
            .values()
            .find(|r| r.content_hash == content_hash && r.group_id == group_id)
            .cloned())
    }

    async fn mark_processing(&self, id: i64, task_handle: &str) -> Result<()> {
        self.update(id, |record| {
            apply_processing(record, task_handle);
            Ok(())
        })
    }

    async fn mark_done(&self, id: i64, chunk_count: u32) -> Result<()> {
        self.update(id, |record| {
            apply_done(record, chunk_count);
            Ok(())
        })
    }

    async fn mark_failed(&self, id: i64, message: &str) -> Result<()> {
        self.update(id, |record| {
            apply_failed(record, message);
            Ok(())
        })
    }

    async fn reset_for_retry(&self, id: i64) -> Result<()> {
        self.update(id, apply_retry)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.reload()?;
        let mut inner = self.inner.lock().unwrap();
        inner.records.remove(&id);
        self.persist(&inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_doc(hash: &str, group: i64) -> NewDocument {
        NewDocument {
            filename: "report.pdf".into(),
            content_hash: hash.into(),
            group_id: group,
            object_key: format!("group_{group}/{hash}_report.pdf"),
            local_path: None,
        }
    }

    #[tokio::test]
    async fn records_start_pending() {
        let store = MemoryDocumentStore::new();
        let record = store.create(new_doc("h1", 1)).await.unwrap();
        assert_eq!(record.status, ProcessingStatus::Pending);
        assert_eq!(record.chunk_count, 0);
    }

    #[tokio::test]
    async fn hash_lookup_is_group_scoped() {
        let store = MemoryDocumentStore::new();
        store.create(new_doc("h1", 1)).await.unwrap();

        assert!(store.find_by_hash("h1", 1).await.unwrap().is_some());
        assert!(store.find_by_hash("h1", 2).await.unwrap().is_none());
        assert!(store.find_by_hash("h2", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let store = MemoryDocumentStore::new();
        let record = store.create(new_doc("h1", 1)).await.unwrap();

        store.mark_processing(record.id, "task-9").await.unwrap();
        let current = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(current.status, ProcessingStatus::Processing);
        assert_eq!(current.task_handle.as_deref(), Some("task-9"));

        store.mark_done(record.id, 42).await.unwrap();
        let current = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(current.status, ProcessingStatus::Done);
        assert_eq!(current.chunk_count, 42);
        assert!(current.error.is_none());
    }

    #[tokio::test]
    async fn failed_message_is_truncated() {
        let store = MemoryDocumentStore::new();
        let record = store.create(new_doc("h1", 1)).await.unwrap();
        store.mark_processing(record.id, "t").await.unwrap();
        store.mark_failed(record.id, &"x".repeat(1000)).await.unwrap();

        let current = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(current.error.as_ref().unwrap().len(), 500);
    }

    #[tokio::test]
    async fn retry_requires_terminal_status() {
        let store = MemoryDocumentStore::new();
        let record = store.create(new_doc("h1", 1)).await.unwrap();

        // Pending records cannot be retried.
        assert!(store.reset_for_retry(record.id).await.is_err());

        store.mark_processing(record.id, "t").await.unwrap();
        store.mark_failed(record.id, "boom").await.unwrap();
        store.reset_for_retry(record.id).await.unwrap();

        let current = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(current.status, ProcessingStatus::Pending);
        assert!(current.error.is_none());
    }

    #[tokio::test]
    async fn missing_record_is_data_consistency_error() {
        let store = MemoryDocumentStore::new();
        let err = store.mark_processing(404, "t").await.unwrap_err();
        assert!(matches!(err, Error::DataConsistency(_)));
    }

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("documents.json");

        let store = JsonDocumentStore::open(&path).unwrap();
        let record = store.create(new_doc("h1", 1)).await.unwrap();
        store.mark_processing(record.id, "t").await.unwrap();
        store.mark_done(record.id, 7).await.unwrap();
        drop(store);

        let reopened = JsonDocumentStore::open(&path).unwrap();
        let current = reopened.get(record.id).await.unwrap().unwrap();
        assert_eq!(current.status, ProcessingStatus::Done);
        assert_eq!(current.chunk_count, 7);
        assert!(reopened.find_by_hash("h1", 1).await.unwrap().is_some());
    }
}
