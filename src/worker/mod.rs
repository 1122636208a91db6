//! Background ingestion: the upload service and the worker that drives
//! extract -> chunk -> metadata -> embed -> upsert with crash-safe
//! status updates and bounded retry.

mod broker;
mod upload;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::chunker::chunk_pages;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::extract::DocumentExtractor;
use crate::indexer::Indexer;
use crate::models::DocumentKind;
use crate::store::{DocumentStore, ObjectStore};

pub use broker::{AmqpBroker, Broker, IngestJob, MemoryBroker};
pub use upload::{delete_document, retry_document, upload_document, UploadLimits};

/// Outcome of a successful ingestion task.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub document_id: i64,
    pub pages: usize,
    pub chunks: usize,
}

/// Retry policy for ingestion tasks.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first failure.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_secs(30),
        }
    }
}

/// Drives a single document through the ingestion pipeline.
pub struct IngestWorker {
    documents: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    extractor: Arc<dyn DocumentExtractor>,
    indexer: Indexer,
    events: Arc<EventBus>,
    retry: RetryPolicy,
}

impl IngestWorker {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        extractor: Arc<dyn DocumentExtractor>,
        indexer: Indexer,
        events: Arc<EventBus>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            documents,
            objects,
            extractor,
            indexer,
            events,
            retry,
        }
    }

    /// Run a task with the retry policy. Transient failures are retried
    /// after a fixed delay; any terminal failure is materialized into
    /// `status = failed` with a truncated message.
    pub async fn run_task(&self, document_id: i64) -> Result<IngestReport> {
        let mut attempt = 0;
        loop {
            match self.process_document(document_id).await {
                Ok(report) => return Ok(report),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        document_id,
                        attempt,
                        error = %err,
                        "ingestion attempt failed, retrying"
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(err) => {
                    let message = err.persisted_message();
                    if let Err(store_err) = self.documents.mark_failed(document_id, &message).await
                    {
                        warn!(document_id, error = %store_err, "failed to record failure");
                    }
                    self.events
                        .log_error(
                            &format!("Document {document_id} processing failed"),
                            &message,
                            "",
                        )
                        .await;
                    return Err(err.into_exhausted());
                }
            }
        }
    }

    /// One ingestion attempt. The temp directory is removed on every
    /// exit path because the `TempDir` owns it.
    async fn process_document(&self, document_id: i64) -> Result<IngestReport> {
        let record = self
            .documents
            .get(document_id)
            .await?
            .ok_or_else(|| Error::DataConsistency(format!("document {document_id} not found")))?;

        let task_handle = Uuid::new_v4().to_string();
        self.documents
            .mark_processing(document_id, &task_handle)
            .await?;
        info!(document_id, filename = %record.filename, "processing document");

        let temp_dir = tempfile::tempdir()?;
        let local_path = temp_dir.path().join(&record.filename);

        if !record.object_key.is_empty() {
            self.objects
                .get_to_file(&record.object_key, &local_path)
                .await?;
        } else if let Some(source) = record.local_path.as_ref().filter(|p| p.exists()) {
            std::fs::copy(source, &local_path)?;
        } else {
            return Err(Error::DataConsistency(format!(
                "no file source for document {document_id}"
            )));
        }

        let kind = DocumentKind::from_path(&local_path).ok_or_else(|| {
            Error::InputInvalid(format!("unsupported file type: {}", record.filename))
        })?;

        let pages = self.extractor.extract(&local_path, kind).await?;
        let chunks = chunk_pages(&pages, kind, &self.indexer.chunking);
        let page_count = pages.len();

        let chunk_count = self
            .indexer
            .index_document(&record, kind, &pages, chunks)
            .await?;

        self.documents
            .mark_done(document_id, chunk_count as u32)
            .await?;
        self.events
            .log_upload(&record.filename, page_count, chunk_count, None)
            .await;
        info!(document_id, chunks = chunk_count, "document processed");

        Ok(IngestReport {
            document_id,
            pages: page_count,
            chunks: chunk_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkConfig;
    use crate::embed::{Bm25Encoder, DenseEmbedder};
    use crate::events::{EventBus, MemoryEventStore};
    use crate::models::{ExtractionMethod, NewDocument, Page, ProcessingStatus};
    use crate::store::{MemoryDocumentStore, MemoryObjectStore};
    use crate::vectordb::MemoryIndex;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct TinyEmbedder;

    #[async_trait]
    impl DenseEmbedder for TinyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    /// Extractor that fails transiently a configurable number of times.
    struct FlakyExtractor {
        failures: AtomicU32,
    }

    #[async_trait]
    impl DocumentExtractor for FlakyExtractor {
        async fn extract(&self, _path: &Path, _kind: DocumentKind) -> Result<Vec<Page>> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
            {
                return Err(Error::TransientExternal("embedding service timeout".into()));
            }
            Ok(vec![Page::new(
                1,
                "Brake test summary for the laden vehicle.".into(),
                ExtractionMethod::Structural,
            )])
        }
    }

    struct Fixture {
        documents: Arc<MemoryDocumentStore>,
        objects: Arc<MemoryObjectStore>,
        index: Arc<MemoryIndex>,
        worker: IngestWorker,
    }

    fn fixture(failures: u32, max_retries: u32) -> Fixture {
        let documents = Arc::new(MemoryDocumentStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let index = Arc::new(MemoryIndex::new());
        let events = Arc::new(EventBus::new(Arc::new(MemoryEventStore::new())));

        let indexer = Indexer::new(
            Arc::new(TinyEmbedder),
            Bm25Encoder::default(),
            index.clone(),
            ChunkConfig::default(),
        );
        let worker = IngestWorker::new(
            documents.clone(),
            objects.clone(),
            Arc::new(FlakyExtractor {
                failures: AtomicU32::new(failures),
            }),
            indexer,
            events,
            RetryPolicy {
                max_retries,
                delay: Duration::from_millis(0),
            },
        );

        Fixture {
            documents,
            objects,
            index,
            worker,
        }
    }

    async fn seeded_document(f: &Fixture) -> i64 {
        let key = "group_1/hash_report.pdf";
        f.objects
            .put(key, b"%PDF-1.4 stub".to_vec(), "application/pdf")
            .await
            .unwrap();
        let record = f
            .documents
            .create(NewDocument {
                filename: "report.pdf".into(),
                content_hash: "hash".into(),
                group_id: 1,
                object_key: key.into(),
                local_path: None,
            })
            .await
            .unwrap();
        record.id
    }

    #[tokio::test]
    async fn successful_task_marks_done_with_chunk_count() {
        let f = fixture(0, 2);
        let id = seeded_document(&f).await;

        let report = f.worker.run_task(id).await.unwrap();
        assert_eq!(report.pages, 1);
        assert!(report.chunks >= 1);

        let record = f.documents.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Done);
        assert_eq!(record.chunk_count as usize, report.chunks);
        assert!(record.error.is_none());
        assert!(record.task_handle.is_some());
        assert_eq!(f.index.len(), report.chunks);
    }

    #[tokio::test]
    async fn transient_failure_then_success_ends_done() {
        let f = fixture(1, 2);
        let id = seeded_document(&f).await;

        let report = f.worker.run_task(id).await.unwrap();
        let record = f.documents.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Done);
        assert_eq!(record.chunk_count as usize, report.chunks);
        // Retrying never duplicates the record.
        assert_eq!(f.documents.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_failed_with_message() {
        let f = fixture(10, 2);
        let id = seeded_document(&f).await;

        let err = f.worker.run_task(id).await.unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));

        let record = f.documents.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Failed);
        let message = record.error.unwrap();
        assert!(message.contains("timeout"));
        assert!(message.len() <= 500);
    }

    #[tokio::test]
    async fn missing_record_is_terminal() {
        let f = fixture(0, 2);
        let err = f.worker.run_task(999).await.unwrap_err();
        assert!(matches!(err, Error::DataConsistency(_)));
    }

    #[tokio::test]
    async fn missing_file_source_is_terminal() {
        let f = fixture(0, 2);
        let record = f
            .documents
            .create(NewDocument {
                filename: "report.pdf".into(),
                content_hash: "hash".into(),
                group_id: 1,
                object_key: String::new(),
                local_path: None,
            })
            .await
            .unwrap();

        let err = f.worker.run_task(record.id).await.unwrap_err();
        assert!(matches!(err, Error::DataConsistency(_)));
        let current = f.documents.get(record.id).await.unwrap().unwrap();
        assert_eq!(current.status, ProcessingStatus::Failed);
        assert!(current.error.unwrap().contains("no file source"));
    }
}
