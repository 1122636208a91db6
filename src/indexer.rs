//! Composes chunks into index points and writes them to the vector
//! index: one dense vector, one sparse vector, and a payload per chunk.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::chunker::ChunkConfig;
use crate::embed::{Bm25Encoder, DenseEmbedder};
use crate::error::Result;
use crate::metadata::{extract_metadata, merge_metadata};
use crate::models::{DocumentKind, DocumentRecord, ExtractionMethod, Page, RawChunk};
use crate::vectordb::{ChunkPayload, IndexPoint, PayloadMetadata, VectorIndex};

/// Builds and writes index points for a document.
pub struct Indexer {
    embedder: Arc<dyn DenseEmbedder>,
    sparse: Bm25Encoder,
    index: Arc<dyn VectorIndex>,
    pub chunking: ChunkConfig,
}

impl Indexer {
    pub fn new(
        embedder: Arc<dyn DenseEmbedder>,
        sparse: Bm25Encoder,
        index: Arc<dyn VectorIndex>,
        chunking: ChunkConfig,
    ) -> Self {
        Self {
            embedder,
            sparse,
            index,
            chunking,
        }
    }

    /// Embed and upsert a document's chunks. Returns the chunk count.
    pub async fn index_document(
        &self,
        record: &DocumentRecord,
        kind: DocumentKind,
        pages: &[Page],
        chunks: Vec<RawChunk>,
    ) -> Result<usize> {
        // Document-level metadata comes from the full text; chunk-level
        // extraction refines it per chunk.
        let full_text: String = pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let doc_meta = extract_metadata(&full_text, &record.filename);

        let file_path = if record.object_key.is_empty() {
            record.filename.clone()
        } else {
            record.object_key.clone()
        };

        let count = chunks.len();
        let mut points = Vec::with_capacity(count);
        for chunk in chunks {
            // Prefix the filename so sparse search can match document
            // names that only appear in payload metadata.
            let cleaned_name = record
                .filename
                .trim_end_matches(".pdf")
                .trim_end_matches(".pptx")
                .trim_end_matches(".ppt")
                .replace('_', " ");
            let searchable = format!(
                "[Document: {}] [File: {}]\n{}",
                record.filename, cleaned_name, chunk.text
            );

            let dense = self.embedder.embed(&searchable).await?;
            let sparse = self.sparse.encode(&searchable);

            let chunk_meta = extract_metadata(&chunk.text, &record.filename);
            let merged = merge_metadata(&doc_meta, &chunk_meta);

            let method = pages
                .iter()
                .find(|p| p.number == chunk.page_number)
                .map(|p| p.method)
                .unwrap_or(ExtractionMethod::Structural);

            let payload = ChunkPayload {
                text: chunk.text,
                metadata: PayloadMetadata {
                    group_id: record.group_id,
                    page_number: chunk.page_number,
                    file_path: file_path.clone(),
                    filename: record.filename.clone(),
                    section: merged.section.clone().unwrap_or_default(),
                    chunk_type: chunk.kind.as_str().to_string(),
                    extraction_method: method.as_str().to_string(),
                    doc_id: merged.doc_id.clone(),
                    vehicle_model: merged.vehicle_model.clone(),
                    chassis_no: merged.chassis_no.clone(),
                    test_date: merged.test_date.clone(),
                    test_type: merged.test_type.clone(),
                    test_parameters: merged.test_parameters.clone(),
                    compliance_status: merged.compliance_status.clone(),
                    standards: merged.standards.clone(),
                    keywords: merged.keywords.clone(),
                },
            };

            points.push(IndexPoint {
                id: Uuid::new_v4().to_string(),
                dense,
                sparse,
                payload,
            });
        }

        self.index.upsert(points).await?;
        debug!(
            document = record.id,
            kind = kind.as_str(),
            chunks = count,
            "indexed document"
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkKind, NewDocument, ProcessingStatus};
    use crate::vectordb::MemoryIndex;
    use async_trait::async_trait;
    use chrono::Utc;

    struct HashEmbedder;

    #[async_trait]
    impl DenseEmbedder for HashEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // Deterministic toy embedding.
            let mut v = vec![0.0f32; 4];
            for (i, b) in text.bytes().enumerate() {
                v[i % 4] += b as f32 / 255.0;
            }
            Ok(v)
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    fn record() -> DocumentRecord {
        let new = NewDocument {
            filename: "ETR_02_24_12.pdf".into(),
            content_hash: "h".into(),
            group_id: 5,
            object_key: "group_5/h_ETR_02_24_12.pdf".into(),
            local_path: None,
        };
        DocumentRecord {
            id: 1,
            filename: new.filename,
            content_hash: new.content_hash,
            group_id: new.group_id,
            object_key: new.object_key,
            local_path: None,
            status: ProcessingStatus::Processing,
            error: None,
            chunk_count: 0,
            task_handle: None,
            uploaded_at: Utc::now(),
        }
    }

    fn pages() -> Vec<Page> {
        vec![Page::new(
            1,
            "Model: Pro 3012\nBrake test results were meeting AIS 153.".into(),
            ExtractionMethod::Structural,
        )]
    }

    #[tokio::test]
    async fn payload_carries_group_and_merged_metadata() {
        let index = Arc::new(MemoryIndex::new());
        let indexer = Indexer::new(
            Arc::new(HashEmbedder),
            Bm25Encoder::default(),
            index.clone(),
            ChunkConfig::default(),
        );

        let chunks = vec![RawChunk {
            text: "Brake test results were meeting AIS 153.".into(),
            page_number: 1,
            kind: ChunkKind::Prose,
        }];
        let count = indexer
            .index_document(&record(), DocumentKind::Pdf, &pages(), chunks)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(index.len(), 1);

        let hits = index
            .search_dense(&[1.0, 1.0, 1.0, 1.0], &[5], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        let meta = &hits[0].payload.metadata;
        assert_eq!(meta.group_id, 5);
        assert_eq!(meta.page_number, 1);
        assert_eq!(meta.filename, "ETR_02_24_12.pdf");
        assert_eq!(meta.file_path, "group_5/h_ETR_02_24_12.pdf");
        assert_eq!(meta.chunk_type, "prose");
        // Vehicle model comes from document-level extraction.
        assert_eq!(meta.vehicle_model.as_deref(), Some("Pro 3012"));
        assert_eq!(meta.test_type.as_deref(), Some("brake"));
    }

    #[tokio::test]
    async fn chunk_text_is_stored_without_searchable_prefix() {
        let index = Arc::new(MemoryIndex::new());
        let indexer = Indexer::new(
            Arc::new(HashEmbedder),
            Bm25Encoder::default(),
            index.clone(),
            ChunkConfig::default(),
        );

        let chunks = vec![RawChunk {
            text: "plain chunk body".into(),
            page_number: 1,
            kind: ChunkKind::Prose,
        }];
        indexer
            .index_document(&record(), DocumentKind::Pdf, &pages(), chunks)
            .await
            .unwrap();

        let hits = index.search_dense(&[1.0; 4], &[5], 1).await.unwrap();
        assert_eq!(hits[0].payload.text, "plain chunk body");
    }

    #[tokio::test]
    async fn method_tag_follows_source_page() {
        let index = Arc::new(MemoryIndex::new());
        let indexer = Indexer::new(
            Arc::new(HashEmbedder),
            Bm25Encoder::default(),
            index.clone(),
            ChunkConfig::default(),
        );

        let mut ocr_page = Page::new(2, "scanned content".into(), ExtractionMethod::VisionOcr);
        ocr_page.number = 2;
        let pages = vec![ocr_page];
        let chunks = vec![RawChunk {
            text: "scanned content".into(),
            page_number: 2,
            kind: ChunkKind::Prose,
        }];
        indexer
            .index_document(&record(), DocumentKind::Pdf, &pages, chunks)
            .await
            .unwrap();

        let hits = index.search_dense(&[1.0; 4], &[5], 1).await.unwrap();
        assert_eq!(hits[0].payload.metadata.extraction_method, "vision-ocr");
    }
}
