//! In-memory vector index.
//!
//! Implements the same contract as the Qdrant adapter, including local
//! reciprocal-rank fusion, so pipelines can be exercised without a
//! running vector database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;

use super::{
    rrf_fuse, HybridSearch, IndexPoint, MetadataFilters, PayloadMetadata, SearchHit, VectorIndex,
    RRF_K,
};

#[derive(Default)]
struct Inner {
    created: bool,
    points: HashMap<String, IndexPoint>,
}

/// Vector index held entirely in process memory.
#[derive(Default)]
pub struct MemoryIndex {
    inner: Mutex<Inner>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored points (test support).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(metadata: &PayloadMetadata, group_ids: &[i64], filters: Option<&MetadataFilters>) -> bool {
        if !group_ids.contains(&metadata.group_id) {
            return false;
        }
        let Some(filters) = filters else {
            return true;
        };

        // Text match for doc id and vehicle model, exact for the rest,
        // mirroring the conditions the Qdrant adapter builds.
        if let Some(doc_id) = &filters.doc_id {
            match &metadata.doc_id {
                Some(v) if v.to_lowercase().contains(&doc_id.to_lowercase()) => {}
                _ => return false,
            }
        }
        if let Some(model) = &filters.vehicle_model {
            match &metadata.vehicle_model {
                Some(v) if v.to_lowercase().contains(&model.to_lowercase()) => {}
                _ => return false,
            }
        }
        if let Some(chassis) = &filters.chassis_no {
            if metadata.chassis_no.as_deref() != Some(chassis.as_str()) {
                return false;
            }
        }
        if let Some(test_type) = &filters.test_type {
            if metadata.test_type.as_deref() != Some(test_type.as_str()) {
                return false;
            }
        }
        true
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_index(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        // Second call must be a no-op: existing points survive.
        if !inner.created {
            inner.created = true;
        }
        Ok(())
    }

    async fn upsert(&self, points: Vec<IndexPoint>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for point in points {
            inner.points.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search_dense(
        &self,
        vector: &[f32],
        group_ids: &[i64],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let inner = self.inner.lock().unwrap();
        let mut scored: Vec<SearchHit> = inner
            .points
            .values()
            .filter(|p| Self::matches(&p.payload.metadata, group_ids, None))
            .map(|p| SearchHit {
                id: p.id.clone(),
                score: cosine(vector, &p.dense),
                payload: p.payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn search_hybrid(&self, search: &HybridSearch) -> Result<Vec<SearchHit>> {
        let inner = self.inner.lock().unwrap();
        let candidates: Vec<&IndexPoint> = inner
            .points
            .values()
            .filter(|p| {
                Self::matches(&p.payload.metadata, &search.group_ids, search.filters.as_ref())
            })
            .collect();

        let mut dense_ranked: Vec<(&IndexPoint, f32)> = candidates
            .iter()
            .map(|p| (*p, cosine(&search.dense, &p.dense)))
            .collect();
        dense_ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        dense_ranked.truncate(search.prefetch_limit);

        let mut sparse_ranked: Vec<(&IndexPoint, f32)> = candidates
            .iter()
            .map(|p| (*p, search.sparse.dot(&p.sparse)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        sparse_ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        sparse_ranked.truncate(search.prefetch_limit);

        let rankings = [
            dense_ranked.iter().map(|(p, _)| p.id.clone()).collect(),
            sparse_ranked.iter().map(|(p, _)| p.id.clone()).collect(),
        ];
        let fused = rrf_fuse(&rankings, RRF_K, search.limit);

        Ok(fused
            .into_iter()
            .filter_map(|(id, score)| {
                inner.points.get(&id).map(|p| SearchHit {
                    id,
                    score,
                    payload: p.payload.clone(),
                })
            })
            .collect())
    }

    async fn delete_by_file_path(&self, file_path: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .points
            .retain(|_, p| p.payload.metadata.file_path != file_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::{Bm25Encoder, SparseVector};
    use crate::vectordb::ChunkPayload;

    fn payload(group_id: i64, file_path: &str, text: &str) -> ChunkPayload {
        ChunkPayload {
            text: text.to_string(),
            metadata: PayloadMetadata {
                group_id,
                page_number: 1,
                file_path: file_path.to_string(),
                filename: file_path.to_string(),
                section: String::new(),
                chunk_type: "prose".to_string(),
                extraction_method: "structural".to_string(),
                doc_id: None,
                vehicle_model: None,
                chassis_no: None,
                test_date: None,
                test_type: None,
                test_parameters: vec![],
                compliance_status: vec![],
                standards: vec![],
                keywords: vec![],
            },
        }
    }

    fn point(id: &str, group_id: i64, dense: Vec<f32>, text: &str) -> IndexPoint {
        IndexPoint {
            id: id.to_string(),
            dense,
            sparse: Bm25Encoder::default().encode(text),
            payload: payload(group_id, "a.pdf", text),
        }
    }

    #[tokio::test]
    async fn ensure_index_is_idempotent() {
        let index = MemoryIndex::new();
        index.ensure_index().await.unwrap();
        index
            .upsert(vec![point("p1", 1, vec![1.0, 0.0], "brake test")])
            .await
            .unwrap();
        index.ensure_index().await.unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn group_filter_confines_results() {
        let index = MemoryIndex::new();
        index
            .upsert(vec![
                point("p1", 1, vec![1.0, 0.0], "brake test report"),
                point("p2", 2, vec![1.0, 0.0], "brake test report"),
            ])
            .await
            .unwrap();

        let hits = index.search_dense(&[1.0, 0.0], &[1], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload.metadata.group_id, 1);

        let search = HybridSearch::new(
            vec![1.0, 0.0],
            Bm25Encoder::default().encode("brake test"),
            vec![2],
        );
        let hits = index.search_hybrid(&search).await.unwrap();
        assert!(hits.iter().all(|h| h.payload.metadata.group_id == 2));
    }

    #[tokio::test]
    async fn hybrid_prefers_agreement_between_spaces() {
        let index = MemoryIndex::new();
        index
            .upsert(vec![
                point("both", 1, vec![0.9, 0.1], "noise test noise test measurement"),
                point("dense-only", 1, vec![1.0, 0.0], "cooling system overview"),
                point("sparse-only", 1, vec![0.0, 1.0], "noise appendix"),
            ])
            .await
            .unwrap();

        let search = HybridSearch::new(
            vec![1.0, 0.0],
            Bm25Encoder::default().encode("noise test"),
            vec![1],
        );
        let hits = index.search_hybrid(&search).await.unwrap();
        assert_eq!(hits[0].id, "both");
    }

    #[tokio::test]
    async fn delete_by_file_path_removes_points() {
        let index = MemoryIndex::new();
        let mut p = point("p1", 1, vec![1.0], "text");
        p.payload.metadata.file_path = "gone.pdf".to_string();
        index.upsert(vec![p, point("p2", 1, vec![1.0], "text")]).await.unwrap();

        index.delete_by_file_path("gone.pdf").await.unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn metadata_filters_narrow_hybrid_results() {
        let index = MemoryIndex::new();
        let mut p1 = point("p1", 1, vec![1.0], "report body");
        p1.payload.metadata.doc_id = Some("ETR_02_24_12".to_string());
        let mut p2 = point("p2", 1, vec![1.0], "report body");
        p2.payload.metadata.doc_id = Some("ETR_99_01_01".to_string());
        index.upsert(vec![p1, p2]).await.unwrap();

        let search = HybridSearch::new(
            vec![1.0],
            SparseVector::default(),
            vec![1],
        )
        .with_filters(Some(MetadataFilters {
            doc_id: Some("ETR_02_24_12".to_string()),
            ..Default::default()
        }));
        let hits = index.search_hybrid(&search).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "p1");
    }
}
