//! Vector index contract: hybrid dense+sparse search with group-scoped
//! access control pushed into every query.
//!
//! Access control is enforced *inside* the index adapter, not by the
//! caller: the mandatory `metadata.group_id` filter is attached to every
//! search this module issues.

mod memory;
mod qdrant;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embed::SparseVector;
use crate::error::Result;

pub use memory::MemoryIndex;
pub use qdrant::QdrantIndex;

/// Fusion constant used by the reciprocal-rank scoring backend.
pub const RRF_K: f32 = 60.0;

/// Default number of final hits returned by hybrid search.
pub const DEFAULT_LIMIT: usize = 20;
/// Default number of candidates prefetched from each vector space.
pub const DEFAULT_PREFETCH: usize = 40;

/// Payload stored alongside each point. The `metadata` map is the
/// queryable surface; `group_id` inside it is authoritative for access
/// control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub text: String,
    pub metadata: PayloadMetadata,
}

/// Queryable chunk metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub group_id: i64,
    pub page_number: u32,
    pub file_path: String,
    pub filename: String,
    #[serde(default)]
    pub section: String,
    pub chunk_type: String,
    pub extraction_method: String,
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub vehicle_model: Option<String>,
    #[serde(default)]
    pub chassis_no: Option<String>,
    #[serde(default)]
    pub test_date: Option<String>,
    #[serde(default)]
    pub test_type: Option<String>,
    #[serde(default)]
    pub test_parameters: Vec<String>,
    #[serde(default)]
    pub compliance_status: Vec<String>,
    #[serde(default)]
    pub standards: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Optional structured filters extracted from a query. Each field maps
/// to a `must` condition on `metadata.<field>`: text match for document
/// id and vehicle model, exact match for chassis number and test type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilters {
    pub doc_id: Option<String>,
    pub vehicle_model: Option<String>,
    pub chassis_no: Option<String>,
    pub test_type: Option<String>,
}

impl MetadataFilters {
    pub fn is_empty(&self) -> bool {
        self.doc_id.is_none()
            && self.vehicle_model.is_none()
            && self.chassis_no.is_none()
            && self.test_type.is_none()
    }
}

/// A point to upsert: opaque id, both vectors, and the payload.
#[derive(Debug, Clone)]
pub struct IndexPoint {
    pub id: String,
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
    pub payload: ChunkPayload,
}

/// A scored search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: ChunkPayload,
}

/// Parameters for a hybrid search.
#[derive(Debug, Clone)]
pub struct HybridSearch {
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
    pub group_ids: Vec<i64>,
    pub limit: usize,
    pub prefetch_limit: usize,
    pub filters: Option<MetadataFilters>,
}

impl HybridSearch {
    pub fn new(dense: Vec<f32>, sparse: SparseVector, group_ids: Vec<i64>) -> Self {
        Self {
            dense,
            sparse,
            group_ids,
            limit: DEFAULT_LIMIT,
            prefetch_limit: DEFAULT_PREFETCH,
            filters: None,
        }
    }

    pub fn with_filters(mut self, filters: Option<MetadataFilters>) -> Self {
        self.filters = filters.filter(|f| !f.is_empty());
        self
    }
}

/// The vector index contract used by the retriever and the indexer.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection with one named dense space and one named
    /// sparse space if absent. Idempotent.
    async fn ensure_index(&self) -> Result<()>;

    /// Write points; existing ids are overwritten.
    async fn upsert(&self, points: Vec<IndexPoint>) -> Result<()>;

    /// Legacy single-mode dense query.
    async fn search_dense(
        &self,
        vector: &[f32],
        group_ids: &[i64],
        limit: usize,
    ) -> Result<Vec<SearchHit>>;

    /// Hybrid search with reciprocal rank fusion of both spaces.
    async fn search_hybrid(&self, search: &HybridSearch) -> Result<Vec<SearchHit>>;

    /// Remove all points whose payload file path matches.
    async fn delete_by_file_path(&self, file_path: &str) -> Result<()>;
}

/// Fuse per-space rankings by Reciprocal Rank Fusion.
///
/// Score of an id is `Σ 1/(k + rank)` over the lists it appears in,
/// with 1-based ranks. Ties break toward the smaller rank in the first
/// list (absent counts as infinity).
pub fn rrf_fuse(rankings: &[Vec<String>], k: f32, limit: usize) -> Vec<(String, f32)> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    for ranking in rankings {
        for (pos, id) in ranking.iter().enumerate() {
            *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k + (pos + 1) as f32);
        }
    }

    let first_rank: HashMap<&String, usize> = rankings
        .first()
        .map(|r| r.iter().enumerate().map(|(pos, id)| (id, pos)).collect())
        .unwrap_or_default();

    let mut fused: Vec<(String, f32)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let ra = first_rank.get(&a.0).copied().unwrap_or(usize::MAX);
                let rb = first_rank.get(&b.0).copied().unwrap_or(usize::MAX);
                ra.cmp(&rb)
            })
    });
    fused.truncate(limit);
    fused
}
