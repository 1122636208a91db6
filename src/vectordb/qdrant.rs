//! Qdrant adapter for the vector index contract.
//!
//! One collection with a named dense space (cosine) and a named sparse
//! space kept in memory; hybrid queries prefetch from both spaces and
//! fuse server-side with RRF.

use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    Fusion, PointStruct, PrefetchQueryBuilder, Query, QueryPointsBuilder, ScoredPoint,
    SparseIndexConfigBuilder, SparseVectorParamsBuilder, SparseVectorsConfigBuilder,
    UpsertPointsBuilder, Value, VectorParamsBuilder, VectorsConfigBuilder,
};
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::{Payload, Qdrant, QdrantError};
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::{ChunkPayload, HybridSearch, IndexPoint, SearchHit, VectorIndex};

const DENSE_SPACE: &str = "dense";
const SPARSE_SPACE: &str = "sparse";

/// Vector index backed by a Qdrant collection.
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    dimension: usize,
}

fn qerr(err: QdrantError) -> Error {
    Error::TransientExternal(format!("vector index: {err}"))
}

impl QdrantIndex {
    pub fn connect(url: &str, collection: &str, dimension: usize) -> Result<Self> {
        let client = Qdrant::from_url(url).build().map_err(qerr)?;
        Ok(Self {
            client,
            collection: collection.to_string(),
            dimension,
        })
    }

    /// Mandatory group filter plus any optional metadata conditions.
    fn build_filter(group_ids: &[i64], filters: Option<&super::MetadataFilters>) -> Filter {
        let mut must = vec![Condition::matches("metadata.group_id", group_ids.to_vec())];

        if let Some(f) = filters {
            if let Some(doc_id) = &f.doc_id {
                must.push(Condition::matches_text("metadata.doc_id", doc_id));
            }
            if let Some(model) = &f.vehicle_model {
                must.push(Condition::matches_text("metadata.vehicle_model", model));
            }
            if let Some(chassis) = &f.chassis_no {
                must.push(Condition::matches("metadata.chassis_no", chassis.clone()));
            }
            if let Some(test_type) = &f.test_type {
                must.push(Condition::matches("metadata.test_type", test_type.clone()));
            }
        }

        Filter::must(must)
    }

    fn hit_from_point(point: ScoredPoint) -> Option<SearchHit> {
        let id = match point.id.and_then(|p| p.point_id_options) {
            Some(PointIdOptions::Uuid(s)) => s,
            Some(PointIdOptions::Num(n)) => n.to_string(),
            None => return None,
        };

        let mut map = serde_json::Map::new();
        for (key, value) in point.payload {
            map.insert(key, value_to_json(value));
        }
        let payload: ChunkPayload = serde_json::from_value(serde_json::Value::Object(map)).ok()?;

        Some(SearchHit {
            id,
            score: point.score,
            payload,
        })
    }
}

/// Convert a Qdrant payload value into plain JSON.
fn value_to_json(value: Value) -> serde_json::Value {
    match value.kind {
        Some(Kind::NullValue(_)) | None => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(i),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.into_iter().map(value_to_json).collect())
        }
        Some(Kind::StructValue(s)) => serde_json::Value::Object(
            s.fields
                .into_iter()
                .map(|(k, v)| (k, value_to_json(v)))
                .collect(),
        ),
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_index(&self) -> Result<()> {
        if self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(qerr)?
        {
            debug!(collection = %self.collection, "collection already exists");
            return Ok(());
        }

        let mut vectors = VectorsConfigBuilder::default();
        vectors.add_named_vector_params(
            DENSE_SPACE,
            VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
        );

        let mut sparse = SparseVectorsConfigBuilder::default();
        sparse.add_named_vector_params(
            SPARSE_SPACE,
            // Keep the lexical index in memory for query speed.
            SparseVectorParamsBuilder::default()
                .index(SparseIndexConfigBuilder::default().on_disk(false)),
        );

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(vectors)
                    .sparse_vectors_config(sparse),
            )
            .await
            .map_err(qerr)?;

        info!(collection = %self.collection, dimension = self.dimension, "created collection");
        Ok(())
    }

    async fn upsert(&self, points: Vec<IndexPoint>) -> Result<()> {
        let count = points.len();
        let mut structs = Vec::with_capacity(count);
        for point in points {
            let payload_json = serde_json::to_value(&point.payload)?;
            let payload = Payload::try_from(payload_json)
                .map_err(|e| Error::Internal(format!("payload conversion: {e}")))?;

            let vectors = qdrant_client::qdrant::NamedVectors::default()
                .add_vector(DENSE_SPACE, point.dense)
                .add_vector(
                    SPARSE_SPACE,
                    qdrant_client::qdrant::Vector::new_sparse(
                        point.sparse.indices,
                        point.sparse.values,
                    ),
                );

            structs.push(PointStruct::new(point.id, vectors, payload));
        }

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, structs).wait(true))
            .await
            .map_err(qerr)?;

        debug!(collection = %self.collection, count, "upserted points");
        Ok(())
    }

    async fn search_dense(
        &self,
        vector: &[f32],
        group_ids: &[i64],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let response = self
            .client
            .query(
                QueryPointsBuilder::new(&self.collection)
                    .query(Query::new_nearest(vector.to_vec()))
                    .using(DENSE_SPACE)
                    .filter(Self::build_filter(group_ids, None))
                    .limit(limit as u64)
                    .with_payload(true),
            )
            .await
            .map_err(qerr)?;

        Ok(response
            .result
            .into_iter()
            .filter_map(Self::hit_from_point)
            .collect())
    }

    async fn search_hybrid(&self, search: &HybridSearch) -> Result<Vec<SearchHit>> {
        let sparse_pairs: Vec<(u32, f32)> = search
            .sparse
            .indices
            .iter()
            .copied()
            .zip(search.sparse.values.iter().copied())
            .collect();

        let response = self
            .client
            .query(
                QueryPointsBuilder::new(&self.collection)
                    .add_prefetch(
                        PrefetchQueryBuilder::default()
                            .query(Query::new_nearest(search.dense.clone()))
                            .using(DENSE_SPACE)
                            .limit(search.prefetch_limit as u64),
                    )
                    .add_prefetch(
                        PrefetchQueryBuilder::default()
                            .query(Query::new_nearest(sparse_pairs.as_slice()))
                            .using(SPARSE_SPACE)
                            .limit(search.prefetch_limit as u64),
                    )
                    .query(Query::new_fusion(Fusion::Rrf))
                    .filter(Self::build_filter(&search.group_ids, search.filters.as_ref()))
                    .limit(search.limit as u64)
                    .with_payload(true),
            )
            .await
            .map_err(qerr)?;

        Ok(response
            .result
            .into_iter()
            .filter_map(Self::hit_from_point)
            .collect())
    }

    async fn delete_by_file_path(&self, file_path: &str) -> Result<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(Filter::must([Condition::matches(
                        "metadata.file_path",
                        file_path.to_string(),
                    )]))
                    .wait(true),
            )
            .await
            .map_err(qerr)?;

        debug!(collection = %self.collection, file_path, "deleted points");
        Ok(())
    }
}
