//! Cross-encoder reranking of retrieval results.
//!
//! The scoring model is an external collaborator; this module owns the
//! length heuristics and the fallback to the original ordering.

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::vectordb::SearchHit;

/// Minimum words for a chunk to survive reranking, unless it is a table
/// or image chunk (those are short by nature but high-signal).
const MIN_WORDS: usize = 15;

/// Scores (query, text) pairs; higher is more relevant.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>>;
}

fn is_structured(hit: &SearchHit) -> bool {
    matches!(
        hit.payload.metadata.chunk_type.as_str(),
        "table" | "image-caption"
    ) || hit.payload.text.contains('|')
}

/// Rerank hits by cross-encoder score and return the top `top_k`.
///
/// Chunks below the word floor are dropped unless structured; if the
/// floor removes everything, the unfiltered scored order is used. Any
/// reranker failure falls back to the original ordering.
pub async fn rerank_hits(
    reranker: &dyn Reranker,
    query: &str,
    hits: Vec<SearchHit>,
    top_k: usize,
) -> Vec<SearchHit> {
    if hits.is_empty() {
        return hits;
    }

    let texts: Vec<String> = hits.iter().map(|h| h.payload.text.clone()).collect();
    let scores = match reranker.score(query, &texts).await {
        Ok(scores) if scores.len() == hits.len() => scores,
        Ok(_) => {
            warn!("reranker returned wrong score count, keeping original order");
            return hits.into_iter().take(top_k).collect();
        }
        Err(err) => {
            warn!(error = %err, "reranker failed, keeping original order");
            return hits.into_iter().take(top_k).collect();
        }
    };

    let scored: Vec<(SearchHit, f32)> = hits.into_iter().zip(scores).collect();

    let mut kept: Vec<&(SearchHit, f32)> = scored
        .iter()
        .filter(|(hit, _)| {
            hit.payload.text.split_whitespace().count() >= MIN_WORDS || is_structured(hit)
        })
        .collect();
    if kept.is_empty() {
        kept = scored.iter().collect();
    }

    kept.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    kept.into_iter()
        .take(top_k)
        .map(|(hit, score)| {
            let mut hit = hit.clone();
            hit.score = *score;
            hit
        })
        .collect()
}
