//! BM25-style sparse vectors for lexical search.
//!
//! Term indices are stable 32-bit hashes of the token, so the same word
//! always lands on the same dimension of the inverted index. Values are
//! saturated term frequencies; the IDF half of BM25 lives in the index
//! backend, which knows corpus statistics.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A `(indices, values)` pair representing a lexical term vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Dot product with another sparse vector.
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let map: HashMap<u32, f32> = other
            .indices
            .iter()
            .copied()
            .zip(other.values.iter().copied())
            .collect();
        self.indices
            .iter()
            .zip(self.values.iter())
            .filter_map(|(idx, val)| map.get(idx).map(|v| v * val))
            .sum()
    }
}

/// Tokens too common to carry retrieval signal.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "to", "was", "were", "with",
];

/// Deterministic BM25-style encoder.
#[derive(Debug, Clone)]
pub struct Bm25Encoder {
    k1: f32,
    b: f32,
    /// Assumed average document length in tokens.
    avg_len: f32,
}

impl Default for Bm25Encoder {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            avg_len: 256.0,
        }
    }
}

impl Bm25Encoder {
    pub fn new(k1: f32, b: f32, avg_len: f32) -> Self {
        Self { k1, b, avg_len }
    }

    /// Encode text into a sparse term vector.
    pub fn encode(&self, text: &str) -> SparseVector {
        let tokens = tokenize(text);
        let doc_len = tokens.len() as f32;

        let mut counts: HashMap<u32, f32> = HashMap::new();
        for token in &tokens {
            *counts.entry(hash_token(token)).or_insert(0.0) += 1.0;
        }

        let norm = self.k1 * (1.0 - self.b + self.b * doc_len / self.avg_len);
        let mut pairs: Vec<(u32, f32)> = counts
            .into_iter()
            .map(|(idx, tf)| (idx, tf * (self.k1 + 1.0) / (tf + norm)))
            .collect();
        pairs.sort_unstable_by_key(|(idx, _)| *idx);

        SparseVector {
            indices: pairs.iter().map(|(idx, _)| *idx).collect(),
            values: pairs.iter().map(|(_, val)| *val).collect(),
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// FNV-1a over the token bytes, folded to 32 bits.
fn hash_token(token: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in token.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
