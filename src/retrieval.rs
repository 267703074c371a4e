//! Top-k premise selection over an `EmbeddingStore`.

use ndarray::ArrayView1;
use rayon::prelude::*;
use std::cmp::Ordering;

use crate::error::{ProverError, Result};
use crate::store::EmbeddingStore;
use crate::traits::Similarity;

/// One selected row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredIndex {
    pub index: usize,
    pub score: f32,
}

/// Scores every premise against a query and keeps the best `k`.
pub struct Retriever<'s, S: Similarity + ?Sized> {
    store: &'s EmbeddingStore,
    similarity: &'s S,
}

impl<'s, S: Similarity + ?Sized> Retriever<'s, S> {
    pub fn new(store: &'s EmbeddingStore, similarity: &'s S) -> Self {
        Self { store, similarity }
    }

    /// The `k` highest-scoring rows, best first. Equal scores are ordered by
    /// ascending row index.
    pub fn top_k(&self, query: ArrayView1<'_, f32>, k: usize) -> Result<Vec<ScoredIndex>> {
        let n = self.store.len();
        if k == 0 || k > n {
            return Err(ProverError::invalid(format!(
                "k must be in 1..={}, got {}",
                n, k
            )));
        }
        if query.len() != self.store.dim() {
            return Err(ProverError::invalid(format!(
                "query has {} dimensions, premise embeddings have {}",
                query.len(),
                self.store.dim()
            )));
        }

        let scores = self
            .similarity
            .similarity(self.store.embeddings(), query)
            .map_err(ProverError::InferenceFailure)?;
        if scores.len() != n {
            return Err(ProverError::InferenceFailure(anyhow::anyhow!(
                "similarity returned {} scores for {} premises",
                scores.len(),
                n
            )));
        }
        if let Some(bad) = scores.iter().position(|s| s.is_nan()) {
            return Err(ProverError::InferenceFailure(anyhow::anyhow!(
                "similarity score for premise {} is NaN",
                bad
            )));
        }

        let mut ranked: Vec<ScoredIndex> = scores
            .iter()
            .enumerate()
            .map(|(index, &score)| ScoredIndex { index, score })
            .collect();
        if k < n {
            ranked.select_nth_unstable_by(k - 1, rank);
            ranked.truncate(k);
        }
        ranked.sort_by(rank);

        for hit in &ranked {
            if hit.index >= n {
                return Err(ProverError::IndexOutOfRange {
                    index: hit.index,
                    len: n,
                }
                .invariant());
            }
        }
        Ok(ranked)
    }

    /// `top_k` for many queries at once.
    pub fn top_k_batch(&self, queries: &[Vec<f32>], k: usize) -> Result<Vec<Vec<ScoredIndex>>> {
        queries
            .par_iter()
            .map(|q| self.top_k(ArrayView1::from(q.as_slice()), k))
            .collect()
    }
}

/// Descending score, then ascending index. Scores are never NaN here.
fn rank(a: &ScoredIndex, b: &ScoredIndex) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.index.cmp(&b.index))
}
