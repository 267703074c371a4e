//! Turns decoder hypotheses and retrieval hits into caller-facing results.

use serde::Serialize;

use crate::codec::ByteCodec;
use crate::error::Result;
use crate::generation::Hypothesis;
use crate::retrieval::ScoredIndex;
use crate::store::EmbeddingStore;

/// A decoded output text with its sequence probability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub text: String,
    /// In `[0, 1]`.
    pub score: f64,
}

/// A retrieved premise.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PremiseHit {
    pub name: String,
    pub path: String,
    pub source_text: String,
    pub score: f32,
}

/// Decodes each hypothesis, keeping the engine's order.
pub fn assemble_candidates(codec: &ByteCodec, hypotheses: &[Hypothesis]) -> Result<Vec<Candidate>> {
    hypotheses
        .iter()
        .map(|h| {
            Ok(Candidate {
                text: codec.decode(&h.tokens)?,
                score: h.score(),
            })
        })
        .collect()
}

/// Joins each selected row with its record.
pub fn assemble_premises(store: &EmbeddingStore, hits: &[ScoredIndex]) -> Result<Vec<PremiseHit>> {
    hits.iter()
        .map(|hit| {
            let record = store.record(hit.index)?;
            Ok(PremiseHit {
                name: record.name.clone(),
                path: record.path.clone(),
                source_text: record.source_text.clone(),
                score: hit.score,
            })
        })
        .collect()
}
