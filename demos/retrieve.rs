use anyhow::Result;
use edgeprover::codec::{Symbol, END_TOKEN_ID};
use edgeprover::{CrossAttentionContext, EmbeddingStore, Encoder, Model, PremiseRecord, Prover, Registry};
use ndarray::{Array2, Array3};
use std::sync::Arc;

const DIM: usize = 64;

/// Hashes each symbol into one of `DIM` buckets; mean pooling then yields a
/// normalised byte histogram.
struct ByteBuckets;

impl Model for ByteBuckets {}

impl Encoder for ByteBuckets {
    fn encode(&self, tokens: &[Symbol]) -> Result<CrossAttentionContext> {
        let body: Vec<Symbol> = tokens.iter().copied().filter(|&s| s != END_TOKEN_ID).collect();
        let mut hidden = Array3::zeros((1, body.len().max(1), DIM));
        for (i, s) in body.iter().enumerate() {
            hidden[[0, i, (*s as usize * 2654435761) % DIM]] = 1.0;
        }
        Ok(CrossAttentionContext::new(hidden))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let premises = [
        ("Nat.add_comm", "Mathlib/Algebra/Group/Defs.lean", "theorem add_comm (a b : ℕ) : a + b = b + a"),
        ("Nat.mul_comm", "Mathlib/Algebra/Group/Defs.lean", "theorem mul_comm (a b : ℕ) : a * b = b * a"),
        ("Nat.add_zero", "Mathlib/Init/Data/Nat.lean", "theorem add_zero (n : ℕ) : n + 0 = n"),
        ("Nat.le_refl", "Mathlib/Order/Basic.lean", "theorem le_refl (n : ℕ) : n ≤ n"),
        ("Nat.succ_pos", "Mathlib/Data/Nat/Basic.lean", "theorem succ_pos (n : ℕ) : 0 < succ n"),
        ("List.length_append", "Mathlib/Data/List/Basic.lean", "theorem length_append (s t : List α) : length (s ++ t) = length s + length t"),
    ];

    let registry = Arc::new(Registry::new());
    registry.insert_encoder("buckets", Arc::new(ByteBuckets));
    let prover = Prover::new(Arc::clone(&registry));

    let mut rows = Vec::with_capacity(premises.len() * DIM);
    let mut records = Vec::with_capacity(premises.len());
    for (name, path, code) in premises {
        rows.extend(prover.encode_to_vector("buckets", code)?);
        records.push(PremiseRecord::new(name, path, code));
    }
    let matrix = Array2::from_shape_vec((premises.len(), DIM), rows)?;
    registry.insert_premise_store(EmbeddingStore::new(matrix, records)?);

    let goal = "n : ℕ\n⊢ n + 0 = n";
    let query = prover.encode_to_vector("buckets", goal)?;
    println!("Goal: {:?}", goal);
    for hit in prover.retrieve_premises(&query, 3)? {
        println!("{:.4}  {}  ({})", hit.score, hit.name, hit.path);
        println!("        {}", hit.source_text);
    }
    Ok(())
}
