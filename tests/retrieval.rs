use edgeprover::{EmbeddingStore, PremiseRecord, Prover, ProverError, Registry, Result};
use ndarray::{array, Array2};
use std::sync::Arc;

fn corpus() -> Result<EmbeddingStore> {
    EmbeddingStore::new(
        array![
            [1.0_f32, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.6, 0.8, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0]
        ],
        vec![
            PremiseRecord::new("Nat.add_comm", "Mathlib/Algebra/Group/Defs.lean", "theorem add_comm (a b : ℕ) : a + b = b + a"),
            PremiseRecord::new("Nat.mul_comm", "Mathlib/Algebra/Group/Defs.lean", "theorem mul_comm (a b : ℕ) : a * b = b * a"),
            PremiseRecord::new("Nat.add_assoc", "Mathlib/Algebra/Group/Defs.lean", "theorem add_assoc"),
            PremiseRecord::new("Nat.le_refl", "Mathlib/Order/Basic.lean", "theorem le_refl (a : ℕ) : a ≤ a"),
            PremiseRecord::new("Nat.succ_pos", "Mathlib/Data/Nat/Basic.lean", "theorem succ_pos (n : ℕ) : 0 < n + 1"),
        ],
    )
}

fn prover(store: EmbeddingStore) -> Prover {
    let registry = Arc::new(Registry::new());
    registry.insert_premise_store(store);
    Prover::new(registry)
}

#[test]
fn test_nearest_premise_first() -> Result<()> {
    let prover = prover(corpus()?);
    let hits = prover.retrieve_premises(&[1.0, 0.0, 0.0, 0.0], 2)?;
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].name, "Nat.add_comm");
    assert_eq!(hits[0].score, 1.0);
    assert_eq!(hits[1].name, "Nat.add_assoc");
    assert!((hits[1].score - 0.6).abs() < 1e-6);
    assert!(hits[0].score >= hits[1].score);
    Ok(())
}

#[test]
fn test_k_bounds() -> Result<()> {
    let prover = prover(corpus()?);
    let q = [0.0_f32, 0.0, 1.0, 0.0];
    assert_eq!(prover.retrieve_premises(&q, 5)?.len(), 5);
    for k in [0, 6] {
        assert!(matches!(
            prover.retrieve_premises(&q, k),
            Err(ProverError::InvalidArgument { .. })
        ));
    }
    assert!(matches!(
        prover.retrieve_premises(&[1.0, 0.0], 1),
        Err(ProverError::InvalidArgument { .. })
    ));
    Ok(())
}

#[test]
fn test_scores_are_raw_inner_products() -> Result<()> {
    let prover = prover(corpus()?);
    let hits = prover.retrieve_premises(&[2.0, 2.0, 0.0, 0.0], 3)?;
    let names: Vec<&str> = hits.iter().map(|h| h.name.as_str()).collect();
    assert_eq!(names, vec!["Nat.add_assoc", "Nat.add_comm", "Nat.mul_comm"]);
    assert!((hits[0].score - 2.8).abs() < 1e-6);
    // Equal scores keep store order.
    assert_eq!(hits[1].score, hits[2].score);
    Ok(())
}

#[test]
fn test_store_round_trips_through_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let embeddings = dir.path().join("embeddings.safetensors");
    let dictionary = dir.path().join("dictionary.json");
    corpus()?.save(&embeddings, &dictionary)?;

    let registry = Arc::new(Registry::new());
    assert!(registry.init_premise_store(&embeddings, &dictionary)?.is_some());
    let prover = Prover::new(registry);
    let hits = prover.retrieve_premises(&[0.0, 0.0, 0.0, 1.0], 1)?;
    assert_eq!(hits[0].name, "Nat.succ_pos");
    assert_eq!(hits[0].path, "Mathlib/Data/Nat/Basic.lean");
    assert_eq!(hits[0].source_text, "theorem succ_pos (n : ℕ) : 0 < n + 1");
    Ok(())
}

#[test]
fn test_dictionary_must_cover_every_row() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let embeddings = dir.path().join("embeddings.safetensors");
    let dictionary = dir.path().join("dictionary.json");
    corpus()?.save(&embeddings, &dictionary)?;
    std::fs::write(
        &dictionary,
        r#"{ "0": { "full_name": "Nat.add_comm", "path": "A.lean", "code": "" } }"#,
    )?;
    assert!(matches!(
        EmbeddingStore::load(&embeddings, &dictionary),
        Err(ProverError::InvalidArgument { .. })
    ));
    Ok(())
}

#[test]
fn test_parallel_batch_agrees_with_single_queries() -> Result<()> {
    let n = 200;
    let d = 16;
    let matrix = Array2::from_shape_fn((n, d), |(i, j)| ((i * 31 + j * 17) % 23) as f32 - 11.0);
    let records = (0..n)
        .map(|i| PremiseRecord::new(format!("Lemma{}", i), "Big.lean", ""))
        .collect();
    let prover = prover(EmbeddingStore::new(matrix, records)?);

    let queries: Vec<Vec<f32>> = (0..32)
        .map(|q| (0..d).map(|j| ((q * 7 + j * 3) % 5) as f32 - 2.0).collect())
        .collect();
    let batch = prover.retrieve_premises_batch(&queries, 10)?;
    assert_eq!(batch.len(), queries.len());
    for (query, hits) in queries.iter().zip(&batch) {
        assert_eq!(hits, &prover.retrieve_premises(query, 10)?);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }
    Ok(())
}
