//! Named model handles and the premise store.
//!
//! Handles are `Arc`s behind a read-write lock. Re-initialising a name swaps
//! the `Arc` in the map; requests already holding the old handle finish on it
//! and the old model is dropped when the last of them releases it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ProverError, Result};
use crate::store::EmbeddingStore;
use crate::traits::{ComputeType, CrossAttentionDecoder, Device, Encoder, Model};

/// How to load one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub device: Device,
    #[serde(default)]
    pub compute_type: ComputeType,
    /// Accelerator ordinals; empty means the backend's default.
    #[serde(default)]
    pub device_indices: Vec<usize>,
    /// Threads per model replica; 0 lets the backend decide.
    #[serde(default)]
    pub intra_threads: usize,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            device: Device::default(),
            compute_type: ComputeType::default(),
            device_indices: Vec::new(),
            intra_threads: 0,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_compute_type(mut self, compute_type: ComputeType) -> Self {
        self.compute_type = compute_type;
        self
    }
}

/// Turns a `ModelSpec` into a loaded backend. Only called for paths that exist.
pub trait ModelLoader: Send + Sync {
    fn load_generator(&self, spec: &ModelSpec) -> anyhow::Result<Arc<dyn CrossAttentionDecoder>>;
    fn load_encoder(&self, spec: &ModelSpec) -> anyhow::Result<Arc<dyn Encoder>>;
}

#[derive(Default)]
pub struct Registry {
    generators: RwLock<HashMap<String, Arc<dyn CrossAttentionDecoder>>>,
    encoders: RwLock<HashMap<String, Arc<dyn Encoder>>>,
    premises: RwLock<Option<Arc<EmbeddingStore>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and registers a generator. `Ok(None)` when `spec.path` does not exist.
    pub fn init_generator(
        &self,
        loader: &dyn ModelLoader,
        spec: &ModelSpec,
    ) -> Result<Option<Arc<dyn CrossAttentionDecoder>>> {
        if !spec.path.exists() {
            tracing::warn!(name = %spec.name, path = %spec.path.display(), "generator path not found");
            return Ok(None);
        }
        let model = loader
            .load_generator(spec)
            .map_err(ProverError::InferenceFailure)?;
        Ok(Some(self.insert_generator(&spec.name, model)))
    }

    /// Loads and registers an encoder. `Ok(None)` when `spec.path` does not exist.
    pub fn init_encoder(&self, loader: &dyn ModelLoader, spec: &ModelSpec) -> Result<Option<Arc<dyn Encoder>>> {
        if !spec.path.exists() {
            tracing::warn!(name = %spec.name, path = %spec.path.display(), "encoder path not found");
            return Ok(None);
        }
        let model = loader
            .load_encoder(spec)
            .map_err(ProverError::InferenceFailure)?;
        Ok(Some(self.insert_encoder(&spec.name, model)))
    }

    /// Loads the premise store. `Ok(None)` when either file does not exist.
    pub fn init_premise_store(
        &self,
        embeddings_path: &Path,
        dictionary_path: &Path,
    ) -> Result<Option<Arc<EmbeddingStore>>> {
        match EmbeddingStore::load(embeddings_path, dictionary_path) {
            Ok(store) => Ok(Some(self.insert_premise_store(store))),
            Err(ProverError::NotFound { path }) => {
                tracing::warn!(path = %path.display(), "premise file not found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Registers an already-built generator, replacing any handle of the same name.
    pub fn insert_generator(
        &self,
        name: &str,
        model: Arc<dyn CrossAttentionDecoder>,
    ) -> Arc<dyn CrossAttentionDecoder> {
        let previous = self
            .generators
            .write()
            .insert(name.to_string(), Arc::clone(&model));
        tracing::info!(name = %name, device = %model.device(), replaced = previous.is_some(), "generator registered");
        model
    }

    pub fn insert_encoder(&self, name: &str, model: Arc<dyn Encoder>) -> Arc<dyn Encoder> {
        let previous = self
            .encoders
            .write()
            .insert(name.to_string(), Arc::clone(&model));
        tracing::info!(name = %name, device = %model.device(), replaced = previous.is_some(), "encoder registered");
        model
    }

    pub fn insert_premise_store(&self, store: EmbeddingStore) -> Arc<EmbeddingStore> {
        let store = Arc::new(store);
        let previous = self.premises.write().replace(Arc::clone(&store));
        tracing::info!(premises = store.len(), replaced = previous.is_some(), "premise store registered");
        store
    }

    pub fn is_generator_initialized(&self, name: &str) -> bool {
        self.generators.read().contains_key(name)
    }

    pub fn is_encoder_initialized(&self, name: &str) -> bool {
        self.encoders.read().contains_key(name)
    }

    pub fn is_premise_store_initialized(&self) -> bool {
        self.premises.read().is_some()
    }

    /// The current handle; the lock is released before the caller uses it.
    pub fn generator(&self, name: &str) -> Result<Arc<dyn CrossAttentionDecoder>> {
        self.generators
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ProverError::not_initialized(format!("generator `{}`", name)))
    }

    pub fn encoder(&self, name: &str) -> Result<Arc<dyn Encoder>> {
        self.encoders
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ProverError::not_initialized(format!("encoder `{}`", name)))
    }

    pub fn premise_store(&self) -> Result<Arc<EmbeddingStore>> {
        self.premises
            .read()
            .clone()
            .ok_or_else(|| ProverError::not_initialized("premise store"))
    }

    pub fn generator_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.generators.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn encoder_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.encoders.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Unregisters a generator. In-flight requests keep their handle.
    pub fn remove_generator(&self, name: &str) -> bool {
        self.generators.write().remove(name).is_some()
    }

    pub fn remove_encoder(&self, name: &str) -> bool {
        self.encoders.write().remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DecodeCache;
    use crate::store::PremiseRecord;
    use crate::traits::{ColdStep, CrossAttentionContext, WarmStep};
    use ndarray::{array, Array3};
    use crate::codec::Symbol;

    struct Null;

    impl Model for Null {}

    impl Encoder for Null {
        fn encode(&self, tokens: &[Symbol]) -> anyhow::Result<CrossAttentionContext> {
            Ok(CrossAttentionContext::new(Array3::zeros((1, tokens.len(), 1))))
        }
    }

    impl CrossAttentionDecoder for Null {
        fn decode_cold(&self, _: &[Symbol], _: &CrossAttentionContext) -> anyhow::Result<ColdStep> {
            anyhow::bail!("not a real decoder")
        }

        fn decode_warm(&self, _: Symbol, _: &DecodeCache, _: &CrossAttentionContext) -> anyhow::Result<WarmStep> {
            anyhow::bail!("not a real decoder")
        }
    }

    struct NullLoader;

    impl ModelLoader for NullLoader {
        fn load_generator(&self, _: &ModelSpec) -> anyhow::Result<Arc<dyn CrossAttentionDecoder>> {
            Ok(Arc::new(Null))
        }

        fn load_encoder(&self, _: &ModelSpec) -> anyhow::Result<Arc<dyn Encoder>> {
            Ok(Arc::new(Null))
        }
    }

    #[test]
    fn test_missing_path_is_not_an_error() -> Result<()> {
        let registry = Registry::new();
        let spec = ModelSpec::new("tacgen", "/nonexistent/model");
        assert!(registry.init_generator(&NullLoader, &spec)?.is_none());
        assert!(!registry.is_generator_initialized("tacgen"));
        assert!(matches!(
            registry.generator("tacgen"),
            Err(ProverError::NotInitialized { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_reinit_replaces_and_old_handle_survives() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = Registry::new();
        let spec = ModelSpec::new("retriever", dir.path());

        let first = registry.init_encoder(&NullLoader, &spec)?.expect("path exists");
        let held = registry.encoder("retriever")?;
        let second = registry.init_encoder(&NullLoader, &spec)?.expect("path exists");

        assert!(Arc::ptr_eq(&held, &first));
        assert!(!Arc::ptr_eq(&registry.encoder("retriever")?, &first));
        assert!(Arc::ptr_eq(&registry.encoder("retriever")?, &second));
        // Still usable after the swap.
        assert_eq!(held.encode(&[4, 1]).map_err(ProverError::InferenceFailure)?.seq_len(), 2);
        assert_eq!(registry.encoder_names(), vec!["retriever".to_string()]);
        Ok(())
    }

    #[test]
    fn test_premise_store_lifecycle() -> Result<()> {
        let registry = Registry::new();
        assert!(!registry.is_premise_store_initialized());
        assert!(registry
            .init_premise_store(Path::new("/nonexistent/e.safetensors"), Path::new("/nonexistent/d.json"))?
            .is_none());

        registry.insert_premise_store(EmbeddingStore::new(
            array![[1.0_f32, 0.0]],
            vec![PremiseRecord::new("Nat.zero_le", "Mathlib/Nat.lean", "theorem zero_le")],
        )?);
        assert_eq!(registry.premise_store()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_remove_generator() {
        let registry = Registry::new();
        registry.insert_generator("tacgen", Arc::new(Null));
        assert!(registry.is_generator_initialized("tacgen"));
        assert!(registry.remove_generator("tacgen"));
        assert!(!registry.remove_generator("tacgen"));
    }
}
