use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ProverError, Result};
use crate::generation::DecodeOptions;
use crate::registry::{ModelLoader, ModelSpec, Registry};
use crate::service::DEFAULT_EMBEDDING_CACHE_CAPACITY;

/// Everything needed to bring a `Prover` up, read from JSON.
///
/// ```json
/// {
///   "generators": [{ "name": "tacgen", "path": "models/tacgen", "device": "cuda" }],
///   "encoders": [{ "name": "retriever", "path": "models/retriever" }],
///   "premise_embeddings": "corpus/embeddings.safetensors",
///   "premise_dictionary": "corpus/dictionary.json",
///   "decode": { "num_return_sequences": 8, "temperature": 0.7 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    pub generators: Vec<ModelSpec>,
    pub encoders: Vec<ModelSpec>,
    pub premise_embeddings: Option<PathBuf>,
    pub premise_dictionary: Option<PathBuf>,
    /// Request defaults for callers that do not build their own options.
    pub decode: DecodeOptions,
    pub embedding_cache_capacity: usize,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            generators: Vec::new(),
            encoders: Vec::new(),
            premise_embeddings: None,
            premise_dictionary: None,
            decode: DecodeOptions::default(),
            embedding_cache_capacity: DEFAULT_EMBEDDING_CACHE_CAPACITY,
        }
    }
}

impl ServingConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ProverError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let config_str = fs::read_to_string(path)?;
        config_str.parse()
    }

    pub fn validate(&self) -> Result<()> {
        self.decode.validate()?;
        if self.premise_embeddings.is_some() != self.premise_dictionary.is_some() {
            return Err(ProverError::invalid(
                "premise_embeddings and premise_dictionary must be set together.",
            ));
        }
        for (kind, specs) in [("generator", &self.generators), ("encoder", &self.encoders)] {
            let mut names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
            names.sort_unstable();
            if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
                return Err(ProverError::invalid(format!(
                    "{} `{}` is configured twice.",
                    kind, pair[0]
                )));
            }
        }
        Ok(())
    }

    /// Loads every configured handle into `registry`. A missing path is
    /// `NotFound` here, since the configuration named it explicitly.
    pub fn load_into(&self, registry: &Registry, loader: &dyn ModelLoader) -> Result<()> {
        self.validate()?;

        for spec in &self.generators {
            if registry.init_generator(loader, spec)?.is_none() {
                return Err(ProverError::NotFound {
                    path: spec.path.clone(),
                });
            }
        }
        for spec in &self.encoders {
            if registry.init_encoder(loader, spec)?.is_none() {
                return Err(ProverError::NotFound {
                    path: spec.path.clone(),
                });
            }
        }
        if let (Some(embeddings), Some(dictionary)) = (&self.premise_embeddings, &self.premise_dictionary) {
            if registry.init_premise_store(embeddings, dictionary)?.is_none() {
                let missing = if embeddings.exists() { dictionary } else { embeddings };
                return Err(ProverError::NotFound {
                    path: missing.clone(),
                });
            }
        }

        tracing::info!(
            generators = self.generators.len(),
            encoders = self.encoders.len(),
            premises = registry.is_premise_store_initialized(),
            "serving config loaded"
        );
        Ok(())
    }
}

impl std::str::FromStr for ServingConfig {
    type Err = ProverError;

    fn from_str(s: &str) -> Result<Self> {
        let config: ServingConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
