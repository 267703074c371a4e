//! Request entry points: text in, candidates or premises out.

use lru::LruCache;
use ndarray::ArrayView1;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use crate::assembler::{assemble_candidates, assemble_premises, Candidate, PremiseHit};
use crate::codec::{ByteCodec, Symbol};
use crate::config::ServingConfig;
use crate::error::{ProverError, Result};
use crate::generation::{DecodeEngine, DecodeOptions};
use crate::pooling::mean_pool_single;
use crate::registry::{ModelLoader, Registry};
use crate::retrieval::Retriever;
use crate::traits::{Encoder, InnerProduct, Similarity};

/// Default number of memoised `encode_to_vector` results.
pub const DEFAULT_EMBEDDING_CACHE_CAPACITY: usize = 1000;

/// Memo key: the address of the encoder handle that produced the vector, and
/// the input text.
type EmbeddingKey = (usize, String);

/// The `Weak` keeps the handle's allocation, and so the address in the key,
/// reserved while the entry lives without keeping the model itself loaded.
type EmbeddingEntry = (Weak<dyn Encoder>, Vec<f32>);

/// Serves `generate`, `encode_to_vector` and `retrieve_premises` over the
/// handles in a `Registry`.
pub struct Prover {
    registry: Arc<Registry>,
    codec: ByteCodec,
    similarity: Arc<dyn Similarity>,
    /// Request defaults, usually from `ServingConfig::decode`.
    default_options: DecodeOptions,
    /// Entries follow the registered handle, so a swapped encoder never
    /// serves its predecessor's vectors. `None` disables memoisation.
    embedding_cache: Option<Mutex<LruCache<EmbeddingKey, EmbeddingEntry>>>,
}

impl Prover {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            codec: ByteCodec::default(),
            similarity: Arc::new(InnerProduct),
            default_options: DecodeOptions::default(),
            embedding_cache: NonZeroUsize::new(DEFAULT_EMBEDDING_CACHE_CAPACITY)
                .map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    /// Builds a registry from `config`. Every configured model and premise
    /// file must exist.
    pub fn from_config(config: &ServingConfig, loader: &dyn ModelLoader) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        config.load_into(&registry, loader)?;
        Ok(Self::new(registry)
            .with_default_options(config.decode.clone())
            .with_embedding_cache(config.embedding_cache_capacity))
    }

    pub fn with_codec(mut self, codec: ByteCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_similarity(mut self, similarity: Arc<dyn Similarity>) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn with_default_options(mut self, options: DecodeOptions) -> Self {
        self.default_options = options;
        self
    }

    /// 0 turns the cache off.
    pub fn with_embedding_cache(mut self, capacity: usize) -> Self {
        self.embedding_cache = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn codec(&self) -> &ByteCodec {
        &self.codec
    }

    /// Options for callers that do not bring their own.
    pub fn default_options(&self) -> &DecodeOptions {
        &self.default_options
    }

    /// Generates `options.num_return_sequences` continuations of `target_prefix`
    /// for `input`, best first.
    pub fn generate(
        &self,
        generator: &str,
        input: &str,
        target_prefix: &str,
        options: &DecodeOptions,
    ) -> Result<Vec<Candidate>> {
        self.generate_with(generator, input, target_prefix, options, |_, _| true)
    }

    /// `generate` with a per-symbol callback; returning `false` cancels.
    pub fn generate_with<F>(
        &self,
        generator: &str,
        input: &str,
        target_prefix: &str,
        options: &DecodeOptions,
        on_token: F,
    ) -> Result<Vec<Candidate>>
    where
        F: FnMut(usize, Symbol) -> bool,
    {
        options.validate()?;
        let input_ids = self.codec.encode(input)?;
        let prefix_ids = self.codec.encode_unterminated(target_prefix)?;
        let model = self.registry.generator(generator)?;

        let hypotheses =
            DecodeEngine::new(model.as_ref()).generate_with(&input_ids, &prefix_ids, options, on_token)?;
        let candidates = assemble_candidates(&self.codec, &hypotheses)?;
        tracing::debug!(
            generator = %generator,
            returned = candidates.len(),
            best = ?candidates.first().map(|c| c.score),
            "generate finished"
        );
        Ok(candidates)
    }

    /// Fixed-width vector for `text`: the encoder's pooled output when it has
    /// one, otherwise the masked mean of its last hidden state.
    pub fn encode_to_vector(&self, encoder: &str, text: &str) -> Result<Vec<f32>> {
        let model = self.registry.encoder(encoder)?;
        let key = (Arc::as_ptr(&model) as *const () as usize, text.to_string());
        if let Some(cache) = &self.embedding_cache {
            if let Some((_, hit)) = cache.lock().get(&key) {
                return Ok(hit.clone());
            }
        }

        let tokens = self.codec.encode(text)?;
        let pooled = model
            .pooled_output(&tokens)
            .map_err(ProverError::InferenceFailure)?;
        let vector = match pooled {
            Some(v) => v.to_vec(),
            None => {
                let context = model.encode(&tokens).map_err(ProverError::InferenceFailure)?;
                mean_pool_single(context.last_hidden_state(), context.attention_mask())?.to_vec()
            }
        };

        if let Some(cache) = &self.embedding_cache {
            cache.lock().put(key, (Arc::downgrade(&model), vector.clone()));
        }
        Ok(vector)
    }

    /// The `k` premises most similar to `query`, best first.
    pub fn retrieve_premises(&self, query: &[f32], k: usize) -> Result<Vec<PremiseHit>> {
        let store = self.registry.premise_store()?;
        let hits = Retriever::new(store.as_ref(), self.similarity.as_ref()).top_k(ArrayView1::from(query), k)?;
        assemble_premises(&store, &hits)
    }

    /// `retrieve_premises` for several queries, scored in parallel.
    pub fn retrieve_premises_batch(&self, queries: &[Vec<f32>], k: usize) -> Result<Vec<Vec<PremiseHit>>> {
        let store = self.registry.premise_store()?;
        let batches = Retriever::new(store.as_ref(), self.similarity.as_ref()).top_k_batch(queries, k)?;
        batches
            .iter()
            .map(|hits| assemble_premises(&store, hits))
            .collect()
    }
}
