//! Scripted forward-pass doubles shared by the integration tests.
#![allow(dead_code)]

use anyhow::Result;
use edgeprover::cache::{CrossAttentionCache, LayerKv, SelfAttentionCache};
use edgeprover::codec::{Symbol, END_TOKEN_ID, NUM_SPECIAL_TOKENS, VOCAB_SIZE};
use edgeprover::{
    ColdStep, CrossAttentionContext, CrossAttentionDecoder, DecodeCache, Encoder, Model, ModelLoader, ModelSpec,
    NativeSearch, SearchHypothesis, SearchParams, WarmStep,
};
use ndarray::{Array1, Array3, Array4};
use parking_lot::Mutex;
use std::sync::Arc;

pub const NUM_LAYERS: usize = 2;

/// Content symbols for the bytes of `text`.
pub fn symbols(text: &str) -> Vec<Symbol> {
    text.bytes().map(|b| b as Symbol + NUM_SPECIAL_TOKENS).collect()
}

/// One observed warm step.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmCall {
    /// Id written into the cross-attention cache by the cold step that built it.
    pub cold_id: f32,
    /// Decoder positions held by the self-attention cache handed in.
    pub cached_len: usize,
    pub cache_step: usize,
    pub token: Symbol,
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub encodes: usize,
    pub colds: usize,
    pub warms: Vec<WarmCall>,
}

/// Uniform over `alphabet` for the first `length` output symbols, then END.
pub struct ToyDecoder {
    alphabet: Vec<Symbol>,
    length: usize,
    fail_after_warms: Option<usize>,
    stats: Mutex<Stats>,
}

impl ToyDecoder {
    pub fn new(alphabet: &str, length: usize) -> Self {
        Self {
            alphabet: symbols(alphabet),
            length,
            fail_after_warms: None,
            stats: Mutex::new(Stats::default()),
        }
    }

    /// Never offers END.
    pub fn endless(alphabet: &str) -> Self {
        Self::new(alphabet, usize::MAX)
    }

    /// The warm step after `n` successful ones errors out.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after_warms = Some(n);
        self
    }

    pub fn stats(&self) -> Stats {
        self.stats.lock().clone()
    }

    fn logits(&self, generated: usize) -> Array1<f32> {
        let mut logits = Array1::from_elem(VOCAB_SIZE, f32::NEG_INFINITY);
        if generated < self.length {
            for &s in &self.alphabet {
                logits[s as usize] = 0.0;
            }
        } else {
            logits[END_TOKEN_ID as usize] = 0.0;
        }
        logits
    }

    fn kv(len: usize, fill: f32) -> Vec<LayerKv> {
        (0..NUM_LAYERS)
            .map(|_| LayerKv::new(Array4::from_elem((1, 1, len, 2), fill), Array4::from_elem((1, 1, len, 2), fill)))
            .collect()
    }
}

impl Model for ToyDecoder {}

impl Encoder for ToyDecoder {
    fn encode(&self, tokens: &[Symbol]) -> Result<CrossAttentionContext> {
        anyhow::ensure!(tokens.last() == Some(&END_TOKEN_ID), "input must be END-terminated");
        self.stats.lock().encodes += 1;
        Ok(CrossAttentionContext::new(Array3::from_elem((1, tokens.len(), 2), 0.5)))
    }
}

impl CrossAttentionDecoder for ToyDecoder {
    fn decode_cold(&self, tokens: &[Symbol], context: &CrossAttentionContext) -> Result<ColdStep> {
        let cold_id = {
            let mut stats = self.stats.lock();
            stats.colds += 1;
            stats.colds as f32
        };
        Ok(ColdStep {
            logits: self.logits(tokens.len() - 1),
            self_attention: SelfAttentionCache::new(Self::kv(tokens.len(), 0.0)),
            cross_attention: CrossAttentionCache::new(Self::kv(context.seq_len(), cold_id)),
        })
    }

    fn decode_warm(&self, token: Symbol, cache: &DecodeCache, _context: &CrossAttentionContext) -> Result<WarmStep> {
        let cached_len = cache.self_attention().seq_len();
        {
            let mut stats = self.stats.lock();
            if let Some(limit) = self.fail_after_warms {
                if stats.warms.len() >= limit {
                    anyhow::bail!("device lost");
                }
            }
            stats.warms.push(WarmCall {
                cold_id: cache.cross_attention().layers()[0].key[[0, 0, 0, 0]],
                cached_len,
                cache_step: cache.step(),
                token,
            });
        }
        Ok(WarmStep {
            logits: self.logits(cached_len),
            self_attention: SelfAttentionCache::new(Self::kv(cached_len + 1, 0.0)),
        })
    }
}

/// A backend with its own beam search; the step methods must never be used.
pub struct BeamBackend {
    pub results: Vec<SearchHypothesis>,
    pub seen: Mutex<Vec<SearchParams>>,
}

impl BeamBackend {
    pub fn new(results: Vec<SearchHypothesis>) -> Self {
        Self {
            results,
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl Model for BeamBackend {}

impl Encoder for BeamBackend {
    fn encode(&self, _tokens: &[Symbol]) -> Result<CrossAttentionContext> {
        anyhow::bail!("beam backend encodes internally")
    }
}

impl CrossAttentionDecoder for BeamBackend {
    fn decode_cold(&self, _tokens: &[Symbol], _context: &CrossAttentionContext) -> Result<ColdStep> {
        anyhow::bail!("beam backend has no step interface")
    }

    fn decode_warm(&self, _token: Symbol, _cache: &DecodeCache, _context: &CrossAttentionContext) -> Result<WarmStep> {
        anyhow::bail!("beam backend has no step interface")
    }

    fn native_search(&self) -> Option<&dyn NativeSearch> {
        Some(self)
    }
}

impl NativeSearch for BeamBackend {
    fn search(&self, _input: &[Symbol], target_prefix: &[Symbol], params: &SearchParams) -> Result<Vec<SearchHypothesis>> {
        self.seen.lock().push(params.clone());
        Ok(self
            .results
            .iter()
            .map(|h| {
                let mut tokens = target_prefix.to_vec();
                tokens.extend_from_slice(&h.tokens);
                SearchHypothesis {
                    tokens,
                    log_prob: h.log_prob,
                }
            })
            .collect())
    }
}

/// Encoder whose hidden state is the one-hot of the first input byte, so
/// `encode_to_vector` output is predictable.
pub struct OneHotEncoder {
    pub dim: usize,
}

impl Model for OneHotEncoder {}

impl Encoder for OneHotEncoder {
    fn encode(&self, tokens: &[Symbol]) -> Result<CrossAttentionContext> {
        let mut hidden = Array3::zeros((1, 1, self.dim));
        if let Some(&first) = tokens.first() {
            hidden[[0, 0, first as usize % self.dim]] = 1.0;
        }
        Ok(CrossAttentionContext::new(hidden))
    }
}

/// Builds toy models by name: `toy` generators and `onehot` encoders.
pub struct ToyLoader;

impl ModelLoader for ToyLoader {
    fn load_generator(&self, _spec: &ModelSpec) -> Result<Arc<dyn CrossAttentionDecoder>> {
        Ok(Arc::new(ToyDecoder::new("abcde", 3)))
    }

    fn load_encoder(&self, _spec: &ModelSpec) -> Result<Arc<dyn Encoder>> {
        Ok(Arc::new(OneHotEncoder { dim: 4 }))
    }
}
