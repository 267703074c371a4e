//! Forward-pass seams.
//!
//! The numerical work (weights, graph execution, kernels) lives behind these
//! traits. The design principles are:
//! 1.  **Stateless Models, Value Caches**: models are immutable (`&self`) during
//!     inference. Everything a decode step produces is handed back as a value
//!     (`ColdStep`, `WarmStep`) and threaded by the caller as a `DecodeCache`.
//! 2.  **Composition over Implementation**: an encoder-decoder model implements
//!     `Encoder` and `CrossAttentionDecoder`; a retrieval encoder only `Encoder`.
//! 3.  **Opaque Failures**: implementations report errors through
//!     `anyhow::Result`; the core surfaces them as `InferenceFailure`.

use anyhow::Result;
use ndarray::{Array1, Array2, Array3, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cache::{CrossAttentionCache, DecodeCache, SelfAttentionCache};
use crate::codec::Symbol;

/// Supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    /// CUDA when available, CPU otherwise.
    Auto,
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda),
            "auto" => Ok(Device::Auto),
            other => anyhow::bail!("unknown device `{}`", other),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Auto => "auto",
        };
        f.write_str(s)
    }
}

/// Numeric precision requested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeType {
    #[default]
    Default,
    Float32,
    Float16,
    Int8,
}

impl FromStr for ComputeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(ComputeType::Default),
            "float32" => Ok(ComputeType::Float32),
            "float16" => Ok(ComputeType::Float16),
            "int8" => Ok(ComputeType::Int8),
            other => anyhow::bail!("unknown compute type `{}`", other),
        }
    }
}

/// A base marker trait for all models.
///
/// It requires `Send + Sync` so a loaded handle can serve concurrent requests.
pub trait Model: Send + Sync {
    /// Returns the computation device this model instance is configured to use.
    fn device(&self) -> Device {
        Device::Cpu
    }
}

/// Encoder output for one input sequence. Computed once per request and only
/// ever borrowed afterwards.
#[derive(Debug)]
pub struct CrossAttentionContext {
    /// Shape: `(1, sequence_length, hidden_size)`.
    last_hidden_state: Array3<f32>,
    /// Shape: `(1, sequence_length)`; 1.0 for real positions.
    attention_mask: Array2<f32>,
}

impl CrossAttentionContext {
    /// Context over a fully valid (unpadded) input.
    pub fn new(last_hidden_state: Array3<f32>) -> Self {
        let (batch, seq_len, _) = last_hidden_state.dim();
        Self {
            last_hidden_state,
            attention_mask: Array2::ones((batch, seq_len)),
        }
    }

    pub fn with_mask(last_hidden_state: Array3<f32>, attention_mask: Array2<f32>) -> Self {
        Self {
            last_hidden_state,
            attention_mask,
        }
    }

    pub fn last_hidden_state(&self) -> &Array3<f32> {
        &self.last_hidden_state
    }

    pub fn attention_mask(&self) -> &Array2<f32> {
        &self.attention_mask
    }

    pub fn seq_len(&self) -> usize {
        self.last_hidden_state.dim().1
    }

    pub fn hidden_size(&self) -> usize {
        self.last_hidden_state.dim().2
    }
}

/// Output of the first decode step.
#[derive(Debug)]
pub struct ColdStep {
    /// Next-symbol logits for the last input position. Length `VOCAB_SIZE`.
    pub logits: Array1<f32>,
    pub self_attention: SelfAttentionCache,
    pub cross_attention: CrossAttentionCache,
}

/// Output of any later decode step.
#[derive(Debug)]
pub struct WarmStep {
    pub logits: Array1<f32>,
    pub self_attention: SelfAttentionCache,
}

/// An encoder (e.g. the retrieval encoder, or the first half of a seq2seq model).
pub trait Encoder: Model {
    /// Runs the encoder over `tokens` (END-terminated).
    fn encode(&self, tokens: &[Symbol]) -> Result<CrossAttentionContext>;

    /// A dedicated pooled sentence vector, if the model exposes one.
    fn pooled_output(&self, _tokens: &[Symbol]) -> Result<Option<Array1<f32>>> {
        Ok(None)
    }
}

/// A decoder that attends to its own previous symbols and to an encoder output.
pub trait CrossAttentionDecoder: Encoder {
    /// First step: no prior cache. `tokens` is the decoder start symbol followed
    /// by any forced target prefix.
    fn decode_cold(&self, tokens: &[Symbol], context: &CrossAttentionContext) -> Result<ColdStep>;

    /// Later steps: one new symbol plus the cache from the previous step.
    fn decode_warm(
        &self,
        token: Symbol,
        cache: &DecodeCache,
        context: &CrossAttentionContext,
    ) -> Result<WarmStep>;

    /// Native multi-hypothesis beam search, when the backend has one.
    fn native_search(&self) -> Option<&dyn NativeSearch> {
        None
    }
}

/// Parameters handed straight to a backend's beam search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub num_hypotheses: usize,
    pub beam_size: usize,
    pub patience: f64,
    pub length_penalty: f64,
    pub min_length: usize,
    pub max_length: usize,
    pub temperature: f64,
    /// UNK is never a valid output.
    pub disable_unk: bool,
}

/// One hypothesis returned by a native search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHypothesis {
    pub tokens: Vec<Symbol>,
    /// Cumulative log-probability.
    pub log_prob: f64,
}

pub trait NativeSearch: Send + Sync {
    fn search(
        &self,
        input: &[Symbol],
        target_prefix: &[Symbol],
        params: &SearchParams,
    ) -> Result<Vec<SearchHypothesis>>;
}

/// Scores every row of an `N x D` matrix against a length-`D` query.
pub trait Similarity: Send + Sync {
    fn similarity(&self, matrix: &Array2<f32>, query: ArrayView1<'_, f32>) -> Result<Array1<f32>>;
}

/// Raw inner product (no normalisation).
#[derive(Debug, Clone, Copy, Default)]
pub struct InnerProduct;

impl Similarity for InnerProduct {
    fn similarity(&self, matrix: &Array2<f32>, query: ArrayView1<'_, f32>) -> Result<Array1<f32>> {
        anyhow::ensure!(
            matrix.ncols() == query.len(),
            "query has {} dimensions, matrix has {} columns",
            query.len(),
            matrix.ncols()
        );
        Ok(matrix.dot(&query))
    }
}
