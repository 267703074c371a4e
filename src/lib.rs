//! Tactic generation and premise retrieval on top of an opaque forward pass.
//!
//! Provides a byte-level codec, an incremental encoder-decoder sampling loop
//! with a per-hypothesis decode cache, and top-k premise retrieval over a
//! frozen embedding matrix. Model weights and kernels are supplied by the
//! caller through the traits in [`traits`].

pub mod assembler;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod generation;
pub mod pooling;
pub mod registry;
pub mod retrieval;
pub mod sampling;
pub mod service;
pub mod store;
pub mod traits;

// Re-exports
pub use assembler::{Candidate, PremiseHit};
pub use cache::{CrossAttentionCache, DecodeCache, LayerKv, SelfAttentionCache};
pub use codec::{ByteCodec, Symbol};
pub use config::ServingConfig;
pub use error::{ProverError, Result};
pub use generation::{DecodeEngine, DecodeOptions, DecodeState, Hypothesis, HypothesisDecoder, Termination};
pub use registry::{ModelLoader, ModelSpec, Registry};
pub use retrieval::{Retriever, ScoredIndex};
pub use sampling::{Sampled, Sampler};
pub use service::Prover;
pub use store::{EmbeddingStore, PremiseRecord};
pub use traits::{
    ColdStep, ComputeType, CrossAttentionContext, CrossAttentionDecoder, Device, Encoder, InnerProduct, Model,
    NativeSearch, SearchHypothesis, SearchParams, Similarity, WarmStep,
};
