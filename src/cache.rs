//! Per-hypothesis decoder cache.
//!
//! A cold step yields both halves of the cache; every warm step yields only a
//! fresh self-attention half. `DecodeCache` is an immutable value: advancing it
//! builds a new cache around the new self-attention state and the *same*
//! cross-attention allocation, so a step that still holds the previous cache
//! never observes a mutation.

use ndarray::Array4;
use std::sync::Arc;

use crate::error::{ProverError, Result};

/// Key/value tensors of one attention block.
/// Shape: `(batch, num_heads, seq_len, head_dim)`.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerKv {
    pub key: Array4<f32>,
    pub value: Array4<f32>,
}

impl LayerKv {
    pub fn new(key: Array4<f32>, value: Array4<f32>) -> Self {
        Self { key, value }
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.key.dim().2
    }
}

/// Decoder self-attention state, one entry per layer. Replaced wholesale each step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelfAttentionCache {
    layers: Vec<LayerKv>,
}

impl SelfAttentionCache {
    pub fn new(layers: Vec<LayerKv>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[LayerKv] {
        &self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Decoder positions covered so far (0 for an empty cache).
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(LayerKv::seq_len).unwrap_or(0)
    }
}

/// Projections of the encoder output, one entry per layer. Written once by the cold step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CrossAttentionCache {
    layers: Vec<LayerKv>,
}

impl CrossAttentionCache {
    pub fn new(layers: Vec<LayerKv>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[LayerKv] {
        &self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

/// The cache threaded through one hypothesis's decode steps.
#[derive(Debug, Clone)]
pub struct DecodeCache {
    self_attention: Arc<SelfAttentionCache>,
    cross_attention: Arc<CrossAttentionCache>,
    /// Number of decode steps that have produced this cache (1 after the cold step).
    step: usize,
}

impl DecodeCache {
    /// Builds the cache produced by the cold step.
    pub(crate) fn from_cold(
        self_attention: SelfAttentionCache,
        cross_attention: CrossAttentionCache,
    ) -> Result<Self> {
        if self_attention.num_layers() != cross_attention.num_layers() {
            return Err(ProverError::InferenceFailure(anyhow::anyhow!(
                "cold step returned {} self-attention layers but {} cross-attention layers",
                self_attention.num_layers(),
                cross_attention.num_layers()
            )));
        }
        Ok(Self {
            self_attention: Arc::new(self_attention),
            cross_attention: Arc::new(cross_attention),
            step: 1,
        })
    }

    /// Returns the cache for the next step: `next` replaces the self-attention
    /// half, the cross-attention half is carried over untouched.
    pub(crate) fn advance(&self, next: SelfAttentionCache) -> Result<Self> {
        if next.num_layers() != self.self_attention.num_layers() {
            return Err(ProverError::InferenceFailure(anyhow::anyhow!(
                "warm step returned {} self-attention layers, expected {}",
                next.num_layers(),
                self.self_attention.num_layers()
            )));
        }
        Ok(Self {
            self_attention: Arc::new(next),
            cross_attention: Arc::clone(&self.cross_attention),
            step: self.step + 1,
        })
    }

    pub fn self_attention(&self) -> &SelfAttentionCache {
        &self.self_attention
    }

    pub fn cross_attention(&self) -> &CrossAttentionCache {
        &self.cross_attention
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// True when both caches reference the same cross-attention allocation.
    pub fn shares_cross_attention(&self, other: &DecodeCache) -> bool {
        Arc::ptr_eq(&self.cross_attention, &other.cross_attention)
    }
}
