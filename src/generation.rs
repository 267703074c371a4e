//! Incremental encoder-decoder generation.
//!
//! Each hypothesis walks the state machine
//!
//! ```text
//! Uninitialized -> ColdStep -> Sampling -> WarmStep -> Sampling -> ... -> Terminal
//! ```
//!
//! A failed forward pass or draw moves the hypothesis to `Failed`, which no
//! later `advance` leaves.
//!
//! The encoder runs once per request; its output is only borrowed by the
//! steps. Caches are values moved from state to state and never shared
//! between hypotheses.

use ndarray::Array1;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::cache::DecodeCache;
use crate::codec::{ByteCodec, Symbol, DECODER_START_TOKEN_ID, END_TOKEN_ID};
use crate::error::{ProverError, Result};
use crate::sampling::Sampler;
use crate::traits::{CrossAttentionContext, CrossAttentionDecoder, SearchHypothesis, SearchParams};

/// Samples drawn per requested sequence before duplicates are accepted.
const SAMPLING_ATTEMPTS_PER_SEQUENCE: usize = 8;

/// `num_return_sequences` is caller-controlled; larger requests grow on demand.
const MAX_PREALLOCATED_HYPOTHESES: usize = 64;

/// Request parameters for `generate`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    pub num_return_sequences: usize,
    /// Beam width for native search, otherwise the sampling width.
    pub beam_size: usize,
    /// Output length (target prefix included) before END may be sampled.
    pub min_length: usize,
    /// Hard cap on output length.
    pub max_length: usize,
    /// Only consulted by native beam search.
    pub length_penalty: f64,
    pub patience: f64,
    pub temperature: f64,
    /// `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            num_return_sequences: 1,
            beam_size: 1,
            min_length: 1,
            max_length: 256,
            length_penalty: 0.0,
            patience: 1.0,
            temperature: 1.0,
            seed: None,
        }
    }
}

impl DecodeOptions {
    pub fn validate(&self) -> Result<()> {
        if self.num_return_sequences == 0 {
            return Err(ProverError::invalid("num_return_sequences must be positive."));
        }
        if self.beam_size == 0 {
            return Err(ProverError::invalid("beam_size must be positive."));
        }
        if self.max_length == 0 || self.min_length > self.max_length {
            return Err(ProverError::invalid("Invalid min_length or max_length."));
        }
        if !self.length_penalty.is_finite() {
            return Err(ProverError::invalid("length_penalty must be finite."));
        }
        if !(self.patience >= 1.0) || !self.patience.is_finite() {
            return Err(ProverError::invalid("patience must be at least 1.0."));
        }
        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(ProverError::invalid("temperature must be positive."));
        }
        Ok(())
    }

    fn search_params(&self) -> SearchParams {
        SearchParams {
            num_hypotheses: self.num_return_sequences,
            beam_size: self.beam_size,
            patience: self.patience,
            length_penalty: self.length_penalty,
            min_length: self.min_length,
            max_length: self.max_length,
            temperature: self.temperature,
            disable_unk: true,
        }
    }
}

/// Why a hypothesis stopped growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    EndSampled,
    MaxLengthReached,
}

/// One finished output sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    /// Output symbols: target prefix first, END excluded.
    pub tokens: Vec<Symbol>,
    /// Cumulative log-probability of the sampled symbols (END included).
    pub log_prob: f64,
    pub termination: Termination,
}

impl Hypothesis {
    /// `exp(log_prob)` in `[0, 1]`.
    pub fn score(&self) -> f64 {
        self.log_prob.exp().clamp(0.0, 1.0)
    }
}

/// Where a hypothesis is in its decode.
#[derive(Debug)]
pub enum DecodeState {
    Uninitialized,
    ColdStep,
    Sampling {
        logits: Array1<f32>,
        cache: DecodeCache,
    },
    WarmStep {
        token: Symbol,
        cache: DecodeCache,
    },
    Terminal(Termination),
    /// A transition returned an error. The partial output is kept for
    /// inspection but cannot be continued.
    Failed,
}

impl DecodeState {
    /// True once `advance` can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DecodeState::Terminal(_) | DecodeState::Failed)
    }
}

/// Drives one hypothesis. Callers may stop calling `advance` at any point;
/// nothing outside the decoder refers to its cache.
pub struct HypothesisDecoder<'a, M: CrossAttentionDecoder + ?Sized> {
    model: &'a M,
    context: &'a CrossAttentionContext,
    options: &'a DecodeOptions,
    /// Start symbol followed by the forced prefix.
    decoder_input: Vec<Symbol>,
    tokens: Vec<Symbol>,
    log_prob: f64,
    forward_steps: usize,
    state: DecodeState,
}

impl<'a, M: CrossAttentionDecoder + ?Sized> HypothesisDecoder<'a, M> {
    pub fn new(
        model: &'a M,
        context: &'a CrossAttentionContext,
        target_prefix: &[Symbol],
        options: &'a DecodeOptions,
    ) -> Self {
        let mut decoder_input = Vec::with_capacity(target_prefix.len() + 1);
        decoder_input.push(DECODER_START_TOKEN_ID);
        decoder_input.extend_from_slice(target_prefix);
        Self {
            model,
            context,
            options,
            decoder_input,
            tokens: target_prefix.to_vec(),
            log_prob: 0.0,
            forward_steps: 0,
            state: DecodeState::Uninitialized,
        }
    }

    pub fn state(&self) -> &DecodeState {
        &self.state
    }

    /// Output symbols so far.
    pub fn tokens(&self) -> &[Symbol] {
        &self.tokens
    }

    /// Forward passes (cold plus warm) run so far.
    pub fn forward_steps(&self) -> usize {
        self.forward_steps
    }

    /// Performs one transition. Returns the symbol appended by it, if any.
    ///
    /// On error the decoder is left in `DecodeState::Failed` and every later
    /// call fails too.
    pub fn advance<R: Rng>(&mut self, sampler: &mut Sampler<R>) -> Result<Option<Symbol>> {
        let state = std::mem::replace(&mut self.state, DecodeState::Failed);
        let (next, appended) = self.transition(state, sampler)?;
        self.state = next;
        Ok(appended)
    }

    fn transition<R: Rng>(
        &mut self,
        state: DecodeState,
        sampler: &mut Sampler<R>,
    ) -> Result<(DecodeState, Option<Symbol>)> {
        match state {
            DecodeState::Uninitialized => Ok((DecodeState::ColdStep, None)),

            DecodeState::ColdStep => {
                let step = self
                    .model
                    .decode_cold(&self.decoder_input, self.context)
                    .map_err(ProverError::InferenceFailure)?;
                self.forward_steps += 1;
                let cache = DecodeCache::from_cold(step.self_attention, step.cross_attention)?;
                Ok((
                    DecodeState::Sampling {
                        logits: step.logits,
                        cache,
                    },
                    None,
                ))
            }

            DecodeState::Sampling { logits, cache } => {
                let allow_end = self.tokens.len() >= self.options.min_length;
                let drawn = sampler.sample_with(&logits, self.options.temperature, allow_end)?;
                self.log_prob += drawn.log_prob;

                if drawn.symbol == END_TOKEN_ID {
                    return Ok((DecodeState::Terminal(Termination::EndSampled), None));
                }
                self.tokens.push(drawn.symbol);
                if self.tokens.len() >= self.options.max_length {
                    return Ok((
                        DecodeState::Terminal(Termination::MaxLengthReached),
                        Some(drawn.symbol),
                    ));
                }
                Ok((
                    DecodeState::WarmStep {
                        token: drawn.symbol,
                        cache,
                    },
                    Some(drawn.symbol),
                ))
            }

            DecodeState::WarmStep { token, cache } => {
                let step = self
                    .model
                    .decode_warm(token, &cache, self.context)
                    .map_err(ProverError::InferenceFailure)?;
                self.forward_steps += 1;
                let cache = cache.advance(step.self_attention)?;
                Ok((
                    DecodeState::Sampling {
                        logits: step.logits,
                        cache,
                    },
                    None,
                ))
            }

            terminal @ DecodeState::Terminal(_) => Ok((terminal, None)),

            DecodeState::Failed => Err(ProverError::InferenceFailure(anyhow::anyhow!(
                "hypothesis decoder already failed after {} forward steps",
                self.forward_steps
            ))),
        }
    }

    /// The finished hypothesis. `None` unless a `Terminal` state was reached.
    pub fn finish(self) -> Option<Hypothesis> {
        match self.state {
            DecodeState::Terminal(termination) => Some(Hypothesis {
                tokens: self.tokens,
                log_prob: self.log_prob.min(0.0),
                termination,
            }),
            _ => None,
        }
    }
}

/// Turns an encoded input into `num_return_sequences` scored hypotheses.
pub struct DecodeEngine<'m, M: CrossAttentionDecoder + ?Sized> {
    model: &'m M,
}

impl<'m, M: CrossAttentionDecoder + ?Sized> DecodeEngine<'m, M> {
    pub fn new(model: &'m M) -> Self {
        Self { model }
    }

    pub fn generate(
        &self,
        input: &[Symbol],
        target_prefix: &[Symbol],
        options: &DecodeOptions,
    ) -> Result<Vec<Hypothesis>> {
        self.generate_with(input, target_prefix, options, |_, _| true)
    }

    /// Like `generate`, calling `on_token(sample_index, symbol)` after every
    /// appended symbol; returning `false` abandons the decode.
    pub fn generate_with<F>(
        &self,
        input: &[Symbol],
        target_prefix: &[Symbol],
        options: &DecodeOptions,
        mut on_token: F,
    ) -> Result<Vec<Hypothesis>>
    where
        F: FnMut(usize, Symbol) -> bool,
    {
        validate_request(input, target_prefix, options)?;

        if let Some(search) = self.model.native_search() {
            tracing::debug!(beam_size = options.beam_size, "using native beam search");
            let found = search
                .search(input, target_prefix, &options.search_params())
                .map_err(ProverError::InferenceFailure)?;
            return collect_native(found, options);
        }
        if options.beam_size > 1 {
            tracing::debug!(
                beam_size = options.beam_size,
                "backend has no beam search, sampling each sequence independently"
            );
        }

        let context = self
            .model
            .encode(input)
            .map_err(ProverError::InferenceFailure)?;
        let mut sampler = match options.seed {
            Some(seed) => Sampler::seeded(seed),
            None => Sampler::from_entropy(),
        };

        let wanted = options.num_return_sequences;
        let budget = wanted.saturating_mul(SAMPLING_ATTEMPTS_PER_SEQUENCE);
        let mut kept: Vec<Hypothesis> = Vec::with_capacity(wanted.min(MAX_PREALLOCATED_HYPOTHESES));
        let mut spare: Vec<Hypothesis> = Vec::new();
        let mut seen: HashSet<Vec<Symbol>> = HashSet::new();

        let mut attempt = 0;
        while kept.len() < wanted && attempt < budget {
            let hypothesis =
                self.decode_one(&context, target_prefix, options, &mut sampler, attempt, &mut on_token)?;
            attempt += 1;
            if !hypothesis.tokens.is_empty() && seen.insert(hypothesis.tokens.clone()) {
                kept.push(hypothesis);
            } else {
                spare.push(hypothesis);
            }
        }
        if kept.len() < wanted {
            tracing::warn!(
                distinct = kept.len(),
                wanted,
                attempts = attempt,
                "not enough distinct candidates, accepting repeats"
            );
            let missing = wanted - kept.len();
            kept.extend(spare.into_iter().take(missing));
        }

        kept.sort_by(|a, b| b.score().total_cmp(&a.score()));
        Ok(kept)
    }

    fn decode_one<R: Rng, F: FnMut(usize, Symbol) -> bool>(
        &self,
        context: &CrossAttentionContext,
        target_prefix: &[Symbol],
        options: &DecodeOptions,
        sampler: &mut Sampler<R>,
        index: usize,
        on_token: &mut F,
    ) -> Result<Hypothesis> {
        let mut decoder = HypothesisDecoder::new(self.model, context, target_prefix, options);
        while !decoder.state().is_terminal() {
            if let Some(symbol) = decoder.advance(sampler)? {
                if !on_token(index, symbol) {
                    return Err(ProverError::Cancelled {
                        step: decoder.forward_steps(),
                    });
                }
            }
        }

        let steps = decoder.forward_steps();
        let hypothesis = decoder.finish().ok_or_else(|| {
            ProverError::InferenceFailure(anyhow::anyhow!("decoder stopped before a terminal state"))
        })?;
        tracing::debug!(
            index,
            steps,
            len = hypothesis.tokens.len(),
            termination = ?hypothesis.termination,
            "hypothesis finished"
        );
        Ok(hypothesis)
    }
}

/// Fails fast, before any forward pass.
fn validate_request(input: &[Symbol], target_prefix: &[Symbol], options: &DecodeOptions) -> Result<()> {
    options.validate()?;
    if input.is_empty() {
        return Err(ProverError::invalid("input sequence is empty."));
    }
    if let Some(position) = target_prefix.iter().position(|&s| !ByteCodec::is_content(s)) {
        return Err(ProverError::MalformedSequence {
            symbol: target_prefix[position],
            position,
        });
    }
    if target_prefix.len() >= options.max_length {
        return Err(ProverError::invalid(format!(
            "target prefix of length {} leaves no room under max_length {}.",
            target_prefix.len(),
            options.max_length
        )));
    }
    Ok(())
}

fn collect_native(found: Vec<SearchHypothesis>, options: &DecodeOptions) -> Result<Vec<Hypothesis>> {
    if found.len() != options.num_return_sequences {
        return Err(ProverError::InferenceFailure(anyhow::anyhow!(
            "beam search returned {} hypotheses, expected {}",
            found.len(),
            options.num_return_sequences
        )));
    }

    let mut hypotheses = Vec::with_capacity(found.len());
    for mut h in found {
        if !(h.log_prob <= 0.0) {
            return Err(ProverError::InferenceFailure(anyhow::anyhow!(
                "beam search returned log-probability {}, score would leave [0, 1]",
                h.log_prob
            )));
        }
        if h.tokens.last() == Some(&END_TOKEN_ID) {
            h.tokens.pop();
        }
        if let Some(position) = h.tokens.iter().position(|&s| !ByteCodec::is_content(s)) {
            return Err(ProverError::InferenceFailure(anyhow::anyhow!(
                "beam search returned non-content symbol {} at position {}",
                h.tokens[position],
                position
            )));
        }
        // Backends may strip END, so only the length tells the two apart.
        let termination = if h.tokens.len() >= options.max_length {
            Termination::MaxLengthReached
        } else {
            Termination::EndSampled
        };
        hypotheses.push(Hypothesis {
            tokens: h.tokens,
            log_prob: h.log_prob,
            termination,
        });
    }
    hypotheses.sort_by(|a, b| b.score().total_cmp(&a.score()));
    Ok(hypotheses)
}
