//! Multinomial sampling over a temperature-scaled softmax.

use ndarray::Array1;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::codec::{Symbol, END_TOKEN_ID, NUM_SPECIAL_TOKENS, NUM_VALID_TOKENS, PAD_TOKEN_ID, UNK_TOKEN_ID};
use crate::error::{ProverError, Result};

/// Tolerance for the mass and normalisation checks.
pub const PROB_EPSILON: f64 = 1e-5;

/// First id past the content range; everything from here on is padding in the logits row.
const VALID_LIMIT: usize = (NUM_SPECIAL_TOKENS + NUM_VALID_TOKENS) as usize;

/// A drawn symbol and its probability under the distribution it was drawn from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampled {
    pub symbol: Symbol,
    /// Natural log of the symbol's probability; always `<= 0`.
    pub log_prob: f64,
}

/// Token sampler. One per request so the random stream is never shared.
pub struct Sampler<R: Rng = StdRng> {
    rng: R,
}

impl Sampler<StdRng> {
    /// Seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic stream for reproducible decoding.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl<R: Rng> Sampler<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    /// Draws one symbol from `logits` (END allowed).
    pub fn sample(&mut self, logits: &Array1<f32>, temperature: f64) -> Result<Sampled> {
        self.sample_with(logits, temperature, true)
    }

    /// Draws one symbol; with `allow_end == false` END gets no mass and the rest is renormalised.
    pub fn sample_with(
        &mut self,
        logits: &Array1<f32>,
        temperature: f64,
        allow_end: bool,
    ) -> Result<Sampled> {
        let probs = Self::distribution(logits, temperature, allow_end)?;
        let index = WeightedIndex::new(&probs)
            .map_err(|e| {
                ProverError::DegenerateDistribution {
                    message: format!("cannot build categorical distribution: {}", e),
                }
                .invariant()
            })?
            .sample(&mut self.rng);

        let p = probs[index];
        debug_assert!(p > 0.0 && is_sampleable(index as Symbol, allow_end));
        Ok(Sampled {
            symbol: index as Symbol,
            log_prob: p.ln().min(0.0),
        })
    }

    /// The normalised distribution `sample_with` draws from.
    ///
    /// PAD, UNK and ids past the content range get zero mass, as does END when
    /// `allow_end` is false. The maximum surviving logit is subtracted before
    /// exponentiating, so tiny temperatures concentrate on the argmax instead
    /// of overflowing.
    pub fn distribution(logits: &Array1<f32>, temperature: f64, allow_end: bool) -> Result<Vec<f64>> {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(ProverError::invalid("temperature must be positive."));
        }

        let mut max_logit = f64::NEG_INFINITY;
        for (i, &logit) in logits.iter().enumerate() {
            if !is_sampleable(i as Symbol, allow_end) {
                continue;
            }
            let v = logit as f64;
            if v.is_nan() || v == f64::INFINITY {
                return Err(ProverError::DegenerateDistribution {
                    message: format!("logit {} for symbol {}", v, i),
                }
                .invariant());
            }
            max_logit = max_logit.max(v);
        }

        let mut probs: Vec<f64> = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| {
                if is_sampleable(i as Symbol, allow_end) && max_logit.is_finite() {
                    ((logit as f64 - max_logit) / temperature).exp()
                } else {
                    0.0
                }
            })
            .collect();

        let mass: f64 = probs.iter().sum();
        if !(mass > PROB_EPSILON) {
            return Err(ProverError::DegenerateDistribution {
                message: format!("total probability mass {} is below {}", mass, PROB_EPSILON),
            }
            .invariant());
        }
        for p in probs.iter_mut() {
            *p /= mass;
        }

        let total: f64 = probs.iter().sum();
        if (total - 1.0).abs() >= PROB_EPSILON {
            return Err(ProverError::DegenerateDistribution {
                message: format!("probabilities sum to {} after normalisation", total),
            }
            .invariant());
        }
        Ok(probs)
    }
}

/// Symbols a decoder may legitimately emit.
fn is_sampleable(symbol: Symbol, allow_end: bool) -> bool {
    match symbol {
        PAD_TOKEN_ID | UNK_TOKEN_ID => false,
        END_TOKEN_ID => allow_end,
        s => (s as usize) < VALID_LIMIT,
    }
}
