use anyhow::Result;
use edgeprover::cache::{CrossAttentionCache, LayerKv, SelfAttentionCache};
use edgeprover::codec::{Symbol, DECODER_START_TOKEN_ID, END_TOKEN_ID, NUM_SPECIAL_TOKENS, VOCAB_SIZE};
use edgeprover::{
    ColdStep, CrossAttentionContext, CrossAttentionDecoder, DecodeCache, DecodeOptions, Encoder, Model, Prover,
    Registry, WarmStep,
};
use ndarray::{Array1, Array2, Array3, Array4};
use std::sync::Arc;

/// Byte bigram model over a handful of tactics. Ignores the goal entirely.
struct BigramTactics {
    /// `counts[[prev, next]]`
    counts: Array2<f32>,
}

impl BigramTactics {
    fn new(corpus: &[&str]) -> Self {
        let mut counts = Array2::zeros((VOCAB_SIZE, VOCAB_SIZE));
        for tactic in corpus {
            let mut prev = DECODER_START_TOKEN_ID;
            for b in tactic.bytes() {
                let next = b as Symbol + NUM_SPECIAL_TOKENS;
                counts[[prev as usize, next as usize]] += 1.0;
                prev = next;
            }
            counts[[prev as usize, END_TOKEN_ID as usize]] += 1.0;
        }
        Self { counts }
    }

    fn logits(&self, prev: Symbol) -> Array1<f32> {
        self.counts
            .row(prev as usize)
            .mapv(|c| if c > 0.0 { c.ln() } else { f32::NEG_INFINITY })
    }

    fn kv(len: usize) -> Vec<LayerKv> {
        vec![LayerKv::new(Array4::zeros((1, 1, len, 1)), Array4::zeros((1, 1, len, 1)))]
    }
}

impl Model for BigramTactics {}

impl Encoder for BigramTactics {
    fn encode(&self, tokens: &[Symbol]) -> Result<CrossAttentionContext> {
        Ok(CrossAttentionContext::new(Array3::zeros((1, tokens.len(), 1))))
    }
}

impl CrossAttentionDecoder for BigramTactics {
    fn decode_cold(&self, tokens: &[Symbol], context: &CrossAttentionContext) -> Result<ColdStep> {
        let prev = tokens.last().copied().unwrap_or(DECODER_START_TOKEN_ID);
        Ok(ColdStep {
            logits: self.logits(prev),
            self_attention: SelfAttentionCache::new(Self::kv(tokens.len())),
            cross_attention: CrossAttentionCache::new(Self::kv(context.seq_len())),
        })
    }

    fn decode_warm(&self, token: Symbol, cache: &DecodeCache, _context: &CrossAttentionContext) -> Result<WarmStep> {
        Ok(WarmStep {
            logits: self.logits(token),
            self_attention: SelfAttentionCache::new(Self::kv(cache.self_attention().seq_len() + 1)),
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let tactics = [
        "rfl",
        "simp",
        "simp [Nat.add_comm]",
        "intro h",
        "intro n",
        "exact h",
        "omega",
        "linarith",
        "induction n with n ih",
        "norm_num",
    ];
    let registry = Arc::new(Registry::new());
    registry.insert_generator("bigram", Arc::new(BigramTactics::new(&tactics)));
    let prover = Prover::new(registry);

    let goal = "n : ℕ\n⊢ n + 0 = n";
    let options = DecodeOptions {
        num_return_sequences: 5,
        max_length: 48,
        temperature: 0.8,
        seed: Some(2024),
        ..Default::default()
    };

    println!("Goal:\n{}\n", goal);
    for candidate in prover.generate("bigram", goal, "", &options)? {
        println!("{:>8.5}  {}", candidate.score, candidate.text);
    }

    println!("\nWith prefix \"intro\":");
    for candidate in prover.generate("bigram", goal, "intro", &options)? {
        println!("{:>8.5}  {}", candidate.score, candidate.text);
    }
    Ok(())
}
