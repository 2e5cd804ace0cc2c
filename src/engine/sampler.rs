//! Token sampling strategies.
//!
//! This module picks the next token from one row of model logits:
//!
//! - **Greedy**: temperature 0 takes the argmax
//! - **Temperature**: Controls randomness (lower = more deterministic)
//! - **Top-k**: Limits choices to k most likely tokens
//! - **Top-p (nucleus)**: Limits choices to tokens covering p probability mass
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Temperature scaling
//! Logits / temperature
//!     │
//!     ▼ Top-k filtering (optional)
//! Keep top k tokens
//!     │
//!     ▼ Softmax
//! Probabilities
//!     │
//!     ▼ Top-p filtering (optional)
//! Cumulative prob ≤ p
//!     │
//!     ▼ Renormalize + Sample
//! Selected token
//! ```

use candle_core::{DType, Tensor, D};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// Token sampler with configurable sampling strategies.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Temperature for scaling logits.
    temperature: f32,
    /// Top-k value (0 = disabled).
    top_k: usize,
    /// Top-p value (1.0 = disabled).
    top_p: f32,
    /// Random number generator.
    rng: StdRng,
}

impl Sampler {
    /// Creates a sampler; seeded when the config carries a seed.
    pub fn new(config: &SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng,
        }
    }

    /// Creates a new sampler with a specific seed for reproducibility.
    pub fn with_seed(config: &SamplingConfig, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            ..Self::new(config)
        }
    }

    /// Whether this sampler always takes the argmax.
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Sample a token from one row of logits of shape `[vocab_size]`.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits = logits.to_dtype(DType::F32)?;
        if logits.rank() != 1 {
            return Err(Error::Model(format!(
                "expected 1D logits, got {}D",
                logits.rank()
            )));
        }

        if self.is_greedy() {
            return Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?);
        }

        let logits = if self.temperature != 1.0 {
            (logits / self.temperature as f64)?
        } else {
            logits
        };

        let mut candidates: Vec<(u32, f32)> = logits
            .to_vec1::<f32>()?
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i as u32, v))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        if self.top_k > 0 && self.top_k < candidates.len() {
            candidates.truncate(self.top_k);
        }

        let kept: Vec<f32> = candidates.iter().map(|&(_, v)| v).collect();
        let kept_len = kept.len();
        let kept = Tensor::from_vec(kept, kept_len, logits.device())?;
        let probs = candle_nn::ops::softmax(&kept, D::Minus1)?.to_vec1::<f32>()?;

        let mut weighted: Vec<(u32, f32)> = candidates
            .iter()
            .zip(probs)
            .map(|(&(token, _), p)| (token, p))
            .collect();

        if self.top_p > 0.0 && self.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            let mut cutoff = weighted.len();
            for (i, &(_, p)) in weighted.iter().enumerate() {
                cumulative += p;
                if cumulative > self.top_p {
                    // Include the token that pushed us over
                    cutoff = i + 1;
                    break;
                }
            }
            weighted.truncate(cutoff);
        }

        let dist = WeightedIndex::new(weighted.iter().map(|&(_, p)| p as f64))
            .map_err(|e| Error::Model(format!("failed to build sampling distribution: {e}")))?;
        Ok(weighted[dist.sample(&mut self.rng)].0)
    }
}
