//! Configuration types for minivllm.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of sequence groups running concurrently.
    pub max_num_seqs: usize,
    /// Block size for PagedAttention (tokens per block).
    pub block_size: usize,
    /// Total number of blocks for KV cache.
    pub num_blocks: usize,
    /// Upper bound on prompt + generated length for any sequence.
    pub max_model_len: usize,
    /// End-of-sequence token; generation stops when it is sampled.
    pub eos_token_id: Option<u32>,
    /// Sleep between ticks when there is no work, in milliseconds.
    pub idle_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 16,
            block_size: 16,
            num_blocks: 1024,
            max_model_len: 2048,
            eos_token_id: None,
            idle_backoff_ms: 10,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_num_seqs == 0 {
            return Err(Error::Config("max_num_seqs must be > 0".to_string()));
        }
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be > 0".to_string()));
        }
        if self.num_blocks == 0 {
            return Err(Error::Config("num_blocks must be > 0".to_string()));
        }
        if self.max_model_len == 0 {
            return Err(Error::Config("max_model_len must be > 0".to_string()));
        }
        Ok(())
    }

    /// Scheduler view of this configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_num_seqs: self.max_num_seqs,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of sequence groups in the running set.
    pub max_num_seqs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_num_seqs: 16 }
    }
}

/// Sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Stop once prompt + output reaches this many tokens.
    pub max_length: Option<usize>,
    /// Token ids that end generation when sampled.
    pub stop_token_ids: Vec<u32>,
    /// Seed for reproducible sampling.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            max_tokens: 256,
            max_length: None,
            stop_token_ids: Vec::new(),
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Greedy decoding config.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }
}
