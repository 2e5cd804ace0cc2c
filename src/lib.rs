//! minivllm: continuous batching over a paged KV cache.
//!
//! This crate implements the serving-side core of a vLLM-style engine:
//! - A fixed pool of KV cache blocks with free list and reference counts
//! - Per-sequence block tables that grow one block at a time
//! - FCFS continuous batching with memory-aware admission and preemption
//! - An engine loop around a black-box batched model

pub mod config;
pub mod error;
pub mod logging;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use config::{EngineConfig, SamplingConfig, SchedulerConfig};
pub use crate::core::sequence::{FinishReason, RequestId, SequenceId, SequenceStatus};
pub use engine::{
    Detokenizer, EngineService, ExecutionBatch, GenerationOutput, GenerationRequest, LLMEngine,
    ModelExecutor, ModelOutput, Sampler, StepOutput,
};
pub use error::{Error, Result};
pub use scheduler::{Scheduler, SchedulerOutputs};
