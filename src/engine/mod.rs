//! Inference engine.
//!
//! This module contains:
//! - LLMEngine for orchestrating generation ticks
//! - EngineService for driving the engine from async code
//! - ModelExecutor and Detokenizer seams to the model and tokenizer
//! - Sampler for token sampling

pub mod executor;
pub mod llm;
pub mod sampler;
pub mod service;

pub use executor::{Detokenizer, ExecutionBatch, ModelExecutor, ModelOutput, SequenceInput};
pub use llm::{GenerationOutput, GenerationRequest, LLMEngine, StepOutput};
pub use sampler::Sampler;
pub use service::EngineService;
