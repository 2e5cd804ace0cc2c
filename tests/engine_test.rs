//! Integration tests for LLMEngine.

use std::sync::Mutex;

use candle_core::{Device, Tensor};
use minivllm::engine::{Detokenizer, ExecutionBatch, ModelExecutor, ModelOutput};
use minivllm::{
    EngineConfig, Error, FinishReason, GenerationRequest, LLMEngine, RequestId, Result,
};

/// Emits `last + 1` for every sequence and records what it was given.
#[derive(Default)]
struct CountingModel {
    /// (batch size, blocks held by the first sequence) per call.
    calls: Mutex<Vec<(usize, usize)>>,
}

impl CountingModel {
    fn calls(&self) -> Vec<(usize, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ModelExecutor for CountingModel {
    fn execute(&self, batch: &ExecutionBatch) -> Result<ModelOutput> {
        self.calls.lock().unwrap().push((
            batch.len(),
            batch.sequences.first().map_or(0, |seq| seq.block_ids.len()),
        ));
        Ok(ModelOutput::TokenIds(
            batch
                .sequences
                .iter()
                .map(|seq| seq.token_ids.last().copied().unwrap_or(0) + 1)
                .collect(),
        ))
    }
}

/// Returns logits that favour one token for every row.
struct LogitsModel {
    vocab_size: usize,
    favourite: usize,
}

impl ModelExecutor for LogitsModel {
    fn execute(&self, batch: &ExecutionBatch) -> Result<ModelOutput> {
        let mut data = vec![0f32; batch.len() * self.vocab_size];
        for row in 0..batch.len() {
            data[row * self.vocab_size + self.favourite] = 5.0;
        }
        let logits = Tensor::from_vec(data, (batch.len(), self.vocab_size), &Device::Cpu)?;
        Ok(ModelOutput::Logits(logits))
    }
}

/// Favours token 1 everywhere except the rows of one request, which are NaN.
struct PoisonedRowModel {
    vocab_size: usize,
    poisoned: RequestId,
}

impl ModelExecutor for PoisonedRowModel {
    fn execute(&self, batch: &ExecutionBatch) -> Result<ModelOutput> {
        let mut data = vec![0f32; batch.len() * self.vocab_size];
        for (row, seq) in batch.sequences.iter().enumerate() {
            let row = &mut data[row * self.vocab_size..(row + 1) * self.vocab_size];
            if seq.request_id == self.poisoned {
                row.fill(f32::NAN);
            } else {
                row[1] = 5.0;
            }
        }
        let logits = Tensor::from_vec(data, (batch.len(), self.vocab_size), &Device::Cpu)?;
        Ok(ModelOutput::Logits(logits))
    }
}

/// Returns no rows at all.
struct BrokenModel;

impl ModelExecutor for BrokenModel {
    fn execute(&self, _batch: &ExecutionBatch) -> Result<ModelOutput> {
        Ok(ModelOutput::TokenIds(Vec::new()))
    }
}

struct AngleDetokenizer;

impl Detokenizer for AngleDetokenizer {
    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        Ok(token_ids.iter().map(|t| format!("<{t}>")).collect())
    }
}

fn config(num_blocks: usize, block_size: usize, max_num_seqs: usize) -> EngineConfig {
    EngineConfig {
        max_num_seqs,
        block_size,
        num_blocks,
        ..EngineConfig::default()
    }
}

#[test]
fn test_generation_request_builder() {
    let request = GenerationRequest::new(vec![1, 2, 3])
        .max_tokens(100)
        .max_length(50)
        .temperature(0.7)
        .top_k(50)
        .top_p(0.9)
        .stop_token_ids(vec![2])
        .seed(3);

    assert_eq!(request.prompt_token_ids, vec![1, 2, 3]);
    assert_eq!(request.sampling_config.max_tokens, 100);
    assert_eq!(request.sampling_config.max_length, Some(50));
    assert_eq!(request.sampling_config.temperature, 0.7);
    assert_eq!(request.sampling_config.top_k, 50);
    assert_eq!(request.sampling_config.top_p, 0.9);
    assert_eq!(request.sampling_config.stop_token_ids, vec![2]);
    assert_eq!(request.sampling_config.seed, Some(3));
}

#[test]
fn test_idle_step_returns_nothing() {
    let engine = LLMEngine::new(CountingModel::default(), config(4, 2, 4)).unwrap();

    assert!(engine.step().unwrap().is_empty());
    assert!(!engine.has_pending_requests());
    assert!(engine.executor().calls().is_empty());
}

#[test]
fn test_invalid_config_is_rejected() {
    assert!(matches!(
        LLMEngine::new(CountingModel::default(), config(0, 2, 4)),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_block_lifecycle_end_to_end() {
    let engine = LLMEngine::new(CountingModel::default(), config(4, 2, 4)).unwrap();
    let request_id = engine
        .add_request(GenerationRequest::new(vec![1, 2, 3]).max_length(5))
        .unwrap();

    // First tick: 3 tokens plus the one being produced fit in 2 blocks.
    let outputs = engine.step().unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].request_id, request_id);
    assert_eq!(outputs[0].token, Some(4));
    assert!(!outputs[0].finished);
    assert_eq!(engine.num_free_blocks(), 2);

    // Second tick produces the 5th token, which needs a 3rd block.
    let outputs = engine.step().unwrap();
    assert_eq!(outputs[0].token, Some(5));
    assert!(outputs[0].finished);
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::MaxLength));

    assert_eq!(engine.executor().calls(), vec![(1, 2), (1, 3)]);
    assert_eq!(engine.num_free_blocks(), 4);
    assert!(!engine.has_pending_requests());
    assert!(engine.step().unwrap().is_empty());
}

#[test]
fn test_batch_respects_max_num_seqs() {
    let engine = LLMEngine::new(CountingModel::default(), config(64, 4, 2)).unwrap();
    for _ in 0..3 {
        engine
            .add_request(GenerationRequest::new(vec![1]).max_tokens(2))
            .unwrap();
    }

    let outputs = engine.step().unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(engine.running_request_ids(), vec![0, 1]);
    assert_eq!(engine.waiting_request_ids(), vec![2]);

    // The first two finish on this tick and free their slots.
    let outputs = engine.step().unwrap();
    assert!(outputs.iter().all(|o| o.finished));
    assert_eq!(engine.num_running(), 0);
    assert_eq!(engine.num_waiting(), 1);

    let results = engine.generate().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].request_id, 2);
    assert_eq!(results[0].output_tokens, vec![2, 3]);
    assert_eq!(results[0].finish_reason, Some(FinishReason::MaxTokens));
}

#[test]
fn test_stop_conditions() {
    let engine = LLMEngine::new(
        CountingModel::default(),
        EngineConfig {
            eos_token_id: Some(11),
            ..config(64, 4, 8)
        },
    )
    .unwrap();

    let eos = engine.add_request(GenerationRequest::new(vec![10])).unwrap();
    let stop = engine
        .add_request(GenerationRequest::new(vec![20]).stop_token_ids(vec![22]))
        .unwrap();
    let max_tokens = engine
        .add_request(GenerationRequest::new(vec![30]).max_tokens(3))
        .unwrap();

    let mut results = engine.generate().unwrap();
    results.sort_by_key(|r| r.request_id);

    assert_eq!(results[0].request_id, eos);
    assert_eq!(results[0].output_tokens, vec![11]);
    assert_eq!(results[0].finish_reason, Some(FinishReason::EndOfSequence));

    assert_eq!(results[1].request_id, stop);
    assert_eq!(results[1].output_tokens, vec![21, 22]);
    assert_eq!(results[1].finish_reason, Some(FinishReason::StopToken));

    assert_eq!(results[2].request_id, max_tokens);
    assert_eq!(results[2].output_tokens, vec![31, 32, 33]);
    assert_eq!(results[2].finish_reason, Some(FinishReason::MaxTokens));

    assert_eq!(engine.num_free_blocks(), 64);
}

#[test]
fn test_preemption_recovers_and_completes() {
    let engine = LLMEngine::new(CountingModel::default(), config(4, 2, 4)).unwrap();
    let first = engine
        .add_request(GenerationRequest::new(vec![1, 2, 3]).max_length(8))
        .unwrap();
    let second = engine
        .add_request(GenerationRequest::new(vec![1, 2, 3]).max_length(8))
        .unwrap();

    assert_eq!(engine.step().unwrap().len(), 2);
    assert_eq!(engine.num_free_blocks(), 0);

    // Both need a third block; the first is sent back to waiting.
    let outputs = engine.step().unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].request_id, second);
    assert_eq!(engine.waiting_request_ids(), vec![first]);

    // The preempted request keeps its first token and resumes after it.
    let results = engine.generate().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].request_id, second);
    assert_eq!(results[0].output_tokens, vec![6, 7, 8]);
    assert_eq!(results[1].request_id, first);
    assert_eq!(results[1].output_tokens, vec![5, 6, 7, 8]);
    assert!(results
        .iter()
        .all(|r| r.finish_reason == Some(FinishReason::MaxLength)));
    assert_eq!(engine.num_free_blocks(), 4);
}

#[test]
fn test_add_request_rejections() {
    let engine = LLMEngine::new(
        CountingModel::default(),
        EngineConfig {
            max_model_len: 16,
            ..config(2, 2, 4)
        },
    )
    .unwrap();

    assert!(matches!(
        engine.add_request(GenerationRequest::new(vec![])),
        Err(Error::InvalidRequest(_))
    ));
    // 4 tokens plus the next one need 3 blocks; the pool has 2.
    assert!(matches!(
        engine.add_request(GenerationRequest::new(vec![1, 2, 3, 4])),
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        engine.add_request(GenerationRequest::new(vec![1, 2]).max_length(2)),
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        engine.add_request(GenerationRequest::new(vec![1]).max_tokens(0)),
        Err(Error::InvalidRequest(_))
    ));
    assert!(!engine.has_pending_requests());
}

#[test]
fn test_request_outgrowing_pool_finishes_with_capacity_exceeded() {
    let engine = LLMEngine::new(CountingModel::default(), config(2, 2, 4)).unwrap();
    let request_id = engine.add_request(GenerationRequest::new(vec![1, 2, 3])).unwrap();

    let outputs = engine.step().unwrap();
    assert_eq!(outputs[0].token, Some(4));

    // A 5th token would need a 3rd block in a 2-block pool.
    let outputs = engine.step().unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].request_id, request_id);
    assert_eq!(outputs[0].token, None);
    assert!(outputs[0].finished);
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::CapacityExceeded));

    assert!(!engine.has_pending_requests());
    assert_eq!(engine.num_free_blocks(), 2);
}

#[test]
fn test_abort_request() {
    let engine = LLMEngine::new(CountingModel::default(), config(8, 2, 1)).unwrap();
    let running = engine.add_request(GenerationRequest::new(vec![1, 2, 3])).unwrap();
    let waiting = engine.add_request(GenerationRequest::new(vec![1])).unwrap();
    engine.step().unwrap();
    assert_eq!(engine.num_free_blocks(), 6);

    let output = engine.abort_request(waiting).unwrap();
    assert_eq!(output.token, None);
    assert!(output.finished);
    assert_eq!(output.finish_reason, Some(FinishReason::Aborted));
    assert_eq!(engine.num_waiting(), 0);

    engine.abort_request(running).unwrap();
    assert_eq!(engine.num_running(), 0);
    assert_eq!(engine.num_free_blocks(), 8);

    assert!(matches!(
        engine.abort_request(running),
        Err(Error::RequestNotFound(_))
    ));
    assert!(engine.step().unwrap().is_empty());
}

#[test]
fn test_free_finished_request_is_idempotent() {
    let engine = LLMEngine::new(CountingModel::default(), config(8, 2, 4)).unwrap();
    let request_id = engine.add_request(GenerationRequest::new(vec![1, 2, 3])).unwrap();
    engine.step().unwrap();

    engine.free_finished_request(request_id).unwrap();
    engine.free_finished_request(request_id).unwrap();
    engine.free_finished_request(999).unwrap();
    assert_eq!(engine.num_free_blocks(), 8);
    assert_eq!(engine.num_running(), 0);
}

#[test]
fn test_free_finished_request_leaves_queued_requests_alone() {
    let engine = LLMEngine::new(
        LogitsModel {
            vocab_size: 8,
            favourite: 6,
        },
        config(16, 2, 1),
    )
    .unwrap();
    let first = engine
        .add_request(GenerationRequest::new(vec![1, 2, 3]).max_tokens(2))
        .unwrap();
    let queued = engine
        .add_request(GenerationRequest::new(vec![1, 2, 3]).max_tokens(2))
        .unwrap();
    engine.step().unwrap();
    assert_eq!(engine.waiting_request_ids(), vec![queued]);

    // Not running yet, so nothing happens to it.
    engine.free_finished_request(queued).unwrap();
    assert_eq!(engine.waiting_request_ids(), vec![queued]);

    let results = engine.generate().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].request_id, first);
    assert_eq!(results[1].request_id, queued);
    assert_eq!(results[1].output_tokens, vec![6, 6]);
    assert_eq!(results[1].finish_reason, Some(FinishReason::MaxTokens));
    assert!(!engine.has_pending_requests());
    assert_eq!(engine.num_free_blocks(), 16);
}

#[test]
fn test_free_finished_request_leaves_preempted_requests_alone() {
    let engine = LLMEngine::new(
        LogitsModel {
            vocab_size: 8,
            favourite: 6,
        },
        config(4, 2, 4),
    )
    .unwrap();
    let first = engine
        .add_request(GenerationRequest::new(vec![1, 2, 3]).max_length(6))
        .unwrap();
    let second = engine
        .add_request(GenerationRequest::new(vec![1, 2, 3]).max_length(6))
        .unwrap();
    engine.step().unwrap();
    engine.step().unwrap();
    assert_eq!(engine.waiting_request_ids(), vec![first]);

    engine.free_finished_request(first).unwrap();

    let mut results = engine.generate().unwrap();
    results.sort_by_key(|r| r.request_id);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].request_id, first);
    assert_eq!(results[1].request_id, second);
    assert!(results
        .iter()
        .all(|r| r.finish_reason == Some(FinishReason::MaxLength)));
    assert!(!engine.has_pending_requests());
    assert_eq!(engine.num_free_blocks(), 4);
}

#[test]
fn test_sampling_failure_only_finishes_its_own_sequence() {
    let engine = LLMEngine::new(
        PoisonedRowModel {
            vocab_size: 4,
            poisoned: 1,
        },
        config(8, 4, 4),
    )
    .unwrap();
    let healthy = engine
        .add_request(GenerationRequest::new(vec![0]).temperature(0.0).max_tokens(1))
        .unwrap();
    let poisoned = engine.add_request(GenerationRequest::new(vec![0])).unwrap();
    assert_eq!(poisoned, 1);

    let outputs = engine.step().unwrap();
    assert_eq!(outputs.len(), 2);

    assert_eq!(outputs[0].request_id, healthy);
    assert_eq!(outputs[0].token, Some(1));
    assert!(outputs[0].finished);
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::MaxTokens));

    assert_eq!(outputs[1].request_id, poisoned);
    assert_eq!(outputs[1].token, None);
    assert!(outputs[1].finished);
    assert_eq!(outputs[1].finish_reason, Some(FinishReason::SamplingFailed));

    assert!(!engine.has_pending_requests());
    assert_eq!(engine.num_free_blocks(), 8);
}

#[test]
fn test_logits_are_sampled_per_row() {
    let engine = LLMEngine::new(
        LogitsModel {
            vocab_size: 8,
            favourite: 6,
        },
        config(16, 4, 4),
    )
    .unwrap();
    for _ in 0..2 {
        engine
            .add_request(GenerationRequest::new(vec![1, 2]).temperature(0.0).max_tokens(2))
            .unwrap();
    }

    let results = engine.generate().unwrap();
    assert_eq!(results.len(), 2);
    for result in results {
        assert_eq!(result.output_tokens, vec![6, 6]);
    }
}

#[test]
fn test_detokenizer_fills_text() {
    let engine = LLMEngine::new(CountingModel::default(), config(8, 4, 4))
        .unwrap()
        .with_detokenizer(AngleDetokenizer);
    engine
        .add_request(GenerationRequest::new(vec![1]).max_tokens(2))
        .unwrap();

    let outputs = engine.step().unwrap();
    assert_eq!(outputs[0].text.as_deref(), Some("<2>"));

    let results = engine.generate().unwrap();
    assert_eq!(results[0].output_tokens, vec![3]);
    assert_eq!(results[0].output_text.as_deref(), Some("<3>"));
}

#[test]
fn test_tokenizer_detokenizes_outputs() {
    let tokenizer: tokenizers::Tokenizer = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": null,
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[UNK]": 0, "hello": 1, "world": 2},
            "unk_token": "[UNK]"
        }
    }"#
    .parse()
    .unwrap();
    let engine = LLMEngine::new(CountingModel::default(), config(8, 4, 4))
        .unwrap()
        .with_detokenizer(tokenizer);
    engine
        .add_request(GenerationRequest::new(vec![0]).max_tokens(2))
        .unwrap();

    let outputs = engine.step().unwrap();
    assert_eq!(outputs[0].text.as_deref(), Some("hello"));
    let outputs = engine.step().unwrap();
    assert_eq!(outputs[0].text.as_deref(), Some("world"));
    assert!(outputs[0].finished);
}

#[test]
fn test_wrong_row_count_is_model_error() {
    let engine = LLMEngine::new(BrokenModel, config(8, 4, 4)).unwrap();
    engine.add_request(GenerationRequest::new(vec![1])).unwrap();

    assert!(matches!(engine.step(), Err(Error::Model(_))));
}
