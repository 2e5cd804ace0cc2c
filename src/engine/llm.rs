//! LLM Inference Engine.
//!
//! The LLMEngine drives one generation tick at a time:
//! - Scheduler admits waiting requests and forms the running batch
//! - Block tables grow so every running sequence can hold its next token
//! - The model executor runs once over the whole batch
//! - Sampled tokens are appended and stop conditions evaluated
//!
//! ## Engine Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LLMEngine::step                        │
//! └─────────────────────────────────────────────────────────────┘
//!        │  state lock held
//!        ▼
//!  ┌──────────────┐   ┌──────────────────────┐   ┌──────────────┐
//!  │  schedule()  │──►│ reserve_running_     │──►│ build batch  │
//!  │  (admission) │   │ blocks (preemption)  │   │              │
//!  └──────────────┘   └──────────────────────┘   └──────────────┘
//!        │  lock released
//!        ▼
//!  ┌──────────────┐
//!  │ model execute│
//!  └──────────────┘
//!        │  lock re-acquired
//!        ▼
//!  ┌──────────────┐   ┌──────────────────────┐
//!  │ sample/append│──►│ stop check, free     │
//!  └──────────────┘   └──────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use super::executor::{
    check_output_rows, Detokenizer, ExecutionBatch, ModelExecutor, ModelOutput, SequenceInput,
};
use super::sampler::Sampler;
use crate::config::{EngineConfig, SamplingConfig};
use crate::core::block::compute_num_blocks;
use crate::core::sequence::{
    FinishReason, RequestId, Sequence, SequenceGroup, SequenceId, SequenceStatus,
};
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;

/// Request for token generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Prompt token IDs.
    pub prompt_token_ids: Vec<u32>,
    /// Sampling configuration for this request.
    pub sampling_config: SamplingConfig,
}

impl GenerationRequest {
    /// Create a new generation request with default settings.
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_token_ids,
            sampling_config: SamplingConfig::default(),
        }
    }

    /// Set the maximum tokens to generate.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.sampling_config.max_tokens = max_tokens;
        self
    }

    /// Stop once prompt + output reaches `max_length` tokens.
    pub fn max_length(mut self, max_length: usize) -> Self {
        self.sampling_config.max_length = Some(max_length);
        self
    }

    /// Set the temperature for sampling.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.sampling_config.temperature = temperature;
        self
    }

    /// Set top-k sampling parameter.
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.sampling_config.top_k = top_k;
        self
    }

    /// Set top-p (nucleus) sampling parameter.
    pub fn top_p(mut self, top_p: f32) -> Self {
        self.sampling_config.top_p = top_p;
        self
    }

    /// Add tokens that end generation.
    pub fn stop_token_ids(mut self, stop_token_ids: Vec<u32>) -> Self {
        self.sampling_config.stop_token_ids = stop_token_ids;
        self
    }

    /// Seed the sampler.
    pub fn seed(mut self, seed: u64) -> Self {
        self.sampling_config.seed = Some(seed);
        self
    }
}

/// Incremental output for one sequence in one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Request the token belongs to.
    pub request_id: RequestId,
    /// Sequence that produced the token.
    pub seq_id: SequenceId,
    /// Token produced this tick; `None` when the request ended without one.
    pub token: Option<u32>,
    /// Decoded text of `token`, when a detokenizer is attached.
    pub text: Option<String>,
    /// Whether the whole request is finished.
    pub finished: bool,
    /// Why the sequence finished.
    pub finish_reason: Option<FinishReason>,
}

/// Collected output of a request run to completion.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Request ID.
    pub request_id: RequestId,
    /// Generated token IDs.
    pub output_tokens: Vec<u32>,
    /// Generated text, when a detokenizer is attached.
    pub output_text: Option<String>,
    /// Reason for finishing.
    pub finish_reason: Option<FinishReason>,
}

/// Stop parameters of one group, copied out so sequences can be mutated.
struct StopCriteria {
    eos_token_id: Option<u32>,
    stop_token_ids: Vec<u32>,
    max_tokens: usize,
    max_length: usize,
}

impl StopCriteria {
    fn check(&self, seq: &Sequence, token: u32) -> Option<FinishReason> {
        if self.eos_token_id == Some(token) {
            Some(FinishReason::EndOfSequence)
        } else if self.stop_token_ids.contains(&token) {
            Some(FinishReason::StopToken)
        } else if seq.output_len() >= self.max_tokens {
            Some(FinishReason::MaxTokens)
        } else if seq.total_len() >= self.max_length {
            Some(FinishReason::MaxLength)
        } else {
            None
        }
    }
}

/// Everything mutated by scheduling decisions, guarded by one lock.
struct EngineState {
    scheduler: Scheduler,
    samplers: HashMap<RequestId, Sampler>,
    next_request_id: RequestId,
    next_seq_id: SequenceId,
}

/// LLM Inference Engine.
///
/// All admission, allocation and free decisions happen under a single state
/// lock, so [`add_request`](Self::add_request) may be called from any thread
/// while a [`step`](Self::step) is in flight. The model call itself runs with
/// the lock released.
pub struct LLMEngine<M: ModelExecutor> {
    /// Engine configuration.
    config: EngineConfig,
    /// The black-box model.
    executor: M,
    /// Optional detokenizer for streamed text.
    detokenizer: Option<Box<dyn Detokenizer>>,
    /// Scheduler, samplers and id counters.
    state: Mutex<EngineState>,
    /// Serialises ticks.
    step_lock: Mutex<()>,
}

impl<M: ModelExecutor> LLMEngine<M> {
    /// Create a new LLMEngine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration.
    pub fn new(executor: M, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::new(
            config.scheduler_config(),
            config.block_size,
            config.num_blocks,
        );
        info!(
            block_size = config.block_size,
            num_blocks = config.num_blocks,
            max_num_seqs = config.max_num_seqs,
            "initialized engine"
        );

        Ok(Self {
            config,
            executor,
            detokenizer: None,
            state: Mutex::new(EngineState {
                scheduler,
                samplers: HashMap::new(),
                next_request_id: 0,
                next_seq_id: 0,
            }),
            step_lock: Mutex::new(()),
        })
    }

    /// Attach a detokenizer used to fill [`StepOutput::text`].
    pub fn with_detokenizer(mut self, detokenizer: impl Detokenizer + 'static) -> Self {
        self.detokenizer = Some(Box::new(detokenizer));
        self
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state lock poisoned")
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get the model executor.
    pub fn executor(&self) -> &M {
        &self.executor
    }

    fn max_length_for(&self, sampling_config: &SamplingConfig) -> usize {
        sampling_config
            .max_length
            .map_or(self.config.max_model_len, |len| {
                len.min(self.config.max_model_len)
            })
    }

    /// Add a generation request to the waiting queue.
    ///
    /// Returns the assigned request ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for an empty prompt, a zero
    /// `max_tokens`, a prompt that already reaches the length limit, or one
    /// that could not fit in the block pool even with the pool to itself.
    pub fn add_request(&self, request: GenerationRequest) -> Result<RequestId> {
        let prompt_len = request.prompt_token_ids.len();
        if prompt_len == 0 {
            return Err(Error::InvalidRequest("empty prompt".to_string()));
        }
        if request.sampling_config.max_tokens == 0 {
            return Err(Error::InvalidRequest("max_tokens must be > 0".to_string()));
        }

        let max_length = self.max_length_for(&request.sampling_config);
        if prompt_len >= max_length {
            return Err(Error::InvalidRequest(format!(
                "prompt of {prompt_len} tokens reaches the length limit of {max_length}"
            )));
        }

        let blocks_needed = compute_num_blocks(prompt_len + 1, self.config.block_size);
        if blocks_needed > self.config.num_blocks {
            return Err(Error::InvalidRequest(format!(
                "prompt needs {blocks_needed} blocks but the pool only has {}",
                self.config.num_blocks
            )));
        }

        let mut state = self.state();
        let request_id = state.next_request_id;
        state.next_request_id += 1;
        let seq_id = state.next_seq_id;
        state.next_seq_id += 1;

        let sampler = Sampler::new(&request.sampling_config);
        let sequence = Sequence::new(seq_id, request.prompt_token_ids);
        let group = SequenceGroup::new(
            request_id,
            vec![sequence],
            request_id,
            request.sampling_config,
        );
        state.scheduler.add_sequence_group(group);
        state.samplers.insert(request_id, sampler);

        info!(request_id, prompt_len, "added request");
        Ok(request_id)
    }

    /// Run one tick.
    ///
    /// Returns one output per sequence that produced a token this tick, plus
    /// a token-less finished output for every request that was found not to
    /// fit in the block pool or whose token could not be sampled. An empty
    /// result means nothing was runnable.
    ///
    /// # Errors
    ///
    /// Returns model-execution failures and block pool programmer errors.
    /// Running out of blocks is handled by preemption.
    pub fn step(&self) -> Result<Vec<StepOutput>> {
        let _tick = self.step_lock.lock().expect("engine step lock poisoned");
        let mut outputs = Vec::new();

        let batch = {
            let mut state = self.state();
            let mut scheduled = state.scheduler.schedule();
            state.scheduler.reserve_running_blocks(&mut scheduled)?;

            for &request_id in &scheduled.infeasible {
                if let Some(group) = state.scheduler.free_finished_request(request_id)? {
                    state.samplers.remove(&request_id);
                    for seq in group.seqs() {
                        outputs.push(StepOutput {
                            request_id,
                            seq_id: seq.seq_id(),
                            token: None,
                            text: None,
                            finished: true,
                            finish_reason: seq.finish_reason(),
                        });
                    }
                }
            }

            self.build_batch(&state.scheduler, &scheduled.scheduled)
        };

        if batch.is_empty() {
            return Ok(outputs);
        }

        debug!(batch_size = batch.len(), "executing model");
        let model_output = self.executor.execute(&batch)?;
        check_output_rows(&model_output, &batch)?;

        let mut state = self.state();

        // Every row is sampled before any sequence changes, so one bad row
        // only fails its own sequence.
        let tokens: Vec<Result<u32>> = batch
            .sequences
            .iter()
            .enumerate()
            .map(|(row, input)| match &model_output {
                ModelOutput::TokenIds(ids) => Ok(ids[row]),
                ModelOutput::Logits(logits) => {
                    let sampler = state.samplers.get_mut(&input.request_id).ok_or_else(|| {
                        Error::InvalidRequest(format!(
                            "request {} has no sampler",
                            input.request_id
                        ))
                    })?;
                    sampler.sample(&logits.get(row)?)
                }
            })
            .collect();

        for (input, token) in batch.sequences.iter().zip(tokens) {
            let output = match token {
                Ok(token) => self.apply_token(&mut state, input, token)?,
                Err(e) => self.fail_sequence(&mut state, input, &e)?,
            };
            outputs.extend(output);
        }

        Ok(outputs)
    }

    fn build_batch(&self, scheduler: &Scheduler, scheduled: &[RequestId]) -> ExecutionBatch {
        let block_manager = scheduler.block_manager();
        let sequences = scheduled
            .iter()
            .filter_map(|&request_id| scheduler.get_group(request_id))
            .flat_map(|group| {
                group
                    .get_seqs(SequenceStatus::Running)
                    .map(move |seq| SequenceInput {
                        request_id: group.request_id(),
                        seq_id: seq.seq_id(),
                        token_ids: seq.all_token_ids(),
                        block_ids: block_manager
                            .block_table(seq.seq_id())
                            .map(|table| table.get_physical_block_ids().to_vec())
                            .unwrap_or_default(),
                    })
            })
            .collect();

        ExecutionBatch {
            sequences,
            block_size: block_manager.block_size(),
        }
    }

    /// Append a sampled token and finish the sequence if a stop condition
    /// hit. Requests aborted while the model ran are skipped.
    fn apply_token(
        &self,
        state: &mut EngineState,
        input: &SequenceInput,
        token: u32,
    ) -> Result<Option<StepOutput>> {
        let request_id = input.request_id;
        let Some(group) = state.scheduler.get_group_mut(request_id) else {
            return Ok(None);
        };
        let criteria = StopCriteria {
            eos_token_id: self.config.eos_token_id,
            stop_token_ids: group.sampling_config().stop_token_ids.clone(),
            max_tokens: group.sampling_config().max_tokens,
            max_length: self.max_length_for(group.sampling_config()),
        };
        let Some(seq) = group.get_seq_mut(input.seq_id) else {
            return Ok(None);
        };
        if seq.status() != SequenceStatus::Running {
            return Ok(None);
        }

        seq.append_token(token);
        let finish_reason = criteria.check(seq, token);
        if let Some(reason) = finish_reason {
            seq.set_finished(reason);
        }
        let finished = group.is_finished();

        if finished {
            state.scheduler.free_finished_request(request_id)?;
            state.samplers.remove(&request_id);
            info!(
                request_id,
                reason = finish_reason.map(|r| r.as_str()),
                free_blocks = state.scheduler.block_manager().num_free_blocks(),
                "request finished"
            );
        }

        Ok(Some(StepOutput {
            request_id,
            seq_id: input.seq_id,
            token: Some(token),
            text: self.decode_token(token),
            finished,
            finish_reason,
        }))
    }

    /// Finish a sequence whose token could not be sampled. Requests aborted
    /// while the model ran are skipped.
    fn fail_sequence(
        &self,
        state: &mut EngineState,
        input: &SequenceInput,
        err: &Error,
    ) -> Result<Option<StepOutput>> {
        let request_id = input.request_id;
        let Some(group) = state.scheduler.get_group_mut(request_id) else {
            return Ok(None);
        };
        let Some(seq) = group.get_seq_mut(input.seq_id) else {
            return Ok(None);
        };
        if seq.status() != SequenceStatus::Running {
            return Ok(None);
        }

        error!(request_id, seq_id = input.seq_id, "sampling failed: {err}");
        seq.set_finished(FinishReason::SamplingFailed);
        let finished = group.is_finished();
        if finished {
            state.scheduler.free_finished_request(request_id)?;
            state.samplers.remove(&request_id);
        }

        Ok(Some(StepOutput {
            request_id,
            seq_id: input.seq_id,
            token: None,
            text: None,
            finished,
            finish_reason: Some(FinishReason::SamplingFailed),
        }))
    }

    fn decode_token(&self, token: u32) -> Option<String> {
        let detokenizer = self.detokenizer.as_ref()?;
        match detokenizer.decode(&[token]) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(token, "failed to decode token: {e}");
                None
            }
        }
    }

    /// Release a finished request's blocks and drop it from the running set.
    ///
    /// Idempotent; unknown requests and requests that are not running are
    /// ignored.
    pub fn free_finished_request(&self, request_id: RequestId) -> Result<()> {
        let mut state = self.state();
        if state.scheduler.free_finished_request(request_id)?.is_some() {
            state.samplers.remove(&request_id);
        }
        Ok(())
    }

    /// Withdraw a request.
    ///
    /// Returns the finished, token-less output to deliver to its caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] for unknown or already finished
    /// requests.
    pub fn abort_request(&self, request_id: RequestId) -> Result<StepOutput> {
        let mut state = self.state();
        let group = state.scheduler.abort_request(request_id)?;
        state.samplers.remove(&request_id);
        info!(request_id, "aborted request");

        Ok(StepOutput {
            request_id,
            seq_id: group.seqs().first().map_or(0, Sequence::seq_id),
            token: None,
            text: None,
            finished: true,
            finish_reason: Some(FinishReason::Aborted),
        })
    }

    /// Run ticks until no request is waiting or running.
    ///
    /// Returns outputs for all requests that finished meanwhile.
    pub fn generate(&self) -> Result<Vec<GenerationOutput>> {
        let mut pending: HashMap<RequestId, GenerationOutput> = HashMap::new();
        let mut completed = Vec::new();

        while self.has_pending_requests() {
            for output in self.step()? {
                let entry = pending
                    .entry(output.request_id)
                    .or_insert_with(|| GenerationOutput {
                        request_id: output.request_id,
                        output_tokens: Vec::new(),
                        output_text: None,
                        finish_reason: None,
                    });
                if let Some(token) = output.token {
                    entry.output_tokens.push(token);
                }
                if let Some(text) = output.text {
                    entry.output_text.get_or_insert_with(String::new).push_str(&text);
                }
                if output.finished {
                    entry.finish_reason = output.finish_reason;
                    if let Some(done) = pending.remove(&output.request_id) {
                        completed.push(done);
                    }
                }
            }
        }

        Ok(completed)
    }

    /// Check if there are pending (waiting or running) requests.
    pub fn has_pending_requests(&self) -> bool {
        self.state().scheduler.has_pending_requests()
    }

    /// Get the number of waiting requests.
    pub fn num_waiting(&self) -> usize {
        self.state().scheduler.num_waiting()
    }

    /// Get the number of running requests.
    pub fn num_running(&self) -> usize {
        self.state().scheduler.num_running()
    }

    /// Get the number of free KV cache blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.state().scheduler.block_manager().num_free_blocks()
    }

    /// Waiting request IDs, head of the queue first.
    pub fn waiting_request_ids(&self) -> Vec<RequestId> {
        self.state().scheduler.waiting_request_ids()
    }

    /// Running request IDs in arrival order.
    pub fn running_request_ids(&self) -> Vec<RequestId> {
        self.state().scheduler.running_request_ids().to_vec()
    }
}
