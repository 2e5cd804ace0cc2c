//! Sequence tracking for inference requests.
//!
//! A [`Sequence`] is one stream of tokens; a [`SequenceGroup`] is the set of
//! sequences produced for a single request. The base policy runs one
//! sequence per group, but every scheduling and memory decision is made over
//! the whole group.

use std::time::Instant;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Unique identifier for a request (sequence group).
pub type RequestId = u64;

/// Status of a sequence in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Waiting in queue to be scheduled. Holds no blocks.
    Waiting,
    /// Currently in the running batch.
    Running,
    /// Finished generation.
    Finished,
}

impl SequenceStatus {
    /// Check if the sequence is active (waiting or running).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running)
    }

    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Finished => "Finished",
        }
    }
}

/// Reason for sequence completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Engine-wide end-of-sequence token generated.
    EndOfSequence,
    /// One of the request's stop tokens generated.
    StopToken,
    /// Maximum number of generated tokens reached.
    MaxTokens,
    /// Prompt + output reached the length limit.
    MaxLength,
    /// Withdrawn by the caller.
    Aborted,
    /// The request cannot fit in the block pool even when running alone.
    CapacityExceeded,
    /// No token could be sampled from the model output.
    SamplingFailed,
}

impl FinishReason {
    /// Get the reason name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndOfSequence => "eos",
            Self::StopToken => "stop",
            Self::MaxTokens | Self::MaxLength => "length",
            Self::Aborted => "abort",
            Self::CapacityExceeded => "capacity",
            Self::SamplingFailed => "error",
        }
    }
}

/// A single stream of tokens: the prompt plus everything generated so far.
///
/// # Example
///
/// ```
/// use minivllm::core::sequence::{Sequence, SequenceStatus};
///
/// let mut seq = Sequence::new(1, vec![1, 2, 3, 4]);
/// assert_eq!(seq.status(), SequenceStatus::Waiting);
/// assert_eq!(seq.prompt_len(), 4);
///
/// seq.append_token(5);
/// assert_eq!(seq.output_len(), 1);
/// assert_eq!(seq.total_len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Unique sequence identifier.
    seq_id: SequenceId,
    /// Prompt token IDs.
    prompt_token_ids: Vec<u32>,
    /// Generated output token IDs.
    output_token_ids: Vec<u32>,
    /// Current status.
    status: SequenceStatus,
    /// Reason for finishing (if finished).
    finish_reason: Option<FinishReason>,
}

impl Sequence {
    /// Create a new sequence with the given prompt tokens.
    pub fn new(seq_id: SequenceId, prompt_token_ids: Vec<u32>) -> Self {
        Self {
            seq_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            status: SequenceStatus::Waiting,
            finish_reason: None,
        }
    }

    /// Get the sequence ID.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    /// Get the output token IDs.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Get all token IDs (prompt + output).
    pub fn all_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    /// Get the current status.
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Get the finish reason (if finished).
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Get the output length.
    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Get the total length (prompt + output).
    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
    }

    /// Get the last token ID.
    pub fn last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    /// Transition to running state.
    ///
    /// # Errors
    ///
    /// Returns error unless the sequence is waiting.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Waiting => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition back to waiting state (preemption).
    ///
    /// # Errors
    ///
    /// Returns error unless the sequence is running.
    pub fn set_waiting(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running => {
                self.status = SequenceStatus::Waiting;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Waiting",
            }),
        }
    }

    /// Mark the sequence as finished. The first reason recorded wins.
    pub fn set_finished(&mut self, reason: FinishReason) {
        if self.status.is_finished() {
            return;
        }
        self.status = SequenceStatus::Finished;
        self.finish_reason = Some(reason);
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.seq_id == other.seq_id
    }
}

impl Eq for Sequence {}

impl std::hash::Hash for Sequence {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.seq_id.hash(state);
    }
}

/// All sequences generated for one request.
///
/// Sequences in a group share the request's arrival and its sampling
/// parameters. The group is finished once every member is.
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    /// Request identifier.
    request_id: RequestId,
    /// Member sequences.
    seqs: Vec<Sequence>,
    /// Wall-clock arrival.
    arrival_time: Instant,
    /// Monotonic admission ticket; breaks ties between equal `Instant`s.
    arrival_order: u64,
    /// Generation parameters shared by every member.
    sampling_config: SamplingConfig,
}

impl SequenceGroup {
    /// Create a group. `arrival_order` must increase with every request.
    pub fn new(
        request_id: RequestId,
        seqs: Vec<Sequence>,
        arrival_order: u64,
        sampling_config: SamplingConfig,
    ) -> Self {
        Self {
            request_id,
            seqs,
            arrival_time: Instant::now(),
            arrival_order,
            sampling_config,
        }
    }

    /// Get the request ID.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Get the arrival time.
    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    /// Position of this request in arrival order.
    pub fn arrival_order(&self) -> u64 {
        self.arrival_order
    }

    /// Get the sampling configuration.
    pub fn sampling_config(&self) -> &SamplingConfig {
        &self.sampling_config
    }

    /// All member sequences.
    pub fn seqs(&self) -> &[Sequence] {
        &self.seqs
    }

    /// Mutable access to member sequences.
    pub fn seqs_mut(&mut self) -> &mut [Sequence] {
        &mut self.seqs
    }

    /// Member sequences with the given status.
    pub fn get_seqs(&self, status: SequenceStatus) -> impl Iterator<Item = &Sequence> {
        self.seqs.iter().filter(move |seq| seq.status() == status)
    }

    /// Find a member sequence by ID.
    pub fn get_seq_mut(&mut self, seq_id: SequenceId) -> Option<&mut Sequence> {
        self.seqs.iter_mut().find(|seq| seq.seq_id() == seq_id)
    }

    /// Number of member sequences.
    pub fn num_seqs(&self) -> usize {
        self.seqs.len()
    }

    /// Whether every member sequence has finished.
    pub fn is_finished(&self) -> bool {
        self.seqs.iter().all(|seq| seq.status().is_finished())
    }

    /// Move every waiting member to running.
    pub fn set_running(&mut self) -> Result<()> {
        for seq in self.seqs.iter_mut() {
            if seq.status() == SequenceStatus::Waiting {
                seq.set_running()?;
            }
        }
        Ok(())
    }

    /// Move every running member back to waiting.
    pub fn set_waiting(&mut self) -> Result<()> {
        for seq in self.seqs.iter_mut() {
            if seq.status() == SequenceStatus::Running {
                seq.set_waiting()?;
            }
        }
        Ok(())
    }

    /// Finish every member that has not finished yet.
    pub fn set_finished(&mut self, reason: FinishReason) {
        for seq in self.seqs.iter_mut() {
            seq.set_finished(reason);
        }
    }
}
