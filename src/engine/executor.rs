//! Seams to the collaborators the engine drives but does not implement.
//!
//! The forward pass of the model is opaque: the engine hands a
//! [`ModelExecutor`] the whole running batch once per tick and gets back one
//! next token (or one row of logits) per sequence, in input order.

use candle_core::Tensor;
use tokenizers::Tokenizer;

use crate::core::sequence::{RequestId, SequenceId};
use crate::error::{Error, Result};

/// One sequence of the batch handed to the model.
#[derive(Debug, Clone)]
pub struct SequenceInput {
    /// Request the sequence belongs to.
    pub request_id: RequestId,
    /// Sequence identifier.
    pub seq_id: SequenceId,
    /// Full token history (prompt + generated).
    pub token_ids: Vec<u32>,
    /// Physical KV cache blocks backing the sequence, in logical order.
    pub block_ids: Vec<usize>,
}

/// The running batch for one tick.
#[derive(Debug, Clone, Default)]
pub struct ExecutionBatch {
    /// Sequences in arrival order of their requests.
    pub sequences: Vec<SequenceInput>,
    /// Tokens per KV cache block.
    pub block_size: usize,
}

impl ExecutionBatch {
    /// Number of sequences in the batch.
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Token histories in batch order; lengths may differ.
    pub fn token_ids(&self) -> Vec<&[u32]> {
        self.sequences
            .iter()
            .map(|seq| seq.token_ids.as_slice())
            .collect()
    }
}

/// What the model returns for a batch.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    /// One already-chosen next token per sequence.
    TokenIds(Vec<u32>),
    /// Next-token logits of shape `[batch, vocab_size]`, sampled by the engine.
    Logits(Tensor),
}

impl ModelOutput {
    /// Number of rows in the output.
    pub fn num_rows(&self) -> Result<usize> {
        match self {
            Self::TokenIds(ids) => Ok(ids.len()),
            Self::Logits(logits) => Ok(logits.dim(0)?),
        }
    }
}

/// Black-box batched forward pass.
///
/// Called without any scheduler lock held; may block for as long as the
/// forward pass takes.
pub trait ModelExecutor: Send + Sync {
    /// Run one forward pass over a non-empty batch.
    fn execute(&self, batch: &ExecutionBatch) -> Result<ModelOutput>;
}

/// Turns produced token ids back into text for streaming.
pub trait Detokenizer: Send + Sync {
    /// Decode a run of token ids.
    fn decode(&self, token_ids: &[u32]) -> Result<String>;
}

impl Detokenizer for Tokenizer {
    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        (**self)
            .decode(token_ids, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }
}

/// Check that a model output has one row per batch entry.
pub(crate) fn check_output_rows(output: &ModelOutput, batch: &ExecutionBatch) -> Result<()> {
    let rows = output.num_rows()?;
    if rows != batch.len() {
        return Err(Error::Model(format!(
            "expected {} rows, model returned {rows}",
            batch.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn batch(n: usize) -> ExecutionBatch {
        ExecutionBatch {
            sequences: (0..n as u64)
                .map(|id| SequenceInput {
                    request_id: id,
                    seq_id: id,
                    token_ids: vec![1; id as usize + 1],
                    block_ids: vec![],
                })
                .collect(),
            block_size: 16,
        }
    }

    #[test]
    fn test_token_ids_keep_batch_order() {
        let batch = batch(3);
        let ids = batch.token_ids();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0].len(), 1);
        assert_eq!(ids[2].len(), 3);
    }

    #[test]
    fn test_row_count_mismatch_is_model_error() {
        let output = ModelOutput::TokenIds(vec![1, 2]);
        assert!(matches!(
            check_output_rows(&output, &batch(3)),
            Err(Error::Model(_))
        ));

        let logits = Tensor::zeros((3, 8), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(check_output_rows(&ModelOutput::Logits(logits), &batch(3)).is_ok());
    }
}
