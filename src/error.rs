//! Error types for minivllm.

use thiserror::Error;

use crate::core::sequence::RequestId;

/// Result type alias for minivllm operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for minivllm.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// Block index is out of range or the block is already free.
    #[error("invalid block {block_id} (pool has {num_blocks} blocks)")]
    InvalidBlock { block_id: usize, num_blocks: usize },

    /// Logical block index not present in a block table.
    #[error("logical block {logical_idx} out of bounds (table has {num_blocks} blocks)")]
    BlockIndexOutOfBounds { logical_idx: usize, num_blocks: usize },

    /// Request not known to the engine.
    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    /// Request rejected at submission.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// A single request needs more blocks than the whole pool holds.
    #[error(
        "request {request_id} needs {blocks_needed} blocks but the pool only has {num_blocks}"
    )]
    CapacityExceeded {
        request_id: RequestId,
        blocks_needed: usize,
        num_blocks: usize,
    },

    /// The engine no longer accepts requests.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Model execution failed or returned a malformed batch.
    #[error("model execution error: {0}")]
    Model(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
