//! Block manager for PagedAttention.
//!
//! The BlockManager owns the [`BlockPool`] and one [`BlockTable`] per
//! sequence, similar to how an operating system keeps one page table per
//! process over a shared set of physical pages. The scheduler consults it
//! for admission decisions and the engine asks it to grow tables before
//! each token is produced.
//!
//! ## Example
//!
//! ```
//! use minivllm::core::block_manager::BlockManager;
//!
//! let mut manager = BlockManager::new(4, 2);
//!
//! // Sequence 7 has a 3-token prompt and is about to produce a token.
//! manager.ensure_capacity_for_next_token(7, 3).unwrap();
//! assert_eq!(manager.num_free_blocks(), 2);
//!
//! // Free when done
//! manager.free(7).unwrap();
//! assert_eq!(manager.num_free_blocks(), 4);
//! ```

use std::collections::HashMap;

use crate::core::block::{compute_num_blocks, BlockTable};
use crate::core::block_pool::BlockPool;
use crate::core::sequence::SequenceId;
use crate::error::Result;

/// Connects sequences to their block tables over a shared pool.
#[derive(Debug)]
pub struct BlockManager {
    /// Physical blocks and free list.
    pool: BlockPool,
    /// Block table per live sequence.
    block_tables: HashMap<SequenceId, BlockTable>,
}

impl BlockManager {
    /// Create a new block manager with the specified capacity.
    ///
    /// # Arguments
    ///
    /// * `num_blocks` - Total number of blocks to manage
    /// * `block_size` - Number of tokens per block
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self {
            pool: BlockPool::new(num_blocks, block_size),
            block_tables: HashMap::new(),
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    /// Get the total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.pool.num_blocks()
    }

    /// Get the number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.pool.num_free_blocks()
    }

    /// Get the number of used blocks.
    pub fn num_used_blocks(&self) -> usize {
        self.pool.num_used_blocks()
    }

    /// Check if a specific number of blocks can be allocated.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.pool.can_allocate(num_blocks)
    }

    /// Read access to the underlying pool.
    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    /// Get the block table of a sequence, if it holds one.
    pub fn block_table(&self, seq_id: SequenceId) -> Option<&BlockTable> {
        self.block_tables.get(&seq_id)
    }

    /// Number of sequences currently holding a block table.
    pub fn num_block_tables(&self) -> usize {
        self.block_tables.len()
    }

    /// Create an empty block table for a sequence. No blocks are taken.
    pub fn allocate(&mut self, seq_id: SequenceId) {
        let block_size = self.pool.block_size();
        self.block_tables
            .entry(seq_id)
            .or_insert_with(|| BlockTable::new(block_size));
    }

    /// Blocks a sequence of `current_len` tokens still needs before it can
    /// produce one more token.
    pub fn blocks_needed_for_next_token(&self, seq_id: SequenceId, current_len: usize) -> usize {
        match self.block_tables.get(&seq_id) {
            Some(table) => table.blocks_needed_for_next_token(current_len),
            None => compute_num_blocks(current_len + 1, self.pool.block_size()),
        }
    }

    /// Grow a sequence's table so it can hold one more token.
    ///
    /// # Returns
    ///
    /// Number of blocks newly allocated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`](crate::Error::OutOfBlocks) without
    /// modifying the table when the pool is short.
    pub fn ensure_capacity_for_next_token(
        &mut self,
        seq_id: SequenceId,
        current_len: usize,
    ) -> Result<usize> {
        let block_size = self.pool.block_size();
        let table = self
            .block_tables
            .entry(seq_id)
            .or_insert_with(|| BlockTable::new(block_size));
        table.ensure_capacity_for_next_token(current_len, &mut self.pool)
    }

    /// Release a sequence's blocks and drop its table.
    ///
    /// Unknown sequences are ignored, so freeing twice is harmless.
    ///
    /// # Returns
    ///
    /// Number of blocks returned to the free list.
    pub fn free(&mut self, seq_id: SequenceId) -> Result<usize> {
        match self.block_tables.remove(&seq_id) {
            Some(mut table) => table.release(&mut self.pool),
            None => Ok(0),
        }
    }
}
