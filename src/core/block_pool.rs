//! Fixed-size pool of physical KV cache blocks.
//!
//! ## Features
//!
//! - **Free list allocation**: O(1) block allocation and deallocation
//! - **Reference counting**: a block returns to the free list only when its
//!   last referencing table lets go of it
//!
//! At every observation point `num_free_blocks() + num_used_blocks()` equals
//! `num_blocks()`.
//!
//! ## Example
//!
//! ```
//! use minivllm::core::block_pool::BlockPool;
//!
//! let mut pool = BlockPool::new(2, 16);
//!
//! let block_id = pool.allocate().unwrap();
//! assert_eq!(pool.num_free_blocks(), 1);
//!
//! pool.free(block_id).unwrap();
//! assert_eq!(pool.num_free_blocks(), 2);
//! ```

use std::collections::VecDeque;

use crate::core::block::PhysicalBlock;
use crate::error::{Error, Result};

/// Owns every physical block and the list of unreferenced ones.
#[derive(Debug)]
pub struct BlockPool {
    /// All blocks indexed by block_id.
    blocks: Vec<PhysicalBlock>,
    /// Free block IDs.
    free_list: VecDeque<usize>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockPool {
    /// Create a pool of `num_blocks` blocks holding `block_size` tokens each.
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self {
            blocks: (0..num_blocks)
                .map(|id| PhysicalBlock::new(id, block_size))
                .collect(),
            free_list: (0..num_blocks).collect(),
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Get the number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Get the number of blocks with a non-zero reference count.
    pub fn num_used_blocks(&self) -> usize {
        self.blocks.len() - self.free_list.len()
    }

    /// Check if a specific number of blocks can be allocated.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_list.len() >= num_blocks
    }

    /// Get a block by index.
    pub fn get_block(&self, block_id: usize) -> Option<&PhysicalBlock> {
        self.blocks.get(block_id)
    }

    /// Allocate a single block. The caller becomes its sole referencer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if no free blocks are available.
    ///
    /// ```
    /// use minivllm::core::block_pool::BlockPool;
    ///
    /// let mut pool = BlockPool::new(1, 16);
    /// pool.allocate().unwrap();
    ///
    /// // Second allocation fails
    /// assert!(pool.allocate().is_err());
    /// ```
    pub fn allocate(&mut self) -> Result<usize> {
        let block_id = self.free_list.pop_front().ok_or(Error::OutOfBlocks)?;
        let block = &mut self.blocks[block_id];
        debug_assert!(block.is_free(), "block {block_id} on free list is referenced");
        block.increment_ref();
        Ok(block_id)
    }

    /// Drop one reference to a block.
    ///
    /// # Returns
    ///
    /// `true` if the block went back to the free list, `false` if it is
    /// still referenced elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBlock`] if the index is out of range or the
    /// block is already free.
    pub fn free(&mut self, block_id: usize) -> Result<bool> {
        let num_blocks = self.blocks.len();
        let block = self
            .blocks
            .get_mut(block_id)
            .filter(|block| !block.is_free())
            .ok_or(Error::InvalidBlock {
                block_id,
                num_blocks,
            })?;

        if block.decrement_ref() == 0 {
            self.free_list.push_back(block_id);
            return Ok(true);
        }
        Ok(false)
    }

    /// Add a reference to an allocated block so that it can be shared
    /// between block tables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBlock`] if the block is out of range or free.
    pub fn increment_ref(&mut self, block_id: usize) -> Result<usize> {
        let num_blocks = self.blocks.len();
        self.blocks
            .get_mut(block_id)
            .filter(|block| !block.is_free())
            .map(PhysicalBlock::increment_ref)
            .ok_or(Error::InvalidBlock {
                block_id,
                num_blocks,
            })
    }
}
