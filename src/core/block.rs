//! Block abstractions for PagedAttention.
//!
//! PagedAttention divides KV cache into fixed-size blocks, similar to
//! how operating systems manage virtual memory with pages. A sequence never
//! owns blocks directly; it owns a [`BlockTable`] of block indices handed out
//! by the [`BlockPool`](super::block_pool::BlockPool).

use crate::core::block_pool::BlockPool;
use crate::error::{Error, Result};

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// A fixed-size chunk of KV cache memory.
///
/// Each block stores KV states for `block_size` tokens. A block with a
/// reference count of zero sits on the pool's free list.
#[derive(Debug, Clone)]
pub struct PhysicalBlock {
    /// Index of this block in the pool.
    block_id: usize,
    /// Number of tokens this block can hold.
    block_size: usize,
    /// Number of block tables referencing this block.
    ref_count: usize,
}

impl PhysicalBlock {
    /// Create a new, unreferenced block.
    pub fn new(block_id: usize, block_size: usize) -> Self {
        Self {
            block_id,
            block_size,
            ref_count: 0,
        }
    }

    /// Get the block ID.
    pub fn block_id(&self) -> usize {
        self.block_id
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Whether the block is on the free list.
    pub fn is_free(&self) -> bool {
        self.ref_count == 0
    }

    /// Increment reference count.
    pub fn increment_ref(&mut self) -> usize {
        self.ref_count += 1;
        self.ref_count
    }

    /// Decrement reference count.
    ///
    /// # Returns
    ///
    /// The new reference count after decrementing.
    pub fn decrement_ref(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}

/// Maps a sequence's logical positions to physical block IDs.
///
/// Think of this like a page table in virtual memory:
/// - Logical block index: Position in the sequence (0, 1, 2, ...)
/// - Physical block ID: Actual block in the global cache pool
///
/// Token at position `p` is stored in:
/// - Logical block: `p / block_size`
/// - Slot within block: `p % block_size`
/// - Physical block: `block_ids[p / block_size]`
///
/// The table grows lazily: [`ensure_capacity_for_next_token`] is called
/// before every token a sequence produces and allocates only when the
/// current blocks cannot hold one more token.
///
/// # Example
///
/// ```
/// use minivllm::core::block::BlockTable;
/// use minivllm::core::block_pool::BlockPool;
///
/// let mut pool = BlockPool::new(4, 2);
/// let mut table = BlockTable::new(2);
///
/// // A 3-token prompt about to produce its 4th token needs 2 blocks.
/// assert_eq!(table.ensure_capacity_for_next_token(3, &mut pool).unwrap(), 2);
/// assert_eq!(pool.num_free_blocks(), 2);
///
/// table.release(&mut pool).unwrap();
/// assert_eq!(pool.num_free_blocks(), 4);
/// ```
///
/// [`ensure_capacity_for_next_token`]: BlockTable::ensure_capacity_for_next_token
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    /// Physical block IDs in logical order.
    block_ids: Vec<usize>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of tokens the allocated blocks can hold.
    pub fn capacity(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    /// Get physical block ID for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockIndexOutOfBounds`] if the logical block index
    /// is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<usize> {
        self.block_ids
            .get(logical_block_idx)
            .copied()
            .ok_or(Error::BlockIndexOutOfBounds {
                logical_idx: logical_block_idx,
                num_blocks: self.block_ids.len(),
            })
    }

    /// Number of blocks allocated to this sequence.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Get all physical block IDs for this sequence.
    pub fn get_physical_block_ids(&self) -> &[usize] {
        &self.block_ids
    }

    /// Blocks that must still be allocated before a sequence of
    /// `current_len` tokens can produce one more token.
    pub fn blocks_needed_for_next_token(&self, current_len: usize) -> usize {
        compute_num_blocks(current_len + 1, self.block_size).saturating_sub(self.block_ids.len())
    }

    /// Make room for the token a sequence of `current_len` tokens is about
    /// to produce.
    ///
    /// Allocation is all-or-nothing: when the pool cannot supply every
    /// missing block the table is left untouched.
    ///
    /// # Returns
    ///
    /// Number of blocks newly allocated (0 if the table already had room).
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if the pool has too few free blocks.
    pub fn ensure_capacity_for_next_token(
        &mut self,
        current_len: usize,
        pool: &mut BlockPool,
    ) -> Result<usize> {
        let missing = self.blocks_needed_for_next_token(current_len);
        if missing == 0 {
            return Ok(0);
        }
        if !pool.can_allocate(missing) {
            return Err(Error::OutOfBlocks);
        }

        for _ in 0..missing {
            let block_id = pool.allocate()?;
            self.block_ids.push(block_id);
        }
        Ok(missing)
    }

    /// Return every block to the pool and empty the table.
    ///
    /// Calling this on an empty table is a no-op, so releasing twice never
    /// double-frees.
    ///
    /// # Returns
    ///
    /// Number of blocks whose reference count dropped to zero.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::InvalidBlock`] from the pool. Every other
    /// block is still returned and the table is emptied.
    pub fn release(&mut self, pool: &mut BlockPool) -> Result<usize> {
        let mut freed = 0;
        let mut first_err = None;
        for &block_id in &self.block_ids {
            match pool.free(block_id) {
                Ok(true) => freed += 1,
                Ok(false) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        self.block_ids.clear();

        match first_err {
            Some(e) => Err(e),
            None => Ok(freed),
        }
    }

    /// Get physical slot indices for all tokens in the sequence.
    ///
    /// Returns a list where `slot_mapping[i]` is the global slot index
    /// for token `i`. Used for writing KV to the cache.
    ///
    /// Global slot = `block_id * block_size + slot_within_block`
    pub fn get_slot_mapping(&self, seq_len: usize) -> Vec<usize> {
        let mut slots = Vec::with_capacity(seq_len);

        for pos in 0..seq_len {
            let logical_block = pos / self.block_size;
            let slot_in_block = pos % self.block_size;

            if let Some(&physical_block) = self.block_ids.get(logical_block) {
                slots.push(physical_block * self.block_size + slot_in_block);
            }
        }

        slots
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use minivllm::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);  // 35 tokens -> 3 blocks
/// assert_eq!(compute_num_blocks(32, 16), 2);  // 32 tokens -> 2 blocks exactly
/// assert_eq!(compute_num_blocks(0, 16), 0);   // 0 tokens -> 0 blocks
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}
