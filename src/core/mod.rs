//! Core infrastructure for minivllm.
//!
//! This module contains the fundamental building blocks:
//! - PhysicalBlock and BlockTable for PagedAttention
//! - BlockPool for the free list and reference counts
//! - BlockManager for per-sequence block tables
//! - Sequence and SequenceGroup for request tracking

pub mod block;
pub mod block_manager;
pub mod block_pool;
pub mod sequence;
