//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - FCFS admission gated on running slots and free KV cache blocks
//! - Continuous batching (iteration-level scheduling)
//! - Preemption of groups that run out of blocks

pub mod batch;

pub use batch::{Scheduler, SchedulerOutputs};
