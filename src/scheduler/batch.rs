//! Continuous batching scheduler.
//!
//! The scheduler manages the lifecycle of inference requests, re-forming the
//! running batch on every tick under two limits at once: the number of
//! running groups and the free blocks in the KV cache pool.
//!
//! ## Scheduling Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Scheduler Flow                               │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//!   add_sequence_group()                            schedule()
//!        │                                              │
//!        ▼                                              ▼
//!   ┌─────────┐                                   ┌─────────────┐
//!   │ Waiting │ ──────────────────────────────────► │  Running   │
//!   │  FIFO   │  (slot free and blocks reservable)  │    Set     │
//!   └─────────┘                                     └─────────────┘
//!        ▲                                              │
//!        │          reserve_running_blocks()            │
//!        └──────────────────────────────────────────────┘
//!              (group cannot get its next block)
//! ```
//!
//! ## Example
//!
//! ```
//! use minivllm::config::{SamplingConfig, SchedulerConfig};
//! use minivllm::core::sequence::{Sequence, SequenceGroup};
//! use minivllm::scheduler::batch::Scheduler;
//!
//! let mut scheduler = Scheduler::new(SchedulerConfig { max_num_seqs: 2 }, 16, 64);
//!
//! for id in 0..3 {
//!     let seq = Sequence::new(id, vec![1, 2, 3, 4]);
//!     let group = SequenceGroup::new(id, vec![seq], id, SamplingConfig::default());
//!     scheduler.add_sequence_group(group);
//! }
//!
//! let outputs = scheduler.schedule();
//! assert_eq!(outputs.scheduled, vec![0, 1]);
//! assert_eq!(scheduler.waiting_request_ids(), vec![2]);
//! ```

use std::collections::{HashMap, VecDeque};

use tracing::{debug, error, warn};

use crate::config::SchedulerConfig;
use crate::core::block::compute_num_blocks;
use crate::core::block_manager::BlockManager;
use crate::core::sequence::{FinishReason, RequestId, SequenceGroup, SequenceStatus};
use crate::error::{Error, Result};

/// Output of a scheduling step.
#[derive(Debug, Default)]
pub struct SchedulerOutputs {
    /// Groups in the running batch this tick, in arrival order.
    pub scheduled: Vec<RequestId>,
    /// Groups moved from waiting to running this tick.
    pub admitted: Vec<RequestId>,
    /// Groups returned to the waiting queue because a block was unavailable.
    pub preempted: Vec<RequestId>,
    /// Groups finished because they cannot fit in the pool even alone.
    /// They stay in the running set until
    /// [`Scheduler::free_finished_request`] is called for them.
    pub infeasible: Vec<RequestId>,
}

impl SchedulerOutputs {
    /// Create empty scheduler outputs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if there are any groups to run.
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Number of groups to run.
    pub fn num_groups(&self) -> usize {
        self.scheduled.len()
    }
}

/// Continuous batching scheduler.
///
/// Manages sequence groups through their lifecycle:
/// - Waiting: In the FCFS queue, holding no blocks
/// - Running: In the active batch, block tables grown on demand
/// - Finished: Removed via [`free_finished_request`](Self::free_finished_request)
pub struct Scheduler {
    /// Configuration.
    config: SchedulerConfig,
    /// Block manager for KV cache allocation.
    block_manager: BlockManager,
    /// All live groups, waiting or running.
    groups: HashMap<RequestId, SequenceGroup>,
    /// Waiting request IDs ordered by arrival.
    waiting: VecDeque<RequestId>,
    /// Running request IDs ordered by arrival.
    running: Vec<RequestId>,
}

impl Scheduler {
    /// Create a new scheduler.
    ///
    /// # Arguments
    ///
    /// * `config` - Scheduler configuration
    /// * `block_size` - Number of tokens per block
    /// * `num_blocks` - Total number of blocks available
    pub fn new(config: SchedulerConfig, block_size: usize, num_blocks: usize) -> Self {
        Self {
            config,
            block_manager: BlockManager::new(num_blocks, block_size),
            groups: HashMap::new(),
            waiting: VecDeque::new(),
            running: Vec::new(),
        }
    }

    /// Add a new group to the tail of the waiting queue.
    ///
    /// No blocks are reserved until the group is admitted.
    pub fn add_sequence_group(&mut self, group: SequenceGroup) {
        let request_id = group.request_id();
        self.groups.insert(request_id, group);
        self.insert_waiting(request_id);
    }

    /// Get a reference to a group.
    pub fn get_group(&self, request_id: RequestId) -> Option<&SequenceGroup> {
        self.groups.get(&request_id)
    }

    /// Get a mutable reference to a group.
    pub fn get_group_mut(&mut self, request_id: RequestId) -> Option<&mut SequenceGroup> {
        self.groups.get_mut(&request_id)
    }

    /// Blocks a group must still acquire before each of its active
    /// sequences can produce one more token.
    fn blocks_needed_for_next_token(&self, group: &SequenceGroup) -> usize {
        group
            .seqs()
            .iter()
            .filter(|seq| seq.status().is_active())
            .map(|seq| {
                self.block_manager
                    .blocks_needed_for_next_token(seq.seq_id(), seq.total_len())
            })
            .sum()
    }

    /// Blocks a group would hold in total after its next token.
    fn total_blocks_for_next_token(&self, group: &SequenceGroup) -> usize {
        let block_size = self.block_manager.block_size();
        group
            .seqs()
            .iter()
            .filter(|seq| seq.status().is_active())
            .map(|seq| compute_num_blocks(seq.total_len() + 1, block_size))
            .sum()
    }

    /// Schedule the next iteration.
    ///
    /// Admits waiting groups in strict arrival order while both a running
    /// slot and enough free blocks remain, then returns the running set.
    /// Blocks still owed to already-running groups for their next token are
    /// reserved before any admission, so admitting never starves a running
    /// group. Infeasible admission is deferred, never an error.
    pub fn schedule(&mut self) -> SchedulerOutputs {
        let mut outputs = SchedulerOutputs::new();

        let mut reserved: usize = self
            .running
            .iter()
            .filter_map(|id| self.groups.get(id))
            .map(|group| self.blocks_needed_for_next_token(group))
            .sum();

        while self.running.len() < self.config.max_num_seqs {
            let Some(&request_id) = self.waiting.front() else {
                break;
            };
            let Some(group) = self.groups.get(&request_id) else {
                self.waiting.pop_front();
                continue;
            };

            let needed = self.blocks_needed_for_next_token(group);
            if !self.block_manager.can_allocate(reserved + needed) {
                debug!(
                    request_id,
                    needed,
                    reserved,
                    free = self.block_manager.num_free_blocks(),
                    "deferring admission, not enough free blocks"
                );
                break;
            }

            self.waiting.pop_front();
            if let Some(group) = self.groups.get_mut(&request_id) {
                let admitted = group.set_running();
                debug_assert!(admitted.is_ok(), "admitting {request_id}: {admitted:?}");
                for seq in group.get_seqs(SequenceStatus::Running) {
                    self.block_manager.allocate(seq.seq_id());
                }
            }
            self.insert_running(request_id);
            reserved += needed;
            outputs.admitted.push(request_id);
            debug!(request_id, blocks = needed, "admitted request");
        }

        outputs.scheduled = self.running.clone();
        outputs
    }

    /// Grow the block table of every running sequence so it can hold the
    /// token it is about to produce.
    ///
    /// Groups are served in arrival order. A group that cannot get its
    /// blocks is preempted: its blocks are released and it goes back to the
    /// waiting queue ahead of every later arrival. A group that could not fit
    /// even with the whole pool to itself is finished with
    /// [`FinishReason::CapacityExceeded`] instead of being retried forever.
    ///
    /// # Errors
    ///
    /// Only programmer errors from the block pool are returned; running out
    /// of blocks is handled here.
    pub fn reserve_running_blocks(&mut self, outputs: &mut SchedulerOutputs) -> Result<()> {
        for request_id in self.running.clone() {
            let Some(group) = self.groups.get(&request_id) else {
                continue;
            };
            let targets: Vec<_> = group
                .get_seqs(SequenceStatus::Running)
                .map(|seq| (seq.seq_id(), seq.total_len()))
                .collect();

            let mut out_of_blocks = false;
            for (seq_id, total_len) in targets {
                match self
                    .block_manager
                    .ensure_capacity_for_next_token(seq_id, total_len)
                {
                    Ok(_) => {}
                    Err(Error::OutOfBlocks) => {
                        out_of_blocks = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !out_of_blocks {
                continue;
            }

            let blocks_needed = self
                .groups
                .get(&request_id)
                .map_or(0, |group| self.total_blocks_for_next_token(group));
            if blocks_needed > self.block_manager.num_blocks() {
                let err = Error::CapacityExceeded {
                    request_id,
                    blocks_needed,
                    num_blocks: self.block_manager.num_blocks(),
                };
                error!(request_id, "{err}, finishing request");
                if let Some(group) = self.groups.get_mut(&request_id) {
                    group.set_finished(FinishReason::CapacityExceeded);
                }
                self.release_group_blocks(request_id)?;
                outputs.infeasible.push(request_id);
            } else {
                self.preempt(request_id)?;
                outputs.preempted.push(request_id);
            }
            outputs.scheduled.retain(|&id| id != request_id);
        }
        Ok(())
    }

    /// Move a running group back to the waiting queue, releasing its blocks.
    ///
    /// Generated tokens are kept; their cache is recomputed once the group
    /// is admitted again.
    fn preempt(&mut self, request_id: RequestId) -> Result<()> {
        self.release_group_blocks(request_id)?;
        self.running.retain(|&id| id != request_id);
        if let Some(group) = self.groups.get_mut(&request_id) {
            group.set_waiting()?;
        }
        self.insert_waiting(request_id);
        warn!(
            request_id,
            free = self.block_manager.num_free_blocks(),
            "preempted request, out of KV cache blocks"
        );
        Ok(())
    }

    /// Remove a finished group from the running set and release its blocks.
    ///
    /// Safe to call more than once and for unknown requests. Groups still in
    /// the waiting queue are left alone.
    ///
    /// # Returns
    ///
    /// The removed group, if it was running.
    pub fn free_finished_request(
        &mut self,
        request_id: RequestId,
    ) -> Result<Option<SequenceGroup>> {
        if !self.running.contains(&request_id) {
            return Ok(None);
        }
        self.release_group_blocks(request_id)?;
        self.running.retain(|&id| id != request_id);
        Ok(self.groups.remove(&request_id))
    }

    /// Withdraw a request.
    ///
    /// A waiting request is dropped from the queue; a running one is
    /// finished immediately and its blocks released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] for unknown requests.
    pub fn abort_request(&mut self, request_id: RequestId) -> Result<SequenceGroup> {
        if let Some(pos) = self.waiting.iter().position(|&id| id == request_id) {
            self.waiting.remove(pos);
        } else if self.running.contains(&request_id) {
            self.release_group_blocks(request_id)?;
            self.running.retain(|&id| id != request_id);
        } else {
            return Err(Error::RequestNotFound(request_id));
        }

        let mut group = self
            .groups
            .remove(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        group.set_finished(FinishReason::Aborted);
        Ok(group)
    }

    fn release_group_blocks(&mut self, request_id: RequestId) -> Result<()> {
        let Some(group) = self.groups.get(&request_id) else {
            return Ok(());
        };
        for seq in group.seqs() {
            self.block_manager.free(seq.seq_id())?;
        }
        Ok(())
    }

    fn arrival_order(&self, request_id: RequestId) -> u64 {
        self.groups
            .get(&request_id)
            .map_or(u64::MAX, SequenceGroup::arrival_order)
    }

    fn insert_waiting(&mut self, request_id: RequestId) {
        let order = self.arrival_order(request_id);
        let pos = self
            .waiting
            .iter()
            .position(|&id| self.arrival_order(id) > order)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(pos, request_id);
    }

    fn insert_running(&mut self, request_id: RequestId) {
        let order = self.arrival_order(request_id);
        let pos = self
            .running
            .partition_point(|&id| self.arrival_order(id) < order);
        self.running.insert(pos, request_id);
    }

    /// Get number of waiting groups.
    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Get number of running groups.
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Waiting request IDs, head of the queue first.
    pub fn waiting_request_ids(&self) -> Vec<RequestId> {
        self.waiting.iter().copied().collect()
    }

    /// Running request IDs in arrival order.
    pub fn running_request_ids(&self) -> &[RequestId] {
        &self.running
    }

    /// Check if there are pending requests (waiting or running).
    pub fn has_pending_requests(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty()
    }

    /// Get the scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get block manager reference.
    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }
}
