//! Round-robin beat pacemaker.
//!
//! The pacemaker drives proposing through the core's signal surface: it
//! proposes when its replica is the current view's proposer and the echo
//! quorum for its previous proposal has completed (the `qc_finish` signal).
//! Policy only — all safety lives in the core.

use std::collections::VecDeque;
use tessera_bft::{ReplicaCore, Ticket};
use tessera_core::{Action, SafetyViolation};
use tessera_types::Hash;
use tracing::debug;

pub struct Pacemaker {
    /// Commands awaiting inclusion in a proposal.
    queue: VecDeque<Hash>,
    /// Last proposed block and the ticket for its echo quorum.
    inflight: Option<(Hash, Ticket)>,
    /// Propose empty blocks when the queue is drained.
    propose_idle: bool,
}

impl Pacemaker {
    pub fn new(propose_idle: bool) -> Self {
        Self {
            queue: VecDeque::new(),
            inflight: None,
            propose_idle,
        }
    }

    /// Queue a command for a future proposal.
    pub fn submit(&mut self, cmd: Hash) {
        self.queue.push_back(cmd);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Give the pacemaker a chance to propose. Called by the runner after
    /// every event its replica processes.
    pub fn beat(&mut self, core: &mut ReplicaCore) -> Result<Vec<Action>, SafetyViolation> {
        if core.is_view_trans() {
            return Ok(vec![]);
        }
        if core.config().proposer_for(core.view()) != core.id() {
            return Ok(vec![]);
        }
        if let Some((blk_hash, ticket)) = self.inflight {
            if !core.poll_qc_finish(&blk_hash, ticket) {
                return Ok(vec![]);
            }
            self.inflight = None;
        }
        let cmds = match self.queue.pop_front() {
            Some(cmd) => vec![cmd],
            None if self.propose_idle => vec![],
            None => return Ok(vec![]),
        };

        let parent = core.highest_tail();
        match core.on_propose(cmds.clone(), vec![parent], vec![])? {
            Some((prop, actions)) => {
                let blk_hash = prop.block.hash();
                self.inflight = Some((blk_hash, core.watch_qc_finish(&blk_hash)));
                Ok(actions)
            }
            None => {
                debug!(replica = %core.id(), "proposal refused, requeueing");
                if let Some(cmd) = cmds.first() {
                    self.queue.push_front(*cmd);
                }
                Ok(vec![])
            }
        }
    }
}
