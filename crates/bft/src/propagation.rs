//! Reliable block propagation (Echo/Ack) and the pre-commit engine.
//!
//! Voting is gated on a two-phase reliable broadcast. The first quorum
//! (echoes) certifies that enough replicas hold the block; the second
//! (acks) certifies that enough replicas saw the first quorum. A replica
//! votes only after the second quorum, so any honest voter can later show
//! another honest replica a proof of block availability.
//!
//! At commit-interval boundaries the echo fan-out is a full broadcast and
//! the completed propagation additionally arms the pre-commit timer for the
//! block referenced by the proposal's embedded QC. The pre-commit quorum is
//! the only trigger that commits blocks.

use crate::replica::ReplicaCore;
use tessera_core::{Action, SafetyViolation, TimerId};
use tessera_messages::{Ack, Echo, PreCommit, PropagateOp, Proposal};
use tessera_types::{pre_commit_obj_hash, propagate_obj_hash, Hash};
use tracing::{debug, info, trace, warn};

impl ReplicaCore {
    // ═══════════════════════════════════════════════════════════════════════
    // Echo phase
    // ═══════════════════════════════════════════════════════════════════════

    /// Start reliable propagation for a delivered block.
    ///
    /// Boundary heights broadcast the echo to everyone and arm the `3Δ`
    /// propagation timer; other heights unicast to the current proposer,
    /// the only replica that needs to aggregate them.
    pub(crate) fn propagate_blk(&mut self, blk_hash: Hash, height: u32) -> Vec<Action> {
        debug!(replica = %self.id, blk = ?blk_hash, height, "propagating block");
        let echo = Echo {
            rid: self.id,
            blk_hash,
            opcode: PropagateOp::Block,
            cert: self.make_part_cert(propagate_obj_hash(&blk_hash)),
        };

        if height % self.config.commit_interval == 0 {
            let mut actions = vec![
                Action::BroadcastEcho { echo: echo.clone() },
                Action::SetTimer {
                    id: TimerId::Propagate(blk_hash),
                    duration: self.config.delta * 3,
                },
            ];
            actions.extend(self.on_receive_echo(echo));
            actions
        } else {
            let proposer = self.config.proposer_for(self.view);
            if self.id == proposer {
                self.on_receive_echo(echo)
            } else {
                vec![Action::SendEcho {
                    echo,
                    dest: proposer,
                }]
            }
        }
    }

    /// Handle an echo message; delegates certificate verification.
    pub fn on_receive_echo(&mut self, echo: Echo) -> Vec<Action> {
        let Some(public_key) = self.config.pub_key(echo.rid) else {
            warn!(replica = %self.id, rid = %echo.rid, "echo from unknown replica");
            return vec![];
        };
        if !self.pending_echos.insert((echo.blk_hash, echo.rid)) {
            trace!(blk = ?echo.blk_hash, rid = %echo.rid, "echo verification already pending");
            return vec![];
        }
        let obj_hash = propagate_obj_hash(&echo.blk_hash);
        vec![Action::VerifyEcho {
            public_key: public_key.clone(),
            echo,
            obj_hash,
        }]
    }

    /// Callback for [`Action::VerifyEcho`].
    pub fn on_echo_verified(
        &mut self,
        echo: Echo,
        valid: bool,
    ) -> Result<Vec<Action>, SafetyViolation> {
        if !self.pending_echos.remove(&(echo.blk_hash, echo.rid)) {
            warn!(rid = %echo.rid, "echo verified without pending entry");
            return Ok(vec![]);
        }
        if !valid {
            warn!(replica = %self.id, rid = %echo.rid, blk = ?echo.blk_hash, "invalid echo certificate");
            return Ok(vec![]);
        }

        let msg_hash = echo.blk_hash;
        let nmajority = self.config.nmajority;
        let (qsize, inserted) = {
            let echos = self.propagate_echos.entry(msg_hash).or_default();
            let qsize = echos.len();
            (qsize, echos.insert(echo.rid))
        };
        if !inserted {
            warn!(replica = %self.id, rid = %echo.rid, blk = ?msg_hash, "duplicate echo");
            return Ok(vec![]);
        }
        trace!(replica = %self.id, blk = ?msg_hash, echos = qsize + 1, "echo counted");

        let mut actions = Vec::new();
        if qsize + 1 == nmajority && !self.propagate_timeouts.contains(&msg_hash) {
            match echo.opcode {
                PropagateOp::Block => {
                    let (height, block) = {
                        let entry = self.get_delivered(&msg_hash)?;
                        (entry.height, entry.block.clone())
                    };
                    self.on_qc_finish(msg_hash);

                    if height % self.config.commit_interval != 0 {
                        return Ok(actions);
                    }

                    // Re-broadcast the proposal so stragglers that missed the
                    // proposer still obtain the block, then ack the quorum.
                    actions.push(Action::BroadcastProposal {
                        prop: Proposal {
                            proposer: self.id,
                            block,
                        },
                    });

                    let ack = self.make_ack(msg_hash);
                    let dests = self
                        .propagate_echos
                        .get(&msg_hash)
                        .cloned()
                        .unwrap_or_default();
                    info!(
                        replica = %self.id,
                        blk = ?msg_hash,
                        echoers = dests.len(),
                        "echo quorum reached, acking"
                    );
                    if dests.contains(&self.id) {
                        actions.extend(self.on_receive_ack(ack.clone()));
                    }
                    actions.push(Action::MulticastAck { ack, dests });
                    actions.push(Action::SetTimer {
                        id: TimerId::Ack(msg_hash),
                        duration: self.config.delta * 2,
                    });
                }
            }
        }

        if qsize + 1 > nmajority && !self.ack_timeouts.contains(&msg_hash) {
            // A straggler echoed after the quorum formed; answer it directly
            // so it can still complete its ack quorum.
            let height = self.get_delivered(&msg_hash)?.height;
            if height % self.config.commit_interval != 0 {
                return Ok(actions);
            }
            let ack = self.make_ack(msg_hash);
            if echo.rid == self.id {
                actions.extend(self.on_receive_ack(ack));
            } else {
                debug!(replica = %self.id, dest = %echo.rid, blk = ?msg_hash, "late echo, sending fresh ack");
                actions.push(Action::SendAck {
                    ack,
                    dest: echo.rid,
                });
            }
        }
        Ok(actions)
    }

    fn make_ack(&self, msg_hash: Hash) -> Ack {
        Ack {
            rid: self.id,
            blk_hash: msg_hash,
            opcode: PropagateOp::Block,
            cert: self.make_part_cert(propagate_obj_hash(&msg_hash)),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Ack phase
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle an ack message; delegates certificate verification.
    pub fn on_receive_ack(&mut self, ack: Ack) -> Vec<Action> {
        let Some(public_key) = self.config.pub_key(ack.rid) else {
            warn!(replica = %self.id, rid = %ack.rid, "ack from unknown replica");
            return vec![];
        };
        if !self.pending_acks.insert((ack.blk_hash, ack.rid)) {
            trace!(blk = ?ack.blk_hash, rid = %ack.rid, "ack verification already pending");
            return vec![];
        }
        let obj_hash = propagate_obj_hash(&ack.blk_hash);
        vec![Action::VerifyAck {
            public_key: public_key.clone(),
            ack,
            obj_hash,
        }]
    }

    /// Callback for [`Action::VerifyAck`].
    pub fn on_ack_verified(
        &mut self,
        ack: Ack,
        valid: bool,
    ) -> Result<Vec<Action>, SafetyViolation> {
        if !self.pending_acks.remove(&(ack.blk_hash, ack.rid)) {
            warn!(rid = %ack.rid, "ack verified without pending entry");
            return Ok(vec![]);
        }
        if !valid {
            warn!(replica = %self.id, rid = %ack.rid, blk = ?ack.blk_hash, "invalid ack certificate");
            return Ok(vec![]);
        }

        let msg_hash = ack.blk_hash;
        let nmajority = self.config.nmajority;
        let acks = self.propagate_acks.entry(msg_hash).or_default();
        let qsize = acks.len();
        if qsize >= nmajority {
            trace!(blk = ?msg_hash, "ack after quorum, dropping");
            return Ok(vec![]);
        }
        if !acks.insert(ack.rid) {
            warn!(replica = %self.id, rid = %ack.rid, blk = ?msg_hash, "duplicate ack");
            return Ok(vec![]);
        }
        trace!(replica = %self.id, blk = ?msg_hash, acks = qsize + 1, "ack counted");

        if qsize + 1 == nmajority && !self.ack_timeouts.contains(&msg_hash) {
            match ack.opcode {
                PropagateOp::Block => return self.on_propose_propagated(msg_hash),
            }
        }
        Ok(vec![])
    }

    /// Both propagation quorums completed: the block is reliably held by a
    /// quorum. This is where the replica actually votes, and where the
    /// pre-commit timer is armed for a referenced block.
    pub(crate) fn on_propose_propagated(
        &mut self,
        blk_hash: Hash,
    ) -> Result<Vec<Action>, SafetyViolation> {
        if self.view_trans {
            debug!(replica = %self.id, blk = ?blk_hash, "propagated during view transition, ignoring");
            return Ok(vec![]);
        }
        let qc_ref = self.get_delivered(&blk_hash)?.qc_ref;
        info!(replica = %self.id, blk = ?blk_hash, "block propagated");

        let mut actions = if self.vote_disabled {
            Vec::new()
        } else {
            self.vote(blk_hash)
        };
        if let Some(qc_ref) = qc_ref {
            actions.push(Action::SetTimer {
                id: TimerId::PreCommit(qc_ref),
                duration: self.config.delta * 2,
            });
        }
        Ok(actions)
    }

    /// Issue a vote: self-deliver, then broadcast.
    fn vote(&mut self, blk_hash: Hash) -> Vec<Action> {
        debug!(replica = %self.id, blk = ?blk_hash, "voting");
        let vote = tessera_messages::Vote {
            voter: self.id,
            blk_hash,
            cert: self.make_part_cert(tessera_types::vote_obj_hash(&blk_hash)),
        };
        let mut actions = self.on_receive_vote(vote.clone());
        actions.push(Action::BroadcastVote { vote });
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Propagation timers
    // ═══════════════════════════════════════════════════════════════════════

    /// The echo-phase timer fired; late echo quorums no longer re-broadcast.
    pub fn on_propagate_timeout(&mut self, msg_hash: Hash) -> Vec<Action> {
        trace!(replica = %self.id, blk = ?msg_hash, "propagation timer fired");
        self.propagate_timeouts.insert(msg_hash);
        vec![]
    }

    /// The ack-phase timer fired; late echoes no longer earn fresh acks.
    pub fn on_ack_timeout(&mut self, msg_hash: Hash) -> Vec<Action> {
        trace!(replica = %self.id, blk = ?msg_hash, "ack timer fired");
        self.ack_timeouts.insert(msg_hash);
        vec![]
    }

    /// Whether the echo-phase timer for `msg_hash` has fired.
    pub fn is_propagate_timeout(&self, msg_hash: &Hash) -> bool {
        self.propagate_timeouts.contains(msg_hash)
    }

    /// Whether the ack-phase timer for `msg_hash` has fired.
    pub fn is_ack_timeout(&self, msg_hash: &Hash) -> bool {
        self.ack_timeouts.contains(msg_hash)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pre-commit engine
    // ═══════════════════════════════════════════════════════════════════════

    /// The pre-commit delay elapsed: broadcast and self-deliver a
    /// PreCommit for the block.
    pub fn on_pre_commit_timeout(&mut self, blk_hash: Hash) -> Vec<Action> {
        debug!(replica = %self.id, blk = ?blk_hash, "pre-commit timer fired");
        let pc = PreCommit {
            rid: self.id,
            blk_hash,
            cert: self.make_part_cert(pre_commit_obj_hash(&blk_hash)),
        };
        let mut actions = vec![Action::BroadcastPreCommit { pc: pc.clone() }];
        actions.extend(self.on_receive_pre_commit(pc));
        actions
    }

    /// Handle a pre-commit message; delegates certificate verification.
    pub fn on_receive_pre_commit(&mut self, pc: PreCommit) -> Vec<Action> {
        let Some(public_key) = self.config.pub_key(pc.rid) else {
            warn!(replica = %self.id, rid = %pc.rid, "pre-commit from unknown replica");
            return vec![];
        };
        if !self.pending_pre_commits.insert((pc.blk_hash, pc.rid)) {
            trace!(blk = ?pc.blk_hash, rid = %pc.rid, "pre-commit verification already pending");
            return vec![];
        }
        let obj_hash = pre_commit_obj_hash(&pc.blk_hash);
        vec![Action::VerifyPreCommit {
            public_key: public_key.clone(),
            pc,
            obj_hash,
        }]
    }

    /// Callback for [`Action::VerifyPreCommit`]. Exactly at quorum, the
    /// block commits.
    pub fn on_pre_commit_verified(
        &mut self,
        pc: PreCommit,
        valid: bool,
    ) -> Result<Vec<Action>, SafetyViolation> {
        if !self.pending_pre_commits.remove(&(pc.blk_hash, pc.rid)) {
            warn!(rid = %pc.rid, "pre-commit verified without pending entry");
            return Ok(vec![]);
        }
        if !valid {
            warn!(replica = %self.id, rid = %pc.rid, blk = ?pc.blk_hash, "invalid pre-commit certificate");
            return Ok(vec![]);
        }

        let nmajority = self.config.nmajority;
        let blk_hash = pc.blk_hash;
        let entry = self.get_delivered_mut(&blk_hash)?;
        let qsize = entry.pre_committed.len();
        if qsize >= nmajority {
            trace!(blk = ?blk_hash, "pre-commit after quorum, dropping");
            return Ok(vec![]);
        }
        if !entry.pre_committed.insert(pc.rid) {
            warn!(replica = %self.id, rid = %pc.rid, blk = ?blk_hash, "duplicate pre-commit");
            return Ok(vec![]);
        }

        if qsize + 1 == nmajority {
            info!(replica = %self.id, blk = ?blk_hash, "pre-commit quorum reached");
            return self.check_commit(blk_hash);
        }
        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{exec, exec_actions, group, keypair};
    use tessera_core::Event;
    use tessera_types::ReplicaId;

    fn make_echo(from: usize, blk_hash: Hash) -> Echo {
        Echo {
            rid: ReplicaId(from as u16),
            blk_hash,
            opcode: PropagateOp::Block,
            cert: tessera_types::PartialCert::create(
                &keypair(from),
                propagate_obj_hash(&blk_hash),
            ),
        }
    }

    fn make_ack_from(from: usize, blk_hash: Hash) -> Ack {
        Ack {
            rid: ReplicaId(from as u16),
            blk_hash,
            opcode: PropagateOp::Block,
            cert: tessera_types::PartialCert::create(
                &keypair(from),
                propagate_obj_hash(&blk_hash),
            ),
        }
    }

    /// Propose a block on core 0 and return its hash. Leaves core 0 with
    /// its own echo counted.
    fn propose_b1(core: &mut crate::ReplicaCore) -> Hash {
        let genesis = core.genesis();
        let (prop, actions) = core
            .on_propose(vec![Hash::digest(b"c1")], vec![genesis], vec![])
            .unwrap()
            .unwrap();
        exec_actions(core, actions);
        prop.block.hash()
    }

    #[test]
    fn echo_quorum_triggers_rebroadcast_and_acks() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let b1 = propose_b1(core);

        // Second echo: below quorum, nothing happens.
        let actions = exec(core, Event::EchoReceived { echo: make_echo(1, b1) });
        assert!(actions.is_empty());

        // Third echo completes the quorum.
        let actions = exec(core, Event::EchoReceived { echo: make_echo(2, b1) });
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::BroadcastProposal { .. })));
        let dests = actions
            .iter()
            .find_map(|a| match a {
                Action::MulticastAck { dests, .. } => Some(dests.clone()),
                _ => None,
            })
            .expect("multicast ack");
        assert_eq!(dests.len(), 3);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SetTimer { id: TimerId::Ack(_), .. })));
    }

    #[test]
    fn late_echo_straggler_gets_fresh_ack() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let b1 = propose_b1(core);
        exec(core, Event::EchoReceived { echo: make_echo(1, b1) });
        exec(core, Event::EchoReceived { echo: make_echo(2, b1) });

        // Replica 3 echoes after the quorum but before the ack timer.
        let actions = exec(core, Event::EchoReceived { echo: make_echo(3, b1) });
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, Action::SendAck { dest, .. } if *dest == ReplicaId(3))),
            "straggler did not receive a fresh ack: {actions:?}"
        );
    }

    #[test]
    fn late_echo_after_ack_timeout_is_ignored() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let b1 = propose_b1(core);
        exec(core, Event::EchoReceived { echo: make_echo(1, b1) });
        exec(core, Event::EchoReceived { echo: make_echo(2, b1) });
        exec(core, Event::AckTimeout { msg_hash: b1 });

        let actions = exec(core, Event::EchoReceived { echo: make_echo(3, b1) });
        assert!(
            !actions.iter().any(|a| matches!(a, Action::SendAck { .. })),
            "ack sent after ack timeout"
        );
    }

    #[test]
    fn echo_quorum_after_propagate_timeout_does_not_rebroadcast() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let b1 = propose_b1(core);
        exec(core, Event::EchoReceived { echo: make_echo(1, b1) });
        exec(core, Event::PropagateTimeout { msg_hash: b1 });

        let actions = exec(core, Event::EchoReceived { echo: make_echo(2, b1) });
        assert!(
            !actions
                .iter()
                .any(|a| matches!(a, Action::BroadcastProposal { .. })),
            "re-broadcast after propagation timeout"
        );
    }

    #[test]
    fn ack_quorum_votes_and_fires_once() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let b1 = propose_b1(core);

        // Ack quorum from {1, 2, 3} (our own ack path is independent here).
        exec(core, Event::AckReceived { ack: make_ack_from(1, b1) });
        exec(core, Event::AckReceived { ack: make_ack_from(2, b1) });
        let actions = exec(core, Event::AckReceived { ack: make_ack_from(3, b1) });
        let votes: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, Action::BroadcastVote { .. }))
            .collect();
        assert_eq!(votes.len(), 1, "vote not issued exactly once");
        assert!(core.block(&b1).unwrap().voted.contains(&ReplicaId(0)));

        // A straggling ack after the quorum must not re-trigger anything.
        let mut cores2 = group(4, 1, 1);
        let core2 = &mut cores2[0];
        let b1b = propose_b1(core2);
        for from in 1..=3 {
            exec(core2, Event::AckReceived { ack: make_ack_from(from, b1b) });
        }
        // All 3 counted; a 4th distinct ack arrives post-quorum.
        let actions = exec(
            core2,
            Event::AckReceived { ack: make_ack_from(0, b1b) },
        );
        assert!(
            !actions.iter().any(|a| matches!(a, Action::BroadcastVote { .. })),
            "vote issued twice for one block"
        );
    }

    #[test]
    fn vote_disabled_suppresses_voting() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        core.set_vote_disabled(true);
        let b1 = propose_b1(core);
        for from in 1..=3 {
            let actions = exec(core, Event::AckReceived { ack: make_ack_from(from, b1) });
            assert!(!actions.iter().any(|a| matches!(a, Action::BroadcastVote { .. })));
        }
    }

    #[test]
    fn propagated_block_with_qc_ref_arms_pre_commit_timer() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let b1 = propose_b1(core);

        // Form a vote quorum on B1 so hqc advances past genesis.
        for voter in 0..3u16 {
            let vote = tessera_messages::Vote {
                voter: ReplicaId(voter),
                blk_hash: b1,
                cert: tessera_types::PartialCert::create(
                    &keypair(voter as usize),
                    tessera_types::vote_obj_hash(&b1),
                ),
            };
            exec(core, Event::VoteReceived { vote });
        }
        assert_eq!(*core.hqc().0, b1);

        // The next proposal embeds the fresh QC; completing its ack quorum
        // must arm the pre-commit timer for B1.
        let (prop2, actions) = core
            .on_propose(vec![Hash::digest(b"c2")], vec![b1], vec![])
            .unwrap()
            .unwrap();
        exec_actions(core, actions);
        let b2 = prop2.block.hash();
        assert_eq!(prop2.block.qc_ref_hash, Some(b1));

        let mut timer_armed = false;
        for from in 1..=3 {
            let actions = exec(core, Event::AckReceived { ack: make_ack_from(from, b2) });
            timer_armed |= actions.iter().any(
                |a| matches!(a, Action::SetTimer { id: TimerId::PreCommit(h), .. } if *h == b1),
            );
        }
        assert!(timer_armed, "pre-commit timer for qc_ref not armed");

        // Firing the timer broadcasts a PreCommit and self-delivers it.
        let actions = exec(core, Event::PreCommitTimeout { blk_hash: b1 });
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::BroadcastPreCommit { .. })));
        assert!(core.block(&b1).unwrap().pre_committed.contains(&ReplicaId(0)));
    }
}
