//! View-change engine: blame aggregation, BlameNotify, view transition.
//!
//! A replica blames the current view when the no-progress timer fires or
//! when it detects proposer equivocation. A quorum of blames finalizes the
//! blame QC, broadcasts a `BlameNotify` carrying the highest certified
//! block, stops commit timers, and arms the `2Δ` transition timer. When
//! that fires the view advances, per-view state resets, and the new view's
//! blame timer starts.

use crate::replica::ReplicaCore;
use tessera_core::{Action, TimerId};
use tessera_messages::{Blame, BlameNotify, Notify};
use tessera_types::{blame_obj_hash, vote_obj_hash, QuorumCert};
use tracing::{debug, info, trace, warn};

impl ReplicaCore {
    /// Blame the current view: stop the blame timer, self-deliver, and
    /// broadcast.
    pub(crate) fn blame(&mut self) -> Vec<Action> {
        let blame = Blame {
            blamer: self.id,
            view: self.view,
            cert: self.make_part_cert(blame_obj_hash(self.view)),
        };
        let mut actions = vec![Action::CancelTimer { id: TimerId::Blame }];
        actions.extend(self.on_receive_blame(blame.clone()));
        actions.push(Action::BroadcastBlame { blame });
        actions
    }

    /// Handle a blame message; delegates certificate verification.
    pub fn on_receive_blame(&mut self, blame: Blame) -> Vec<Action> {
        if self.view_trans {
            debug!(replica = %self.id, "blame during view transition, dropping");
            return vec![];
        }
        let Some(public_key) = self.config.pub_key(blame.blamer) else {
            warn!(replica = %self.id, blamer = %blame.blamer, "blame from unknown replica");
            return vec![];
        };
        if !self.pending_blames.insert((blame.view, blame.blamer)) {
            trace!(view = blame.view, blamer = %blame.blamer, "blame verification already pending");
            return vec![];
        }
        let obj_hash = blame_obj_hash(blame.view);
        vec![Action::VerifyBlame {
            public_key: public_key.clone(),
            blame,
            obj_hash,
        }]
    }

    /// Callback for [`Action::VerifyBlame`]. Exactly at quorum, the view
    /// change begins.
    pub fn on_blame_verified(&mut self, blame: Blame, valid: bool) -> Vec<Action> {
        if !self.pending_blames.remove(&(blame.view, blame.blamer)) {
            warn!(blamer = %blame.blamer, "blame verified without pending entry");
            return vec![];
        }
        if !valid {
            warn!(replica = %self.id, blamer = %blame.blamer, view = blame.view, "invalid blame certificate");
            return vec![];
        }
        if self.view_trans {
            debug!(replica = %self.id, "blame during view transition, dropping");
            return vec![];
        }
        if blame.view != self.view {
            warn!(
                replica = %self.id,
                got = blame.view,
                current = self.view,
                "blame for another view, dropping"
            );
            return vec![];
        }

        let qsize = self.blamed.len();
        if qsize >= self.config.nmajority {
            trace!(view = self.view, "blame after quorum, dropping");
            return vec![];
        }
        if !self.blamed.insert(blame.blamer) {
            warn!(replica = %self.id, blamer = %blame.blamer, "duplicate blame");
            return vec![];
        }
        if let Err(err) = self.blame_qc.add_part(blame.blamer, &blame.cert) {
            warn!(blamer = %blame.blamer, %err, "blame certificate rejected by aggregate");
            self.blamed.remove(&blame.blamer);
            return vec![];
        }
        debug!(
            replica = %self.id,
            view = self.view,
            blames = qsize + 1,
            "blame counted"
        );

        if qsize + 1 == self.config.nmajority {
            return self.new_view();
        }
        vec![]
    }

    /// A quorum blamed the view: finalize the blame QC, broadcast
    /// `BlameNotify`, stop commit timers, and enter the transition period.
    fn new_view(&mut self) -> Vec<Action> {
        info!(replica = %self.id, view = self.view, "preparing new view");
        self.blame_qc.compute();
        let bn = BlameNotify {
            view: self.view,
            hqc_hash: self.hqc.0,
            hqc_qc: self.hqc.1.clone(),
            qc: self.blame_qc.clone(),
        };
        self.view_trans = true;
        self.view_trans_signal.resolve(());

        vec![
            Action::BroadcastBlameNotify { bn },
            Action::CancelCommitTimers,
            Action::SetTimer {
                id: TimerId::ViewTransition,
                duration: self.config.delta * 2,
            },
        ]
    }

    /// Handle a blame-notify message; delegates verification of both
    /// certificates it carries.
    pub fn on_receive_blamenotify(&mut self, bn: BlameNotify) -> Vec<Action> {
        if self.view_trans {
            debug!(replica = %self.id, "blame-notify during view transition, dropping");
            return vec![];
        }
        if bn.view != self.view {
            warn!(
                replica = %self.id,
                got = bn.view,
                current = self.view,
                "blame-notify for another view, dropping"
            );
            return vec![];
        }
        let signers = bn.qc.signers().chain(bn.hqc_qc.signers());
        let Some(public_keys) = self.config.signer_keys(signers) else {
            warn!(replica = %self.id, "blame-notify has unknown signer");
            return vec![];
        };
        let hqc_genesis = self.is_genesis_qc(&bn.hqc_qc, &bn.hqc_hash);
        let blame_obj = blame_obj_hash(bn.view);
        let hqc_obj = vote_obj_hash(&bn.hqc_hash);
        vec![Action::VerifyBlameNotify {
            bn,
            public_keys,
            quorum: self.config.nmajority,
            blame_obj_hash: blame_obj,
            hqc_obj_hash: hqc_obj,
            hqc_genesis,
        }]
    }

    /// Callback for [`Action::VerifyBlameNotify`]. Adopting the carried
    /// blame QC lets a replica transition without having blamed itself.
    pub fn on_blamenotify_verified(&mut self, bn: BlameNotify, valid: bool) -> Vec<Action> {
        if !valid {
            warn!(replica = %self.id, view = bn.view, "invalid blame-notify");
            return vec![];
        }
        if self.view_trans {
            debug!(replica = %self.id, "view transition already underway, dropping blame-notify");
            return vec![];
        }
        if bn.view != self.view {
            warn!(replica = %self.id, got = bn.view, current = self.view, "stale blame-notify");
            return vec![];
        }
        self.blame_qc = bn.qc;
        self.new_view()
    }

    /// No progress for `3Δ`: blame the current view.
    pub fn on_blame_timeout(&mut self) -> Vec<Action> {
        info!(replica = %self.id, view = self.view, "no progress, start blaming");
        self.blame()
    }

    /// The transition period elapsed: enter the next view, reset per-view
    /// state, restart the blame timer, and notify laggards of the hqc.
    pub fn on_viewtrans_timeout(&mut self) -> Vec<Action> {
        self.view += 1;
        self.view_trans = false;
        self.proposals.clear();
        self.blamed.clear();
        self.blame_qc = QuorumCert::new(blame_obj_hash(self.view));
        let view = self.view;
        self.pending_blames.retain(|(v, _)| *v >= view);

        info!(replica = %self.id, view = self.view, "entering view");
        self.view_change_signal.resolve(self.view);

        let notify = Notify {
            blk_hash: self.hqc.0,
            qc: self.hqc.1.clone(),
        };
        vec![
            Action::SetTimer {
                id: TimerId::Blame,
                duration: self.config.delta * 3,
            },
            Action::Notify { notify },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{exec, group, keypair};
    use tessera_core::Event;
    use tessera_messages::Proposal;
    use tessera_types::{Block, Hash, PartialCert, ReplicaId};

    fn make_blame(from: usize, view: u32) -> Blame {
        Blame {
            blamer: ReplicaId(from as u16),
            view,
            cert: PartialCert::create(&keypair(from), blame_obj_hash(view)),
        }
    }

    #[test]
    fn equivocation_triggers_blame_not_vote() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[1];
        let genesis = core.genesis();

        let b1a = Block::new(vec![genesis], vec![Hash::digest(b"a")], None, vec![], 1);
        let b1b = Block::new(vec![genesis], vec![Hash::digest(b"b")], None, vec![], 1);
        let b1b_hash = b1b.hash();
        assert!(core.on_deliver_blk(b1a.clone()));
        assert!(core.on_deliver_blk(b1b.clone()));

        let actions = exec(
            core,
            Event::ProposalReceived {
                prop: Proposal {
                    proposer: ReplicaId(0),
                    block: b1a,
                },
            },
        );
        assert!(actions.iter().any(|a| matches!(a, Action::BroadcastEcho { .. })));
        assert_eq!(core.vheight(), 1);

        let actions = exec(
            core,
            Event::ProposalReceived {
                prop: Proposal {
                    proposer: ReplicaId(0),
                    block: b1b,
                },
            },
        );
        // The second proposal is recorded for the equivocation proof but is
        // neither voted for nor propagated.
        assert!(actions.iter().any(|a| matches!(a, Action::BroadcastBlame { .. })));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::BroadcastEcho { echo } if echo.blk_hash == b1b_hash)));
        assert_eq!(core.vheight(), 1);
        assert!(core.blamed().contains(&ReplicaId(1)));
    }

    #[test]
    fn blame_quorum_enters_transition_and_timer_completes_it() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let trans_ticket = core.watch_view_trans();
        let change_ticket = core.watch_view_change();

        // Own blame via timeout, then two more.
        let actions = exec(core, Event::BlameTimeout);
        assert!(actions.iter().any(|a| matches!(a, Action::BroadcastBlame { .. })));
        exec(core, Event::BlameReceived { blame: make_blame(1, 0) });
        assert!(!core.is_view_trans());

        let actions = exec(core, Event::BlameReceived { blame: make_blame(2, 0) });
        assert!(core.is_view_trans());
        assert!(core.poll_view_trans(trans_ticket));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::BroadcastBlameNotify { .. })));
        assert!(actions.iter().any(|a| matches!(a, Action::CancelCommitTimers)));

        // A fourth blame after the quorum is absorbed.
        let actions = exec(core, Event::BlameReceived { blame: make_blame(3, 0) });
        assert!(actions.is_empty());

        // Transition timer completes the view change.
        let actions = exec(core, Event::ViewTransTimeout);
        assert_eq!(core.view(), 1);
        assert!(!core.is_view_trans());
        assert_eq!(core.poll_view_change(change_ticket), Some(1));
        assert!(actions.iter().any(|a| matches!(a, Action::Notify { .. })));
        assert!(actions.iter().any(
            |a| matches!(a, Action::SetTimer { id: TimerId::Blame, .. })
        ));
    }

    #[test]
    fn blamenotify_transitions_replica_that_did_not_blame() {
        let mut cores = group(4, 1, 1);

        // Build a valid blame QC from replicas 0..3 on a side core.
        // The BlameNotify was broadcast when the quorum formed on core 0;
        // rebuild it from that core's state instead of capturing actions.
        let bn = {
            let side = &mut cores[0];
            for from in 0..3 {
                exec(side, Event::BlameReceived { blame: make_blame(from, 0) });
            }
            assert!(side.is_view_trans());
            BlameNotify {
                view: 0,
                hqc_hash: side.genesis(),
                hqc_qc: side.hqc().1.clone(),
                qc: side.blame_qc().clone(),
            }
        };

        let core = &mut cores[3];
        assert!(!core.is_view_trans());
        exec(core, Event::BlameNotifyReceived { bn });
        assert!(core.is_view_trans());

        exec(core, Event::ViewTransTimeout);
        assert_eq!(core.view(), 1);
    }

    #[test]
    fn stale_view_blame_is_dropped() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        exec(core, Event::BlameReceived { blame: make_blame(1, 5) });
        assert!(core.blamed().is_empty());
    }
}
