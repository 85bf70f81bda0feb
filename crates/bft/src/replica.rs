//! The replica state machine: delivery, proposing, voting, committing.
//!
//! The propagation engine lives in `propagation.rs` and the view-change
//! engine in `view_change.rs`; both are `impl ReplicaCore` blocks over the
//! state defined here.

use crate::signals::{Signal, Ticket};
use crate::store::{BlockStore, Decision};
use crate::BlockEntry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tessera_core::{Action, Event, SafetyViolation, StateMachine, TimerId};
use tessera_messages::{Finality, Notify, Proposal, Vote};
use tessera_types::{
    vote_obj_hash, Block, ConfigError, Hash, KeyPair, PartialCert, QuorumCert, ReplicaConfig,
    ReplicaId, ReplicaInfo,
};
use tracing::{debug, error, info, trace, warn};

/// Core replication state machine for one replica.
///
/// Construct with [`ReplicaCore::new`], register the replica set with
/// [`ReplicaCore::add_replica`], then call [`ReplicaCore::on_init`] once
/// before feeding events.
pub struct ReplicaCore {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════
    pub(crate) id: ReplicaId,
    pub(crate) key_pair: KeyPair,
    pub(crate) config: ReplicaConfig,

    // ═══════════════════════════════════════════════════════════════════════
    // Chain state
    // ═══════════════════════════════════════════════════════════════════════
    pub(crate) store: BlockStore,
    /// Genesis block hash.
    pub(crate) b0: Hash,
    /// Highest certified block and its QC.
    pub(crate) hqc: (Hash, QuorumCert),
    /// Last executed block.
    pub(crate) b_exec: Hash,
    /// Height of the highest block voted for. Strictly monotonic.
    pub(crate) vheight: u32,
    pub(crate) view: u32,
    /// True while between views.
    pub(crate) view_trans: bool,
    /// The block whose QC was last embedded into a proposal.
    pub(crate) last_qc_ref: Hash,
    /// Leaf blocks, ordered by height.
    pub(crate) tails: BTreeSet<(u32, Hash)>,

    // ═══════════════════════════════════════════════════════════════════════
    // Per-view state
    // ═══════════════════════════════════════════════════════════════════════
    /// Proposals seen per height; two entries at one height is equivocation.
    pub(crate) proposals: HashMap<u32, HashSet<Hash>>,
    /// Blocks whose proposal processing already ran.
    pub(crate) finished_propose: HashSet<Hash>,
    /// Replicas whose blame for the current view was accepted.
    pub(crate) blamed: BTreeSet<ReplicaId>,
    /// Accumulating QC over `BLAME(view)`.
    pub(crate) blame_qc: QuorumCert,

    // ═══════════════════════════════════════════════════════════════════════
    // Propagation state
    // ═══════════════════════════════════════════════════════════════════════
    pub(crate) propagate_echos: HashMap<Hash, BTreeSet<ReplicaId>>,
    pub(crate) propagate_acks: HashMap<Hash, BTreeSet<ReplicaId>>,
    /// Blocks whose echo-phase timer has fired.
    pub(crate) propagate_timeouts: HashSet<Hash>,
    /// Blocks whose ack-phase timer has fired.
    pub(crate) ack_timeouts: HashSet<Hash>,

    // ═══════════════════════════════════════════════════════════════════════
    // In-flight verification (dedup keys; the message rides the callback)
    // ═══════════════════════════════════════════════════════════════════════
    pub(crate) pending_votes: HashSet<(Hash, ReplicaId)>,
    pub(crate) pending_blames: HashSet<(u32, ReplicaId)>,
    pub(crate) pending_echos: HashSet<(Hash, ReplicaId)>,
    pub(crate) pending_acks: HashSet<(Hash, ReplicaId)>,
    pub(crate) pending_pre_commits: HashSet<(Hash, ReplicaId)>,
    /// Proposals parked while their embedded QC verifies.
    pub(crate) pending_proposals: HashMap<Hash, Proposal>,

    // ═══════════════════════════════════════════════════════════════════════
    // Signal surface
    // ═══════════════════════════════════════════════════════════════════════
    pub(crate) qc_waiting: HashMap<Hash, Signal<()>>,
    pub(crate) propose_signal: Signal<Proposal>,
    pub(crate) receive_proposal_signal: Signal<Proposal>,
    pub(crate) hqc_signal: Signal<Hash>,
    pub(crate) view_change_signal: Signal<u32>,
    pub(crate) view_trans_signal: Signal<()>,

    // ═══════════════════════════════════════════════════════════════════════
    // Feature switches & clock
    // ═══════════════════════════════════════════════════════════════════════
    /// Never vote; useful for some pacemakers.
    pub(crate) vote_disabled: bool,
    pub(crate) initialized: bool,
    pub(crate) now: Duration,
}

impl ReplicaCore {
    /// Create a replica core with an empty replica set.
    pub fn new(id: ReplicaId, key_pair: KeyPair, config: ReplicaConfig) -> Self {
        let mut store = BlockStore::new();
        let b0 = store.add_blk(Block::genesis());
        {
            let genesis = store.find_mut(&b0).expect("genesis just inserted");
            genesis.delivered = true;
        }
        let hqc_qc = QuorumCert::self_certified(vote_obj_hash(&b0));

        Self {
            id,
            key_pair,
            config,
            store,
            b0,
            hqc: (b0, hqc_qc),
            b_exec: b0,
            vheight: 0,
            view: 0,
            view_trans: false,
            last_qc_ref: b0,
            tails: BTreeSet::from([(0, b0)]),
            proposals: HashMap::new(),
            finished_propose: HashSet::new(),
            blamed: BTreeSet::new(),
            blame_qc: QuorumCert::new(tessera_types::blame_obj_hash(0)),
            propagate_echos: HashMap::new(),
            propagate_acks: HashMap::new(),
            propagate_timeouts: HashSet::new(),
            ack_timeouts: HashSet::new(),
            pending_votes: HashSet::new(),
            pending_blames: HashSet::new(),
            pending_echos: HashSet::new(),
            pending_acks: HashSet::new(),
            pending_pre_commits: HashSet::new(),
            pending_proposals: HashMap::new(),
            qc_waiting: HashMap::new(),
            propose_signal: Signal::new(),
            receive_proposal_signal: Signal::new(),
            hqc_signal: Signal::new(),
            view_change_signal: Signal::new(),
            view_trans_signal: Signal::new(),
            vote_disabled: false,
            initialized: false,
            now: Duration::ZERO,
        }
    }

    /// Register a replica. Only legal before [`ReplicaCore::on_init`].
    pub fn add_replica(&mut self, info: ReplicaInfo) {
        let rid = info.id;
        self.config.add_replica(info);
        if let Some(genesis) = self.store.find_mut(&self.b0) {
            genesis.voted.insert(rid);
        }
    }

    /// Initialize the protocol: derive the quorum threshold, self-certify
    /// genesis, and arm the first blame timer.
    pub fn on_init(
        &mut self,
        nfaulty: usize,
        delta: Duration,
    ) -> Result<Vec<Action>, ConfigError> {
        self.config.on_init(nfaulty, delta)?;

        let qc = QuorumCert::self_certified(vote_obj_hash(&self.b0));
        let b0 = self.b0;
        if let Some(genesis) = self.store.find_mut(&b0) {
            genesis.self_qc = Some(qc.clone());
            genesis.qc_ref = Some(b0);
        }
        self.hqc = (b0, qc);
        self.last_qc_ref = b0;
        self.blame_qc = QuorumCert::new(tessera_types::blame_obj_hash(self.view));
        self.initialized = true;

        info!(
            replica = %self.id,
            nreplicas = self.config.nreplicas(),
            nmajority = self.config.nmajority,
            delta_ms = delta.as_millis() as u64,
            commit_interval = self.config.commit_interval,
            "initialized replica core"
        );

        Ok(vec![Action::SetTimer {
            id: TimerId::Blame,
            duration: self.config.delta * 3,
        }])
    }

    /// Disable (or re-enable) voting.
    pub fn set_vote_disabled(&mut self, flag: bool) {
        self.vote_disabled = flag;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Delivery
    // ═══════════════════════════════════════════════════════════════════════

    /// Inform the core that a block is ready to be handled.
    ///
    /// A block is delivered only if all of its parents are delivered and
    /// the block referenced by its embedded QC is present. Invalid blocks
    /// are dropped; re-delivery is a no-op. Returns `true` if delivered.
    pub fn on_deliver_blk(&mut self, block: Block) -> bool {
        let hash = block.hash();
        if let Some(entry) = self.store.find(&hash) {
            if entry.delivered {
                warn!(replica = %self.id, blk = ?hash, "attempt to deliver a block twice");
                return false;
            }
        }
        if block.parent_hashes.is_empty() {
            warn!(replica = %self.id, blk = ?hash, "dropping foreign parentless block");
            return false;
        }

        // Every parent must already be delivered.
        let mut parent_tails = Vec::with_capacity(block.parent_hashes.len());
        for parent in &block.parent_hashes {
            match self.store.find(parent) {
                Some(entry) if entry.delivered => parent_tails.push((entry.height, *parent)),
                _ => {
                    warn!(
                        replica = %self.id,
                        blk = ?hash,
                        parent = ?parent,
                        "dropping block with undelivered parent"
                    );
                    return false;
                }
            }
        }
        let height = parent_tails[0].0 + 1;
        if block.height != height {
            warn!(
                replica = %self.id,
                blk = ?hash,
                claimed = block.height,
                derived = height,
                "dropping block with inconsistent height"
            );
            return false;
        }

        // The block referenced by the embedded QC must be present.
        let qc_ref = match (&block.qc, &block.qc_ref_hash) {
            (Some(_), Some(qc_ref_hash)) => {
                if !self.store.contains(qc_ref_hash) {
                    warn!(
                        replica = %self.id,
                        blk = ?hash,
                        qc_ref = ?qc_ref_hash,
                        "dropping block whose qc_ref is not fetched"
                    );
                    return false;
                }
                Some(*qc_ref_hash)
            }
            (None, None) => None,
            _ => {
                warn!(replica = %self.id, blk = ?hash, "dropping block with dangling qc fields");
                return false;
            }
        };

        let parents = block.parent_hashes.clone();
        let hash = self.store.add_blk(block);
        let entry = self.store.find_mut(&hash).expect("block just inserted");
        entry.parents = parents;
        entry.height = height;
        entry.qc_ref = qc_ref;
        entry.delivered = true;

        for parent in parent_tails {
            self.tails.remove(&parent);
        }
        self.tails.insert((height, hash));

        debug!(replica = %self.id, blk = ?hash, height, "delivered block");
        true
    }

    pub(crate) fn get_delivered(&self, hash: &Hash) -> Result<&BlockEntry, SafetyViolation> {
        match self.store.find(hash) {
            Some(entry) if entry.delivered => Ok(entry),
            _ => Err(SafetyViolation::BlockNotDelivered(*hash)),
        }
    }

    pub(crate) fn get_delivered_mut(
        &mut self,
        hash: &Hash,
    ) -> Result<&mut BlockEntry, SafetyViolation> {
        match self.store.find_mut(hash) {
            Some(entry) if entry.delivered => Ok(entry),
            _ => Err(SafetyViolation::BlockNotDelivered(*hash)),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Highest QC
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn update_hqc(&mut self, blk_hash: Hash, qc: &QuorumCert) {
        debug_assert_eq!(qc.obj_hash(), vote_obj_hash(&blk_hash));
        let Some(new_height) = self.store.find(&blk_hash).map(|e| e.height) else {
            return;
        };
        let cur_height = self
            .store
            .find(&self.hqc.0)
            .map(|e| e.height)
            .unwrap_or(0);
        if new_height > cur_height {
            debug!(
                replica = %self.id,
                blk = ?blk_hash,
                height = new_height,
                "updated highest QC"
            );
            self.hqc = (blk_hash, qc.clone());
            self.hqc_signal.resolve(blk_hash);
        }
    }

    /// Fast path for the genesis self-certification: the only QC with an
    /// empty signer set the protocol ever accepts.
    pub(crate) fn is_genesis_qc(&self, qc: &QuorumCert, blk_hash: &Hash) -> bool {
        qc.is_self_certified() && *blk_hash == self.b0
    }

    pub(crate) fn on_qc_finish(&mut self, blk_hash: Hash) {
        trace!(replica = %self.id, blk = ?blk_hash, "qc finish");
        self.qc_waiting.entry(blk_hash).or_default().resolve(());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Proposing
    // ═══════════════════════════════════════════════════════════════════════

    /// Submit new commands to be replicated. `parents[0]` is the actual
    /// parent; the rest are uncles. Returns `None` when proposing is
    /// illegal in the current state (view transition).
    pub fn on_propose(
        &mut self,
        cmds: Vec<Hash>,
        parents: Vec<Hash>,
        extra: Vec<u8>,
    ) -> Result<Option<(Proposal, Vec<Action>)>, SafetyViolation> {
        if !self.initialized {
            warn!(replica = %self.id, "propose before on_init");
            return Ok(None);
        }
        if self.view_trans {
            warn!(replica = %self.id, "pacemaker tried to propose during view transition");
            return Ok(None);
        }
        if parents.is_empty() {
            return Err(SafetyViolation::EmptyParents);
        }
        for parent in &parents {
            self.get_delivered(parent)?;
        }

        let parent_height = self.get_delivered(&parents[0])?.height;
        let height = parent_height + 1;
        let is_commit_height = height % self.config.commit_interval == 0;
        let embed = is_commit_height && self.last_qc_ref != self.hqc.0;

        let block = Block::new(
            parents,
            cmds,
            embed.then(|| (self.hqc.0, self.hqc.1.clone())),
            extra,
            height,
        );
        if is_commit_height {
            self.last_qc_ref = self.hqc.0;
        }

        let blk_hash = block.hash();
        if !self.on_deliver_blk(block.clone()) {
            warn!(replica = %self.id, blk = ?blk_hash, "proposed block failed delivery");
            return Ok(None);
        }
        if let Some(entry) = self.store.find_mut(&blk_hash) {
            entry.self_qc = Some(QuorumCert::new(vote_obj_hash(&blk_hash)));
        }

        // Self-vote height bookkeeping: the new block must be higher than
        // anything voted for.
        if height <= self.vheight {
            error!(
                replica = %self.id,
                height,
                vheight = self.vheight,
                "proposed block does not exceed voted height"
            );
            return Err(SafetyViolation::VoteHeightRegression {
                attempted: height,
                current: self.vheight,
            });
        }
        self.vheight = height;
        self.finished_propose.insert(blk_hash);

        let prop = Proposal {
            proposer: self.id,
            block,
        };
        info!(
            replica = %self.id,
            blk = ?blk_hash,
            height,
            embeds_qc = embed,
            "proposing block"
        );

        let mut actions = self.propagate_blk(blk_hash, height);
        self.propose_signal.resolve(prop.clone());
        actions.push(Action::SetTimer {
            id: TimerId::Blame,
            duration: self.config.delta * 3,
        });
        actions.push(Action::BroadcastProposal { prop: prop.clone() });
        Ok(Some((prop, actions)))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Proposal reception
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle a proposal message. The block must already be delivered.
    pub fn on_receive_proposal(
        &mut self,
        prop: Proposal,
    ) -> Result<Vec<Action>, SafetyViolation> {
        if self.view_trans {
            debug!(replica = %self.id, "dropping proposal during view transition");
            return Ok(vec![]);
        }
        let blk_hash = prop.block.hash();
        if self.finished_propose.contains(&blk_hash) {
            return Ok(vec![]);
        }
        self.get_delivered(&blk_hash)?;
        debug!(
            replica = %self.id,
            proposer = %prop.proposer,
            blk = ?blk_hash,
            height = prop.block.height,
            "received proposal"
        );

        match (&prop.block.qc, &prop.block.qc_ref_hash) {
            (Some(qc), Some(qc_ref_hash)) if !self.is_genesis_qc(qc, qc_ref_hash) => {
                // The embedded QC must check out before it can move hqc.
                if self.pending_proposals.contains_key(&blk_hash) {
                    trace!(blk = ?blk_hash, "proposal QC verification already pending");
                    return Ok(vec![]);
                }
                let Some(public_keys) = self.config.signer_keys(qc.signers()) else {
                    warn!(replica = %self.id, blk = ?blk_hash, "proposal QC has unknown signer");
                    return Ok(vec![]);
                };
                let action = Action::VerifyProposalQc {
                    blk_hash,
                    qc: qc.clone(),
                    public_keys,
                    quorum: self.config.nmajority,
                    obj_hash: vote_obj_hash(qc_ref_hash),
                };
                self.pending_proposals.insert(blk_hash, prop);
                Ok(vec![action])
            }
            _ => self.proceed_proposal(prop),
        }
    }

    /// Callback for [`Action::VerifyProposalQc`].
    pub fn on_proposal_qc_verified(
        &mut self,
        blk_hash: Hash,
        valid: bool,
    ) -> Result<Vec<Action>, SafetyViolation> {
        let Some(prop) = self.pending_proposals.remove(&blk_hash) else {
            warn!(blk = ?blk_hash, "proposal QC verified without pending proposal");
            return Ok(vec![]);
        };
        if !valid {
            warn!(replica = %self.id, blk = ?blk_hash, "proposal carried an invalid QC");
            return Ok(vec![]);
        }
        if self.view_trans {
            debug!(replica = %self.id, "view moved on while proposal QC verified");
            return Ok(vec![]);
        }
        if let (Some(qc), Some(qc_ref_hash)) = (&prop.block.qc, &prop.block.qc_ref_hash) {
            let (qc, qc_ref_hash) = (qc.clone(), *qc_ref_hash);
            self.update_hqc(qc_ref_hash, &qc);
        }
        self.proceed_proposal(prop)
    }

    /// Shared tail of proposal processing: the voting opinion, the
    /// equivocation check, and the hand-off to reliable propagation.
    fn proceed_proposal(&mut self, prop: Proposal) -> Result<Vec<Action>, SafetyViolation> {
        let blk_hash = prop.block.hash();
        let height = self.get_delivered(&blk_hash)?.height;
        let qc_ref = self.get_delivered(&blk_hash)?.qc_ref;

        let mut actions = Vec::new();
        let mut opinion = false;
        let mut equivocation = false;
        {
            let slot = self.proposals.entry(height).or_default();
            if slot.len() <= 1 {
                slot.insert(blk_hash);
                if slot.len() > 1 {
                    equivocation = true;
                } else {
                    opinion = true;
                }
            }
            // Third and later proposals at a height are ignored outright.
        }
        if equivocation {
            warn!(
                replica = %self.id,
                height,
                blk = ?blk_hash,
                "conflicting proposal detected, start blaming"
            );
            actions.extend(self.blame());
        }

        if opinion {
            // The proposal must extend the highest certified block.
            let pref = self.hqc.0;
            let pref_height = self.store.find(&pref).map(|e| e.height).unwrap_or(0);
            let mut cursor = blk_hash;
            loop {
                let entry = self.get_delivered(&cursor)?;
                if entry.height <= pref_height {
                    break;
                }
                match entry.primary_parent() {
                    Some(parent) => cursor = parent,
                    None => break,
                }
            }
            if cursor == pref {
                if height <= self.vheight {
                    error!(
                        replica = %self.id,
                        height,
                        vheight = self.vheight,
                        "accepted proposal would regress voted height"
                    );
                    return Err(SafetyViolation::VoteHeightRegression {
                        attempted: height,
                        current: self.vheight,
                    });
                }
                self.vheight = height;
            } else {
                debug!(
                    replica = %self.id,
                    blk = ?blk_hash,
                    "proposal does not extend highest certified block"
                );
                opinion = false;
            }
        }

        if let Some(qc_ref) = qc_ref {
            self.on_qc_finish(qc_ref);
        }
        self.finished_propose.insert(blk_hash);
        self.receive_proposal_signal.resolve(prop);

        // A non-equivocating proposal heard in this view is progress: push
        // the no-progress timer out by another 3Δ.
        if !equivocation {
            actions.push(Action::SetTimer {
                id: TimerId::Blame,
                duration: self.config.delta * 3,
            });
        }

        if opinion {
            actions.extend(self.propagate_blk(blk_hash, height));
        }
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Vote aggregation
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle a vote message; delegates certificate verification.
    pub fn on_receive_vote(&mut self, vote: Vote) -> Vec<Action> {
        let Some(public_key) = self.config.pub_key(vote.voter) else {
            warn!(replica = %self.id, voter = %vote.voter, "vote from unknown replica");
            return vec![];
        };
        let key = (vote.blk_hash, vote.voter);
        if !self.pending_votes.insert(key) {
            trace!(?key, "vote verification already pending");
            return vec![];
        }
        let obj_hash = vote_obj_hash(&vote.blk_hash);
        vec![Action::VerifyVote {
            public_key: public_key.clone(),
            vote,
            obj_hash,
        }]
    }

    /// Callback for [`Action::VerifyVote`].
    pub fn on_vote_verified(
        &mut self,
        vote: Vote,
        valid: bool,
    ) -> Result<Vec<Action>, SafetyViolation> {
        if !self.pending_votes.remove(&(vote.blk_hash, vote.voter)) {
            warn!(voter = %vote.voter, "vote verified without pending entry");
            return Ok(vec![]);
        }
        if !valid {
            warn!(replica = %self.id, voter = %vote.voter, blk = ?vote.blk_hash, "invalid vote certificate");
            return Ok(vec![]);
        }

        let mut actions = Vec::new();
        // A vote can precede its proposal; synthesize proposal processing
        // with the voter in the proposer slot so aggregation can proceed.
        if !self.finished_propose.contains(&vote.blk_hash) {
            let block = self.get_delivered(&vote.blk_hash)?.block.clone();
            debug!(
                replica = %self.id,
                blk = ?vote.blk_hash,
                voter = %vote.voter,
                "vote arrived before proposal, synthesizing"
            );
            actions.extend(self.on_receive_proposal(Proposal {
                proposer: vote.voter,
                block,
            })?);
        }

        let nmajority = self.config.nmajority;
        let blk_hash = vote.blk_hash;
        let entry = self.get_delivered_mut(&blk_hash)?;
        let qsize = entry.voted.len();
        if qsize >= nmajority {
            trace!(blk = ?blk_hash, "vote after quorum, dropping");
            return Ok(actions);
        }
        if !entry.voted.insert(vote.voter) {
            warn!(voter = %vote.voter, blk = ?blk_hash, "duplicate vote");
            return Ok(actions);
        }
        let self_qc = entry
            .self_qc
            .get_or_insert_with(|| QuorumCert::new(vote_obj_hash(&blk_hash)));
        if let Err(err) = self_qc.add_part(vote.voter, &vote.cert) {
            warn!(voter = %vote.voter, %err, "vote certificate rejected by aggregate");
            entry.voted.remove(&vote.voter);
            return Ok(actions);
        }

        if qsize + 1 == nmajority {
            self_qc.compute();
            let qc = self_qc.clone();
            info!(replica = %self.id, blk = ?blk_hash, "vote quorum reached, QC formed");
            self.update_hqc(blk_hash, &qc);
        }
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Notify (hqc catch-up)
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle a notify message; delegates QC verification.
    pub fn on_receive_notify(&mut self, notify: Notify) -> Vec<Action> {
        if self.is_genesis_qc(&notify.qc, &notify.blk_hash) {
            // Genesis is never an improvement.
            return vec![];
        }
        let Some(public_keys) = self.config.signer_keys(notify.qc.signers()) else {
            warn!(replica = %self.id, "notify QC has unknown signer");
            return vec![];
        };
        let obj_hash = vote_obj_hash(&notify.blk_hash);
        vec![Action::VerifyNotify {
            notify,
            public_keys,
            quorum: self.config.nmajority,
            obj_hash,
        }]
    }

    /// Callback for [`Action::VerifyNotify`].
    pub fn on_notify_verified(
        &mut self,
        notify: Notify,
        valid: bool,
    ) -> Result<Vec<Action>, SafetyViolation> {
        if !valid {
            warn!(replica = %self.id, blk = ?notify.blk_hash, "invalid notify QC");
            return Ok(vec![]);
        }
        self.get_delivered(&notify.blk_hash)?;
        self.update_hqc(notify.blk_hash, &notify.qc);
        Ok(vec![])
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commit
    // ═══════════════════════════════════════════════════════════════════════

    /// Commit `blk_hash` and every uncommitted ancestor down to the
    /// executed prefix, in ascending height order.
    pub(crate) fn check_commit(&mut self, blk_hash: Hash) -> Result<Vec<Action>, SafetyViolation> {
        let tip_height = self.get_delivered(&blk_hash)?.height;
        if tip_height == 0 {
            return Ok(vec![]);
        }
        let exec_height = self
            .store
            .find(&self.b_exec)
            .map(|e| e.height)
            .unwrap_or(0);
        if tip_height <= exec_height {
            trace!(blk = ?blk_hash, "already within executed prefix");
            return Ok(vec![]);
        }

        let mut queue = Vec::new();
        let mut cursor = blk_hash;
        loop {
            let entry = self.get_delivered(&cursor)?;
            if entry.height <= exec_height {
                break;
            }
            queue.push(cursor);
            match entry.primary_parent() {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        let anchored = cursor == self.b_exec
            || self
                .store
                .find(&cursor)
                .map(|e| e.decision == Decision::Committed)
                .unwrap_or(false);
        if !anchored {
            error!(
                replica = %self.id,
                tip = ?blk_hash,
                b_exec = ?self.b_exec,
                "safety breached: commit walk diverged from executed chain"
            );
            return Err(SafetyViolation::DivergentCommit {
                tip: blk_hash,
                b_exec: self.b_exec,
            });
        }

        let rid = self.id;
        let mut actions = Vec::new();
        for hash in queue.iter().rev() {
            let Some(entry) = self.store.find_mut(hash) else {
                continue;
            };
            entry.decision = Decision::Committed;
            let height = entry.height;
            let cmds = entry.block.cmds.clone();
            info!(replica = %rid, blk = ?hash, height, cmds = cmds.len(), "commit block");
            actions.push(Action::ExecuteBlock { blk_hash: *hash });
            for (idx, cmd) in cmds.iter().enumerate() {
                actions.push(Action::Decide {
                    fin: Finality {
                        rid,
                        decision: 1,
                        cmd_idx: idx as u32,
                        cmd_height: height,
                        cmd_hash: *cmd,
                        blk_hash: *hash,
                    },
                });
            }
        }
        self.b_exec = blk_hash;
        Ok(actions)
    }

    /// Commit timer fired for a block.
    pub fn on_commit_timeout(&mut self, blk_hash: Hash) -> Result<Vec<Action>, SafetyViolation> {
        self.check_commit(blk_hash)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pruning
    // ═══════════════════════════════════════════════════════════════════════

    /// Release blocks more than `staleness` primary-parent hops below the
    /// executed tip, clearing `qc_ref` back-references on the way down.
    pub fn prune(&mut self, staleness: u32) {
        let mut start = self.b_exec;
        for _ in 0..staleness {
            let Some(entry) = self.store.find(&start) else {
                return;
            };
            match entry.primary_parent() {
                Some(parent) => start = parent,
                None => return,
            }
        }

        let mut released = 0usize;
        let mut stack = vec![start];
        while let Some(hash) = stack.pop() {
            let Some(entry) = self.store.find_mut(&hash) else {
                continue;
            };
            entry.qc_ref = None;
            let height = entry.height;
            stack.extend(std::mem::take(&mut entry.parents));
            self.store.try_release_blk(&hash);
            released += 1;

            self.tails.remove(&(height, hash));
            self.finished_propose.remove(&hash);
            self.qc_waiting.remove(&hash);
            self.propagate_echos.remove(&hash);
            self.propagate_acks.remove(&hash);
            self.propagate_timeouts.remove(&hash);
            self.ack_timeouts.remove(&hash);
            if let Some(slot) = self.proposals.get_mut(&height) {
                slot.remove(&hash);
                if slot.is_empty() {
                    self.proposals.remove(&height);
                }
            }
        }
        info!(replica = %self.id, staleness, released, "pruned stale blocks");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Signal surface
    // ═══════════════════════════════════════════════════════════════════════

    /// Ticket resolved when a QC forms for `blk_hash` — immediately ready
    /// for genesis or a block whose echo quorum was already reached.
    pub fn watch_qc_finish(&mut self, blk_hash: &Hash) -> Ticket {
        let ready = self
            .store
            .find(blk_hash)
            .map(|e| e.height == 0)
            .unwrap_or(false)
            || self
                .propagate_echos
                .get(blk_hash)
                .map(|signers| signers.len() >= self.config.nmajority)
                .unwrap_or(false);
        let signal = self.qc_waiting.entry(*blk_hash).or_default();
        if ready && !signal.is_resolved() {
            signal.resolve(());
        }
        if signal.is_resolved() {
            signal.watch_ready()
        } else {
            signal.watch()
        }
    }

    pub fn poll_qc_finish(&self, blk_hash: &Hash, ticket: Ticket) -> bool {
        self.qc_waiting
            .get(blk_hash)
            .map(|signal| signal.poll(ticket).is_some())
            .unwrap_or(false)
    }

    /// Ticket resolved with the next locally-issued proposal.
    pub fn watch_proposal(&self) -> Ticket {
        self.propose_signal.watch()
    }

    pub fn poll_proposal(&self, ticket: Ticket) -> Option<Proposal> {
        self.propose_signal.poll(ticket)
    }

    /// Ticket resolved with the next externally-received proposal.
    pub fn watch_receive_proposal(&self) -> Ticket {
        self.receive_proposal_signal.watch()
    }

    pub fn poll_receive_proposal(&self, ticket: Ticket) -> Option<Proposal> {
        self.receive_proposal_signal.poll(ticket)
    }

    /// Ticket resolved with the new hqc block on every improvement.
    pub fn watch_hqc_update(&self) -> Ticket {
        self.hqc_signal.watch()
    }

    pub fn poll_hqc_update(&self, ticket: Ticket) -> Option<Hash> {
        self.hqc_signal.poll(ticket)
    }

    /// Ticket resolved with the view number after entering a new view.
    pub fn watch_view_change(&self) -> Ticket {
        self.view_change_signal.watch()
    }

    pub fn poll_view_change(&self, ticket: Ticket) -> Option<u32> {
        self.view_change_signal.poll(ticket)
    }

    /// Ticket resolved on entering the view-transition state.
    pub fn watch_view_trans(&self) -> Ticket {
        self.view_trans_signal.watch()
    }

    pub fn poll_view_trans(&self, ticket: Ticket) -> bool {
        self.view_trans_signal.poll(ticket).is_some()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn genesis(&self) -> Hash {
        self.b0
    }

    pub fn hqc(&self) -> (&Hash, &QuorumCert) {
        (&self.hqc.0, &self.hqc.1)
    }

    pub fn b_exec(&self) -> Hash {
        self.b_exec
    }

    pub fn vheight(&self) -> u32 {
        self.vheight
    }

    pub fn view(&self) -> u32 {
        self.view
    }

    pub fn is_view_trans(&self) -> bool {
        self.view_trans
    }

    /// Replicas whose blame for the current view has been accepted.
    pub fn blamed(&self) -> &BTreeSet<ReplicaId> {
        &self.blamed
    }

    /// The accumulating (or finalized) QC over `BLAME(view)`.
    pub fn blame_qc(&self) -> &QuorumCert {
        &self.blame_qc
    }

    pub fn block(&self, hash: &Hash) -> Option<&BlockEntry> {
        self.store.find(hash)
    }

    pub fn block_delivered(&self, hash: &Hash) -> bool {
        self.store.find(hash).map(|e| e.delivered).unwrap_or(false)
    }

    /// The highest leaf block (the natural parent for the next proposal).
    pub fn highest_tail(&self) -> Hash {
        self.tails
            .iter()
            .next_back()
            .map(|(_, hash)| *hash)
            .unwrap_or(self.b0)
    }

    pub fn tail_count(&self) -> usize {
        self.tails.len()
    }

    pub fn store_len(&self) -> usize {
        self.store.len()
    }

    pub(crate) fn make_part_cert(&self, obj_hash: Hash) -> PartialCert {
        PartialCert::create(&self.key_pair, obj_hash)
    }
}

impl std::fmt::Debug for ReplicaCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaCore")
            .field("id", &self.id)
            .field("view", &self.view)
            .field("view_trans", &self.view_trans)
            .field("hqc", &self.hqc.0)
            .field("b_exec", &self.b_exec)
            .field("vheight", &self.vheight)
            .field("tails", &self.tails.len())
            .field("blocks", &self.store.len())
            .field("now", &self.now)
            .finish()
    }
}

impl StateMachine for ReplicaCore {
    fn handle(&mut self, event: Event) -> Result<Vec<Action>, SafetyViolation> {
        match event {
            Event::BlameTimeout => Ok(self.on_blame_timeout()),
            Event::ViewTransTimeout => Ok(self.on_viewtrans_timeout()),
            Event::CommitTimeout { blk_hash } => self.on_commit_timeout(blk_hash),
            Event::PropagateTimeout { msg_hash } => Ok(self.on_propagate_timeout(msg_hash)),
            Event::AckTimeout { msg_hash } => Ok(self.on_ack_timeout(msg_hash)),
            Event::PreCommitTimeout { blk_hash } => Ok(self.on_pre_commit_timeout(blk_hash)),
            Event::ProposalReceived { prop } => self.on_receive_proposal(prop),
            Event::VoteReceived { vote } => Ok(self.on_receive_vote(vote)),
            Event::NotifyReceived { notify } => Ok(self.on_receive_notify(notify)),
            Event::BlameReceived { blame } => Ok(self.on_receive_blame(blame)),
            Event::BlameNotifyReceived { bn } => Ok(self.on_receive_blamenotify(bn)),
            Event::EchoReceived { echo } => Ok(self.on_receive_echo(echo)),
            Event::AckReceived { ack } => Ok(self.on_receive_ack(ack)),
            Event::PreCommitReceived { pc } => Ok(self.on_receive_pre_commit(pc)),
            Event::VoteVerified { vote, valid } => self.on_vote_verified(vote, valid),
            Event::NotifyVerified { notify, valid } => self.on_notify_verified(notify, valid),
            Event::BlameVerified { blame, valid } => Ok(self.on_blame_verified(blame, valid)),
            Event::BlameNotifyVerified { bn, valid } => {
                Ok(self.on_blamenotify_verified(bn, valid))
            }
            Event::EchoVerified { echo, valid } => self.on_echo_verified(echo, valid),
            Event::AckVerified { ack, valid } => self.on_ack_verified(ack, valid),
            Event::PreCommitVerified { pc, valid } => self.on_pre_commit_verified(pc, valid),
            Event::ProposalQcVerified { blk_hash, valid } => {
                self.on_proposal_qc_verified(blk_hash, valid)
            }
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{exec, exec_actions, group, keypair};

    fn chain_block(parent: Hash, cmd: &[u8], height: u32) -> Block {
        Block::new(vec![parent], vec![Hash::digest(cmd)], None, vec![], height)
    }

    #[test]
    fn deliver_rejects_unknown_parent() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let orphan = chain_block(Hash::digest(b"nowhere"), b"c", 1);
        assert!(!core.on_deliver_blk(orphan));
    }

    #[test]
    fn deliver_rejects_bad_height_and_redelivery() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let genesis = core.genesis();

        let skewed = chain_block(genesis, b"c", 9);
        assert!(!core.on_deliver_blk(skewed));

        let b1 = chain_block(genesis, b"c", 1);
        assert!(core.on_deliver_blk(b1.clone()));
        assert!(!core.on_deliver_blk(b1));
    }

    #[test]
    fn deliver_maintains_tails() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let genesis = core.genesis();
        let b1 = chain_block(genesis, b"c1", 1);
        let b1_hash = b1.hash();
        core.on_deliver_blk(b1);
        assert_eq!(core.highest_tail(), b1_hash);
        assert_eq!(core.tail_count(), 1);
    }

    #[test]
    fn vote_before_proposal_synthesizes_processing() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[1];
        let genesis = core.genesis();
        let b1 = chain_block(genesis, b"c1", 1);
        let b1_hash = b1.hash();
        assert!(core.on_deliver_blk(b1));

        let received = core.watch_receive_proposal();
        let vote = Vote {
            voter: ReplicaId(0),
            blk_hash: b1_hash,
            cert: PartialCert::create(&keypair(0), vote_obj_hash(&b1_hash)),
        };
        let actions = exec(core, Event::VoteReceived { vote });

        // The synthesized proposal ran: opinion formed, propagation started.
        let prop = core.poll_receive_proposal(received).expect("synthesized");
        assert_eq!(prop.proposer, ReplicaId(0));
        assert_eq!(core.vheight(), 1);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::BroadcastEcho { .. })));

        // And the vote itself was counted.
        assert!(core.block(&b1_hash).unwrap().voted.contains(&ReplicaId(0)));
    }

    #[test]
    fn vote_quorum_forms_qc_and_updates_hqc() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let genesis = core.genesis();
        let b1 = chain_block(genesis, b"c1", 1);
        let b1_hash = b1.hash();
        core.on_deliver_blk(b1);

        let hqc_ticket = core.watch_hqc_update();
        for voter in 0..3u16 {
            let vote = Vote {
                voter: ReplicaId(voter),
                blk_hash: b1_hash,
                cert: PartialCert::create(&keypair(voter as usize), vote_obj_hash(&b1_hash)),
            };
            exec(core, Event::VoteReceived { vote });
        }

        assert_eq!(core.poll_hqc_update(hqc_ticket), Some(b1_hash));
        let entry = core.block(&b1_hash).unwrap();
        assert_eq!(entry.voted.len(), 3);
        assert!(entry.self_qc.as_ref().unwrap().is_finalized());
    }

    #[test]
    fn duplicate_and_post_quorum_votes_are_dropped() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let genesis = core.genesis();
        let b1 = chain_block(genesis, b"c1", 1);
        let b1_hash = b1.hash();
        core.on_deliver_blk(b1);

        for voter in [0u16, 0, 1, 2, 3] {
            let vote = Vote {
                voter: ReplicaId(voter),
                blk_hash: b1_hash,
                cert: PartialCert::create(&keypair(voter as usize), vote_obj_hash(&b1_hash)),
            };
            exec(core, Event::VoteReceived { vote });
        }
        // Voter 0 counted once; voter 3 arrived after quorum and was dropped.
        let entry = core.block(&b1_hash).unwrap();
        assert_eq!(entry.voted.len(), 3);
        assert!(!entry.voted.contains(&ReplicaId(3)));
    }

    #[test]
    fn forged_vote_certificate_is_dropped() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let genesis = core.genesis();
        let b1 = chain_block(genesis, b"c1", 1);
        let b1_hash = b1.hash();
        core.on_deliver_blk(b1);

        // Replica 2's key signing a vote claimed to be from replica 1.
        let vote = Vote {
            voter: ReplicaId(1),
            blk_hash: b1_hash,
            cert: PartialCert::create(&keypair(2), vote_obj_hash(&b1_hash)),
        };
        exec(core, Event::VoteReceived { vote });
        assert!(core.block(&b1_hash).unwrap().voted.is_empty());
    }

    #[test]
    fn notify_with_valid_qc_updates_hqc() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[3];
        let genesis = core.genesis();
        let b1 = chain_block(genesis, b"c1", 1);
        let b1_hash = b1.hash();
        core.on_deliver_blk(b1);

        let obj = vote_obj_hash(&b1_hash);
        let mut qc = QuorumCert::new(obj);
        for signer in 0..3u16 {
            qc.add_part(
                ReplicaId(signer),
                &PartialCert::create(&keypair(signer as usize), obj),
            )
            .unwrap();
        }
        qc.compute();

        exec(
            core,
            Event::NotifyReceived {
                notify: Notify {
                    blk_hash: b1_hash,
                    qc,
                },
            },
        );
        assert_eq!(*core.hqc().0, b1_hash);
    }

    #[test]
    fn notify_with_underfilled_qc_is_dropped() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[3];
        let genesis = core.genesis();
        let b1 = chain_block(genesis, b"c1", 1);
        let b1_hash = b1.hash();
        core.on_deliver_blk(b1);

        let obj = vote_obj_hash(&b1_hash);
        let mut qc = QuorumCert::new(obj);
        qc.add_part(ReplicaId(0), &PartialCert::create(&keypair(0), obj))
            .unwrap();
        qc.compute();

        exec(
            core,
            Event::NotifyReceived {
                notify: Notify {
                    blk_hash: b1_hash,
                    qc,
                },
            },
        );
        assert_eq!(*core.hqc().0, genesis);
    }

    #[test]
    fn accepted_lower_proposal_is_a_safety_violation() {
        let mut cores = group(4, 1, 2);
        let core = &mut cores[0];
        let genesis = core.genesis();

        // Propose twice as leader; vheight reaches 2.
        let (p1, actions) = core
            .on_propose(vec![Hash::digest(b"c1")], vec![genesis], vec![])
            .unwrap()
            .unwrap();
        exec_actions(core, actions);
        let (_, actions) = core
            .on_propose(vec![Hash::digest(b"c2")], vec![p1.block.hash()], vec![])
            .unwrap()
            .unwrap();
        exec_actions(core, actions);
        assert_eq!(core.vheight(), 2);

        // A fresh height-1 proposal extending hqc (=genesis) must halt.
        let c1 = chain_block(genesis, b"other", 1);
        assert!(core.on_deliver_blk(c1.clone()));
        let result = core.handle(Event::ProposalReceived {
            prop: Proposal {
                proposer: ReplicaId(1),
                block: c1,
            },
        });
        assert!(matches!(
            result,
            Err(SafetyViolation::VoteHeightRegression {
                attempted: 1,
                current: 2
            })
        ));
    }

    #[test]
    fn prune_releases_stale_chain() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let genesis = core.genesis();

        // Committed chain b0 ← B1 ← … ← B5.
        let mut hashes = vec![genesis];
        let mut parent = genesis;
        for height in 1..=5u32 {
            let blk = chain_block(parent, format!("c{height}").as_bytes(), height);
            let hash = blk.hash();
            assert!(core.on_deliver_blk(blk));
            hashes.push(hash);
            parent = hash;
        }
        // Pre-commit quorum on B5 commits the whole chain.
        let b5 = hashes[5];
        for rid in 0..3u16 {
            let pc = tessera_messages::PreCommit {
                rid: ReplicaId(rid),
                blk_hash: b5,
                cert: PartialCert::create(
                    &keypair(rid as usize),
                    tessera_types::pre_commit_obj_hash(&b5),
                ),
            };
            exec(core, Event::PreCommitReceived { pc });
        }
        assert_eq!(core.b_exec(), b5);

        core.prune(2);
        for released in &hashes[..4] {
            assert!(core.block(released).is_none(), "{released} not released");
        }
        for kept in &hashes[4..] {
            assert!(core.block(kept).is_some(), "{kept} wrongly released");
        }
    }

    #[test]
    fn commit_emits_finality_per_command() {
        let mut cores = group(4, 1, 1);
        let core = &mut cores[0];
        let genesis = core.genesis();
        let cmds = vec![Hash::digest(b"c1"), Hash::digest(b"c2")];
        let b1 = Block::new(vec![genesis], cmds.clone(), None, vec![], 1);
        let b1_hash = b1.hash();
        core.on_deliver_blk(b1);

        let mut decides = Vec::new();
        for rid in 0..3u16 {
            let pc = tessera_messages::PreCommit {
                rid: ReplicaId(rid),
                blk_hash: b1_hash,
                cert: PartialCert::create(
                    &keypair(rid as usize),
                    tessera_types::pre_commit_obj_hash(&b1_hash),
                ),
            };
            for action in exec(core, Event::PreCommitReceived { pc }) {
                if let Action::Decide { fin } = action {
                    decides.push(fin);
                }
            }
        }
        assert_eq!(decides.len(), 2);
        for (idx, fin) in decides.iter().enumerate() {
            assert_eq!(fin.decision, 1);
            assert_eq!(fin.cmd_idx, idx as u32);
            assert_eq!(fin.cmd_height, 1);
            assert_eq!(fin.cmd_hash, cmds[idx]);
            assert_eq!(fin.blk_hash, b1_hash);
        }
    }
}
