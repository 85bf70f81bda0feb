//! Action types for the deterministic state machine.

use crate::{Event, TimerId};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tessera_messages::{
    Ack, Blame, BlameNotify, Echo, Finality, Notify, PreCommit, Proposal, Vote,
};
use tessera_types::{Hash, PublicKey, QuorumCert, ReplicaId};

/// Actions the replica core wants performed.
///
/// Actions are commands; the host executes them and may convert results
/// back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Send a proposal to every other replica.
    BroadcastProposal { prop: Proposal },

    /// Send a vote to every other replica.
    BroadcastVote { vote: Vote },

    /// Send a blame to every other replica.
    BroadcastBlame { blame: Blame },

    /// Send a blame-notify to every other replica.
    BroadcastBlameNotify { bn: BlameNotify },

    /// Send an echo to every other replica (commit-boundary heights).
    BroadcastEcho { echo: Echo },

    /// Send a pre-commit to every other replica.
    BroadcastPreCommit { pc: PreCommit },

    /// Send an ack to every other replica. Part of the propagation surface
    /// for deployments that prefer full fan-out over multicast.
    BroadcastAck { ack: Ack },

    /// Send an echo to one replica (non-boundary heights, to the proposer).
    SendEcho { echo: Echo, dest: ReplicaId },

    /// Send an ack to one late echoer.
    SendAck { ack: Ack, dest: ReplicaId },

    /// Send an ack to the replicas whose echoes formed the quorum.
    MulticastAck { ack: Ack, dests: BTreeSet<ReplicaId> },

    /// Announce the highest certified block (sent on entering a new view).
    Notify { notify: Notify },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Arm a timer, replacing any live timer with the same id.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a timer. No-op when the timer is not armed.
    CancelTimer { id: TimerId },

    /// Cancel every armed `TimerId::Commit(_)` timer.
    CancelCommitTimers,

    // ═══════════════════════════════════════════════════════════════════════
    // Internal
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Delegated verification (async; each returns a callback event)
    //
    // Public keys are pre-resolved by the core; the host stays ignorant of
    // the replica registry. `obj_hash` is the domain-separated proof object
    // the certificate must attest to.
    // ═══════════════════════════════════════════════════════════════════════
    /// Check a vote's partial certificate. Returns [`Event::VoteVerified`].
    VerifyVote {
        vote: Vote,
        public_key: PublicKey,
        obj_hash: Hash,
    },

    /// Check a blame's partial certificate. Returns [`Event::BlameVerified`].
    VerifyBlame {
        blame: Blame,
        public_key: PublicKey,
        obj_hash: Hash,
    },

    /// Check an echo's partial certificate. Returns [`Event::EchoVerified`].
    VerifyEcho {
        echo: Echo,
        public_key: PublicKey,
        obj_hash: Hash,
    },

    /// Check an ack's partial certificate. Returns [`Event::AckVerified`].
    VerifyAck {
        ack: Ack,
        public_key: PublicKey,
        obj_hash: Hash,
    },

    /// Check a pre-commit's partial certificate.
    /// Returns [`Event::PreCommitVerified`].
    VerifyPreCommit {
        pc: PreCommit,
        public_key: PublicKey,
        obj_hash: Hash,
    },

    /// Check a notify's quorum certificate.
    /// Returns [`Event::NotifyVerified`].
    VerifyNotify {
        notify: Notify,
        public_keys: BTreeMap<ReplicaId, PublicKey>,
        quorum: usize,
        obj_hash: Hash,
    },

    /// Check both certificates in a blame-notify: the blame QC over
    /// `BLAME(view)` and the carried high QC over `VOTE(hqc_hash)`.
    /// Returns [`Event::BlameNotifyVerified`].
    VerifyBlameNotify {
        bn: BlameNotify,
        public_keys: BTreeMap<ReplicaId, PublicKey>,
        quorum: usize,
        blame_obj_hash: Hash,
        hqc_obj_hash: Hash,
        /// The carried high QC is the genesis self-certification; skip its
        /// signature check.
        hqc_genesis: bool,
    },

    /// Check the quorum certificate embedded in a proposal.
    /// Returns [`Event::ProposalQcVerified`] keyed by the proposal's block.
    VerifyProposalQc {
        blk_hash: Hash,
        qc: QuorumCert,
        public_keys: BTreeMap<ReplicaId, PublicKey>,
        quorum: usize,
        obj_hash: Hash,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Decide outputs
    // ═══════════════════════════════════════════════════════════════════════
    /// A command reached finality.
    Decide { fin: Finality },

    /// A block was committed; hand it to the execution layer.
    ExecuteBlock { blk_hash: Hash },
}

impl Action {
    /// Whether this action delegates work that returns a callback event.
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            Action::VerifyVote { .. }
                | Action::VerifyBlame { .. }
                | Action::VerifyEcho { .. }
                | Action::VerifyAck { .. }
                | Action::VerifyPreCommit { .. }
                | Action::VerifyNotify { .. }
                | Action::VerifyBlameNotify { .. }
                | Action::VerifyProposalQc { .. }
        )
    }

    /// Whether this action sends bytes to other replicas.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Action::BroadcastProposal { .. }
                | Action::BroadcastVote { .. }
                | Action::BroadcastBlame { .. }
                | Action::BroadcastBlameNotify { .. }
                | Action::BroadcastEcho { .. }
                | Action::BroadcastAck { .. }
                | Action::BroadcastPreCommit { .. }
                | Action::SendEcho { .. }
                | Action::SendAck { .. }
                | Action::MulticastAck { .. }
                | Action::Notify { .. }
        )
    }

    /// Action name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::BroadcastProposal { .. } => "BroadcastProposal",
            Action::BroadcastVote { .. } => "BroadcastVote",
            Action::BroadcastBlame { .. } => "BroadcastBlame",
            Action::BroadcastBlameNotify { .. } => "BroadcastBlameNotify",
            Action::BroadcastEcho { .. } => "BroadcastEcho",
            Action::BroadcastAck { .. } => "BroadcastAck",
            Action::BroadcastPreCommit { .. } => "BroadcastPreCommit",
            Action::SendEcho { .. } => "SendEcho",
            Action::SendAck { .. } => "SendAck",
            Action::MulticastAck { .. } => "MulticastAck",
            Action::Notify { .. } => "Notify",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::CancelCommitTimers => "CancelCommitTimers",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::VerifyVote { .. } => "VerifyVote",
            Action::VerifyBlame { .. } => "VerifyBlame",
            Action::VerifyEcho { .. } => "VerifyEcho",
            Action::VerifyAck { .. } => "VerifyAck",
            Action::VerifyPreCommit { .. } => "VerifyPreCommit",
            Action::VerifyNotify { .. } => "VerifyNotify",
            Action::VerifyBlameNotify { .. } => "VerifyBlameNotify",
            Action::VerifyProposalQc { .. } => "VerifyProposalQc",
            Action::Decide { .. } => "Decide",
            Action::ExecuteBlock { .. } => "ExecuteBlock",
        }
    }
}
