//! Event types for the deterministic state machine.

use tessera_messages::{Ack, Blame, BlameNotify, Echo, Notify, PreCommit, Proposal, Vote};
use tessera_types::Hash;

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same time are processed in priority order; lower values
/// first. Internal events (consequences of prior processing, including
/// verification callbacks) are handled before new external inputs so
/// causality is preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Consequences of prior event processing.
    Internal = 0,
    /// Timers scheduled by the replica itself.
    Timer = 1,
    /// Inputs from other replicas.
    Network = 2,
}

/// All possible inputs to the replica core.
///
/// Events are passive data; the state machine processes them and returns
/// actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// No progress for `3Δ`; blame the current view.
    BlameTimeout,

    /// View transition period (`2Δ`) elapsed; complete the view change.
    ViewTransTimeout,

    /// Commit timer for a block fired.
    CommitTimeout { blk_hash: Hash },

    /// Echo-phase timer (`3Δ`) fired; late echoes no longer re-broadcast.
    PropagateTimeout { msg_hash: Hash },

    /// Ack-phase timer (`2Δ`) fired; late echoes no longer earn acks.
    AckTimeout { msg_hash: Hash },

    /// Pre-commit delay (`2Δ`) elapsed; emit a PreCommit for the block.
    PreCommitTimeout { blk_hash: Hash },

    // ═══════════════════════════════════════════════════════════════════════
    // Network messages (priority: Network)
    //
    // The referenced block must already be delivered; the transport fetches
    // and delivers blocks before handing these to the core.
    // ═══════════════════════════════════════════════════════════════════════
    ProposalReceived { prop: Proposal },
    VoteReceived { vote: Vote },
    NotifyReceived { notify: Notify },
    BlameReceived { blame: Blame },
    BlameNotifyReceived { bn: BlameNotify },
    EchoReceived { echo: Echo },
    AckReceived { ack: Ack },
    PreCommitReceived { pc: PreCommit },

    // ═══════════════════════════════════════════════════════════════════════
    // Verification callbacks (priority: Internal)
    //
    // Results of delegated work from the verification pool. Handlers
    // re-check state guards on these; the core may have moved on.
    // ═══════════════════════════════════════════════════════════════════════
    VoteVerified { vote: Vote, valid: bool },
    NotifyVerified { notify: Notify, valid: bool },
    BlameVerified { blame: Blame, valid: bool },
    BlameNotifyVerified { bn: BlameNotify, valid: bool },
    EchoVerified { echo: Echo, valid: bool },
    AckVerified { ack: Ack, valid: bool },
    PreCommitVerified { pc: PreCommit, valid: bool },
    /// The quorum certificate embedded in a proposal checked out (or not).
    ProposalQcVerified { blk_hash: Hash, valid: bool },
}

impl Event {
    /// Ordering priority of this event at a shared timestamp.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::VoteVerified { .. }
            | Event::NotifyVerified { .. }
            | Event::BlameVerified { .. }
            | Event::BlameNotifyVerified { .. }
            | Event::EchoVerified { .. }
            | Event::AckVerified { .. }
            | Event::PreCommitVerified { .. }
            | Event::ProposalQcVerified { .. } => EventPriority::Internal,

            Event::BlameTimeout
            | Event::ViewTransTimeout
            | Event::CommitTimeout { .. }
            | Event::PropagateTimeout { .. }
            | Event::AckTimeout { .. }
            | Event::PreCommitTimeout { .. } => EventPriority::Timer,

            Event::ProposalReceived { .. }
            | Event::VoteReceived { .. }
            | Event::NotifyReceived { .. }
            | Event::BlameReceived { .. }
            | Event::BlameNotifyReceived { .. }
            | Event::EchoReceived { .. }
            | Event::AckReceived { .. }
            | Event::PreCommitReceived { .. } => EventPriority::Network,
        }
    }

    /// Event name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::BlameTimeout => "BlameTimeout",
            Event::ViewTransTimeout => "ViewTransTimeout",
            Event::CommitTimeout { .. } => "CommitTimeout",
            Event::PropagateTimeout { .. } => "PropagateTimeout",
            Event::AckTimeout { .. } => "AckTimeout",
            Event::PreCommitTimeout { .. } => "PreCommitTimeout",
            Event::ProposalReceived { .. } => "ProposalReceived",
            Event::VoteReceived { .. } => "VoteReceived",
            Event::NotifyReceived { .. } => "NotifyReceived",
            Event::BlameReceived { .. } => "BlameReceived",
            Event::BlameNotifyReceived { .. } => "BlameNotifyReceived",
            Event::EchoReceived { .. } => "EchoReceived",
            Event::AckReceived { .. } => "AckReceived",
            Event::PreCommitReceived { .. } => "PreCommitReceived",
            Event::VoteVerified { .. } => "VoteVerified",
            Event::NotifyVerified { .. } => "NotifyVerified",
            Event::BlameVerified { .. } => "BlameVerified",
            Event::BlameNotifyVerified { .. } => "BlameNotifyVerified",
            Event::EchoVerified { .. } => "EchoVerified",
            Event::AckVerified { .. } => "AckVerified",
            Event::PreCommitVerified { .. } => "PreCommitVerified",
            Event::ProposalQcVerified { .. } => "ProposalQcVerified",
        }
    }
}
