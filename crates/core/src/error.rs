//! Fatal safety errors.

use tessera_types::Hash;
use thiserror::Error;

/// An invariant the protocol can never recover from locally.
///
/// The host must halt the replica on any of these; continuing could commit
/// a divergent branch or double-vote.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SafetyViolation {
    /// A handler consumed a block that was never delivered. The transport
    /// contract (deliver before consume) was broken.
    #[error("block {0} consumed before delivery")]
    BlockNotDelivered(Hash),

    /// A vote would have been recorded at a height at or below `vheight`.
    #[error("vote height {attempted} does not exceed voted height {current}")]
    VoteHeightRegression { attempted: u32, current: u32 },

    /// The commit walk from a pre-committed block never reached the
    /// executed chain.
    #[error("commit walk from {tip} diverged from executed block {b_exec}")]
    DivergentCommit { tip: Hash, b_exec: Hash },

    /// A proposal was submitted with no parents.
    #[error("proposal has no parents")]
    EmptyParents,
}
