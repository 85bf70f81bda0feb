//! Network messages for the replication protocol.

mod consensus;

pub use consensus::{
    Ack, Blame, BlameNotify, Echo, Finality, Notify, PreCommit, Proposal, PropagateOp, Vote,
};
