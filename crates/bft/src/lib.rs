//! Synchronous-HotStuff replication state machine.
//!
//! This crate implements the core of a BFT replication protocol in the
//! HotStuff family, extended with a reliable Echo/Ack block-propagation
//! sub-protocol and an explicit pre-commit phase at commit-interval
//! boundaries.
//!
//! # Architecture
//!
//! The [`ReplicaCore`] processes events synchronously:
//!
//! - `Event::ProposalReceived` → record the proposal, form an opinion
//!   against the highest QC, start reliable propagation
//! - `Event::EchoReceived`/`AckReceived` → two-phase propagation quorums;
//!   the second quorum gates voting
//! - `Event::VoteReceived` → aggregate into the block's quorum certificate
//! - `Event::PreCommitReceived` → extra quorum at commit boundaries; the
//!   only trigger that commits blocks
//! - `Event::BlameReceived`/`BlameNotifyReceived` → view-change machinery
//!
//! All I/O is performed by the host via returned `Action`s; signature
//! verification round-trips through the host's verification pool.
//!
//! # Safety
//!
//! - **Voting rule**: a replica votes for a block only if its height is not
//!   occupied by a conflicting proposal and the block extends the highest
//!   certified block. The voted height is strictly monotonic; a regression
//!   halts the replica.
//! - **Commit rule**: a block commits only after a pre-commit quorum, and
//!   only along a chain that reaches the executed prefix. A divergent walk
//!   halts the replica.
//!
//! # Liveness
//!
//! Timers are multiples of the synchrony bound `Δ`: a blame fires after
//! `3Δ` without progress, a quorum of blames broadcasts a `BlameNotify`,
//! and the view advances `2Δ` later.

mod propagation;
mod replica;
mod signals;
mod store;
mod view_change;

pub use replica::ReplicaCore;
pub use signals::{Signal, Ticket};
pub use store::{BlockEntry, BlockStore, Decision};
