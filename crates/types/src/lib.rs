//! Foundation types for the tessera replication core.
//!
//! This crate provides the types shared by every layer of the protocol:
//!
//! - **Primitives**: [`Hash`], keys and signatures
//! - **Certificates**: [`PartialCert`] (one signer) and [`QuorumCert`]
//!   (`nmajority` signers) over domain-separated proof-object hashes
//! - **Blocks**: the wire-level [`Block`] that proposals carry
//! - **Replica set**: [`ReplicaConfig`] with quorum and proposer mapping
//! - **Wire codec**: [`WireEncode`]/[`WireDecode`] with a fixed field layout
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod block;
mod cert;
mod crypto;
mod hash;
mod proof;
mod replicas;
pub mod wire;

pub use block::Block;
pub use cert::{CertError, PartialCert, QuorumCert};
pub use crypto::{CryptoError, KeyPair, PublicKey, Signature};
pub use hash::Hash;
pub use proof::{
    blame_obj_hash, pre_commit_obj_hash, propagate_obj_hash, vote_obj_hash, ProofKind,
};
pub use replicas::{ConfigError, ReplicaConfig, ReplicaId, ReplicaInfo};
pub use wire::{WireDecode, WireEncode, WireError};
