//! Replica set and protocol configuration.

use crate::PublicKey;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Identity of a replica in the configured set.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ReplicaId(pub u16);

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from configuration setup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{nreplicas} replicas cannot tolerate {nfaulty} faults (need 3f+1)")]
    QuorumUnsatisfiable { nreplicas: usize, nfaulty: usize },
    #[error("replica set is empty")]
    EmptyReplicaSet,
}

/// One registered replica.
#[derive(Clone, Debug)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub addr: SocketAddr,
    pub pub_key: PublicKey,
}

/// The replica set plus the protocol parameters derived from it.
///
/// `add_replica` is only legal before `on_init`; the quorum threshold is
/// frozen once derived.
#[derive(Clone, Debug)]
pub struct ReplicaConfig {
    replicas: BTreeMap<ReplicaId, ReplicaInfo>,
    /// Quorum threshold `nreplicas - nfaulty`. Zero until `on_init`.
    pub nmajority: usize,
    pub nfaulty: usize,
    /// Assumed upper bound on message delay; every timer is a multiple.
    pub delta: Duration,
    /// Heights divisible by this collect pre-commit and commit quorums.
    pub commit_interval: u32,
}

impl ReplicaConfig {
    pub fn new(commit_interval: u32) -> Self {
        Self {
            replicas: BTreeMap::new(),
            nmajority: 0,
            nfaulty: 0,
            delta: Duration::ZERO,
            commit_interval: commit_interval.max(1),
        }
    }

    /// Register a replica. Call for every member before `on_init`.
    pub fn add_replica(&mut self, info: ReplicaInfo) {
        self.replicas.insert(info.id, info);
    }

    /// Derive the quorum threshold and fix the timing bound.
    pub fn on_init(&mut self, nfaulty: usize, delta: Duration) -> Result<(), ConfigError> {
        let nreplicas = self.replicas.len();
        if nreplicas == 0 {
            return Err(ConfigError::EmptyReplicaSet);
        }
        if nreplicas < 3 * nfaulty + 1 {
            return Err(ConfigError::QuorumUnsatisfiable { nreplicas, nfaulty });
        }
        self.nfaulty = nfaulty;
        self.nmajority = nreplicas - nfaulty;
        self.delta = delta;
        Ok(())
    }

    pub fn nreplicas(&self) -> usize {
        self.replicas.len()
    }

    pub fn contains(&self, rid: ReplicaId) -> bool {
        self.replicas.contains_key(&rid)
    }

    pub fn pub_key(&self, rid: ReplicaId) -> Option<&PublicKey> {
        self.replicas.get(&rid).map(|info| &info.pub_key)
    }

    pub fn replica_ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.replicas.keys().copied()
    }

    /// Registered keys for the given signers; `None` if any signer is unknown.
    pub fn signer_keys(
        &self,
        signers: impl Iterator<Item = ReplicaId>,
    ) -> Option<BTreeMap<ReplicaId, PublicKey>> {
        signers
            .map(|rid| self.pub_key(rid).map(|pk| (rid, pk.clone())))
            .collect()
    }

    /// The designated proposer of a view: round-robin over replica ids in
    /// ascending order.
    pub fn proposer_for(&self, view: u32) -> ReplicaId {
        let ids: Vec<ReplicaId> = self.replicas.keys().copied().collect();
        ids[view as usize % ids.len()]
    }
}
