//! Simulated network.

use std::time::Duration;
use tessera_types::ReplicaId;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub nreplicas: usize,
    pub nfaulty: usize,
    /// Synchrony bound handed to the cores.
    pub delta: Duration,
    pub commit_interval: u32,
    /// One-way message latency on every link. Uniform latency preserves the
    /// deliver-before-consume ordering the cores rely on.
    pub latency: Duration,
    /// Whether pacemakers keep proposing empty blocks when their command
    /// queue is drained (keeps the commit pipeline moving).
    pub propose_idle: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            nreplicas: 4,
            nfaulty: 1,
            delta: Duration::from_millis(100),
            commit_interval: 1,
            latency: Duration::from_millis(10),
            propose_idle: true,
        }
    }
}

/// Full-mesh network with one uniform link latency.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn latency(&self) -> Duration {
        self.config.latency
    }

    /// Every replica except `of`.
    pub fn peers(&self, of: ReplicaId) -> Vec<ReplicaId> {
        (0..self.config.nreplicas as u16)
            .map(ReplicaId)
            .filter(|rid| *rid != of)
            .collect()
    }

    pub fn all(&self) -> Vec<ReplicaId> {
        (0..self.config.nreplicas as u16).map(ReplicaId).collect()
    }
}
