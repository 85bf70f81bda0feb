//! Deterministic multi-replica simulation.
//!
//! The runner owns `n` replica cores, a global event queue ordered by
//! `(time, priority, sequence)`, and a full-mesh fixed-latency network.
//! Actions execute inline: broadcasts fan out as future events, signature
//! verification runs instantly, timers become scheduled timeout events.
//! Given the same seed and inputs, a run is bit-for-bit reproducible.

mod network;
mod pacemaker;
mod runner;

pub use network::{NetworkConfig, SimulatedNetwork};
pub use pacemaker::Pacemaker;
pub use runner::{SimReplica, SimulationRunner, SimulationStats};
