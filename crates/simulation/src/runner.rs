//! Deterministic simulation runner.
//!
//! Every replica has its own core and pacemaker. Events are processed in
//! `(time, priority, sequence)` order; actions execute inline, with
//! signature verification resolved instantly and network sends scheduled
//! one latency away.

use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::pacemaker::Pacemaker;
use rand::RngCore;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tessera_bft::ReplicaCore;
use tessera_core::{
    run_verification, Action, Event, SafetyViolation, StateMachine, TimerId,
};
use tessera_messages::Finality;
use tessera_types::{Hash, KeyPair, ReplicaConfig, ReplicaId, ReplicaInfo};
use tracing::{debug, trace, warn};

/// Deterministic ordering key for queued events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EventKey {
    time: Duration,
    priority: u8,
    seq: u64,
}

/// One replica plus its host-side state.
pub struct SimReplica {
    pub core: ReplicaCore,
    pub pacemaker: Pacemaker,
    /// Finality records emitted through `Action::Decide`.
    pub finality: Vec<Finality>,
    /// Blocks handed to execution through `Action::ExecuteBlock`.
    pub executed: Vec<Hash>,
    /// Set when the core raised a safety violation; the replica is dead.
    pub halted: Option<SafetyViolation>,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    pub events_processed: u64,
    pub actions_executed: u64,
    pub messages_sent: u64,
    pub timers_set: u64,
    pub timers_cancelled: u64,
}

/// Deterministic simulation runner.
///
/// Given the same seed and the same submitted commands, produces identical
/// results every run.
pub struct SimulationRunner {
    replicas: Vec<SimReplica>,
    network: SimulatedNetwork,
    event_queue: BTreeMap<EventKey, (ReplicaId, Event)>,
    timers: HashMap<(ReplicaId, TimerId), EventKey>,
    seq: u64,
    now: Duration,
    stats: SimulationStats,
}

impl SimulationRunner {
    /// Build `nreplicas` initialized replicas with seed-derived keys.
    pub fn new(config: NetworkConfig, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let keys: Vec<KeyPair> = (0..config.nreplicas)
            .map(|_| {
                let mut key_seed = [0u8; 32];
                rng.fill_bytes(&mut key_seed);
                KeyPair::from_seed(&key_seed)
            })
            .collect();

        let network = SimulatedNetwork::new(config.clone());
        let mut runner = Self {
            replicas: Vec::with_capacity(config.nreplicas),
            network,
            event_queue: BTreeMap::new(),
            timers: HashMap::new(),
            seq: 0,
            now: Duration::ZERO,
            stats: SimulationStats::default(),
        };

        for i in 0..config.nreplicas {
            let rid = ReplicaId(i as u16);
            let mut core = ReplicaCore::new(
                rid,
                keys[i].clone(),
                ReplicaConfig::new(config.commit_interval),
            );
            for (j, key) in keys.iter().enumerate() {
                core.add_replica(ReplicaInfo {
                    id: ReplicaId(j as u16),
                    addr: "127.0.0.1:0".parse().expect("static addr"),
                    pub_key: key.public_key(),
                });
            }
            let init_actions = core
                .on_init(config.nfaulty, config.delta)
                .expect("simulation config satisfies 3f+1");
            runner.replicas.push(SimReplica {
                core,
                pacemaker: Pacemaker::new(config.propose_idle),
                finality: Vec::new(),
                executed: Vec::new(),
                halted: None,
            });
            for action in init_actions {
                runner.process_action(rid, action);
            }
        }
        runner
    }

    pub fn replica(&self, i: usize) -> &SimReplica {
        &self.replicas[i]
    }

    pub fn replica_mut(&mut self, i: usize) -> &mut SimReplica {
        &mut self.replicas[i]
    }

    pub fn nreplicas(&self) -> usize {
        self.replicas.len()
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Queue a command on a replica's pacemaker.
    pub fn submit(&mut self, node: usize, cmd: Hash) {
        self.replicas[node].pacemaker.submit(cmd);
    }

    /// Run until the queue drains or `end` is reached.
    pub fn run_until(&mut self, end: Duration) {
        // Give every pacemaker an initial chance to propose.
        for i in 0..self.replicas.len() {
            self.beat(ReplicaId(i as u16));
        }

        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > end {
                break;
            }
            let (key, (node, event)) = self.event_queue.pop_first().expect("non-empty");
            self.now = key.time;
            self.stats.events_processed += 1;
            // A fired timer is no longer cancellable.
            self.timers.retain(|_, k| *k != key);

            if self.replicas[node.0 as usize].halted.is_some() {
                continue;
            }

            // The transport contract: a proposal's block is delivered before
            // the core sees the message. Undeliverable blocks drop it.
            if let Event::ProposalReceived { prop } = &event {
                let core = &mut self.replicas[node.0 as usize].core;
                let blk_hash = prop.block.hash();
                if !core.block_delivered(&blk_hash) && !core.on_deliver_blk(prop.block.clone()) {
                    debug!(node = %node, blk = ?blk_hash, "dropping undeliverable proposal");
                    continue;
                }
            }

            trace!(node = %node, event = event.type_name(), time = ?self.now, "processing event");
            let result = {
                let replica = &mut self.replicas[node.0 as usize];
                replica.core.set_time(key.time);
                replica.core.handle(event)
            };
            match result {
                Ok(actions) => {
                    for action in actions {
                        self.process_action(node, action);
                    }
                    self.beat(node);
                }
                Err(violation) => {
                    warn!(node = %node, %violation, "replica halted on safety violation");
                    self.replicas[node.0 as usize].halted = Some(violation);
                }
            }
        }
    }

    fn beat(&mut self, node: ReplicaId) {
        if self.replicas[node.0 as usize].halted.is_some() {
            return;
        }
        let result = {
            let replica = &mut self.replicas[node.0 as usize];
            let SimReplica {
                core, pacemaker, ..
            } = replica;
            pacemaker.beat(core)
        };
        match result {
            Ok(actions) => {
                for action in actions {
                    self.process_action(node, action);
                }
            }
            Err(violation) => {
                warn!(node = %node, %violation, "replica halted during pacemaker beat");
                self.replicas[node.0 as usize].halted = Some(violation);
            }
        }
    }

    fn process_action(&mut self, from: ReplicaId, action: Action) {
        self.stats.actions_executed += 1;

        // Delegated verification runs instantly in simulation; the callback
        // is enqueued as an internal event at the current time.
        if let Some(callback) = run_verification(&action) {
            self.schedule(from, self.now, callback);
            return;
        }

        match action {
            Action::BroadcastProposal { prop } => {
                self.broadcast(from, Event::ProposalReceived { prop })
            }
            Action::BroadcastVote { vote } => self.broadcast(from, Event::VoteReceived { vote }),
            Action::BroadcastBlame { blame } => {
                self.broadcast(from, Event::BlameReceived { blame })
            }
            Action::BroadcastBlameNotify { bn } => {
                self.broadcast(from, Event::BlameNotifyReceived { bn })
            }
            Action::BroadcastEcho { echo } => self.broadcast(from, Event::EchoReceived { echo }),
            Action::BroadcastAck { ack } => self.broadcast(from, Event::AckReceived { ack }),
            Action::BroadcastPreCommit { pc } => {
                self.broadcast(from, Event::PreCommitReceived { pc })
            }
            Action::Notify { notify } => self.broadcast(from, Event::NotifyReceived { notify }),
            Action::SendEcho { echo, dest } => {
                self.send(from, dest, Event::EchoReceived { echo })
            }
            Action::SendAck { ack, dest } => self.send(from, dest, Event::AckReceived { ack }),
            Action::MulticastAck { ack, dests } => {
                for dest in dests {
                    if dest != from {
                        self.send(from, dest, Event::AckReceived { ack: ack.clone() });
                    }
                }
            }

            Action::SetTimer { id, duration } => {
                if let Some(old) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&old);
                }
                let key = self.schedule(from, self.now + duration, Self::timer_event(id));
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }
            Action::CancelTimer { id } => {
                if let Some(old) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&old);
                    self.stats.timers_cancelled += 1;
                }
            }
            Action::CancelCommitTimers => {
                let stale: Vec<_> = self
                    .timers
                    .iter()
                    .filter(|((rid, tid), _)| *rid == from && matches!(tid, TimerId::Commit(_)))
                    .map(|(k, v)| (*k, *v))
                    .collect();
                for (k, v) in stale {
                    self.timers.remove(&k);
                    self.event_queue.remove(&v);
                    self.stats.timers_cancelled += 1;
                }
            }

            Action::EnqueueInternal { event } => {
                self.schedule(from, self.now, event);
            }

            Action::Decide { fin } => self.replicas[from.0 as usize].finality.push(fin),
            Action::ExecuteBlock { blk_hash } => {
                self.replicas[from.0 as usize].executed.push(blk_hash)
            }

            // Verification actions were consumed above.
            other => unreachable!("unhandled action {}", other.type_name()),
        }
    }

    fn broadcast(&mut self, from: ReplicaId, event: Event) {
        for peer in self.network.peers(from) {
            self.send(from, peer, event.clone());
        }
    }

    fn send(&mut self, from: ReplicaId, to: ReplicaId, event: Event) {
        if from == to {
            return;
        }
        self.stats.messages_sent += 1;
        let arrival = self.now + self.network.latency();
        self.schedule(to, arrival, event);
    }

    fn schedule(&mut self, node: ReplicaId, time: Duration, event: Event) -> EventKey {
        let key = EventKey {
            time,
            priority: event.priority() as u8,
            seq: self.seq,
        };
        self.seq += 1;
        self.event_queue.insert(key, (node, event));
        key
    }

    fn timer_event(id: TimerId) -> Event {
        match id {
            TimerId::Blame => Event::BlameTimeout,
            TimerId::ViewTransition => Event::ViewTransTimeout,
            TimerId::Commit(blk_hash) => Event::CommitTimeout { blk_hash },
            TimerId::Propagate(msg_hash) => Event::PropagateTimeout { msg_hash },
            TimerId::Ack(msg_hash) => Event::AckTimeout { msg_hash },
            TimerId::PreCommit(blk_hash) => Event::PreCommitTimeout { blk_hash },
        }
    }
}
