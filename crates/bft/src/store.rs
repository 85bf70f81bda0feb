//! Content-addressed block store.
//!
//! The store exclusively owns every block the replica has seen; the rest of
//! the core refers to blocks by hash. Cross-references (parents, `qc_ref`)
//! are hashes too, so the ownership graph has no cycles and pruning is a
//! plain removal.

use std::collections::{BTreeSet, HashMap};
use tessera_types::{Block, Hash, QuorumCert, ReplicaId};
use tracing::trace;

/// Decision state of a block. Once committed, irrevocable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Undecided,
    Committed,
}

/// A block plus the runtime state the protocol accumulates for it.
#[derive(Debug, Clone)]
pub struct BlockEntry {
    /// The wire-level block content.
    pub block: Block,
    /// Content hash (store key).
    pub hash: Hash,
    /// `parents[0].height + 1`; validated at delivery.
    pub height: u32,
    /// Parent handles, resolved at delivery. Empty for genesis.
    pub parents: Vec<Hash>,
    /// Runtime back-reference to the block certified by `block.qc`.
    /// Cleared during pruning.
    pub qc_ref: Option<Hash>,
    /// The QC being accumulated for this block.
    pub self_qc: Option<QuorumCert>,
    /// Replicas that voted for this block.
    pub voted: BTreeSet<ReplicaId>,
    /// Replicas that pre-committed this block.
    pub pre_committed: BTreeSet<ReplicaId>,
    pub decision: Decision,
    /// Set once all delivery invariants hold.
    pub delivered: bool,
}

impl BlockEntry {
    fn new(block: Block) -> Self {
        let hash = block.hash();
        let height = block.height;
        Self {
            block,
            hash,
            height,
            parents: Vec::new(),
            qc_ref: None,
            self_qc: None,
            voted: BTreeSet::new(),
            pre_committed: BTreeSet::new(),
            decision: Decision::Undecided,
            delivered: false,
        }
    }

    /// The primary parent, if any.
    pub fn primary_parent(&self) -> Option<Hash> {
        self.parents.first().copied()
    }
}

/// Map `hash → BlockEntry` with deduplicating insert.
#[derive(Debug, Default)]
pub struct BlockStore {
    blocks: HashMap<Hash, BlockEntry>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block, or return the canonical hash if already present.
    pub fn add_blk(&mut self, block: Block) -> Hash {
        let entry = BlockEntry::new(block);
        let hash = entry.hash;
        self.blocks.entry(hash).or_insert_with(|| {
            trace!(blk = ?hash, "stored block");
            entry
        });
        hash
    }

    pub fn find(&self, hash: &Hash) -> Option<&BlockEntry> {
        self.blocks.get(hash)
    }

    pub fn find_mut(&mut self, hash: &Hash) -> Option<&mut BlockEntry> {
        self.blocks.get_mut(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Release a block assumed to have no live references. Only called from
    /// pruning. Returns whether the block was present.
    pub fn try_release_blk(&mut self, hash: &Hash) -> bool {
        self.blocks.remove(hash).is_some()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
