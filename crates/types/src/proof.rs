//! Domain-separated proof-object hashes.
//!
//! Every partial or quorum certificate attests to a *proof object*, never to
//! a raw block hash. The proof object is the hash of a tagged preimage, so a
//! signature produced for one message kind can never be replayed as another.

use crate::Hash;

/// Domain tags for the four proof-object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProofKind {
    /// A vote for a block.
    Vote = 0x00,
    /// A blame against the current view.
    Blame = 0x01,
    /// An echo/ack in the propagation sub-protocol.
    Propagate = 0x02,
    /// A pre-commit for a block at a commit-interval boundary.
    PreCommit = 0x03,
}

/// Proof object for `Vote(blk_hash)`: hash of `[0x00 || blk_hash]`.
pub fn vote_obj_hash(blk_hash: &Hash) -> Hash {
    tagged(ProofKind::Vote, blk_hash.as_bytes())
}

/// Proof object for `Blame(view)`: hash of `[0x01 || view_be32]`.
pub fn blame_obj_hash(view: u32) -> Hash {
    tagged(ProofKind::Blame, &view.to_be_bytes())
}

/// Proof object for `Propagate(msg_hash)`: hash of `[0x02 || msg_hash]`.
pub fn propagate_obj_hash(msg_hash: &Hash) -> Hash {
    tagged(ProofKind::Propagate, msg_hash.as_bytes())
}

/// Proof object for `PreCommit(blk_hash)`: hash of `[0x03 || blk_hash]`.
pub fn pre_commit_obj_hash(blk_hash: &Hash) -> Hash {
    tagged(ProofKind::PreCommit, blk_hash.as_bytes())
}

fn tagged(kind: ProofKind, payload: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[kind as u8]);
    hasher.update(payload);
    Hash::from_bytes(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_never_collide() {
        let h = Hash::digest(b"block");
        let all = [
            vote_obj_hash(&h),
            blame_obj_hash(7),
            propagate_obj_hash(&h),
            pre_commit_obj_hash(&h),
        ];
        for i in 0..all.len() {
            for j in (i + 1)..all.len() {
                assert_ne!(all[i], all[j], "domains {i} and {j} collide");
            }
        }
    }

    #[test]
    fn blame_hash_depends_on_view() {
        assert_ne!(blame_obj_hash(0), blame_obj_hash(1));
        assert_eq!(blame_obj_hash(3), blame_obj_hash(3));
    }
}
