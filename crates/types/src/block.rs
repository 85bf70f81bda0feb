//! Wire-level blocks.
//!
//! A block is identified by the hash of its canonical wire encoding. The
//! runtime state a replica accumulates for a block (vote sets, delivery
//! status, decision) lives in the block store, not here.

use crate::wire::{
    get_hash, get_u32, get_u8, put_hash, put_u32, put_u8, WireDecode, WireEncode, WireError,
};
use crate::{Hash, QuorumCert};

/// A proposed block.
///
/// `parent_hashes[0]` is the primary parent; the rest are uncles. Non-empty
/// for every block except genesis. `height` must equal the primary parent's
/// height plus one; delivery enforces this.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub parent_hashes: Vec<Hash>,
    pub cmds: Vec<Hash>,
    /// Certificate over `qc_ref_hash`, present only on commit-boundary
    /// proposals embedding a fresh high QC.
    pub qc: Option<QuorumCert>,
    pub qc_ref_hash: Option<Hash>,
    /// Opaque pacemaker payload.
    pub extra: Vec<u8>,
    pub height: u32,
}

impl Block {
    /// The genesis block: no parents, no commands, height 0.
    pub fn genesis() -> Self {
        Self {
            parent_hashes: Vec::new(),
            cmds: Vec::new(),
            qc: None,
            qc_ref_hash: None,
            extra: Vec::new(),
            height: 0,
        }
    }

    /// Build a block on the given parents.
    pub fn new(
        parent_hashes: Vec<Hash>,
        cmds: Vec<Hash>,
        qc: Option<(Hash, QuorumCert)>,
        extra: Vec<u8>,
        height: u32,
    ) -> Self {
        let (qc_ref_hash, qc) = match qc {
            Some((hash, qc)) => (Some(hash), Some(qc)),
            None => (None, None),
        };
        Self {
            parent_hashes,
            cmds,
            qc,
            qc_ref_hash,
            extra,
            height,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_hashes.is_empty()
    }

    /// Content hash over the canonical wire encoding.
    pub fn hash(&self) -> Hash {
        Hash::digest(&self.to_wire_bytes())
    }
}

impl WireEncode for Block {
    fn encode(&self, out: &mut Vec<u8>) {
        // Counts bounded far below u32::MAX by protocol limits.
        put_u32(out, self.parent_hashes.len() as u32);
        for parent in &self.parent_hashes {
            put_hash(out, parent);
        }
        put_u32(out, self.cmds.len() as u32);
        for cmd in &self.cmds {
            put_hash(out, cmd);
        }
        match (&self.qc_ref_hash, &self.qc) {
            (Some(qc_ref_hash), Some(qc)) => {
                put_u8(out, 1);
                put_hash(out, qc_ref_hash);
                qc.encode(out);
            }
            _ => put_u8(out, 0),
        }
        put_u32(out, self.extra.len() as u32);
        out.extend_from_slice(&self.extra);
        put_u32(out, self.height);
    }
}

impl WireDecode for Block {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let parent_count = get_u32(input)? as usize;
        let mut parent_hashes = Vec::with_capacity(parent_count.min(64));
        for _ in 0..parent_count {
            parent_hashes.push(get_hash(input)?);
        }
        let cmd_count = get_u32(input)? as usize;
        let mut cmds = Vec::with_capacity(cmd_count.min(1024));
        for _ in 0..cmd_count {
            cmds.push(get_hash(input)?);
        }
        let (qc_ref_hash, qc) = match get_u8(input)? {
            0 => (None, None),
            1 => {
                let qc_ref_hash = get_hash(input)?;
                let qc = QuorumCert::decode(input)?;
                (Some(qc_ref_hash), Some(qc))
            }
            _ => return Err(WireError::InvalidValue("qc presence flag")),
        };
        let extra_len = get_u32(input)? as usize;
        let extra = crate::wire::get_bytes(input, extra_len)?.to_vec();
        let height = get_u32(input)?;
        Ok(Self {
            parent_hashes,
            cmds,
            qc,
            qc_ref_hash,
            extra,
            height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{vote_obj_hash, KeyPair, PartialCert, ReplicaId};

    #[test]
    fn genesis_hash_is_stable() {
        assert_eq!(Block::genesis().hash(), Block::genesis().hash());
    }

    #[test]
    fn hash_covers_commands() {
        let parent = Block::genesis().hash();
        let a = Block::new(vec![parent], vec![Hash::digest(b"c1")], None, vec![], 1);
        let b = Block::new(vec![parent], vec![Hash::digest(b"c2")], None, vec![], 1);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn wire_roundtrip_with_embedded_qc() {
        let key = KeyPair::from_seed(&[3u8; 32]);
        let parent = Block::genesis().hash();
        let obj = vote_obj_hash(&parent);
        let mut qc = QuorumCert::new(obj);
        qc.add_part(ReplicaId(0), &PartialCert::create(&key, obj))
            .unwrap();
        qc.compute();

        let blk = Block::new(
            vec![parent],
            vec![Hash::digest(b"cmd")],
            Some((parent, qc)),
            b"extra".to_vec(),
            4,
        );
        let decoded = Block::from_wire_bytes(&blk.to_wire_bytes()).unwrap();
        assert_eq!(decoded, blk);
        assert_eq!(decoded.hash(), blk.hash());
    }

    #[test]
    fn wire_roundtrip_plain() {
        let blk = Block::new(
            vec![Block::genesis().hash()],
            vec![],
            None,
            vec![],
            1,
        );
        assert_eq!(Block::from_wire_bytes(&blk.to_wire_bytes()).unwrap(), blk);
    }
}
