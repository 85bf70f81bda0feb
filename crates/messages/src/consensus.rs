//! Consensus wire messages.
//!
//! Field order and widths are fixed: `ReplicaId` is a `u16`, views and
//! heights are `u32`, hashes are 32 bytes. A message that fails to decode is
//! rejected at the transport; the core never sees malformed input.

use tessera_types::wire::{
    get_hash, get_i8, get_u16, get_u32, get_u8, put_hash, put_i8, put_u16, put_u32, put_u8,
    WireDecode, WireEncode, WireError,
};
use tessera_types::{Block, Hash, PartialCert, QuorumCert, ReplicaId};

/// What an [`Echo`]/[`Ack`] pair is propagating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PropagateOp {
    /// A block proposal.
    Block = 0x00,
}

impl PropagateOp {
    fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0x00 => Ok(PropagateOp::Block),
            _ => Err(WireError::InvalidValue("propagate opcode")),
        }
    }
}

/// A block proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub proposer: ReplicaId,
    pub block: Block,
}

impl WireEncode for Proposal {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u16(out, self.proposer.0);
        self.block.encode(out);
    }
}

impl WireDecode for Proposal {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            proposer: ReplicaId(get_u16(input)?),
            block: Block::decode(input)?,
        })
    }
}

/// A vote for a block, carrying a partial certificate over `VOTE(blk_hash)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub voter: ReplicaId,
    pub blk_hash: Hash,
    pub cert: PartialCert,
}

impl WireEncode for Vote {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u16(out, self.voter.0);
        put_hash(out, &self.blk_hash);
        self.cert.encode(out);
    }
}

impl WireDecode for Vote {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            voter: ReplicaId(get_u16(input)?),
            blk_hash: get_hash(input)?,
            cert: PartialCert::decode(input)?,
        })
    }
}

/// Announcement of the highest certified block, sent on view entry so
/// laggards can catch up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub blk_hash: Hash,
    pub qc: QuorumCert,
}

impl WireEncode for Notify {
    fn encode(&self, out: &mut Vec<u8>) {
        put_hash(out, &self.blk_hash);
        self.qc.encode(out);
    }
}

impl WireDecode for Notify {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            blk_hash: get_hash(input)?,
            qc: QuorumCert::decode(input)?,
        })
    }
}

/// A complaint against the current view's proposer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blame {
    pub blamer: ReplicaId,
    pub view: u32,
    pub cert: PartialCert,
}

impl WireEncode for Blame {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u16(out, self.blamer.0);
        put_u32(out, self.view);
        self.cert.encode(out);
    }
}

impl WireDecode for Blame {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            blamer: ReplicaId(get_u16(input)?),
            view: get_u32(input)?,
            cert: PartialCert::decode(input)?,
        })
    }
}

/// Proof that a quorum blamed `view`, plus the sender's highest QC so the
/// next view starts from the freshest certified block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlameNotify {
    pub view: u32,
    pub hqc_hash: Hash,
    pub hqc_qc: QuorumCert,
    pub qc: QuorumCert,
}

impl WireEncode for BlameNotify {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.view);
        put_hash(out, &self.hqc_hash);
        self.hqc_qc.encode(out);
        self.qc.encode(out);
    }
}

impl WireDecode for BlameNotify {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            view: get_u32(input)?,
            hqc_hash: get_hash(input)?,
            hqc_qc: QuorumCert::decode(input)?,
            qc: QuorumCert::decode(input)?,
        })
    }
}

/// First phase of reliable propagation: "I have this block".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Echo {
    pub rid: ReplicaId,
    pub blk_hash: Hash,
    pub opcode: PropagateOp,
    pub cert: PartialCert,
}

impl WireEncode for Echo {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u16(out, self.rid.0);
        put_hash(out, &self.blk_hash);
        put_u8(out, self.opcode as u8);
        self.cert.encode(out);
    }
}

impl WireDecode for Echo {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            rid: ReplicaId(get_u16(input)?),
            blk_hash: get_hash(input)?,
            opcode: PropagateOp::from_u8(get_u8(input)?)?,
            cert: PartialCert::decode(input)?,
        })
    }
}

/// Second phase of reliable propagation: "a quorum echoed this block".
/// Same layout as [`Echo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub rid: ReplicaId,
    pub blk_hash: Hash,
    pub opcode: PropagateOp,
    pub cert: PartialCert,
}

impl WireEncode for Ack {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u16(out, self.rid.0);
        put_hash(out, &self.blk_hash);
        put_u8(out, self.opcode as u8);
        self.cert.encode(out);
    }
}

impl WireDecode for Ack {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            rid: ReplicaId(get_u16(input)?),
            blk_hash: get_hash(input)?,
            opcode: PropagateOp::from_u8(get_u8(input)?)?,
            cert: PartialCert::decode(input)?,
        })
    }
}

/// Extra quorum phase collected at commit-interval boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreCommit {
    pub rid: ReplicaId,
    pub blk_hash: Hash,
    pub cert: PartialCert,
}

impl WireEncode for PreCommit {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u16(out, self.rid.0);
        put_hash(out, &self.blk_hash);
        self.cert.encode(out);
    }
}

impl WireDecode for PreCommit {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            rid: ReplicaId(get_u16(input)?),
            blk_hash: get_hash(input)?,
            cert: PartialCert::decode(input)?,
        })
    }
}

/// Commit record for a single command.
///
/// `blk_hash` is on the wire only when `decision == 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finality {
    pub rid: ReplicaId,
    pub decision: i8,
    pub cmd_idx: u32,
    pub cmd_height: u32,
    pub cmd_hash: Hash,
    pub blk_hash: Hash,
}

impl WireEncode for Finality {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u16(out, self.rid.0);
        put_i8(out, self.decision);
        put_u32(out, self.cmd_idx);
        put_u32(out, self.cmd_height);
        put_hash(out, &self.cmd_hash);
        if self.decision == 1 {
            put_hash(out, &self.blk_hash);
        }
    }
}

impl WireDecode for Finality {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let rid = ReplicaId(get_u16(input)?);
        let decision = get_i8(input)?;
        let cmd_idx = get_u32(input)?;
        let cmd_height = get_u32(input)?;
        let cmd_hash = get_hash(input)?;
        let blk_hash = if decision == 1 {
            get_hash(input)?
        } else {
            Hash::ZERO
        };
        Ok(Self {
            rid,
            decision,
            cmd_idx,
            cmd_height,
            cmd_hash,
            blk_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{blame_obj_hash, propagate_obj_hash, vote_obj_hash, KeyPair};

    fn key() -> KeyPair {
        KeyPair::from_seed(&[5u8; 32])
    }

    fn roundtrip<T: WireEncode + WireDecode + PartialEq + std::fmt::Debug>(msg: &T) {
        let decoded = T::from_wire_bytes(&msg.to_wire_bytes()).unwrap();
        assert_eq!(&decoded, msg);
    }

    #[test]
    fn proposal_roundtrip() {
        let block = Block::new(
            vec![Block::genesis().hash()],
            vec![Hash::digest(b"cmd")],
            None,
            vec![1, 2, 3],
            1,
        );
        roundtrip(&Proposal {
            proposer: ReplicaId(2),
            block,
        });
    }

    #[test]
    fn vote_roundtrip() {
        let blk_hash = Hash::digest(b"blk");
        roundtrip(&Vote {
            voter: ReplicaId(1),
            blk_hash,
            cert: PartialCert::create(&key(), vote_obj_hash(&blk_hash)),
        });
    }

    #[test]
    fn notify_roundtrip() {
        let blk_hash = Hash::digest(b"blk");
        roundtrip(&Notify {
            blk_hash,
            qc: QuorumCert::self_certified(vote_obj_hash(&blk_hash)),
        });
    }

    #[test]
    fn blame_roundtrip() {
        roundtrip(&Blame {
            blamer: ReplicaId(3),
            view: 7,
            cert: PartialCert::create(&key(), blame_obj_hash(7)),
        });
    }

    #[test]
    fn blamenotify_roundtrip() {
        let blk_hash = Hash::digest(b"hqc");
        roundtrip(&BlameNotify {
            view: 2,
            hqc_hash: blk_hash,
            hqc_qc: QuorumCert::self_certified(vote_obj_hash(&blk_hash)),
            qc: QuorumCert::new(blame_obj_hash(2)),
        });
    }

    #[test]
    fn echo_and_ack_roundtrip() {
        let blk_hash = Hash::digest(b"blk");
        let cert = PartialCert::create(&key(), propagate_obj_hash(&blk_hash));
        roundtrip(&Echo {
            rid: ReplicaId(0),
            blk_hash,
            opcode: PropagateOp::Block,
            cert: cert.clone(),
        });
        roundtrip(&Ack {
            rid: ReplicaId(0),
            blk_hash,
            opcode: PropagateOp::Block,
            cert,
        });
    }

    #[test]
    fn pre_commit_roundtrip() {
        let blk_hash = Hash::digest(b"blk");
        roundtrip(&PreCommit {
            rid: ReplicaId(1),
            blk_hash,
            cert: PartialCert::create(&key(), vote_obj_hash(&blk_hash)),
        });
    }

    #[test]
    fn finality_blk_hash_gated_on_decision() {
        let committed = Finality {
            rid: ReplicaId(0),
            decision: 1,
            cmd_idx: 0,
            cmd_height: 4,
            cmd_hash: Hash::digest(b"cmd"),
            blk_hash: Hash::digest(b"blk"),
        };
        roundtrip(&committed);

        let undecided = Finality {
            decision: 0,
            blk_hash: Hash::ZERO,
            ..committed.clone()
        };
        let bytes = undecided.to_wire_bytes();
        assert_eq!(bytes.len(), committed.to_wire_bytes().len() - Hash::LEN);
        roundtrip(&undecided);
    }
}
