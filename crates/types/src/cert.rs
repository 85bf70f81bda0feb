//! Partial and quorum certificates.
//!
//! A [`PartialCert`] proves that one replica authorized a proof-object hash.
//! A [`QuorumCert`] accumulates partial certificates from distinct signers
//! and, once `compute()` has been called with at least `nmajority` parts,
//! proves that a quorum authorized the hash.

use crate::wire::{
    get_hash, get_signature, get_u16, get_u32, get_u8, put_hash, put_signature, put_u16, put_u32,
    put_u8, WireDecode, WireEncode, WireError,
};
use crate::{Hash, KeyPair, PublicKey, ReplicaId, Signature};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from certificate accumulation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertError {
    #[error("part attests to {part}, certificate is over {expected}")]
    ObjHashMismatch { part: Hash, expected: Hash },
    #[error("certificate already finalized")]
    AlreadyFinalized,
}

/// One replica's signature over a proof-object hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialCert {
    obj_hash: Hash,
    signature: Signature,
}

impl PartialCert {
    /// Sign a proof-object hash.
    pub fn create(key: &KeyPair, obj_hash: Hash) -> Self {
        Self {
            signature: key.sign(obj_hash.as_bytes()),
            obj_hash,
        }
    }

    /// The proof-object hash this certificate attests to.
    pub fn obj_hash(&self) -> Hash {
        self.obj_hash
    }

    /// Check the signature against the claimed signer's key.
    pub fn verify(&self, pub_key: &PublicKey) -> bool {
        pub_key.verify(self.obj_hash.as_bytes(), &self.signature)
    }

    /// The raw signature (consumed when aggregating into a quorum cert).
    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

impl WireEncode for PartialCert {
    fn encode(&self, out: &mut Vec<u8>) {
        put_hash(out, &self.obj_hash);
        put_signature(out, &self.signature);
    }
}

impl WireDecode for PartialCert {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            obj_hash: get_hash(input)?,
            signature: get_signature(input)?,
        })
    }
}

/// A quorum of signatures over a single proof-object hash.
///
/// Mutable while accumulating; `compute()` freezes it. Signer order is
/// canonical (ascending replica id) so two replicas aggregating the same
/// parts produce byte-identical certificates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuorumCert {
    obj_hash: Hash,
    parts: BTreeMap<ReplicaId, Signature>,
    finalized: bool,
}

impl QuorumCert {
    /// Start accumulating a certificate over `obj_hash`.
    pub fn new(obj_hash: Hash) -> Self {
        Self {
            obj_hash,
            parts: BTreeMap::new(),
            finalized: false,
        }
    }

    /// A finalized certificate with no signers.
    ///
    /// Only the genesis block is certified this way; verification of a
    /// self-certified cert fails everywhere except the genesis fast path.
    pub fn self_certified(obj_hash: Hash) -> Self {
        Self {
            obj_hash,
            parts: BTreeMap::new(),
            finalized: true,
        }
    }

    /// The proof-object hash this certificate is over.
    pub fn obj_hash(&self) -> Hash {
        self.obj_hash
    }

    /// Add one signer's partial certificate.
    pub fn add_part(&mut self, signer: ReplicaId, part: &PartialCert) -> Result<(), CertError> {
        if self.finalized {
            return Err(CertError::AlreadyFinalized);
        }
        if part.obj_hash() != self.obj_hash {
            return Err(CertError::ObjHashMismatch {
                part: part.obj_hash(),
                expected: self.obj_hash,
            });
        }
        self.parts.insert(signer, *part.signature());
        Ok(())
    }

    /// Finalize the aggregate. Idempotent.
    pub fn compute(&mut self) {
        self.finalized = true;
    }

    /// Whether `compute()` has run.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Finalized with an empty signer set (genesis only).
    pub fn is_self_certified(&self) -> bool {
        self.finalized && self.parts.is_empty()
    }

    /// Number of distinct signers.
    pub fn signer_count(&self) -> usize {
        self.parts.len()
    }

    /// Iterate the signer set in canonical order.
    pub fn signers(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.parts.keys().copied()
    }

    /// Verify the certificate: finalized, quorum-sized, and every part
    /// checks against its signer's registered key.
    pub fn verify(&self, keys: &BTreeMap<ReplicaId, PublicKey>, quorum: usize) -> bool {
        if !self.finalized || self.parts.len() < quorum {
            return false;
        }
        self.parts.iter().all(|(rid, sig)| {
            keys.get(rid)
                .is_some_and(|pk| pk.verify(self.obj_hash.as_bytes(), sig))
        })
    }
}

impl WireEncode for QuorumCert {
    fn encode(&self, out: &mut Vec<u8>) {
        put_hash(out, &self.obj_hash);
        put_u8(out, self.finalized as u8);
        // Length checked at construction; a cert cannot hold 2^32 signers.
        put_u32(out, self.parts.len() as u32);
        for (rid, sig) in &self.parts {
            put_u16(out, rid.0);
            put_signature(out, sig);
        }
    }
}

impl WireDecode for QuorumCert {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let obj_hash = get_hash(input)?;
        let finalized = match get_u8(input)? {
            0 => false,
            1 => true,
            _ => return Err(WireError::InvalidValue("finalized flag")),
        };
        let count = get_u32(input)?;
        let mut parts = BTreeMap::new();
        for _ in 0..count {
            let rid = ReplicaId(get_u16(input)?);
            let sig = get_signature(input)?;
            parts.insert(rid, sig);
        }
        Ok(Self {
            obj_hash,
            parts,
            finalized,
        })
    }
}
