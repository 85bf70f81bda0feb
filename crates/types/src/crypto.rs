//! Signing keys and signatures.
//!
//! The protocol only relies on the semantic contract of a signature scheme:
//! a replica's key signs a 32-byte proof-object hash, and anyone holding the
//! registered public key can check it. Ed25519 satisfies that contract; a
//! deployment wanting threshold or aggregate signatures swaps this module.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use std::fmt;
use thiserror::Error;

/// Errors from key or signature deserialization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")]
    InvalidPublicKey,
}

/// A replica's signing key pair.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Derive a key pair from a 32-byte seed.
    ///
    /// Deterministic: the same seed always yields the same key.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// The public half of this key pair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    /// Sign a message.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.signing.sign(msg).to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish()
    }
}

/// A replica's registered verification key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Verify a signature over `msg`.
    pub fn verify(&self, msg: &[u8], sig: &Signature) -> bool {
        let sig = ed25519_dalek::Signature::from_bytes(&sig.0);
        self.0.verify(msg, &sig).is_ok()
    }

    /// Raw key bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Parse raw key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(PublicKey)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pk:{}", hex::encode(&self.to_bytes()[..5]))
    }
}

/// A detached signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Raw signature bytes.
    pub const fn to_bytes(&self) -> [u8; 64] {
        self.0
    }

    /// Construct from raw bytes.
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Signature(bytes)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig:{}", hex::encode(&self.0[..5]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = KeyPair::from_seed(&[7u8; 32]);
        let sig = kp.sign(b"hello");
        assert!(kp.public_key().verify(b"hello", &sig));
        assert!(!kp.public_key().verify(b"other", &sig));
    }

    #[test]
    fn wrong_key_rejects() {
        let a = KeyPair::from_seed(&[1u8; 32]);
        let b = KeyPair::from_seed(&[2u8; 32]);
        let sig = a.sign(b"msg");
        assert!(!b.public_key().verify(b"msg", &sig));
    }

    #[test]
    fn seeded_keys_are_deterministic() {
        let a = KeyPair::from_seed(&[9u8; 32]);
        let b = KeyPair::from_seed(&[9u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
    }
}
