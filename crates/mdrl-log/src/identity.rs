//! Writer identities and entry signatures (ed25519).

use crate::hash::Hash;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw ed25519 public key bytes. Used as clock id and signer id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicSignKey([u8; 32]);

impl PublicSignKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicSignKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Stable string id derived from the key, used as peer id.
    pub fn hashcode(&self) -> String {
        Hash::digest(&self.0).to_hex()
    }
}

impl fmt::Debug for PublicSignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicSignKey({})", &self.hashcode()[..8])
    }
}

/// A signature together with the key that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureWithKey {
    pub public_key: PublicSignKey,
    pub signature: Vec<u8>,
}

impl SignatureWithKey {
    /// Checks the signature over `data`. Malformed keys or signatures verify as false.
    pub fn verify(&self, data: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(self.public_key.as_bytes()) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        key.verify(data, &signature).is_ok()
    }
}

/// A local writer identity holding an ed25519 signing key.
#[derive(Clone)]
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Random identity.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Deterministic identity from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Identity {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> PublicSignKey {
        PublicSignKey(self.signing.verifying_key().to_bytes())
    }

    /// Peer id string for this identity.
    pub fn peer_id(&self) -> String {
        self.public_key().hashcode()
    }

    pub fn sign(&self, data: &[u8]) -> SignatureWithKey {
        let signature = self.signing.sign(data);
        SignatureWithKey {
            public_key: self.public_key(),
            signature: signature.to_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let identity = Identity::generate();
        let signature = identity.sign(b"payload");
        assert_eq!(signature.public_key, identity.public_key());
        assert!(signature.verify(b"payload"));
        assert!(!signature.verify(b"tampered"));
    }

    #[test]
    fn test_seeded_identity_is_stable() {
        let a = Identity::from_seed([7; 32]);
        let b = Identity::from_seed([7; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.sign(b"x"), b.sign(b"x"));
        assert_eq!(a.peer_id().len(), 64);
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = Identity::from_seed([1; 32]);
        let b = Identity::from_seed([2; 32]);
        let mut signature = a.sign(b"data");
        signature.public_key = b.public_key();
        assert!(!signature.verify(b"data"));
    }

    #[test]
    fn test_malformed_signature_fails() {
        let a = Identity::from_seed([1; 32]);
        let mut signature = a.sign(b"data");
        signature.signature.truncate(10);
        assert!(!signature.verify(b"data"));
    }
}
