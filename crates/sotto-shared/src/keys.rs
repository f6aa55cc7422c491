use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{derive_conversation_key, SymmetricKey};
use crate::error::KeyError;

/// A user's asymmetric key pair based on X25519.
///
/// The pair exists to agree on shared secrets with peers; Sotto has no
/// signing surface, so there is no companion Ed25519 key.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
}

/// Serializable format for storing/exporting a key pair
#[derive(Serialize, Deserialize)]
pub struct KeyPairExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self { secret }
    }

    /// Restore a key pair from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(*secret),
        }
    }

    /// Restore a key pair from a serialized export
    pub fn from_export(export: &KeyPairExport) -> Self {
        Self::from_secret_bytes(&export.secret_key)
    }

    /// Get the raw public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        PublicKey::from(&self.secret).to_bytes()
    }

    /// Get the raw secret key bytes
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Export the key pair for serialization
    pub fn to_export(&self) -> KeyPairExport {
        KeyPairExport {
            secret_key: self.secret.to_bytes(),
            public_key: self.public_key_bytes(),
        }
    }

    /// Raw X25519 Diffie-Hellman with a peer's public key.
    ///
    /// Callers should not use the output directly as an encryption key;
    /// run it through [`derive_shared_secret`] to bind it to a conversation.
    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let peer = PublicKey::from(*peer_public);
        self.secret.diffie_hellman(&peer).to_bytes()
    }
}

/// Derive the symmetric key for a conversation with a peer.
///
/// Both sides arrive at the same key: X25519 guarantees
/// `a_secret x b_public == b_secret x a_public`, and the BLAKE3 step binds
/// the result to the conversation id.
pub fn derive_shared_secret(
    local: &KeyPair,
    peer_public: &[u8; 32],
    conversation_id: &[u8],
) -> SymmetricKey {
    let dh = local.diffie_hellman(peer_public);
    derive_conversation_key(&dh, conversation_id)
}

/// Validate and copy raw public key bytes from a slice.
pub fn public_key_from_slice(bytes: &[u8]) -> Result<[u8; 32], KeyError> {
    if bytes.len() != 32 {
        return Err(KeyError::InvalidKeyBytes);
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_roundtrip() {
        let pair = KeyPair::generate();
        let export = pair.to_export();
        let restored = KeyPair::from_export(&export);
        assert_eq!(pair.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn test_dh_agreement() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let ab = alice.diffie_hellman(&bob.public_key_bytes());
        let ba = bob.diffie_hellman(&alice.public_key_bytes());

        assert_eq!(ab, ba);
    }

    #[test]
    fn test_shared_secret_agreement() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let conversation = b"conversation-42";

        let k1 = derive_shared_secret(&alice, &bob.public_key_bytes(), conversation);
        let k2 = derive_shared_secret(&bob, &alice.public_key_bytes(), conversation);

        assert_eq!(k1, k2);
    }

    #[test]
    fn test_rotation_changes_shared_secret() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let conversation = b"conversation-42";

        let before = derive_shared_secret(&alice, &bob.public_key_bytes(), conversation);
        let rotated = KeyPair::generate();
        let after = derive_shared_secret(&rotated, &bob.public_key_bytes(), conversation);

        assert_ne!(before, after);
    }

    #[test]
    fn test_public_key_from_slice_length_check() {
        assert!(public_key_from_slice(&[0u8; 31]).is_err());
        assert!(public_key_from_slice(&[0u8; 32]).is_ok());
    }
}
