//! Password key derivation.
//!
//! The account manager treats the KDF as an opaque, slow collaborator: it
//! hands over (password, salt, parameters) and gets back a 32-byte key.
//! [`PasswordKdf`] is that seam; [`Argon2Kdf`] is the default
//! implementation.  Parameters are an explicit tagged structure so they can
//! be persisted per-account and raised later without breaking old accounts.

use argon2::{Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::constants::{KDF_CONTEXT_KEY_VERIFIER, SALT_SIZE};
use crate::error::KdfError;

/// Supported KDF algorithms and their cost factors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum KdfParams {
    Argon2id {
        /// Memory cost in KiB.
        m_cost: u32,
        /// Number of iterations.
        t_cost: u32,
        /// Degree of parallelism.
        p_cost: u32,
    },
}

impl KdfParams {
    /// Defaults tuned for interactive (desktop) unlock: 64 MiB, 3 passes.
    pub fn default_interactive() -> Self {
        Self::Argon2id {
            m_cost: 64 * 1024,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

/// 32-byte key derived from the user's password.  Zeroized on drop and
/// never persisted; only its verification tag reaches the store.
#[derive(ZeroizeOnDrop)]
pub struct DerivedKey(pub [u8; 32]);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// The seam the account manager calls through.  Implementations may take
/// seconds; callers run them off the cooperative executor.
pub trait PasswordKdf: Send + Sync {
    fn derive(
        &self,
        password: &[u8],
        salt: &[u8; SALT_SIZE],
        params: &KdfParams,
    ) -> Result<DerivedKey, KdfError>;
}

/// Argon2id implementation of [`PasswordKdf`].
pub struct Argon2Kdf;

impl PasswordKdf for Argon2Kdf {
    fn derive(
        &self,
        password: &[u8],
        salt: &[u8; SALT_SIZE],
        params: &KdfParams,
    ) -> Result<DerivedKey, KdfError> {
        let KdfParams::Argon2id {
            m_cost,
            t_cost,
            p_cost,
        } = params;

        let argon_params = Params::new(*m_cost, *t_cost, *p_cost, Some(32))
            .map_err(|e| KdfError::InvalidParams(e.to_string()))?;
        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon_params);

        let mut output = [0u8; 32];
        argon2
            .hash_password_into(password, salt, &mut output)
            .map_err(|e| KdfError::Derivation(e.to_string()))?;
        Ok(DerivedKey(output))
    }
}

/// Generate a fresh random salt (call once at account creation; stored
/// alongside the account, not secret).
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Verification tag for a derived key.
///
/// Unlock compares tags rather than raw key bytes, so the stored record
/// never contains anything password-equivalent.
pub fn verification_tag(key: &DerivedKey) -> String {
    let tag = blake3::derive_key(KDF_CONTEXT_KEY_VERIFIER, key.as_bytes());
    hex::encode(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cheap parameters so the test suite stays fast.
    fn test_params() -> KdfParams {
        KdfParams::Argon2id {
            m_cost: 8,
            t_cost: 1,
            p_cost: 1,
        }
    }

    #[test]
    fn test_derivation_deterministic() {
        let salt = [7u8; SALT_SIZE];
        let k1 = Argon2Kdf.derive(b"hunter2", &salt, &test_params()).unwrap();
        let k2 = Argon2Kdf.derive(b"hunter2", &salt, &test_params()).unwrap();
        assert_eq!(k1.0, k2.0);
    }

    #[test]
    fn test_different_password_different_key() {
        let salt = [7u8; SALT_SIZE];
        let k1 = Argon2Kdf.derive(b"hunter2", &salt, &test_params()).unwrap();
        let k2 = Argon2Kdf.derive(b"hunter3", &salt, &test_params()).unwrap();
        assert_ne!(k1.0, k2.0);
    }

    #[test]
    fn test_different_salt_different_key() {
        let k1 = Argon2Kdf
            .derive(b"hunter2", &[1u8; SALT_SIZE], &test_params())
            .unwrap();
        let k2 = Argon2Kdf
            .derive(b"hunter2", &[2u8; SALT_SIZE], &test_params())
            .unwrap();
        assert_ne!(k1.0, k2.0);
    }

    #[test]
    fn test_verification_tag_matches_key_not_password() {
        let salt = [7u8; SALT_SIZE];
        let key = Argon2Kdf.derive(b"hunter2", &salt, &test_params()).unwrap();
        let tag = verification_tag(&key);

        assert_eq!(tag, verification_tag(&key));
        // Tag is not the key itself.
        assert_ne!(tag, hex::encode(key.as_bytes()));
    }

    #[test]
    fn test_params_roundtrip_json() {
        let params = KdfParams::default_interactive();
        let json = serde_json::to_string(&params).unwrap();
        let restored: KdfParams = serde_json::from_str(&json).unwrap();
        assert_eq!(params, restored);
    }

    #[test]
    fn test_invalid_params_rejected() {
        // Argon2 refuses a memory cost this small.
        let bad = KdfParams::Argon2id {
            m_cost: 1,
            t_cost: 1,
            p_cost: 1,
        };
        let salt = [0u8; SALT_SIZE];
        assert!(matches!(
            Argon2Kdf.derive(b"pw", &salt, &bad),
            Err(KdfError::InvalidParams(_))
        ));
    }
}
