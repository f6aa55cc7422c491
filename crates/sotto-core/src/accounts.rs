//! Account and key-pair lifecycle.
//!
//! The manager owns the durable account record (salt, KDF parameters,
//! verification tag, X25519 pair) and the ephemeral unlock result.  The
//! password-derived key only ever lives in a [`SessionKey`] held by the
//! caller; theft of the store alone yields neither the password nor
//! anything password-equivalent.

use std::sync::{Arc, Mutex};

use tracing::info;
use uuid::Uuid;

use sotto_shared::kdf::{generate_salt, verification_tag, DerivedKey, KdfParams, PasswordKdf};
use sotto_shared::keys::KeyPair;
use sotto_shared::KdfError;
use sotto_store::{Account, Database};

use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::friends::FriendRegistry;

/// The unlocked, in-memory session secret.  Zeroizes on drop via the
/// wrapped [`DerivedKey`]; never persisted.
pub struct SessionKey(DerivedKey);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionKey").field(&"<redacted>").finish()
    }
}

pub struct AccountManager {
    db: Arc<Mutex<Database>>,
    kdf: Arc<dyn PasswordKdf>,
    kdf_params: KdfParams,
    clock: Clock,
}

impl AccountManager {
    pub fn new(db: Arc<Mutex<Database>>, kdf: Arc<dyn PasswordKdf>, clock: Clock) -> Self {
        Self {
            db,
            kdf,
            kdf_params: KdfParams::default_interactive(),
            clock,
        }
    }

    /// Override the KDF cost parameters used for new accounts (tests,
    /// constrained devices).  Existing accounts keep their stored params.
    pub fn with_kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf_params = params;
        self
    }

    /// In-place variant of [`AccountManager::with_kdf_params`].
    pub fn set_kdf_params(&mut self, params: KdfParams) {
        self.kdf_params = params;
    }

    /// Create the local account.
    ///
    /// Fails with [`CoreError::AccountExists`] if the store already holds
    /// one.  The KDF runs on a blocking thread so other operations keep
    /// making progress while it grinds.
    pub async fn create_account(&self, username: &str, password: &str) -> Result<Account> {
        let username = username.trim().to_string();

        {
            let db = self.db.lock().expect("store lock");
            if db.get_account()?.is_some() {
                return Err(CoreError::AccountExists);
            }
        }

        let salt = generate_salt();
        let params = self.kdf_params.clone();
        let derived = self.derive_off_thread(password.to_string(), salt, params.clone()).await?;

        let pair = KeyPair::generate();
        let account = Account {
            id: Uuid::new_v4(),
            username,
            kdf_salt: salt,
            kdf_params: params,
            key_verifier: verification_tag(&derived),
            public_key: pair.public_key_bytes(),
            secret_key: pair.secret_bytes(),
            created_at: self.clock.now(),
        };

        {
            let db = self.db.lock().expect("store lock");
            db.insert_account(&account).map_err(|e| match e {
                sotto_store::StoreError::AccountExists => CoreError::AccountExists,
                other => CoreError::Store(other),
            })?;
        }

        info!(account_id = %account.id, username = %account.username, "account created");
        Ok(account)
    }

    /// Re-derive the key from the password and the stored salt/params.
    ///
    /// The comparison runs over verification tags, never raw key bytes.
    pub async fn unlock(&self, password: &str) -> Result<SessionKey> {
        let account = self.account()?;

        let derived = self
            .derive_off_thread(password.to_string(), account.kdf_salt, account.kdf_params.clone())
            .await?;

        if verification_tag(&derived) != account.key_verifier {
            return Err(CoreError::InvalidCredentials);
        }

        info!(account_id = %account.id, "account unlocked");
        Ok(SessionKey(derived))
    }

    /// Generate and persist a fresh key pair, returning the new public key
    /// for redistribution to friends.
    ///
    /// Existing shared secrets are stale from this point on, so the friend
    /// registry's cache is flushed; peers re-derive once they learn the new
    /// public key.
    pub fn rotate_key_pair(&self, registry: &FriendRegistry) -> Result<[u8; 32]> {
        let account = self.account()?;

        let pair = KeyPair::generate();
        {
            let db = self.db.lock().expect("store lock");
            db.update_account_keys(&pair.public_key_bytes(), &pair.secret_bytes())?;
        }
        registry.invalidate_secrets();

        info!(account_id = %account.id, "key pair rotated");
        Ok(pair.public_key_bytes())
    }

    /// The stored account record.
    pub fn account(&self) -> Result<Account> {
        let db = self.db.lock().expect("store lock");
        db.get_account()?.ok_or(CoreError::NoAccount)
    }

    async fn derive_off_thread(
        &self,
        password: String,
        salt: [u8; 16],
        params: KdfParams,
    ) -> Result<DerivedKey> {
        let kdf = Arc::clone(&self.kdf);
        let derived = tokio::task::spawn_blocking(move || {
            kdf.derive(password.as_bytes(), &salt, &params)
        })
        .await
        .map_err(|e| KdfError::Derivation(e.to_string()))??;
        Ok(derived)
    }
}
