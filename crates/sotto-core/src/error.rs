use thiserror::Error;
use uuid::Uuid;

use sotto_shared::{CryptoError, KdfError, KeyError};
use sotto_store::StoreError;

/// Errors produced by the service layer.
///
/// Four families, with different handling expectations:
/// credential errors are surfaced to the user and never retried
/// automatically; integrity errors are logged and leave the last
/// known-good state in place; policy errors are rejected synchronously
/// with no persistence side effect; transient errors are eligible for
/// caller-driven retry.  Nothing here is fatal to the process.
#[derive(Error, Debug)]
pub enum CoreError {
    // --- credential ---
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("No public key on record for peer {0}")]
    MissingPeerKey(Uuid),

    #[error("No local account exists")]
    NoAccount,

    // --- policy ---
    #[error("An account already exists")]
    AccountExists,

    #[error("Sender {0} is blocked")]
    BlockedSender(Uuid),

    #[error("Peer {0} has no pending request in the required direction")]
    NotPending(Uuid),

    #[error("A call session is already active")]
    CallBusy,

    #[error("No active call session")]
    NotInCall,

    #[error("Signal does not apply to the current call state")]
    UnexpectedSignal,

    // --- integrity / transient (wrapped) ---
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Key derivation error: {0}")]
    Kdf(#[from] KdfError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    /// Whether a caller-driven retry with backoff can plausibly succeed.
    /// Credential, policy, and integrity failures are deterministic;
    /// retrying them with the same inputs cannot help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Store(StoreError::Sqlite(_)) | CoreError::Store(StoreError::Io(_))
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
