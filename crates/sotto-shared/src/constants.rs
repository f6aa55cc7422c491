/// Application name
pub const APP_NAME: &str = "Sotto";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// X25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Password-KDF salt size in bytes
pub const SALT_SIZE: usize = 16;

/// Maximum message size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Maximum length of the conversation-list message preview, in characters
pub const PREVIEW_MAX_CHARS: usize = 80;

/// Clock offset above which a drift diagnostic is raised, in milliseconds
pub const CLOCK_DRIFT_WARN_MS: i64 = 5_000;

/// How long an unanswered outgoing or incoming call rings before it is
/// abandoned and the session falls back to idle, in seconds
pub const CALL_RING_TIMEOUT_SECS: i64 = 45;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_CONVERSATION_KEY: &str = "sotto-conversation-key-v1";
pub const KDF_CONTEXT_KEY_VERIFIER: &str = "sotto-key-verifier-v1";
