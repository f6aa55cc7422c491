use thiserror::Error;

#[derive(Error, Debug)]
pub enum SottoError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Key derivation error: {0}")]
    Kdf(#[from] KdfError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,
}

#[derive(Error, Debug)]
pub enum KdfError {
    #[error("Unsupported KDF parameters: {0}")]
    InvalidParams(String),

    #[error("Key derivation failed: {0}")]
    Derivation(String),
}

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,
}
