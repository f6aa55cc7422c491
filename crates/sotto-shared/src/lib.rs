//! # sotto-shared
//!
//! Types shared between the store and service layers of Sotto: identifier
//! newtypes, the cryptographic primitives used for end-to-end encryption,
//! the password-KDF seam, and the wire protocol exchanged with peers over
//! the (external) transport.

pub mod constants;
pub mod crypto;
pub mod kdf;
pub mod keys;
pub mod protocol;
pub mod types;

mod error;

pub use error::{CryptoError, KdfError, KeyError, SottoError};
