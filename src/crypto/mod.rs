//! Secret/encryption subsystem.
//!
//! # Data Flow
//! ```text
//! upstream refresh credential (plaintext, never stored)
//!     → cipher.rs encrypt (AES-256-GCM, fresh nonce)
//!     → SealedSecret (nonce || ciphertext, "v1." text form)
//!     → principal store
//! ```
//!
//! # Design Decisions
//! - Encryption key is independent of the session signing key
//! - Decryption failure means "no usable credential", never a panic
//! - Cipher is a trait object injected at startup

pub mod cipher;

pub use cipher::{AesGcmCipher, CredentialCipher, SealedSecret};

/// Errors from the credential cipher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encryption,

    /// Tampered ciphertext or a key mismatch.
    #[error("decryption failed")]
    Decryption,

    #[error("malformed ciphertext encoding")]
    MalformedCiphertext,
}
