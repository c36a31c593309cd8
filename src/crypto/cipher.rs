//! AES-256-GCM credential cipher.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use super::CryptoError;

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

const ENCODING_VERSION: &str = "v1";

/// Ciphertext plus the nonce it was sealed with.
///
/// Text form is `v1.<base64url(nonce || ciphertext)>`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SealedSecret {
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl SealedSecret {
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        raw.extend_from_slice(&self.nonce);
        raw.extend_from_slice(&self.ciphertext);
        format!("{ENCODING_VERSION}.{}", URL_SAFE_NO_PAD.encode(raw))
    }

    pub fn decode(text: &str) -> Result<Self, CryptoError> {
        let body = text
            .strip_prefix(ENCODING_VERSION)
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or(CryptoError::MalformedCiphertext)?;
        let raw = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| CryptoError::MalformedCiphertext)?;
        if raw.len() <= NONCE_SIZE {
            return Err(CryptoError::MalformedCiphertext);
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&raw[..NONCE_SIZE]);
        Ok(Self {
            nonce,
            ciphertext: raw[NONCE_SIZE..].to_vec(),
        })
    }

    /// Byte equality without early exit. Used by conditional credential updates.
    pub fn ct_eq(&self, other: &SealedSecret) -> bool {
        let nonce_eq = self.nonce[..].ct_eq(&other.nonce[..]);
        let body_eq = self.ciphertext.as_slice().ct_eq(other.ciphertext.as_slice());
        (nonce_eq & body_eq).into()
    }
}

impl TryFrom<String> for SealedSecret {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decode(&value)
    }
}

impl From<SealedSecret> for String {
    fn from(value: SealedSecret) -> Self {
        value.encode()
    }
}

impl std::fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedSecret")
            .field("len", &self.ciphertext.len())
            .finish()
    }
}

/// Encrypt/decrypt capability for at-rest credentials.
///
/// Injected as `Arc<dyn CredentialCipher>` so key rotation and test doubles
/// do not touch call sites.
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<SealedSecret, CryptoError>;

    fn decrypt(&self, sealed: &SealedSecret) -> Result<Vec<u8>, CryptoError>;

    fn encrypt_str(&self, plaintext: &str) -> Result<SealedSecret, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    fn decrypt_string(&self, sealed: &SealedSecret) -> Result<String, CryptoError> {
        String::from_utf8(self.decrypt(sealed)?).map_err(|_| CryptoError::Decryption)
    }
}

/// AES-256-GCM with a random 96-bit nonce per encryption.
#[derive(Clone)]
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Create a cipher from a hex-encoded 32-byte key.
    pub fn from_hex_key(key_hex: &str) -> Result<Self, CryptoError> {
        let key = hex::decode(key_hex.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::from_key(&key)
    }

    /// Create a cipher from raw key bytes.
    pub fn from_key(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "expected {KEY_SIZE} bytes, got {}",
                key.len()
            )));
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Generate a new random key, hex-encoded (for initial setup).
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }
}

impl CredentialCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<SealedSecret, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        Ok(SealedSecret { nonce, ciphertext })
    }

    fn decrypt(&self, sealed: &SealedSecret) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
            .map_err(|_| CryptoError::Decryption)
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}
