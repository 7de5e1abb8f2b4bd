//! Symmetric authenticated encryption for credentials at rest.
//!
//! Uses:
//! - BLAKE3 `derive_key` to turn the shared passphrase into a 256-bit key
//! - ChaCha20-Poly1305 for authenticated encryption
//!
//! Encrypted values are rendered as `base64(nonce):base64(ciphertext)` so they
//! can live inside any string-valued store.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Context string for BLAKE3 key derivation. Changing it invalidates every
/// stored session.
const KEY_CONTEXT: &str = "guildboard 2024-06-01 session vault token encryption";

const NONCE_LEN: usize = 12;
const SEPARATOR: char = ':';

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid base64 encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid payload - missing nonce/data separator")]
    InvalidPayload,

    #[error("Invalid nonce length")]
    InvalidNonce,

    #[error("Decryption failed - invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Cipher keyed by a passphrase-derived key.
///
/// The derived key is wiped from memory when the cipher is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TokenCipher {
    key: [u8; 32],
}

impl TokenCipher {
    /// Derive the cipher key from a shared passphrase.
    pub fn new(passphrase: &str) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, passphrase.as_bytes()),
        }
    }

    fn cipher(&self) -> CryptoResult<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Encrypt a secret with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(format!(
            "{}{}{}",
            BASE64.encode(nonce_bytes),
            SEPARATOR,
            BASE64.encode(ciphertext)
        ))
    }

    /// Decrypt a payload produced by [`TokenCipher::encrypt`].
    pub fn decrypt(&self, payload: &str) -> CryptoResult<String> {
        let (nonce_part, data_part) = payload
            .split_once(SEPARATOR)
            .ok_or(CryptoError::InvalidPayload)?;

        let nonce_bytes = BASE64.decode(nonce_part)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CryptoError::InvalidNonce);
        }
        let ciphertext = BASE64.decode(data_part)?;

        let mut plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        match String::from_utf8(std::mem::take(&mut plaintext)) {
            Ok(text) => Ok(text),
            Err(e) => {
                e.into_bytes().zeroize();
                Err(CryptoError::InvalidUtf8)
            }
        }
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

/// Encrypt `plaintext` under a key derived from `secret`.
pub fn encrypt(plaintext: &str, secret: &str) -> CryptoResult<String> {
    TokenCipher::new(secret).encrypt(plaintext)
}

/// Decrypt `payload` under a key derived from `secret`.
pub fn decrypt(payload: &str, secret: &str) -> CryptoResult<String> {
    TokenCipher::new(secret).decrypt(payload)
}
