//! At-rest encryption for stored service tokens.
//!
//! Tokens are sealed with XChaCha20-Poly1305 under a 32-byte key and stored
//! as `base64(nonce || ciphertext)`. A fresh 24-byte nonce is drawn per
//! call, so encrypting the same token twice yields different blobs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use std::fmt;
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption key must be 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("encrypted blob is too short")]
    Truncated,
    #[error("cipher rejected the blob")]
    Cipher,
    #[error("decrypted token is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("system RNG unavailable: {0}")]
    Rng(getrandom::Error),
}

#[derive(Clone)]
pub struct TokenCipher {
    cipher: XChaCha20Poly1305,
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Build a cipher from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, VaultError> {
        let key = BASE64.decode(key_base64.trim())?;
        if key.len() != KEY_LEN {
            return Err(VaultError::KeyLength(key.len()));
        }
        Ok(Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce).map_err(VaultError::Rng)?;
        let sealed = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| VaultError::Cipher)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(BASE64.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> Result<String, VaultError> {
        let raw = BASE64.decode(blob.trim())?;
        if raw.len() < NONCE_LEN {
            return Err(VaultError::Truncated);
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let opened = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| VaultError::Cipher)?;
        Ok(String::from_utf8(opened)?)
    }
}

/// Generate a fresh base64-encoded key suitable for `TokenCipher::new`.
pub fn generate_key() -> Result<String, VaultError> {
    let mut key = [0u8; KEY_LEN];
    getrandom::getrandom(&mut key).map_err(VaultError::Rng)?;
    Ok(BASE64.encode(key))
}
