//! AES-256-GCM encryption for token material at rest.
//!
//! Each value is sealed with a fresh random nonce and stored as
//! `base64(nonce || ciphertext)`, so one column holds one secret.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
    Engine,
};
use rand::RngCore;

use crate::error::{CipherError, DecryptionError};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of generated state and confirmation tokens in bytes
const TOKEN_SIZE: usize = 32;

/// Symmetric cipher holding the process-wide key.
///
/// Constructed once at startup and passed to whoever needs it; cloning shares
/// nothing mutable.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("cipher", &"<redacted>")
            .finish()
    }
}

impl TokenCipher {
    /// Build a cipher from a base64-encoded 32-byte key
    pub fn from_base64_key(key_base64: &str) -> Result<Self, CipherError> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .map_err(|_| CipherError::InvalidKeyEncoding)?;

        Self::from_bytes(&key_bytes)
    }

    /// Build a cipher from raw key bytes
    pub fn from_bytes(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != KEY_SIZE {
            return Err(CipherError::InvalidKeyLength { len: key.len() });
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| CipherError::InvalidKeyLength { len: key.len() })?;

        Ok(Self { cipher })
    }

    /// Generate a new random key (base64-encoded)
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        BASE64.encode(key)
    }

    /// Encrypt a plaintext string
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::EncryptFailed)?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(combined))
    }

    /// Decrypt a value produced by [`TokenCipher::encrypt`].
    ///
    /// Wrong key, tampering and malformed input are indistinguishable to the
    /// caller.
    pub fn decrypt(&self, sealed: &str) -> Result<String, DecryptionError> {
        let combined = BASE64.decode(sealed).map_err(|_| DecryptionError)?;

        if combined.len() <= NONCE_SIZE {
            return Err(DecryptionError);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| DecryptionError)?;

        String::from_utf8(plaintext).map_err(|_| DecryptionError)
    }
}

/// Random 256-bit URL-safe token for OAuth states and confirmation ids
pub fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_SIZE];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
