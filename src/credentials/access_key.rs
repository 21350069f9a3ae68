//! Access keys identifying the end user to the MCP server.
//!
//! After authorization the user is handed their user id sealed with the token
//! cipher. The MCP client presents it on every session; opening it yields the
//! user id the Vault is keyed by. Rotating the encryption key invalidates all
//! access keys along with the stored credentials.

use super::TokenCipher;
use crate::error::AuthError;

/// Issues and resolves access keys
#[derive(Debug, Clone)]
pub struct AccessKeys {
    cipher: TokenCipher,
}

impl AccessKeys {
    pub fn new(cipher: TokenCipher) -> Self {
        Self { cipher }
    }

    /// Seal `user_id` into an opaque access key
    pub fn issue(&self, user_id: &str) -> Result<String, AuthError> {
        self.cipher
            .encrypt(user_id)
            .map_err(|e| AuthError::CodeExchangeFailed {
                message: format!("could not issue access key: {}", e),
            })
    }

    /// Recover the user id from an access key
    pub fn resolve(&self, access_key: &str) -> Result<String, AuthError> {
        match self.cipher.decrypt(access_key.trim()) {
            Ok(user_id) if !user_id.is_empty() => Ok(user_id),
            _ => Err(AuthError::InvalidAccessKey),
        }
    }
}
