//! Encrypted per-user credential storage.
//!
//! ```text
//! Credential (plaintext, Vault only)
//!      │ seal ▲ open            TokenCipher (AES-256-GCM)
//!      ▼      │
//! SealedCredential ──────────── CredentialStore (SQLite / memory)
//! ```
//!
//! Token fields exist in plaintext only inside the Vault. Everything that
//! crosses the store boundary is a [`SealedCredential`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::error::{CipherError, DecryptionError};

pub mod access_key;
pub mod cipher;
pub mod memory;
pub mod store;

pub use access_key::AccessKeys;
pub use cipher::{random_token, TokenCipher};
pub use memory::MemoryCredentialStore;
pub use store::{CredentialStore, SqliteCredentialStore};

/// Decrypted OAuth credential for one user
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Stable provider-side user identifier
    pub user_id: String,

    /// Bearer token for Gmail API calls
    pub access_token: String,

    /// Long-lived token used to mint new access tokens; never empty
    pub refresh_token: String,

    /// Granted scopes
    pub scopes: BTreeSet<String>,

    /// The access token is invalid at and after this instant
    pub expires_at: DateTime<Utc>,

    /// Last successful write
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

impl Credential {
    /// Encrypt the token fields for persistence
    pub fn seal(&self, cipher: &TokenCipher) -> Result<SealedCredential, CipherError> {
        Ok(SealedCredential {
            user_id: self.user_id.clone(),
            access_token: cipher.encrypt(&self.access_token)?,
            refresh_token: cipher.encrypt(&self.refresh_token)?,
            scopes: self.scopes.iter().cloned().collect(),
            expires_at: self.expires_at,
            updated_at: self.updated_at,
        })
    }
}

/// Credential row as persisted: token fields are ciphertext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedCredential {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SealedCredential {
    /// Decrypt the token fields.
    ///
    /// An unreadable refresh token or an empty one both count as a failed
    /// record.
    pub fn open(&self, cipher: &TokenCipher) -> Result<Credential, DecryptionError> {
        let access_token = cipher.decrypt(&self.access_token)?;
        let refresh_token = cipher.decrypt(&self.refresh_token)?;
        if refresh_token.is_empty() {
            return Err(DecryptionError);
        }

        Ok(Credential {
            user_id: self.user_id.clone(),
            access_token,
            refresh_token,
            scopes: self.scopes.iter().cloned().collect(),
            expires_at: self.expires_at,
            updated_at: self.updated_at,
        })
    }
}
