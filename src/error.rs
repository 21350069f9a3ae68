//! Error types for the Gmail MCP vault
//!
//! One enum per concern, aggregated into [`GmailMcpError`]. Nothing in here
//! ever carries a raw token: provider failures are reduced to the OAuth
//! `error` code and decryption failures carry no payload at all.

use std::fmt;

use thiserror::Error;

/// Main error type for the Gmail MCP vault
#[derive(Error, Debug)]
pub enum GmailMcpError {
    /// Credential and authorization errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Destructive action blocked by the confirmation gate
    #[error("Confirmation error: {0}")]
    Confirmation(#[from] ConfirmationError),

    /// Gmail API errors
    #[error("Gmail API error: {0}")]
    Gmail(#[from] GmailApiError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<StoreError> for GmailMcpError {
    fn from(err: StoreError) -> Self {
        GmailMcpError::Auth(AuthError::Store(err))
    }
}

/// Why a user has to go through the OAuth flow again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReauthReason {
    /// No credential is stored for the user
    NoCredential,

    /// The provider rejected the refresh token (revoked or expired grant)
    RevokedGrant,

    /// The stored record could not be decrypted with the current key
    Undecryptable,
}

impl fmt::Display for ReauthReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReauthReason::NoCredential => "no stored credential",
            ReauthReason::RevokedGrant => "refresh token revoked or expired",
            ReauthReason::Undecryptable => "stored credential unreadable",
        };
        f.write_str(text)
    }
}

/// Credential and authorization errors
///
/// `Clone` so a single refresh outcome can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Re-authorization required: {reason}")]
    ReauthRequired { reason: ReauthReason },

    #[error("OAuth state mismatch: unknown, expired or already used")]
    StateMismatch,

    #[error("Authorization code exchange failed: {message}")]
    CodeExchangeFailed { message: String },

    #[error("Failed to refresh access token: {message}")]
    RefreshFailed { message: String },

    #[error("OAuth provider did not answer within {secs} seconds")]
    ProviderTimeout { secs: u64 },

    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid access key")]
    InvalidAccessKey,

    #[error("OAuth keys file not found: {path}")]
    KeysFileNotFound { path: String },

    #[error("Invalid OAuth keys format: expected 'installed' or 'web' credentials")]
    InvalidKeysFormat,
}

impl AuthError {
    /// Shorthand for a re-authorization failure
    pub fn reauth(reason: ReauthReason) -> Self {
        AuthError::ReauthRequired { reason }
    }

    /// Whether the caller may retry the same call later without user action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::RefreshFailed { .. } | AuthError::ProviderTimeout { .. } | AuthError::Store(_)
        )
    }

    /// Whether the user has to redo the OAuth flow
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            AuthError::ReauthRequired { .. }
                | AuthError::StateMismatch
                | AuthError::CodeExchangeFailed { .. }
                | AuthError::InvalidAccessKey
        )
    }
}

/// Credential store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {message}")]
    Database { message: String },

    #[error("corrupt credential row: {message}")]
    Corrupt { message: String },

    #[error("credential could not be encrypted")]
    Encryption,
}

impl From<CipherError> for StoreError {
    fn from(_: CipherError) -> Self {
        StoreError::Encryption
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database {
            message: err.to_string(),
        }
    }
}

/// Failures reported by an OAuth provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The grant (refresh token or authorization code) is invalid or revoked
    #[error("grant rejected by provider")]
    InvalidGrant,

    #[error("provider rejected request ({status}): {code}")]
    Rejected { status: u16, code: String },

    #[error("transport failure: {message}")]
    Transport { message: String },

    #[error("request timed out")]
    Timeout,

    #[error("malformed provider response: {message}")]
    Malformed { message: String },
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Malformed {
                message: err.to_string(),
            }
        } else {
            ProviderError::Transport {
                message: err.without_url().to_string(),
            }
        }
    }
}

/// Token cipher construction and encryption errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption key must be 32 bytes of base64, got {len} bytes")]
    InvalidKeyLength { len: usize },

    #[error("encryption key is not valid base64")]
    InvalidKeyEncoding,

    #[error("encryption failed")]
    EncryptFailed,
}

/// Ciphertext could not be opened (wrong key, tampering, or garbage)
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("stored value could not be decrypted")]
pub struct DecryptionError;

/// Confirmation gate errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationError {
    #[error("Invalid confirmation token: request a new one and confirm with the user")]
    InvalidConfirmationToken,
}

/// Gmail API errors
#[derive(Error, Debug)]
pub enum GmailApiError {
    #[error("Draft not found: {draft_id}")]
    DraftNotFound { draft_id: String },

    #[error("Label not found: {label_id}")]
    LabelNotFound { label_id: String },

    #[error("Thread not found: {thread_id}")]
    ThreadNotFound { thread_id: String },

    #[error("Cannot delete system label: {label_id}")]
    CannotDeleteSystemLabel { label_id: String },

    #[error("Access token rejected by Gmail")]
    Unauthorized,

    #[error("API request failed: {message}")]
    RequestFailed { message: String },

    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config directory not found: {path}")]
    DirNotFound { path: String },

    #[error("Failed to create config directory: {path}")]
    DirCreationFailed { path: String },

    #[error("Missing required environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

/// Result type alias for Gmail MCP operations
pub type Result<T> = std::result::Result<T, GmailMcpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AuthError::KeysFileNotFound {
            path: "/path/to/keys.json".to_string(),
        };
        assert!(err.to_string().contains("/path/to/keys.json"));
    }

    #[test]
    fn test_error_conversion() {
        let auth_err = AuthError::StateMismatch;
        let err: GmailMcpError = auth_err.into();
        assert!(matches!(err, GmailMcpError::Auth(_)));

        let store_err = StoreError::Database {
            message: "locked".to_string(),
        };
        let err: GmailMcpError = store_err.into();
        assert!(matches!(err, GmailMcpError::Auth(AuthError::Store(_))));
    }

    #[test]
    fn test_retry_classification() {
        assert!(AuthError::RefreshFailed {
            message: "503".to_string()
        }
        .is_retryable());
        assert!(AuthError::ProviderTimeout { secs: 30 }.is_retryable());
        assert!(!AuthError::reauth(ReauthReason::RevokedGrant).is_retryable());
        assert!(AuthError::reauth(ReauthReason::Undecryptable).requires_reauth());
        assert!(AuthError::StateMismatch.requires_reauth());
    }

    #[test]
    fn test_reauth_reason_display() {
        let err = AuthError::reauth(ReauthReason::NoCredential);
        assert_eq!(
            err.to_string(),
            "Re-authorization required: no stored credential"
        );
    }
}
