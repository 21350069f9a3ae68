//! OAuth provider capability.
//!
//! The Vault and the flow orchestrator only see this trait; Google is one
//! implementation, the mocks are another.

use std::future::Future;

use chrono::{DateTime, Duration, Utc};

use crate::error::ProviderError;

/// Tokens returned by a code exchange or a refresh
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,

    /// Absent on most refresh responses
    pub refresh_token: Option<String>,

    /// Lifetime of `access_token` in seconds
    pub expires_in: i64,

    /// Granted scopes; empty when the provider did not say
    pub scopes: Vec<String>,
}

impl TokenSet {
    /// Absolute expiry of the access token relative to `now`
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.expires_in.max(0))
    }

    /// The refresh token, unless missing or blank
    pub fn usable_refresh_token(&self) -> Option<&str> {
        self.refresh_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.usable_refresh_token().is_some())
            .field("expires_in", &self.expires_in)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// OAuth 2.0 authorization-code provider.
///
/// # Implementation Notes
///
/// - `refresh` must report a revoked or expired refresh token as
///   [`ProviderError::InvalidGrant`]; every other failure is treated as
///   retryable by the Vault.
/// - Implementations must bound their own network calls; the Vault and the
///   flow add an outer timeout as well.
pub trait OAuthProvider: Send + Sync + 'static {
    /// URL the user is sent to for consent
    fn authorization_url(&self, state: &str, redirect_uri: &str, scopes: &[String]) -> String;

    /// Exchange a single-use authorization code for tokens
    fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> impl Future<Output = Result<TokenSet, ProviderError>> + Send;

    /// Mint a new access token from a refresh token
    fn refresh(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<TokenSet, ProviderError>> + Send;

    /// Stable identifier of the user the tokens belong to
    fn resolve_user(
        &self,
        tokens: &TokenSet,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send;
}
