//! Credential Vault
//!
//! Owns the only plaintext view of stored tokens. Every tool call asks the
//! Vault for a valid access token; the Vault serves the cached token while it
//! is outside the safety margin and otherwise refreshes it, at most once at a
//! time per user.
//!
//! ```text
//! get_access_token(user)
//!     │
//!     ├─ no record / unreadable ──────────► ReauthRequired
//!     ├─ fresh ───────────────────────────► cached token
//!     └─ stale ─► SingleFlight[user] ─► provider.refresh ─► upsert_if_unchanged ─► new token
//!                       ▲
//!         concurrent callers join here
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::clock::{is_expired, to_chrono, Clock};
use crate::config::Config;
use crate::credentials::{Credential, CredentialStore, TokenCipher};
use crate::error::{AuthError, ProviderError, ReauthReason, StoreError};
use crate::oauth::{OAuthProvider, TokenSet};

pub mod single_flight;

pub use single_flight::SingleFlight;

/// A valid bearer token and the instant it stops being valid
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// The bearer value to put in an `Authorization` header
    pub fn secret(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl From<&Credential> for AccessToken {
    fn from(credential: &Credential) -> Self {
        Self {
            token: credential.access_token.clone(),
            expires_at: credential.expires_at,
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Timing knobs of the Vault
#[derive(Debug, Clone, Copy)]
pub struct VaultOptions {
    /// Tokens this close to expiry are refreshed instead of served
    pub refresh_margin: Duration,

    /// Upper bound on a single provider refresh call
    pub provider_timeout: std::time::Duration,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::seconds(60),
            provider_timeout: std::time::Duration::from_secs(30),
        }
    }
}

impl VaultOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            refresh_margin: to_chrono(config.refresh_margin),
            provider_timeout: config.http_timeout,
        }
    }
}

struct VaultInner<P> {
    store: Arc<dyn CredentialStore>,
    cipher: TokenCipher,
    provider: Arc<P>,
    clock: Arc<dyn Clock>,
    options: VaultOptions,
    flights: SingleFlight<AccessToken>,
}

/// Per-user credential coordinator.
///
/// Cheap to clone; clones share the store handle and the refresh group.
pub struct CredentialVault<P: OAuthProvider> {
    inner: Arc<VaultInner<P>>,
}

impl<P: OAuthProvider> Clone for CredentialVault<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: OAuthProvider> CredentialVault<P> {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cipher: TokenCipher,
        provider: Arc<P>,
        clock: Arc<dyn Clock>,
        options: VaultOptions,
    ) -> Self {
        Self {
            inner: Arc::new(VaultInner {
                store,
                cipher,
                provider,
                clock,
                options,
                flights: SingleFlight::new(),
            }),
        }
    }

    /// The provider tokens are refreshed against
    pub fn provider(&self) -> &Arc<P> {
        &self.inner.provider
    }

    /// Return a valid access token for `user_id`, refreshing it if needed.
    ///
    /// # Errors
    ///
    /// - `ReauthRequired` when there is no usable record or the grant is gone
    /// - `RefreshFailed`, `ProviderTimeout` or `Store` for transient failures;
    ///   nothing is retried here
    pub async fn get_access_token(&self, user_id: &str) -> Result<AccessToken, AuthError> {
        let credential = self.inner.load(user_id)?;

        if !self.inner.is_stale(&credential) {
            return Ok(AccessToken::from(&credential));
        }

        tracing::debug!(user_id, expires_at = %credential.expires_at, "Access token needs refresh");

        let inner = Arc::clone(&self.inner);
        let owned_user_id = user_id.to_string();
        self.inner
            .flights
            .run(user_id, move || async move { inner.refresh(&owned_user_id).await })
            .await
    }

    /// Store tokens from a completed authorization for `user_id`.
    ///
    /// A provider that omits the refresh token keeps the one already on
    /// record. Without either there is nothing to refresh with, so the
    /// exchange counts as failed.
    pub fn install(&self, user_id: &str, tokens: &TokenSet) -> Result<Credential, AuthError> {
        let previous = match self.inner.load(user_id) {
            Ok(credential) => Some(credential),
            Err(AuthError::ReauthRequired { .. }) => None,
            Err(err) => return Err(err),
        };

        let refresh_token = match (tokens.usable_refresh_token(), previous) {
            (Some(token), _) => token.to_string(),
            (None, Some(previous)) => {
                tracing::debug!(user_id, "Provider returned no refresh token, keeping stored one");
                previous.refresh_token
            }
            (None, None) => {
                return Err(AuthError::CodeExchangeFailed {
                    message: "provider returned no refresh token; revoke the app's access and authorize again".to_string(),
                })
            }
        };

        let now = self.inner.clock.now();
        let credential = Credential {
            user_id: user_id.to_string(),
            access_token: tokens.access_token.clone(),
            refresh_token,
            scopes: tokens.scopes.iter().cloned().collect(),
            expires_at: tokens.expires_at(now),
            updated_at: now,
        };

        self.inner.persist(&credential)?;
        tracing::info!(user_id, expires_at = %credential.expires_at, "Installed credential");

        Ok(credential)
    }

    /// Delete the stored credential for `user_id`.
    ///
    /// Only explicit user revocation ends up here. Returns whether a record
    /// existed.
    pub fn revoke(&self, user_id: &str) -> Result<bool, AuthError> {
        let existed = self.inner.store.delete(user_id)?;
        tracing::info!(user_id, existed, "Revoked stored credential");
        Ok(existed)
    }

    /// Users with a stored credential
    pub fn users(&self) -> Result<Vec<String>, AuthError> {
        Ok(self.inner.store.list_users()?)
    }
}

impl<P: OAuthProvider> VaultInner<P> {
    fn load(&self, user_id: &str) -> Result<Credential, AuthError> {
        let sealed = self
            .store
            .get(user_id)?
            .ok_or(AuthError::reauth(ReauthReason::NoCredential))?;

        sealed.open(&self.cipher).map_err(|_| {
            tracing::warn!(user_id, "Stored credential could not be decrypted");
            AuthError::reauth(ReauthReason::Undecryptable)
        })
    }

    fn persist(&self, credential: &Credential) -> Result<(), AuthError> {
        let sealed = credential.seal(&self.cipher).map_err(StoreError::from)?;
        self.store.upsert(&sealed)?;
        Ok(())
    }

    /// Write `credential` only if the stored record is still the one
    /// written at `read_at`
    fn persist_if_unchanged(&self, credential: &Credential, read_at: DateTime<Utc>) -> Result<bool, AuthError> {
        let sealed = credential.seal(&self.cipher).map_err(StoreError::from)?;
        Ok(self.store.upsert_if_unchanged(&sealed, read_at)?)
    }

    fn is_stale(&self, credential: &Credential) -> bool {
        is_expired(
            credential.expires_at,
            self.clock.now(),
            self.options.refresh_margin,
        )
    }

    /// Body of a single flight. Runs detached from any caller.
    async fn refresh(&self, user_id: &str) -> Result<AccessToken, AuthError> {
        // Another writer may have refreshed between the caller's read and
        // the start of this flight.
        let credential = self.load(user_id)?;
        if !self.is_stale(&credential) {
            tracing::debug!(user_id, "Credential already refreshed");
            return Ok(AccessToken::from(&credential));
        }

        tracing::info!(user_id, "Refreshing access token");
        let read_at = credential.updated_at;

        let timeout = self.options.provider_timeout;
        let outcome = tokio::time::timeout(timeout, self.provider.refresh(&credential.refresh_token))
            .await
            .unwrap_or(Err(ProviderError::Timeout));

        let tokens = match outcome {
            Ok(tokens) => tokens,
            Err(ProviderError::InvalidGrant) => {
                tracing::warn!(user_id, "Refresh token rejected, re-authorization required");
                return Err(AuthError::reauth(ReauthReason::RevokedGrant));
            }
            Err(ProviderError::Timeout) => {
                tracing::warn!(user_id, timeout_secs = timeout.as_secs(), "Token refresh timed out");
                return Err(AuthError::ProviderTimeout {
                    secs: timeout.as_secs(),
                });
            }
            Err(err) => {
                tracing::warn!(user_id, error = %err, "Token refresh failed");
                return Err(AuthError::RefreshFailed {
                    message: err.to_string(),
                });
            }
        };

        let now = self.clock.now();
        let refreshed = Credential {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens
                .usable_refresh_token()
                .map(str::to_string)
                .unwrap_or(credential.refresh_token),
            scopes: if tokens.scopes.is_empty() {
                credential.scopes
            } else {
                tokens.scopes.iter().cloned().collect()
            },
            expires_at: tokens.expires_at(now),
            updated_at: now,
            user_id: credential.user_id,
        };

        if !self.persist_if_unchanged(&refreshed, read_at)? {
            // A re-authorization or revocation landed while the provider was
            // answering. The stored record wins.
            tracing::info!(user_id, "Credential changed during refresh, discarding refreshed token");
            let current = self.load(user_id)?;
            if self.is_stale(&current) {
                return Err(AuthError::RefreshFailed {
                    message: "credential changed during refresh".to_string(),
                });
            }
            return Ok(AccessToken::from(&current));
        }
        tracing::info!(user_id, expires_at = %refreshed.expires_at, "Access token refreshed");

        Ok(AccessToken::from(&refreshed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::mocks::{token_set, FixedClock, MockOAuthProvider};

    struct Harness {
        vault: CredentialVault<MockOAuthProvider>,
        provider: Arc<MockOAuthProvider>,
        clock: Arc<FixedClock>,
        store: Arc<MemoryCredentialStore>,
    }

    fn cipher() -> TokenCipher {
        TokenCipher::from_bytes(&[9u8; 32]).unwrap()
    }

    fn harness_with(options: VaultOptions) -> Harness {
        let provider = Arc::new(MockOAuthProvider::new("user-1"));
        let clock = Arc::new(FixedClock::default());
        let store = Arc::new(MemoryCredentialStore::new());
        let vault = CredentialVault::new(
            store.clone(),
            cipher(),
            provider.clone(),
            clock.clone(),
            options,
        );
        Harness {
            vault,
            provider,
            clock,
            store,
        }
    }

    /// Vault with `user-1` authorized: access token valid for an hour
    fn authorized() -> Harness {
        let h = harness_with(VaultOptions::default());
        h.vault
            .install("user-1", &token_set("access-1", Some("refresh-1"), 3600))
            .unwrap();
        h
    }

    fn stored(h: &Harness) -> Credential {
        h.store.get("user-1").unwrap().unwrap().open(&cipher()).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_token_served_without_refresh() {
        let h = authorized();
        h.clock.advance(Duration::minutes(58));

        let token = h.vault.get_access_token("user-1").await.unwrap();
        assert_eq!(token.secret(), "access-1");
        assert_eq!(h.provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_token_inside_margin_is_refreshed() {
        let h = authorized();
        h.clock.advance(Duration::seconds(3600 - 30));

        let token = h.vault.get_access_token("user-1").await.unwrap();
        assert_eq!(token.secret(), "refreshed-access-1");
        assert_eq!(token.expires_at(), h.clock.now() + Duration::seconds(3600));
        assert_eq!(h.provider.refresh_tokens_seen(), vec!["refresh-1".to_string()]);

        let again = h.vault.get_access_token("user-1").await.unwrap();
        assert_eq!(again, token);
        assert_eq!(h.provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_without_new_refresh_token_keeps_old_one() {
        let h = authorized();
        h.clock.advance(Duration::hours(2));

        h.vault.get_access_token("user-1").await.unwrap();

        let credential = stored(&h);
        assert_eq!(credential.access_token, "refreshed-access-1");
        assert_eq!(credential.refresh_token, "refresh-1");
        assert!(credential.scopes.contains("https://mail.google.com/"));
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_replaces_old_one() {
        let h = authorized();
        h.clock.advance(Duration::hours(2));
        h.provider
            .push_refresh(Ok(token_set("access-2", Some("refresh-2"), 3600)));

        h.vault.get_access_token("user-1").await.unwrap();
        assert_eq!(stored(&h).refresh_token, "refresh-2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_trigger_one_refresh() {
        let h = authorized();
        h.clock.advance(Duration::hours(2));
        h.provider.hold_refreshes();

        let mut callers = Vec::new();
        for _ in 0..8 {
            let vault = h.vault.clone();
            callers.push(tokio::spawn(async move {
                vault.get_access_token("user-1").await
            }));
        }

        h.provider.refresh_started().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        h.provider.release_refreshes();

        for caller in callers {
            let token = caller.await.unwrap().unwrap();
            assert_eq!(token.secret(), "refreshed-access-1");
        }
        assert_eq!(h.provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_user_requires_reauth() {
        let h = harness_with(VaultOptions::default());

        let err = h.vault.get_access_token("nobody").await.unwrap_err();
        assert_eq!(err, AuthError::reauth(ReauthReason::NoCredential));
    }

    #[tokio::test]
    async fn test_revoked_grant_requires_reauth_and_keeps_record() {
        let h = authorized();
        h.clock.advance(Duration::hours(2));
        h.provider.push_refresh(Err(ProviderError::InvalidGrant));

        let err = h.vault.get_access_token("user-1").await.unwrap_err();
        assert_eq!(err, AuthError::reauth(ReauthReason::RevokedGrant));
        assert!(h.store.get("user-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transient_failure_releases_refresh_slot() {
        let h = authorized();
        h.clock.advance(Duration::hours(2));
        h.provider.push_refresh(Err(ProviderError::Rejected {
            status: 429,
            code: "rate_limit_exceeded".to_string(),
        }));

        let err = h.vault.get_access_token("user-1").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(stored(&h).access_token, "access-1");

        let token = h.vault.get_access_token("user-1").await.unwrap();
        assert_eq!(token.secret(), "refreshed-access-2");
        assert_eq!(h.provider.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_undecryptable_record_requires_reauth() {
        let h = authorized();
        let foreign = TokenCipher::from_bytes(&[1u8; 32]).unwrap();
        let mut credential = stored(&h);
        credential.access_token = "other-access".to_string();
        h.store.upsert(&credential.seal(&foreign).unwrap()).unwrap();

        let err = h.vault.get_access_token("user-1").await.unwrap_err();
        assert_eq!(err, AuthError::reauth(ReauthReason::Undecryptable));
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let h = harness_with(VaultOptions {
            provider_timeout: std::time::Duration::from_millis(50),
            ..VaultOptions::default()
        });
        h.vault
            .install("user-1", &token_set("access-1", Some("refresh-1"), 60))
            .unwrap();
        h.provider.hold_refreshes();

        let err = h.vault.get_access_token("user-1").await.unwrap_err();
        assert!(matches!(err, AuthError::ProviderTimeout { .. }));
        h.provider.release_refreshes();
    }

    #[tokio::test]
    async fn test_reauthorization_during_refresh_wins() {
        let h = authorized();
        h.clock.advance(Duration::hours(2));
        h.provider.hold_refreshes();

        let caller = {
            let vault = h.vault.clone();
            tokio::spawn(async move { vault.get_access_token("user-1").await })
        };
        h.provider.refresh_started().await;

        h.vault
            .install("user-1", &token_set("access-new", Some("refresh-new"), 3600))
            .unwrap();
        h.provider.release_refreshes();

        let token = caller.await.unwrap().unwrap();
        assert_eq!(token.secret(), "access-new");

        let credential = stored(&h);
        assert_eq!(credential.access_token, "access-new");
        assert_eq!(credential.refresh_token, "refresh-new");
        assert_eq!(h.provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_revoke_during_refresh_is_not_undone() {
        let h = authorized();
        h.clock.advance(Duration::hours(2));
        h.provider.hold_refreshes();

        let caller = {
            let vault = h.vault.clone();
            tokio::spawn(async move { vault.get_access_token("user-1").await })
        };
        h.provider.refresh_started().await;

        assert!(h.vault.revoke("user-1").unwrap());
        h.provider.release_refreshes();

        let err = caller.await.unwrap().unwrap_err();
        assert_eq!(err, AuthError::reauth(ReauthReason::NoCredential));
        assert!(h.store.get("user-1").unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abandoned_caller_still_populates_store() {
        let h = authorized();
        h.clock.advance(Duration::hours(2));
        h.provider.hold_refreshes();

        let caller = {
            let vault = h.vault.clone();
            tokio::spawn(async move { vault.get_access_token("user-1").await })
        };
        h.provider.refresh_started().await;
        caller.abort();
        h.provider.release_refreshes();

        for _ in 0..50 {
            if stored(&h).access_token == "refreshed-access-1" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let token = h.vault.get_access_token("user-1").await.unwrap();
        assert_eq!(token.secret(), "refreshed-access-1");
        assert_eq!(h.provider.refresh_calls(), 1);
    }

    #[test]
    fn test_install_without_any_refresh_token_fails() {
        let h = harness_with(VaultOptions::default());

        let err = h
            .vault
            .install("user-1", &token_set("access-1", None, 3600))
            .unwrap_err();
        assert!(matches!(err, AuthError::CodeExchangeFailed { .. }));
        assert!(h.store.get("user-1").unwrap().is_none());
    }

    #[test]
    fn test_reinstall_keeps_prior_refresh_token() {
        let h = authorized();

        h.vault
            .install("user-1", &token_set("access-9", None, 3600))
            .unwrap();

        let credential = stored(&h);
        assert_eq!(credential.access_token, "access-9");
        assert_eq!(credential.refresh_token, "refresh-1");
    }

    #[tokio::test]
    async fn test_revoke_deletes_record() {
        let h = authorized();

        assert_eq!(h.vault.users().unwrap(), vec!["user-1".to_string()]);
        assert!(h.vault.revoke("user-1").unwrap());
        assert!(!h.vault.revoke("user-1").unwrap());

        let err = h.vault.get_access_token("user-1").await.unwrap_err();
        assert!(err.requires_reauth());
    }

    #[test]
    fn test_access_token_debug_redacts() {
        let h = authorized();
        let printed = format!("{:?}", AccessToken::from(&stored(&h)));
        assert!(!printed.contains("access-1"));
    }
}
