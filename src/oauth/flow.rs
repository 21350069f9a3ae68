//! OAuth flow orchestrator.
//!
//! `begin_auth` hands out an authorization URL carrying a fresh state;
//! `handle_callback` burns that state, exchanges the code and installs the
//! resulting tokens into the Vault.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::provider::{OAuthProvider, TokenSet};
use super::state::AuthStateStore;
use crate::error::{AuthError, ProviderError};
use crate::vault::CredentialVault;

/// Where to send the user, and the state bound to it
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

/// Drives authorization for new and returning users
pub struct OAuthFlow<P: OAuthProvider> {
    vault: CredentialVault<P>,
    states: AuthStateStore,
    provider_timeout: Duration,
}

impl<P: OAuthProvider> OAuthFlow<P> {
    pub fn new(vault: CredentialVault<P>, states: AuthStateStore, provider_timeout: Duration) -> Self {
        Self {
            vault,
            states,
            provider_timeout,
        }
    }

    /// Pending states, for the sweeper
    pub fn states(&self) -> &AuthStateStore {
        &self.states
    }

    /// Start a flow: remember a new state and build the consent URL
    pub fn begin_auth(&self, redirect_uri: &str, scopes: &[String]) -> AuthorizationRequest {
        let state = self.states.create(redirect_uri, scopes);
        let url = self
            .vault
            .provider()
            .authorization_url(&state.state_token, redirect_uri, scopes);

        tracing::debug!(expires_at = %state.expires_at, "Issued authorization URL");

        AuthorizationRequest {
            url,
            state: state.state_token,
            expires_at: state.expires_at,
        }
    }

    /// Finish a flow and return the authorized user id.
    ///
    /// The state is consumed before anything else, so a replayed or forged
    /// callback never reaches the provider. Codes are single-use; a failed
    /// exchange is not retried.
    pub async fn handle_callback(&self, received_state: &str, code: &str) -> Result<String, AuthError> {
        let Some(pending) = self.states.consume(received_state) else {
            tracing::warn!("OAuth callback with unknown, expired or reused state");
            return Err(AuthError::StateMismatch);
        };

        let provider = self.vault.provider();

        let tokens = self
            .bounded(provider.exchange_code(code, &pending.redirect_uri))
            .await
            .map_err(|e| exchange_failed("code exchange", e))?;

        let user_id = self
            .bounded(provider.resolve_user(&tokens))
            .await
            .map_err(|e| exchange_failed("user lookup", e))?;

        warn_on_missing_scopes(&user_id, &pending.scopes, &tokens);

        self.vault.install(&user_id, &tokens)?;
        tracing::info!(user_id = %user_id, "Authorization completed");

        Ok(user_id)
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        tokio::time::timeout(self.provider_timeout, call)
            .await
            .unwrap_or(Err(ProviderError::Timeout))
    }
}

fn exchange_failed(step: &str, err: ProviderError) -> AuthError {
    tracing::warn!(error = %err, "OAuth {} failed", step);
    AuthError::CodeExchangeFailed {
        message: format!("{} failed: {}", step, err),
    }
}

fn warn_on_missing_scopes(user_id: &str, requested: &[String], tokens: &TokenSet) {
    // Providers that do not echo scopes are taken at their word.
    if tokens.scopes.is_empty() {
        return;
    }

    let missing: Vec<&str> = requested
        .iter()
        .filter(|scope| !tokens.scopes.contains(*scope))
        .map(String::as_str)
        .collect();

    if !missing.is_empty() {
        tracing::warn!(user_id, ?missing, "Not all requested scopes were granted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::to_chrono;
    use crate::credentials::{CredentialStore, MemoryCredentialStore, TokenCipher};
    use crate::mocks::{token_set, FixedClock, MockOAuthProvider};
    use crate::vault::VaultOptions;

    const REDIRECT: &str = "http://localhost:3000/oauth2callback";

    struct Harness {
        flow: OAuthFlow<MockOAuthProvider>,
        vault: CredentialVault<MockOAuthProvider>,
        provider: Arc<MockOAuthProvider>,
        clock: Arc<FixedClock>,
        store: Arc<MemoryCredentialStore>,
    }

    fn harness() -> Harness {
        let provider = Arc::new(MockOAuthProvider::new("google-sub-42"));
        let clock = Arc::new(FixedClock::default());
        let store = Arc::new(MemoryCredentialStore::new());
        let vault = CredentialVault::new(
            store.clone(),
            TokenCipher::from_bytes(&[5u8; 32]).unwrap(),
            provider.clone(),
            clock.clone(),
            VaultOptions::default(),
        );
        let states = AuthStateStore::new(to_chrono(Duration::from_secs(600)), clock.clone());
        let flow = OAuthFlow::new(vault.clone(), states, Duration::from_secs(5));
        Harness {
            flow,
            vault,
            provider,
            clock,
            store,
        }
    }

    fn scopes() -> Vec<String> {
        vec!["openid".to_string(), "https://mail.google.com/".to_string()]
    }

    #[tokio::test]
    async fn test_begin_auth_embeds_state() {
        let h = harness();

        let request = h.flow.begin_auth(REDIRECT, &scopes());
        assert!(request.url.contains(&format!("state={}", request.state)));
        assert_eq!(h.flow.states().len(), 1);
    }

    #[tokio::test]
    async fn test_callback_installs_credential() {
        let h = harness();
        let request = h.flow.begin_auth(REDIRECT, &scopes());

        let user_id = h.flow.handle_callback(&request.state, "abc").await.unwrap();
        assert_eq!(user_id, "google-sub-42");
        assert_eq!(h.provider.exchange_calls(), 1);

        let token = h.vault.get_access_token(&user_id).await.unwrap();
        assert_eq!(token.secret(), "code-access-abc");
        assert!(h.flow.states().is_empty());
    }

    #[tokio::test]
    async fn test_replayed_state_is_rejected() {
        let h = harness();
        let request = h.flow.begin_auth(REDIRECT, &scopes());

        h.flow.handle_callback(&request.state, "abc").await.unwrap();
        let err = h.flow.handle_callback(&request.state, "abc").await.unwrap_err();

        assert_eq!(err, AuthError::StateMismatch);
        assert_eq!(h.provider.exchange_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_state_never_reaches_provider() {
        let h = harness();
        h.flow.begin_auth(REDIRECT, &scopes());

        let err = h.flow.handle_callback("forged", "abc").await.unwrap_err();
        assert_eq!(err, AuthError::StateMismatch);
        assert_eq!(h.provider.exchange_calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_state_is_rejected() {
        let h = harness();
        let request = h.flow.begin_auth(REDIRECT, &scopes());
        h.clock.advance(chrono::Duration::minutes(11));

        let err = h.flow.handle_callback(&request.state, "abc").await.unwrap_err();
        assert_eq!(err, AuthError::StateMismatch);
    }

    #[tokio::test]
    async fn test_failed_exchange_burns_state() {
        let h = harness();
        h.provider.push_exchange(Err(ProviderError::InvalidGrant));
        let request = h.flow.begin_auth(REDIRECT, &scopes());

        let err = h.flow.handle_callback(&request.state, "stale").await.unwrap_err();
        assert!(matches!(err, AuthError::CodeExchangeFailed { .. }));
        assert!(h.store.get("google-sub-42").unwrap().is_none());

        let err = h.flow.handle_callback(&request.state, "stale").await.unwrap_err();
        assert_eq!(err, AuthError::StateMismatch);
    }

    #[tokio::test]
    async fn test_reauthorization_without_refresh_token_keeps_old_one() {
        let h = harness();
        let first = h.flow.begin_auth(REDIRECT, &scopes());
        h.flow.handle_callback(&first.state, "one").await.unwrap();

        h.provider
            .push_exchange(Ok(token_set("second-access", None, 3600)));
        let second = h.flow.begin_auth(REDIRECT, &scopes());
        h.flow.handle_callback(&second.state, "two").await.unwrap();

        h.clock.advance(chrono::Duration::hours(2));
        h.vault.get_access_token("google-sub-42").await.unwrap();
        assert_eq!(
            h.provider.refresh_tokens_seen(),
            vec!["code-refresh-one".to_string()]
        );
    }
}
