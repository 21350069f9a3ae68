//! Test doubles for the OAuth provider and the clock.
//!
//! Enabled by the default `test-utils` feature so integration tests can use
//! them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Notify, Semaphore};

use crate::clock::Clock;
use crate::error::ProviderError;
use crate::oauth::{OAuthProvider, TokenSet};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct FixedClock {
    time: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Mutex::new(time),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut time = lock(&self.time);
        *time += by;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.time)
    }
}

/// Scriptable OAuth provider.
///
/// Unscripted calls succeed: refreshes return `refreshed-access-<n>` without
/// a new refresh token, code exchanges return tokens derived from the code.
/// Refreshes can be held in flight with [`MockOAuthProvider::hold_refreshes`].
pub struct MockOAuthProvider {
    user_id: String,
    refresh_calls: AtomicUsize,
    exchange_calls: AtomicUsize,
    refresh_results: Mutex<VecDeque<Result<TokenSet, ProviderError>>>,
    exchange_results: Mutex<VecDeque<Result<TokenSet, ProviderError>>>,
    refresh_tokens_seen: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    refresh_started: Notify,
}

impl MockOAuthProvider {
    /// Provider whose users all resolve to `user_id`
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            refresh_calls: AtomicUsize::new(0),
            exchange_calls: AtomicUsize::new(0),
            refresh_results: Mutex::new(VecDeque::new()),
            exchange_results: Mutex::new(VecDeque::new()),
            refresh_tokens_seen: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            refresh_started: Notify::new(),
        }
    }

    /// Script the outcome of the next unscripted refresh
    pub fn push_refresh(&self, result: Result<TokenSet, ProviderError>) {
        lock(&self.refresh_results).push_back(result);
    }

    /// Script the outcome of the next unscripted code exchange
    pub fn push_exchange(&self, result: Result<TokenSet, ProviderError>) {
        lock(&self.exchange_results).push_back(result);
    }

    /// Make refreshes wait until [`MockOAuthProvider::release_refreshes`]
    pub fn hold_refreshes(&self) {
        *lock(&self.gate) = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let held refreshes finish
    pub fn release_refreshes(&self) {
        if let Some(gate) = lock(&self.gate).take() {
            gate.close();
        }
    }

    /// Resolves once a refresh call has reached the provider
    pub async fn refresh_started(&self) {
        self.refresh_started.notified().await;
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    /// Refresh tokens presented so far, in call order
    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        lock(&self.refresh_tokens_seen).clone()
    }
}

/// Tokens as a provider would return them on a first authorization
pub fn token_set(access_token: &str, refresh_token: Option<&str>, expires_in: i64) -> TokenSet {
    TokenSet {
        access_token: access_token.to_string(),
        refresh_token: refresh_token.map(str::to_string),
        expires_in,
        scopes: vec![
            "openid".to_string(),
            "https://mail.google.com/".to_string(),
        ],
    }
}

impl OAuthProvider for MockOAuthProvider {
    fn authorization_url(&self, state: &str, redirect_uri: &str, scopes: &[String]) -> String {
        format!(
            "https://auth.example.test/authorize?state={}&redirect_uri={}&scope={}",
            urlencoding::encode(state),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes.join(" ")),
        )
    }

    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<TokenSet, ProviderError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);

        let scripted = lock(&self.exchange_results).pop_front();
        scripted.unwrap_or_else(|| {
            Ok(token_set(
                &format!("code-access-{}", code),
                Some(&format!("code-refresh-{}", code)),
                3600,
            ))
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, ProviderError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.refresh_tokens_seen).push(refresh_token.to_string());
        self.refresh_started.notify_one();

        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            // Closed means released.
            let _ = gate.acquire().await;
        }

        let scripted = lock(&self.refresh_results).pop_front();
        scripted.unwrap_or_else(|| {
            Ok(TokenSet {
                access_token: format!("refreshed-access-{}", call),
                refresh_token: None,
                expires_in: 3600,
                scopes: Vec::new(),
            })
        })
    }

    async fn resolve_user(&self, _tokens: &TokenSet) -> Result<String, ProviderError> {
        Ok(self.user_id.clone())
    }
}
