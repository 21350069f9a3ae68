//! OAuth state management for CSRF protection.
//!
//! Manages short-lived, single-use state tokens issued with every
//! authorization URL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};

use crate::clock::{is_expired, Clock};
use crate::credentials::random_token;

/// Pending authorization started by `begin_auth`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthState {
    pub state_token: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// In-memory store of pending OAuth states with expiry
#[derive(Clone)]
pub struct AuthStateStore {
    states: Arc<Mutex<HashMap<String, AuthState>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl AuthStateStore {
    /// Create a store whose states live for `ttl`
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            clock,
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, AuthState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generate and remember a new state for a flow
    pub fn create(&self, redirect_uri: &str, scopes: &[String]) -> AuthState {
        let now = self.clock.now();
        let state = AuthState {
            state_token: random_token(),
            redirect_uri: redirect_uri.to_string(),
            scopes: scopes.to_vec(),
            created_at: now,
            expires_at: now + self.ttl,
        };

        self.states()
            .insert(state.state_token.clone(), state.clone());

        state
    }

    /// Remove a state and return it if it was still valid.
    ///
    /// The entry is removed whatever the outcome, so a value can be presented
    /// at most once.
    pub fn consume(&self, state_token: &str) -> Option<AuthState> {
        let entry = self.states().remove(state_token)?;

        if is_expired(entry.expires_at, self.clock.now(), Duration::zero()) {
            tracing::debug!("Rejected expired OAuth state");
            return None;
        }

        Some(entry)
    }

    /// Drop expired states, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut states = self.states();
        let before = states.len();

        states.retain(|_, entry| !is_expired(entry.expires_at, now, Duration::zero()));

        before - states.len()
    }

    /// Number of pending states
    pub fn len(&self) -> usize {
        self.states().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::FixedClock;

    fn store(clock: &Arc<FixedClock>) -> AuthStateStore {
        AuthStateStore::new(Duration::minutes(10), clock.clone())
    }

    #[test]
    fn test_create_and_consume() {
        let clock = Arc::new(FixedClock::default());
        let store = store(&clock);

        let state = store.create("http://localhost:3000/oauth2callback", &["openid".to_string()]);
        assert_eq!(state.expires_at - state.created_at, Duration::minutes(10));

        let entry = store.consume(&state.state_token).expect("state missing");
        assert_eq!(entry.redirect_uri, "http://localhost:3000/oauth2callback");
        assert_eq!(entry.scopes, vec!["openid".to_string()]);
    }

    #[test]
    fn test_state_is_single_use() {
        let clock = Arc::new(FixedClock::default());
        let store = store(&clock);
        let state = store.create("http://localhost/cb", &[]);

        assert!(store.consume(&state.state_token).is_some());
        assert!(store.consume(&state.state_token).is_none());
    }

    #[test]
    fn test_unknown_state_rejected() {
        let clock = Arc::new(FixedClock::default());
        assert!(store(&clock).consume("invalid_state").is_none());
    }

    #[test]
    fn test_expired_state_rejected_and_removed() {
        let clock = Arc::new(FixedClock::default());
        let store = store(&clock);
        let state = store.create("http://localhost/cb", &[]);

        clock.advance(Duration::minutes(10));

        assert!(store.consume(&state.state_token).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let clock = Arc::new(FixedClock::default());
        let store = store(&clock);

        store.create("http://localhost/cb", &[]);
        clock.advance(Duration::minutes(6));
        let fresh = store.create("http://localhost/cb", &[]);
        clock.advance(Duration::minutes(5));

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.consume(&fresh.state_token).is_some());
    }
}
