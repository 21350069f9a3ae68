//! Two-step confirmation for destructive tool calls.
//!
//! ```text
//! call 1 (no token) ──► issue ──► ISSUED ──┐
//!                                          │ call 2 (token, same user/action/target)
//!                                          ▼
//!                                      CONSUMED ──► action runs
//! ```
//!
//! A token authorizes one `(user, action, target)` triple, once, before it
//! expires. Issuing a new token for a triple invalidates any earlier
//! unconsumed one. Presenting a token for the wrong triple is rejected but
//! leaves the token usable for the right one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};

use crate::clock::{is_expired, Clock};
use crate::credentials::random_token;
use crate::error::ConfirmationError;

/// Irreversible operations that need confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestructiveAction {
    DeleteDraft,
    DeleteLabel,
}

impl DestructiveAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestructiveAction::DeleteDraft => "delete-draft",
            DestructiveAction::DeleteLabel => "delete-label",
        }
    }

    /// What the target id refers to
    pub fn target_kind(&self) -> &'static str {
        match self {
            DestructiveAction::DeleteDraft => "draft",
            DestructiveAction::DeleteLabel => "label",
        }
    }
}

impl fmt::Display for DestructiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A destructive tool call, resolved once from the optional token argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestructiveCall {
    NeedsConfirmation {
        action: DestructiveAction,
        target_id: String,
    },
    Confirmed {
        action: DestructiveAction,
        target_id: String,
        token_id: String,
    },
}

impl DestructiveCall {
    /// A blank token counts as no token
    pub fn new(action: DestructiveAction, target_id: &str, token: Option<&str>) -> Self {
        match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(token_id) => DestructiveCall::Confirmed {
                action,
                target_id: target_id.to_string(),
                token_id: token_id.to_string(),
            },
            None => DestructiveCall::NeedsConfirmation {
                action,
                target_id: target_id.to_string(),
            },
        }
    }

    pub fn action(&self) -> DestructiveAction {
        match self {
            DestructiveCall::NeedsConfirmation { action, .. }
            | DestructiveCall::Confirmed { action, .. } => *action,
        }
    }

    pub fn target_id(&self) -> &str {
        match self {
            DestructiveCall::NeedsConfirmation { target_id, .. }
            | DestructiveCall::Confirmed { target_id, .. } => target_id,
        }
    }
}

/// Stored token state
#[derive(Debug, Clone)]
pub struct ConfirmationToken {
    pub token_id: String,
    pub action: DestructiveAction,
    pub target_id: String,
    pub issued_for_user: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

/// What the caller gets back from `issue`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedConfirmation {
    pub token_id: String,
    pub action: DestructiveAction,
    pub target_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of [`ConfirmationGate::check`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// No token was presented; hand this one to the user
    Required(IssuedConfirmation),

    /// The presented token was valid and is now consumed
    Proceed,
}

type Triple = (String, DestructiveAction, String);

#[derive(Default)]
struct Ledger {
    tokens: HashMap<String, ConfirmationToken>,
    /// Latest unconsumed token per triple
    outstanding: HashMap<Triple, String>,
}

impl Ledger {
    fn forget(&mut self, token_id: &str) -> Option<ConfirmationToken> {
        let token = self.tokens.remove(token_id)?;
        let triple = (
            token.issued_for_user.clone(),
            token.action,
            token.target_id.clone(),
        );
        if self.outstanding.get(&triple).map(String::as_str) == Some(token_id) {
            self.outstanding.remove(&triple);
        }
        Some(token)
    }
}

/// Issues and verifies confirmation tokens
#[derive(Clone)]
pub struct ConfirmationGate {
    ledger: Arc<Mutex<Ledger>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ConfirmationGate {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger::default())),
            ttl,
            clock,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a token for `(user_id, action, target_id)`
    pub fn issue(&self, user_id: &str, action: DestructiveAction, target_id: &str) -> IssuedConfirmation {
        let now = self.clock.now();
        let token = ConfirmationToken {
            token_id: random_token(),
            action,
            target_id: target_id.to_string(),
            issued_for_user: user_id.to_string(),
            issued_at: now,
            expires_at: now + self.ttl,
            consumed: false,
        };
        let issued = IssuedConfirmation {
            token_id: token.token_id.clone(),
            action,
            target_id: token.target_id.clone(),
            expires_at: token.expires_at,
        };

        let mut ledger = self.ledger();
        let triple = (user_id.to_string(), action, target_id.to_string());
        if let Some(previous) = ledger.outstanding.insert(triple, token.token_id.clone()) {
            ledger.tokens.remove(&previous);
            tracing::debug!(user_id, %action, target_id, "Superseded earlier confirmation token");
        }
        ledger.tokens.insert(token.token_id.clone(), token);

        tracing::info!(user_id, %action, target_id, expires_at = %issued.expires_at, "Issued confirmation token");
        issued
    }

    /// Consume `token_id` if it was issued for exactly this triple.
    ///
    /// Exactly one caller can win for a given token.
    pub fn verify(
        &self,
        user_id: &str,
        action: DestructiveAction,
        target_id: &str,
        token_id: &str,
    ) -> Result<(), ConfirmationError> {
        let now = self.clock.now();
        let mut ledger = self.ledger();

        let Some(token) = ledger.tokens.get_mut(token_id) else {
            tracing::warn!(user_id, %action, target_id, "Unknown confirmation token");
            return Err(ConfirmationError::InvalidConfirmationToken);
        };

        if token.consumed {
            tracing::warn!(user_id, %action, target_id, "Confirmation token already used");
            return Err(ConfirmationError::InvalidConfirmationToken);
        }

        if is_expired(token.expires_at, now, Duration::zero()) {
            ledger.forget(token_id);
            tracing::warn!(user_id, %action, target_id, "Confirmation token expired");
            return Err(ConfirmationError::InvalidConfirmationToken);
        }

        if token.issued_for_user != user_id || token.action != action || token.target_id != target_id {
            tracing::warn!(user_id, %action, target_id, "Confirmation token presented for a different request");
            return Err(ConfirmationError::InvalidConfirmationToken);
        }

        token.consumed = true;
        ledger
            .outstanding
            .remove(&(user_id.to_string(), action, target_id.to_string()));

        tracing::info!(user_id, %action, target_id, "Confirmation token consumed");
        Ok(())
    }

    /// Resolve a destructive call: issue a token or consume the presented one
    pub fn check(&self, user_id: &str, call: &DestructiveCall) -> Result<Confirmation, ConfirmationError> {
        match call {
            DestructiveCall::NeedsConfirmation { action, target_id } => {
                Ok(Confirmation::Required(self.issue(user_id, *action, target_id)))
            }
            DestructiveCall::Confirmed {
                action,
                target_id,
                token_id,
            } => {
                self.verify(user_id, *action, target_id, token_id)?;
                Ok(Confirmation::Proceed)
            }
        }
    }

    /// Drop expired tokens, consumed or not. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut ledger = self.ledger();

        let expired: Vec<String> = ledger
            .tokens
            .values()
            .filter(|token| is_expired(token.expires_at, now, Duration::zero()))
            .map(|token| token.token_id.clone())
            .collect();

        for token_id in &expired {
            ledger.forget(token_id);
        }

        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "Swept expired confirmation tokens");
        }
        expired.len()
    }

    /// Tokens still held, consumed ones included until they expire
    pub fn len(&self) -> usize {
        self.ledger().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
