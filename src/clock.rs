//! Time source and the expiry predicate
//!
//! Every expiry decision in the crate (cached access tokens, OAuth states,
//! confirmation tokens and their sweeps) goes through [`is_expired`].

use chrono::{DateTime, Duration, Utc};

/// Abstracts "now" so expiry can be tested deterministically
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// True once `now` has reached `expires_at - margin`.
///
/// A zero margin means "at or after the expiry instant".
pub fn is_expired(expires_at: DateTime<Utc>, now: DateTime<Utc>, margin: Duration) -> bool {
    expires_at
        .checked_sub_signed(margin)
        .map_or(true, |deadline| now >= deadline)
}

/// Convert a std duration into a chrono one, saturating on overflow
pub fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or(Duration::MAX)
}
