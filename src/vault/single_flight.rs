//! Per-key deduplication of in-flight work.
//!
//! The first caller for a key spawns the work on the runtime; callers that
//! arrive while it runs share its result. The work is a detached task, so a
//! caller giving up does not cancel it. The key is released by a drop guard
//! inside the task, on success, error and panic alike.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::AuthError;

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, AuthError>>>;

struct Flight<T: Clone> {
    id: u64,
    outcome: SharedOutcome<T>,
}

/// Removes the flight entry when the task ends, however it ends
struct Release<T: Clone> {
    flights: Arc<DashMap<String, Flight<T>>>,
    key: String,
    id: u64,
}

impl<T: Clone> Drop for Release<T> {
    fn drop(&mut self) {
        self.flights.remove_if(&self.key, |_, flight| flight.id == self.id);
    }
}

/// Single-flight group keyed by string
pub struct SingleFlight<T: Clone> {
    flights: Arc<DashMap<String, Flight<T>>>,
    next_id: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `make()` for `key` unless a run is already in flight, and wait
    /// for the shared outcome.
    ///
    /// `make` is only invoked by the caller that starts a new flight.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Result<T, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AuthError>> + Send + 'static,
    {
        self.join_or_start(key, make).await
    }

    fn join_or_start<F, Fut>(&self, key: &str, make: F) -> SharedOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AuthError>> + Send + 'static,
    {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                tracing::debug!(key, "Joining in-flight refresh");
                existing.get().outcome.clone()
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let release = Release {
                    flights: Arc::clone(&self.flights),
                    key: key.to_string(),
                    id,
                };
                let work = make();

                // The entry is inserted before the shard lock is released, so
                // the task's release cannot run ahead of the insert.
                let handle = tokio::spawn(async move {
                    let _release = release;
                    work.await
                });

                let outcome = async move {
                    handle.await.unwrap_or_else(|join_error| {
                        Err(AuthError::RefreshFailed {
                            message: format!("refresh task aborted: {}", join_error),
                        })
                    })
                }
                .boxed()
                .shared();

                slot.insert(Flight {
                    id,
                    outcome: outcome.clone(),
                });
                outcome
            }
        }
    }

    /// Whether a run for `key` is currently in flight
    pub fn in_flight(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_run() {
        let group = Arc::new(SingleFlight::<usize>::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let rx = Arc::new(tokio::sync::Mutex::new(Some(rx)));

        let mut callers = Vec::new();
        for _ in 0..10 {
            let group = Arc::clone(&group);
            let runs = Arc::clone(&runs);
            let rx = Arc::clone(&rx);
            callers.push(tokio::spawn(async move {
                group
                    .run("user-1", move || async move {
                        let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
                        if let Some(rx) = rx.lock().await.take() {
                            let _ = rx.await;
                        }
                        Ok::<_, AuthError>(n)
                    })
                    .await
            }));
        }

        while !group.in_flight("user-1") {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        for caller in callers {
            assert_eq!(caller.await.unwrap(), Ok(1));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!group.in_flight("user-1"));
    }

    #[tokio::test]
    async fn test_failure_releases_key() {
        let group = SingleFlight::<u32>::new();

        let first = group
            .run("user-1", || async {
                Err(AuthError::RefreshFailed {
                    message: "503".to_string(),
                })
            })
            .await;
        assert!(first.is_err());
        assert!(!group.in_flight("user-1"));

        let second = group
            .run("user-1", || async { Ok::<_, AuthError>(7) })
            .await;
        assert_eq!(second, Ok(7));
    }

    async fn exploding() -> Result<u32, AuthError> {
        panic!("provider exploded")
    }

    #[tokio::test]
    async fn test_panic_releases_key() {
        let group = SingleFlight::<u32>::new();

        let result = group.run("user-1", exploding).await;
        assert!(matches!(result, Err(AuthError::RefreshFailed { .. })));
        assert!(!group.in_flight("user-1"));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let group = SingleFlight::<&'static str>::new();

        let (a, b) = tokio::join!(
            group.run("user-a", || async { Ok::<_, AuthError>("a") }),
            group.run("user-b", || async { Ok::<_, AuthError>("b") }),
        );
        assert_eq!(a, Ok("a"));
        assert_eq!(b, Ok("b"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abandoned_caller_does_not_cancel_run() {
        let group = Arc::new(SingleFlight::<u32>::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let caller = {
            let group = Arc::clone(&group);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                group
                    .run("user-1", move || async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, AuthError>(1)
                    })
                    .await
            })
        };

        while !group.in_flight("user-1") {
            tokio::task::yield_now().await;
        }
        caller.abort();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!group.in_flight("user-1"));
    }
}
