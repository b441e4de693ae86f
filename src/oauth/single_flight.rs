//! Keyed single-flight execution.
//!
//! At most one operation per key runs at a time; callers arriving while it
//! runs await the same result. The operation is spawned onto the runtime, so
//! it finishes even if every caller that awaited it is dropped.

use crate::error::OAuthError;
use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Flight<V> = Shared<BoxFuture<'static, Result<V, OAuthError>>>;

/// In-flight operations keyed by `K`, each producing `Result<V, OAuthError>`.
pub struct SingleFlight<K, V> {
    flights: Arc<DashMap<K, (u64, Flight<V>)>>,
    generation: AtomicU64,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `make()` for `key`, or join the run already in progress.
    ///
    /// `make` is only called when this caller starts a new flight.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<V, OAuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, OAuthError>> + Send + 'static,
    {
        let flight = match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().1.clone(),
            Entry::Vacant(entry) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let guard = FlightGuard {
                    flights: Arc::clone(&self.flights),
                    key,
                    generation,
                };
                let work = make();

                // The shard lock held by `entry` keeps the task from clearing
                // the slot before it is filled.
                let handle = tokio::spawn(async move {
                    let _guard = guard;
                    work.await
                });

                let flight = async move {
                    handle.await.unwrap_or_else(|e| {
                        tracing::error!(error = %e, "Single-flight task failed");
                        Err(OAuthError::Transient("in-flight operation aborted".to_string()))
                    })
                }
                .boxed()
                .shared();

                entry.insert((generation, flight.clone()));
                flight
            }
        };

        flight.await
    }

    /// Number of keys with an operation in progress.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the flight's slot when its task ends, including by panic.
struct FlightGuard<K: Eq + Hash, V> {
    flights: Arc<DashMap<K, (u64, Flight<V>)>>,
    key: K,
    generation: u64,
}

impl<K: Eq + Hash, V> Drop for FlightGuard<K, V> {
    fn drop(&mut self) {
        self.flights
            .remove_if(&self.key, |_, (generation, _)| *generation == self.generation);
    }
}
