//! Per-key load coalescing.
//!
//! Concurrent callers asking for the same key share one in-flight load: the
//! first caller starts it, later callers join it, and every caller observes the
//! same outcome. The registry only keeps a weak handle on the load, so when
//! every caller has gone away the load is dropped and its entry removed.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, WeakShared};
use hybrid_cache_core::Result;

use crate::metrics;

type SharedLoad<T> = Shared<BoxFuture<'static, Result<T>>>;

struct InFlight<T> {
    generation: u64,
    load: Option<WeakShared<BoxFuture<'static, Result<T>>>>,
    waiters: Arc<AtomicUsize>,
}

/// Registry of in-flight loads keyed by cache key.
pub struct SingleFlight<T> {
    in_flight: Arc<DashMap<String, InFlight<T>>>,
    generation: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `load` for `key`, or join the load already running for it.
    ///
    /// `load` is only invoked when no live load exists. Dropping the returned
    /// future detaches this caller; the load keeps running while at least one
    /// caller still awaits it.
    pub async fn run<F, Fut>(&self, key: &str, load: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (shared, waiters, leader) = self.join_or_start(key, load);
        if !leader {
            metrics::record_coalesced();
            tracing::trace!(key, "joined in-flight load");
        }
        let _waiter = WaiterGuard(waiters);
        shared.await
    }

    /// Number of loads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Callers currently awaiting the load for `key`.
    pub fn waiters(&self, key: &str) -> usize {
        self.in_flight
            .get(key)
            .map_or(0, |flight| flight.waiters.load(Ordering::Acquire))
    }

    fn join_or_start<F, Fut>(&self, key: &str, load: F) -> (SharedLoad<T>, Arc<AtomicUsize>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if let Some(shared) = occupied.get().load.as_ref().and_then(WeakShared::upgrade) {
                    let waiters = Arc::clone(&occupied.get().waiters);
                    waiters.fetch_add(1, Ordering::AcqRel);
                    return (shared, waiters, false);
                }
                // Every caller of the previous load went away
                let (flight, shared, waiters) = self.start(key, load);
                occupied.insert(flight);
                (shared, waiters, true)
            }
            Entry::Vacant(vacant) => {
                let (flight, shared, waiters) = self.start(key, load);
                vacant.insert(flight);
                (shared, waiters, true)
            }
        }
    }

    fn start<F, Fut>(&self, key: &str, load: F) -> (InFlight<T>, SharedLoad<T>, Arc<AtomicUsize>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let guard = FlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            key: key.to_string(),
            generation,
        };
        let future = load();
        let shared = async move {
            let _guard = guard;
            future.await
        }
        .boxed()
        .shared();

        let waiters = Arc::new(AtomicUsize::new(1));
        let flight = InFlight {
            generation,
            load: shared.downgrade(),
            waiters: Arc::clone(&waiters),
        };
        (flight, shared, waiters)
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

/// Removes the registry entry once its load finishes or is dropped.
struct FlightGuard<T> {
    in_flight: Arc<DashMap<String, InFlight<T>>>,
    key: String,
    generation: u64,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(&self.key, |_, flight| flight.generation == self.generation);
    }
}

struct WaiterGuard(Arc<AtomicUsize>);

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
