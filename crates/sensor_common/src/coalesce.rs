//! Request coalescing.
//!
//! Two primitives over one building block, a spawned call whose outcome is
//! shared by every waiter:
//!
//! - [`CallGroup`] deduplicates concurrent calls per key. A call for a key
//!   already in flight attaches to the running one instead of starting new
//!   work.
//! - [`CoalescingCache`] fronts a single expensive source with in-flight
//!   deduplication plus a short TTL on the last successful result.
//!
//! The shared call runs on its own task, so a waiter that gives up (drops or
//! cancels) never aborts the call for the others.

use crate::error::{Result, TelemetryError};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type SharedCall<T> = Shared<BoxFuture<'static, Result<T>>>;

fn share<T>(handle: JoinHandle<Result<T>>) -> SharedCall<T>
where
    T: Clone + Send + Sync + 'static,
{
    async move {
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(TelemetryError::Internal(format!(
                "coalesced call did not complete: {}",
                e
            ))),
        }
    }
    .boxed()
    .shared()
}

fn lock<M>(mutex: &Mutex<M>) -> MutexGuard<'_, M> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// CallGroup
// ============================================================================

struct Flight<T> {
    id: u64,
    call: SharedCall<T>,
}

/// Removes a finished flight from its table, also when the call panics.
struct FlightGuard<K: Eq + Hash, T> {
    table: Arc<Mutex<HashMap<K, Flight<T>>>>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, T> Drop for FlightGuard<K, T> {
    fn drop(&mut self) {
        let mut calls = lock(&self.table);
        if calls.get(&self.key).map(|f| f.id) == Some(self.id) {
            calls.remove(&self.key);
        }
    }
}

/// Outcome of [`CallGroup::run`]
#[derive(Debug, Clone)]
pub struct CallOutcome<T> {
    pub result: Result<T>,
    /// True when this caller attached to a call started by someone else.
    pub joined: bool,
}

/// Keyed in-flight call table.
pub struct CallGroup<K, T> {
    calls: Arc<Mutex<HashMap<K, Flight<T>>>>,
    next_id: AtomicU64,
}

impl<K, T> CallGroup<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `work` for `key` unless a call for `key` is already in flight, in
    /// which case wait for that call and return its outcome.
    ///
    /// `work` is invoked under the table lock and must only build the future.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> CallOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (call, joined) = {
            let mut calls = lock(&self.calls);
            match calls.get(&key) {
                Some(flight) => (flight.call.clone(), true),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let table = Arc::clone(&self.calls);
                    let owned_key = key.clone();
                    let fut = work();

                    let handle = tokio::spawn(async move {
                        let _flight = FlightGuard {
                            table,
                            key: owned_key,
                            id,
                        };
                        fut.await
                    });

                    let call = share(handle);
                    calls.insert(key, Flight { id, call: call.clone() });
                    (call, false)
                }
            }
        };

        CallOutcome {
            result: call.await,
            joined,
        }
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.calls).contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

impl<K, T> Default for CallGroup<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// CoalescingCache
// ============================================================================

/// Upstream behind a [`CoalescingCache`]
#[async_trait]
pub trait SnapshotSource<T>: Send + Sync {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<T>;
}

struct CacheState<T> {
    snapshot: Option<(T, Instant)>,
    in_flight: Option<SharedCall<T>>,
}

struct CacheInner<T> {
    source: Arc<dyn SnapshotSource<T>>,
    retention: Duration,
    fetch_timeout: Duration,
    state: Mutex<CacheState<T>>,
}

/// Clears the cache's in-flight call when the fetch task ends, also on panic.
/// Only one fetch is in flight at a time, so the slot always belongs to it.
struct InFlightGuard<T>(Arc<CacheInner<T>>);

impl<T> Drop for InFlightGuard<T> {
    fn drop(&mut self) {
        lock(&self.0.state).in_flight = None;
    }
}

/// Single-snapshot TTL cache with in-flight deduplication.
///
/// Freshness check and in-flight lookup happen under one lock, so callers
/// racing on a stale entry all attach to the same upstream call. Only
/// successful results are cached; a failure leaves the previous snapshot and
/// its timestamp untouched.
pub struct CoalescingCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> CoalescingCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        source: Arc<dyn SnapshotSource<T>>,
        retention: Duration,
        fetch_timeout: Duration,
    ) -> Result<Self> {
        if retention.is_zero() {
            return Err(TelemetryError::construction(
                "cache retention must be greater than 0",
            ));
        }
        if fetch_timeout.is_zero() {
            return Err(TelemetryError::construction(
                "cache fetch timeout must be greater than 0",
            ));
        }

        Ok(Self {
            inner: Arc::new(CacheInner {
                source,
                retention,
                fetch_timeout,
                state: Mutex::new(CacheState {
                    snapshot: None,
                    in_flight: None,
                }),
            }),
        })
    }

    pub fn retention(&self) -> Duration {
        self.inner.retention
    }

    /// Return the cached snapshot while it is younger than the retention,
    /// otherwise wait for the (single) upstream call.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<T> {
        let call = {
            let mut state = lock(&self.inner.state);

            if let Some((value, updated_at)) = &state.snapshot {
                if updated_at.elapsed() < self.inner.retention {
                    return Ok(value.clone());
                }
            }

            match &state.in_flight {
                Some(call) => call.clone(),
                None => {
                    let call = self.start_fetch();
                    state.in_flight = Some(call.clone());
                    call
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TelemetryError::Cancelled),
            result = call => result,
        }
    }

    // Called with the state lock held; the spawned task takes the lock only
    // after the upstream call resolves.
    fn start_fetch(&self) -> SharedCall<T> {
        let inner = Arc::clone(&self.inner);

        let handle = tokio::spawn(async move {
            let _in_flight = InFlightGuard(Arc::clone(&inner));
            let token = CancellationToken::new();
            let result =
                match tokio::time::timeout(inner.fetch_timeout, inner.source.fetch(&token)).await {
                    Ok(result) => result,
                    Err(_) => {
                        token.cancel();
                        Err(TelemetryError::Timeout(inner.fetch_timeout))
                    }
                };

            match &result {
                Ok(value) => lock(&inner.state).snapshot = Some((value.clone(), Instant::now())),
                Err(e) => debug!(error = %e, "upstream fetch failed, snapshot left as is"),
            }
            result
        });

        share(handle)
    }
}
