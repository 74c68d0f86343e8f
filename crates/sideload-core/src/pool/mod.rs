//! Deduplicating object pool with weak lifetime.
//!
//! [`WeakPool`] hands out shared [`Lease`]s for a key while never being the
//! reason a value stays alive:
//!
//! - a live value for the key is returned as-is
//! - a construction already in flight for the key is awaited, so every
//!   concurrent requester observes the same success or failure
//! - otherwise the factory runs once on a background task
//!
//! The pool only records a `Weak` observation of each value. When the last
//! lease is dropped the value is destroyed and a release message is queued
//! back to the pool, which prunes the slot on its next access. Failures are
//! never cached.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::CreationAborted;

type PendingValue<K, V, E> = Shared<BoxFuture<'static, Result<Lease<K, V>, E>>>;

/// A shared handle to a pooled value.
///
/// Cloning a lease is cheap. The value lives until the last lease drops.
pub struct Lease<K, V> {
    inner: Arc<LeaseInner<K, V>>,
}

struct LeaseInner<K, V> {
    value: V,
    key: K,
    generation: u64,
    released: mpsc::UnboundedSender<u64>,
}

impl<K, V> Drop for LeaseInner<K, V> {
    fn drop(&mut self) {
        // Never touch the pool lock from a destructor; the pool drains this
        // queue itself.
        let _ = self.released.send(self.generation);
    }
}

impl<K, V> Lease<K, V> {
    /// The key this value was created for.
    pub fn key(&self) -> &K {
        &self.inner.key
    }

    /// Whether both leases refer to the same pooled instance.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }
}

impl<K, V> Clone for Lease<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Deref for Lease<K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.inner.value
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for Lease<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.inner.key)
            .field("generation", &self.inner.generation)
            .field("value", &self.inner.value)
            .finish()
    }
}

struct LiveSlot<K, V> {
    generation: u64,
    value: Weak<LeaseInner<K, V>>,
}

struct PoolState<K, V, E> {
    pending: HashMap<K, PendingValue<K, V, E>>,
    live: HashMap<K, LiveSlot<K, V>>,
    released: mpsc::UnboundedReceiver<u64>,
    next_generation: u64,
}

impl<K, V, E> PoolState<K, V, E> {
    fn prune_released(&mut self) {
        while let Ok(generation) = self.released.try_recv() {
            // Generations are unique, so at most one slot matches.
            self.live.retain(|_, slot| slot.generation != generation);
        }
    }
}

/// Async, deduplicated, weak-lifetime cache keyed by `K`.
pub struct WeakPool<K, V, E> {
    state: Arc<Mutex<PoolState<K, V, E>>>,
    released: mpsc::UnboundedSender<u64>,
}

impl<K, V, E> Default for WeakPool<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Clone + Send + Sync + From<CreationAborted> + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> WeakPool<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Clone + Send + Sync + From<CreationAborted> + 'static,
{
    pub fn new() -> Self {
        let (released_tx, released_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(PoolState {
                pending: HashMap::new(),
                live: HashMap::new(),
                released: released_rx,
                next_generation: 0,
            })),
            released: released_tx,
        }
    }

    /// Return the live value for `key`, or join/start its construction.
    ///
    /// `create` is invoked with the key map locked, so it should only build
    /// the future; all real work belongs inside the returned future, which
    /// runs on its own task and completes even if every requester goes away.
    pub async fn value<F, Fut>(&self, key: K, create: F) -> Result<Lease<K, V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let pending = {
            let mut state = lock(&self.state);
            state.prune_released();

            if let Some(pending) = state.pending.get(&key) {
                trace!("joining in-flight creation");
                pending.clone()
            } else {
                if let Some(inner) = state.live.get(&key).and_then(|slot| slot.value.upgrade()) {
                    return Ok(Lease { inner });
                }
                state.live.remove(&key);

                let generation = state.next_generation;
                state.next_generation += 1;

                let pending = self.spawn_creation(key.clone(), generation, create());
                state.pending.insert(key, pending.clone());
                pending
            }
        };

        pending.await
    }

    /// Whether a live value is currently recorded for `key`.
    pub fn contains(&self, key: &K) -> bool {
        let mut state = lock(&self.state);
        state.prune_released();
        state
            .live
            .get(key)
            .is_some_and(|slot| slot.value.strong_count() > 0)
    }

    /// Whether a construction for `key` is in flight.
    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.state).pending.contains_key(key)
    }

    fn spawn_creation<Fut>(&self, key: K, generation: u64, create: Fut) -> PendingValue<K, V, E>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let released = self.released.clone();

        let task = tokio::spawn(async move {
            let result = create.await;

            let mut state = lock(&state);
            state.pending.remove(&key);
            match result {
                Ok(value) => {
                    let inner = Arc::new(LeaseInner {
                        value,
                        key: key.clone(),
                        generation,
                        released,
                    });
                    state.live.insert(
                        key,
                        LiveSlot {
                            generation,
                            value: Arc::downgrade(&inner),
                        },
                    );
                    Ok(Lease { inner })
                }
                Err(err) => Err(err),
            }
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => Err(E::from(CreationAborted)),
            }
        }
        .boxed()
        .shared()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
