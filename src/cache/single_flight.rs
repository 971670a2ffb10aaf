//! Request de-duplication
//!
//! Concurrent callers asking for the same key while a computation is in
//! flight await that computation instead of starting their own. The
//! in-flight entry removes itself when the computation finishes, so the next
//! caller after completion starts fresh.
//!
//! The map only holds a weak handle: once every waiter is gone (a torn-down
//! subscription, say) the computation is dropped with them.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};

type InFlight<K, T> = Arc<Mutex<HashMap<K, (u64, WeakShared<BoxFuture<'static, T>>)>>>;

pub struct SingleFlight<K, T: Clone> {
    in_flight: InFlight<K, T>,
    generation: AtomicU64,
}

impl<K, T: Clone> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }
}

fn lock<K, T: Clone>(map: &InFlight<K, T>) -> MutexGuard<'_, HashMap<K, (u64, WeakShared<BoxFuture<'static, T>>)>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, T> SingleFlight<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key` unless a run for `key` is already in flight, in
    /// which case its result is awaited instead. `make` is only called by
    /// the caller that starts the run.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(&key).and_then(|(_, weak)| weak.upgrade()) {
                Some(shared) => shared,
                None => {
                    // abandoned runs leave dead handles behind
                    in_flight.retain(|_, (_, weak)| weak.upgrade().is_some());
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let map = Arc::clone(&self.in_flight);
                    let cleanup_key = key.clone();
                    let work = make();
                    let shared: Shared<BoxFuture<'static, T>> = async move {
                        let value = work.await;
                        let mut in_flight = lock(&map);
                        if in_flight.get(&cleanup_key).is_some_and(|(g, _)| *g == generation) {
                            in_flight.remove(&cleanup_key);
                        }
                        value
                    }
                    .boxed()
                    .shared();
                    if let Some(weak) = shared.downgrade() {
                        in_flight.insert(key, (generation, weak));
                    }
                    shared
                }
            }
        };
        shared.await
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.in_flight)
            .get(key)
            .is_some_and(|(_, weak)| weak.upgrade().is_some())
    }

    pub fn len(&self) -> usize {
        lock(&self.in_flight)
            .values()
            .filter(|(_, weak)| weak.upgrade().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
