use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt};
use sentry::{Hub, SentryFutureExt};

use crate::utils::defer::defer;

use super::CacheKey;

/// An in-flight computation and everyone waiting for it.
#[derive(Debug)]
struct PendingRequest<T> {
    started: Instant,
    /// The first waiter is the caller that started the computation.
    waiters: Vec<oneshot::Sender<T>>,
}

type PendingMap<T> = Arc<Mutex<HashMap<CacheKey, PendingRequest<T>>>>;

/// Deduplicates concurrent computations by their [`CacheKey`].
///
/// The first request for a key spawns its computation, every further request for the same key
/// attaches to it until it completes. On completion the key is removed from the registry and
/// all waiters are notified in one critical section: the caller that started the computation
/// receives the original value, everybody else an independent clone.
///
/// There is no cancellation. A waiter that is dropped does not affect the computation or the
/// other waiters. If the computation itself goes away without completing, the key is removed
/// as well and all waiters observe [`oneshot::Canceled`].
#[derive(Debug)]
pub struct Coordinator<T> {
    pending: PendingMap<T>,
}

impl<T> Clone for Coordinator<T> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T> Default for Coordinator<T> {
    fn default() -> Self {
        Self {
            pending: Default::default(),
        }
    }
}

fn lock<T>(pending: &PendingMap<T>) -> MutexGuard<'_, HashMap<CacheKey, PendingRequest<T>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone + Send + 'static> Coordinator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the computation of `key`, starting it via `make_computation` if it is not
    /// already in flight.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the
    /// computation on the runtime, even if the returned future is never awaited.
    pub fn request<F, Fut>(
        &self,
        key: CacheKey,
        make_computation: F,
    ) -> BoxFuture<'static, Result<T, oneshot::Canceled>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let computation = {
            let mut pending = lock(&self.pending);
            match pending.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    tracing::trace!(%key, "Attaching to in-flight request");
                    metric!(counter("caches.coalesced") += 1);
                    entry.get_mut().waiters.push(sender);
                    None
                }
                Entry::Vacant(entry) => {
                    entry.insert(PendingRequest {
                        started: Instant::now(),
                        waiters: vec![sender],
                    });
                    metric!(gauge("caches.in_flight") = pending.len() as u64);
                    Some(make_computation())
                }
            }
        };

        if let Some(computation) = computation {
            self.spawn(key, computation);
        }

        receiver.boxed()
    }

    fn spawn<Fut>(&self, key: CacheKey, computation: Fut)
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let pending = self.pending.clone();

        // Evicts the key if the task is torn down before completing, dropping all senders.
        let remove_on_abort = {
            let pending = pending.clone();
            let key = key.clone();
            defer(move || {
                lock(&pending).remove(&key);
            })
        };

        let task = async move {
            let result = computation.await;
            remove_on_abort.cancel();

            let mut pending = lock(&pending);
            let Some(request) = pending.remove(&key) else {
                return;
            };
            tracing::trace!(
                %key,
                elapsed = ?request.started.elapsed(),
                waiters = request.waiters.len(),
                "Request completed"
            );

            let mut waiters = request.waiters.into_iter();
            let primary = waiters.next();
            let copies: Vec<_> = waiters.map(|waiter| (waiter, result.clone())).collect();
            if let Some(primary) = primary {
                primary.send(result).ok();
            }
            for (waiter, copy) in copies {
                waiter.send(copy).ok();
            }
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(task);
    }

    /// The number of keys currently in flight.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether a computation for `key` is in flight.
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        lock(&self.pending).contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_requests_are_coalesced() {
        fetchcache_test::setup();
        let coordinator = Coordinator::<String>::new();
        let key = CacheKey::for_testing("/x");
        let calls = Arc::new(AtomicUsize::new(0));

        let requests: Vec<_> = (0..3)
            .map(|_| {
                let calls = calls.clone();
                coordinator.request(key.clone(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    "A".to_owned()
                })
            })
            .collect();

        assert!(coordinator.is_pending(&key));
        let results = futures::future::join_all(requests).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), "A");
        }
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_completed_request_starts_over() {
        let coordinator = Coordinator::<usize>::new();
        let key = CacheKey::for_testing("/x");

        let first = coordinator.request(key.clone(), || async { 1 }).await;
        let second = coordinator.request(key.clone(), || async { 2 }).await;

        assert_eq!(first.unwrap(), 1);
        assert_eq!(second.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_affect_others() {
        let coordinator = Coordinator::<usize>::new();
        let key = CacheKey::for_testing("/x");

        let slow = || async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            7
        };
        let primary = coordinator.request(key.clone(), slow);
        let dropped = coordinator.request(key.clone(), slow);
        drop(dropped);

        assert_eq!(primary.await.unwrap(), 7);
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_computation() {
        fetchcache_test::setup();
        let coordinator = Coordinator::<usize>::new();
        let key = CacheKey::for_testing("/x");

        async fn explode() -> usize {
            tokio::time::sleep(Duration::from_millis(10)).await;
            panic!("transport blew up");
        }

        let first = coordinator.request(key.clone(), explode);
        let second = coordinator.request(key.clone(), || async { 1 });

        assert!(first.await.is_err());
        assert!(second.await.is_err());
        assert_eq!(coordinator.pending_count(), 0);

        let retry = coordinator.request(key, || async { 2 }).await;
        assert_eq!(retry.unwrap(), 2);
    }
}
