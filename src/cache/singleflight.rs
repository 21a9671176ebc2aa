//! Request coalescing ("singleflight")
//!
//! Tracks one pending execution per key. The first caller for a key invokes
//! the factory and spawns its future; later callers subscribe to the same
//! outcome until it settles. The pending entry is removed before the outcome
//! is published, so a caller arriving after settlement starts a fresh
//! execution instead of joining a finished one.

use crate::error::{CacheError, Result};
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

type OutcomeChannel<T> = Shared<oneshot::Receiver<T>>;
type PendingMap<K, T> = Arc<Mutex<HashMap<K, PendingExecution<T>>>>;

/// An execution that has not settled yet
struct PendingExecution<T> {
    id: u64,
    channel: OutcomeChannel<T>,
    subscribers: usize,
}

/// Counters kept by the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Factory invocations
    pub executions_started: u64,
    /// Callers that joined an execution already in flight
    pub joins: u64,
}

/// Generic key → pending-execution tracker
pub struct CoalescingRegistry<K, T> {
    pending: PendingMap<K, T>,
    next_id: AtomicU64,
    executions_started: AtomicU64,
    joins: AtomicU64,
}

impl<K, T> CoalescingRegistry<K, T>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            executions_started: AtomicU64::new(0),
            joins: AtomicU64::new(0),
        }
    }

    /// Execute `factory` for `key`, or join the execution already in flight
    ///
    /// The factory runs at most once per pending window. Its future is spawned
    /// on the tokio runtime, so dropping the returned future does not cancel
    /// the execution for other subscribers. If the execution ends without an
    /// outcome (panic, runtime shutdown) every subscriber gets
    /// [`CacheError::Abandoned`].
    ///
    /// Not `async` on purpose: the execution is registered and spawned
    /// eagerly, before the returned future is first polled. The factory is
    /// invoked without holding the registry lock. If it panics, the pending
    /// entry is removed and subscribers that joined in the meantime get
    /// [`CacheError::Abandoned`].
    pub fn acquire<F, Fut>(&self, key: K, factory: F) -> BoxFuture<'static, Result<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (channel, started) = {
            let mut pending = self.pending.lock();
            if let Some(execution) = pending.get_mut(&key) {
                execution.subscribers += 1;
                self.joins.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Joined pending execution for {} ({} subscribers)",
                    key, execution.subscribers
                );
                (execution.channel.clone(), None)
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (sender, receiver) = oneshot::channel();
                let channel = receiver.shared();
                pending.insert(
                    key.clone(),
                    PendingExecution {
                        id,
                        channel: channel.clone(),
                        subscribers: 1,
                    },
                );
                self.executions_started.fetch_add(1, Ordering::Relaxed);
                debug!("Started execution {} for {}", id, key);
                (channel, Some((id, sender)))
            }
        };

        // The factory runs outside the lock, so it may call back into the
        // registry. Callers arriving meanwhile already see the pending entry.
        if let Some((id, sender)) = started {
            let remove_token = RemoveOnDrop {
                pending: Arc::clone(&self.pending),
                key: key.clone(),
                id,
            };
            let execution = factory();
            Self::spawn_execution(remove_token, sender, execution);
        }

        channel
            .map(move |outcome| {
                outcome.map_err(|_canceled| CacheError::Abandoned {
                    key: key.to_string(),
                })
            })
            .boxed()
    }

    fn spawn_execution<Fut>(
        remove_token: RemoveOnDrop<K, T>,
        sender: oneshot::Sender<T>,
        execution: Fut,
    ) where
        Fut: Future<Output = T> + Send + 'static,
    {
        // The token also runs on unwind, so a panicking execution never
        // leaves a stale entry behind.
        tokio::spawn(async move {
            let outcome = execution.await;
            // Evict from the map first: callers either get a channel that will
            // still receive the outcome, or they start a new execution.
            drop(remove_token);
            sender.send(outcome).ok();
        });
    }

    /// Number of executions in flight
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether an execution for `key` is in flight
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Subscribers of the execution in flight for `key`, 0 if none
    pub fn subscribers(&self, key: &K) -> usize {
        self.pending
            .lock()
            .get(key)
            .map_or(0, |execution| execution.subscribers)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            executions_started: self.executions_started.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
        }
    }
}

impl<K, T> Default for CoalescingRegistry<K, T>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct RemoveOnDrop<K: Eq + Hash, T> {
    pending: PendingMap<K, T>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, T> Drop for RemoveOnDrop<K, T> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        // Only remove our own execution, never a newer one for the same key.
        if pending.get(&self.key).is_some_and(|e| e.id == self.id) {
            pending.remove(&self.key);
            trace!("Execution {} settled", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot as tokio_oneshot;

    type Registry = CoalescingRegistry<String, std::result::Result<Arc<String>, String>>;

    #[tokio::test]
    async fn test_single_caller() {
        let registry = Registry::new();
        let outcome = registry
            .acquire("k".to_string(), || async { Ok(Arc::new("v".to_string())) })
            .await
            .unwrap();

        assert_eq!(outcome.unwrap().as_str(), "v");
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let registry = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = tokio_oneshot::channel::<()>();
        let mut gate = Some(gate);

        let mut futures = Vec::new();
        for _ in 0..5 {
            let calls = calls.clone();
            let gate = gate.take();
            futures.push(registry.acquire("k".to_string(), move || {
                calls.fetch_add(1, Ordering::SeqCst);
                let gate = gate.expect("factory invoked more than once");
                async move {
                    gate.await.ok();
                    Ok(Arc::new("shared".to_string()))
                }
            }));
        }

        assert_eq!(registry.subscribers(&"k".to_string()), 5);
        assert!(registry.is_pending(&"k".to_string()));
        release.send(()).unwrap();

        let outcomes = futures::future::join_all(futures).await;
        let values: Vec<Arc<String>> = outcomes
            .into_iter()
            .map(|o| o.unwrap().unwrap())
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(
            registry.stats(),
            RegistryStats {
                executions_started: 1,
                joins: 4
            }
        );
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_retained() {
        let registry = Registry::new();
        let (release, gate) = tokio_oneshot::channel::<()>();

        let first = registry.acquire("k".to_string(), move || async move {
            gate.await.ok();
            Err("remote failure".to_string())
        });
        let second = registry.acquire("k".to_string(), || async {
            Err("second factory ran".to_string())
        });
        release.send(()).unwrap();

        let (a, b) = futures::join!(first, second);
        assert_eq!(a.unwrap().unwrap_err(), "remote failure");
        assert_eq!(b.unwrap().unwrap_err(), "remote failure");

        // Settled: the next call starts a new execution.
        let next = registry
            .acquire("k".to_string(), || async { Ok(Arc::new("retry".to_string())) })
            .await
            .unwrap();
        assert_eq!(next.unwrap().as_str(), "retry");
        assert_eq!(registry.stats().executions_started, 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let registry = Registry::new();
        let a = registry.acquire("a".to_string(), || async { Ok(Arc::new("A".to_string())) });
        let b = registry.acquire("b".to_string(), || async { Ok(Arc::new("B".to_string())) });

        let (a, b) = futures::join!(a, b);
        assert_eq!(a.unwrap().unwrap().as_str(), "A");
        assert_eq!(b.unwrap().unwrap().as_str(), "B");
        assert_eq!(registry.stats().executions_started, 2);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_execution() {
        let registry = Registry::new();
        let (release, gate) = tokio_oneshot::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        let ran_clone = ran.clone();
        let leader = registry.acquire("k".to_string(), move || async move {
            gate.await.ok();
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new("v".to_string()))
        });
        let follower = registry.acquire("k".to_string(), || async {
            Err("follower factory ran".to_string())
        });

        drop(leader);
        release.send(()).unwrap();

        let outcome = follower.await.unwrap();
        assert_eq!(outcome.unwrap().as_str(), "v");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn test_panicking_execution_is_abandoned() {
        let registry = Registry::new();
        let outcome = registry
            .acquire("k".to_string(), || async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                panic!("fetcher bug");
                Ok(Arc::new(String::new()))
            })
            .await;

        assert!(matches!(outcome, Err(CacheError::Abandoned { ref key }) if key == "k"));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_factory_can_reenter_registry() {
        let registry = Registry::new();
        let key = "k".to_string();

        let outcome = registry
            .acquire(key.clone(), || {
                // Already registered, and the lock is free again.
                let pending = registry.pending_count();
                let subscribers = registry.subscribers(&key);
                async move { Ok(Arc::new(format!("{}/{}", pending, subscribers))) }
            })
            .await
            .unwrap();

        assert_eq!(outcome.unwrap().as_str(), "1/1");
    }

    #[tokio::test]
    async fn test_panicking_factory_leaves_no_pending_entry() {
        let registry = Registry::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = registry.acquire("k".to_string(), || -> futures::future::Ready<_> {
                panic!("factory bug")
            });
        }));

        assert!(result.is_err());
        assert_eq!(registry.pending_count(), 0);

        let outcome = registry
            .acquire("k".to_string(), || async { Ok(Arc::new("v".to_string())) })
            .await
            .unwrap();
        assert_eq!(outcome.unwrap().as_str(), "v");
    }
}
