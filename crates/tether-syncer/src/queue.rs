//! Keyed work queue
//!
//! Deduplicates pending keys and guarantees at most one worker holds a given
//! key at a time. A key added while it is being processed is requeued when
//! the worker calls [`WorkQueue::done`]. Retries use per-key exponential
//! backoff that resets on [`WorkQueue::forget`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use tether_common::retry::BackoffPolicy;

/// Why a key was enqueued
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkReason {
    /// Change observed on the logical side
    LogicalEvent,
    /// Change observed on the physical side
    PhysicalEvent,
    /// Periodic full resync
    Resync,
    /// Backoff retry after a failure
    Retry,
}

impl fmt::Display for WorkReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LogicalEvent => write!(f, "logical_event"),
            Self::PhysicalEvent => write!(f, "physical_event"),
            Self::Resync => write!(f, "resync"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

/// A dequeued key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem<K> {
    /// The key to reconcile
    pub key: K,
    /// Reason of the first enqueue since the key was last dequeued
    pub reason: WorkReason,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    reasons: HashMap<K, WorkReason>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            reasons: HashMap::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            shutting_down: false,
        }
    }
}

/// Deduplicating, single-flight work queue
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    failures: Mutex<HashMap<K, u32>>,
    backoff: BackoffPolicy,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue using `backoff` for rate-limited requeues
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            failures: Mutex::new(HashMap::new()),
            backoff,
        }
    }

    /// Enqueue a key. No-op if it is already pending or the queue is shut down.
    pub fn add(&self, key: K, reason: WorkReason) {
        {
            let mut state = self.state.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            state.reasons.insert(key.clone(), reason);
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Enqueue a key after `delay`
    pub fn add_after(self: &Arc<Self>, key: K, reason: WorkReason, delay: Duration) {
        if delay.is_zero() {
            self.add(key, reason);
            return;
        }
        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.add(key, reason);
            }
        });
    }

    /// Enqueue a key after its next backoff delay; returns the delay used
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let attempt = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = self.backoff.delay_for(attempt);
        self.add_after(key, WorkReason::Retry, delay);
        delay
    }

    /// Reset the backoff for a key
    pub fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    /// Rate-limited requeues since the last `forget`
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` on shutdown or cancellation.
    ///
    /// The caller must call [`WorkQueue::done`] with the key when finished.
    pub async fn get(&self, cancel: &CancellationToken) -> Option<WorkItem<K>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let reason = state.reasons.remove(&key).unwrap_or(WorkReason::Resync);
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(WorkItem { key, reason });
                }
                if state.shutting_down {
                    return None;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Release a key; requeues it if it was added while being processed
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys; waiting workers return `None`
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting to be processed
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<String>> {
        Arc::new(WorkQueue::new(
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(8)).deterministic(),
        ))
    }

    #[tokio::test]
    async fn test_pending_keys_are_deduplicated() {
        let q = queue();
        q.add("a".to_string(), WorkReason::LogicalEvent);
        q.add("a".to_string(), WorkReason::PhysicalEvent);
        q.add("b".to_string(), WorkReason::Resync);
        assert_eq!(q.len(), 2);

        let cancel = CancellationToken::new();
        let first = q.get(&cancel).await.unwrap();
        assert_eq!(first.key, "a");
        assert_eq!(first.reason, WorkReason::LogicalEvent);
    }

    #[tokio::test]
    async fn test_key_in_flight_is_not_handed_out_twice() {
        let q = queue();
        let cancel = CancellationToken::new();
        q.add("a".to_string(), WorkReason::LogicalEvent);
        let item = q.get(&cancel).await.unwrap();

        // Added while processing: held back until done
        q.add("a".to_string(), WorkReason::PhysicalEvent);
        assert!(q.is_empty());

        q.done(&item.key);
        assert_eq!(q.len(), 1);
        let again = q.get(&cancel).await.unwrap();
        assert_eq!(again.reason, WorkReason::PhysicalEvent);
        q.done(&again.key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let q = queue();
        let cancel = CancellationToken::new();
        let waiter = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.get(&cancel).await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert!(waiter.await.unwrap().is_none());

        q.add("late".to_string(), WorkReason::Resync);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_releases_waiters() {
        let q = queue();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(q.get(&cancel).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_requeue_backs_off() {
        let q = queue();
        let key = "a".to_string();
        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_secs(1));
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(q.len(), 1);

        let cancel = CancellationToken::new();
        let item = q.get(&cancel).await.unwrap();
        assert_eq!(item.reason, WorkReason::Retry);
        q.done(&item.key);

        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_secs(2));
        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_secs(4));
        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_secs(8));
        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_secs(8));
        assert_eq!(q.num_requeues(&key), 5);

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
        assert_eq!(q.add_rate_limited(key), Duration::from_secs(1));
    }
}
