//! Deduplicating, rate-limited work queue.
//!
//! An item is in at most one of three places: waiting in the queue, being
//! processed by exactly one worker, or both "processing" and "dirty" when it
//! was re-added mid-flight. `done` moves a dirty item back into the queue, so
//! changes that arrive during processing are deferred, never dropped.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Decides how long a failing item waits before it is retried
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next retry of `item`; counts as one more failure
    fn when(&self, item: &K) -> Duration;

    /// Reset the failure history of `item`
    fn forget(&self, item: &K);

    /// Consecutive failures recorded for `item`
    fn num_requeues(&self, item: &K) -> u32;
}

/// Backoff bounds for [`ItemExponentialFailureRateLimiter`]
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash> ItemExponentialFailureRateLimiter<K> {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            base: config.base_delay,
            max: config.max_delay.max(config.base_delay),
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Clone + Eq + Hash + Send> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn forget(&self, item: &K) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    shutdown: CancellationToken,
}

/// Work queue with per-key exclusivity and rate-limited retries
///
/// Cloning is cheap; clones share the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
    rate_limiter: Arc<dyn RateLimiter<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            rate_limiter: self.rate_limiter.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(rate_limiter: Arc<dyn RateLimiter<K>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            rate_limiter,
        }
    }

    /// Queue with exponential per-item backoff
    pub fn with_backoff(config: RateLimiterConfig) -> Self {
        Self::new(Arc::new(ItemExponentialFailureRateLimiter::new(config)))
    }

    /// Mark `item` as needing processing. No-op if it is already queued;
    /// deferred until `done` if a worker currently holds it.
    pub fn add(&self, item: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next item and mark it as processing.
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so an add between the check and the
            // await still wakes us
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Release `item`; requeue it if it was added while being processed
    pub fn done(&self, item: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Add `item` after `delay`; dropped if the queue shuts down first
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Add `item` after its backoff delay, recording one more failure
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.rate_limiter.when(&item);
        debug!("Requeueing {:?} in {:?}", item, delay);
        self.add_after(item, delay);
    }

    /// Clear the backoff history of `item`
    pub fn forget(&self, item: &K) {
        self.rate_limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `item` is waiting or marked for another pass
    pub fn is_pending(&self, item: &K) -> bool {
        self.inner.state.lock().dirty.contains(item)
    }

    /// Whether a worker currently holds `item`
    pub fn is_processing(&self, item: &K) -> bool {
        self.inner.state.lock().processing.contains(item)
    }

    /// Stop handing out work; blocked and future `get` calls return `None`
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}
