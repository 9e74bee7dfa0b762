//! Deduplicating, rate-limited work queue.
//!
//! A key is held at most once while pending, and never handed to two workers
//! at the same time: a key re-added while it is being processed is parked
//! until [`WorkQueue::done`] is called for it.

pub mod rate_limiter;

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use rate_limiter::{default_controller_rate_limiter, RateLimiter};

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    /// Delayed adds not yet fired, with the earliest time each is due.
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
    shutdown: CancellationToken,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_default_rate_limiter() -> Self {
        Self::new(Box::new(default_controller_rate_limiter()))
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `key` as needing processing. Collapses into an already pending entry.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Adds `key` once `delay` has elapsed. A later request for a key that is
    /// already waiting with an earlier deadline is dropped.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(&key) {
                Some(&due) if due <= ready_at => return,
                _ => {
                    state.waiting.insert(key.clone(), ready_at);
                }
            }
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(ready_at) => queue.fire(key, ready_at),
                _ = queue.shutdown.cancelled() => {}
            }
        });
    }

    fn fire(&self, key: K, ready_at: Instant) {
        {
            let mut state = self.lock();
            if state.waiting.get(&key) != Some(&ready_at) {
                return;
            }
            state.waiting.remove(&key);
        }
        self.add(key);
    }

    /// Re-adds `key` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = self.limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Clears the rate limiter's failure history for `key`.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Blocks until a key is available. Returns `None` once the queue is shut down.
    /// The caller must hand the key back through [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Finishes processing `key`, requeueing it if it was re-added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting keys and wakes every blocked [`WorkQueue::get`].
    /// Keys already queued are dropped.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
            state.waiting.clear();
        }
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::rate_limiter::ItemExponentialFailureRateLimiter;
    use super::*;

    fn queue() -> Arc<WorkQueue<String>> {
        Arc::new(WorkQueue::new(Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
        ))))
    }

    #[test]
    fn duplicate_adds_collapse() {
        let q = queue();
        q.add("ns/a".to_string());
        q.add("ns/a".to_string());
        q.add("ns/b".to_string());
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn get_hands_out_in_fifo_order() {
        let q = queue();
        q.add("ns/a".to_string());
        q.add("ns/b".to_string());

        assert_eq!(q.get().await.as_deref(), Some("ns/a"));
        assert_eq!(q.get().await.as_deref(), Some("ns/b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_readded_while_processing_waits_for_done() {
        let q = queue();
        q.add("ns/a".to_string());

        let key = q.get().await.unwrap();
        q.add(key.clone());
        q.add(key.clone());
        assert_eq!(q.len(), 0, "in-flight key must not be handed out twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(key.clone()));
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn get_wakes_on_add() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("ns/late".to_string());

        let got = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("get should wake")
            .unwrap();
        assert_eq!(got.as_deref(), Some("ns/late"));
    }

    #[tokio::test]
    async fn shut_down_releases_blocked_getters() {
        let q = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&q);
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        q.shut_down();
        for w in waiters {
            let got = tokio::time::timeout(Duration::from_secs(5), w)
                .await
                .expect("getter should be released")
                .unwrap();
            assert_eq!(got, None);
        }

        q.add("ns/ignored".to_string());
        assert!(q.is_empty());
        assert!(q.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_fires_once_delay_elapses() {
        let q = queue();
        let start = Instant::now();
        q.add_after("ns/a".to_string(), Duration::from_secs(2));
        assert!(q.is_empty());

        let key = tokio::time::timeout(Duration::from_secs(10), q.get())
            .await
            .expect("delayed key should arrive")
            .unwrap();
        assert_eq!(key, "ns/a");
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_delayed_adds_collapse() {
        let q = queue();
        q.add_after("ns/a".to_string(), Duration::from_secs(1));
        q.add_after("ns/a".to_string(), Duration::from_secs(5));
        q.add_after("ns/a".to_string(), Duration::from_millis(500));

        let key = tokio::time::timeout(Duration::from_secs(10), q.get())
            .await
            .expect("delayed key should arrive")
            .unwrap();
        q.done(&key);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(q.is_empty(), "superseded delayed adds must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_and_forget_resets() {
        let q = queue();
        let key = "ns/a".to_string();

        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 2);

        let got = tokio::time::timeout(Duration::from_secs(5), q.get())
            .await
            .expect("rate limited key should arrive")
            .unwrap();
        assert_eq!(got, key);
        q.forget(&key);
        q.done(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }
}
