//! Deduplicating work queue keyed by policy name.
//!
//! A key is in at most one of three places: waiting in the queue, being
//! processed by a worker, or neither. Adding a waiting key is a no-op.
//! Adding a key that is being processed marks it dirty; `done` puts a dirty
//! key back so it runs exactly once more. Failed keys come back after an
//! exponential backoff until the attempt budget is spent.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

/// Backoff and retry budget.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl QueueConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    attempts: HashMap<String, u32>,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    config: QueueConfig,
}

/// Shared handle to the queue. Cheap to clone.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                config,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // state stays consistent between statements, so a poisoned lock is usable
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` unless it is already waiting.
    pub fn add(&self, key: &str) {
        let mut state = self.lock();
        if state.shutdown {
            return;
        }
        if state.processing.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Queue `key` once `delay` has elapsed.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as no longer processing. A dirty key is queued again.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.to_string()) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Schedule a retry of a failed key. Returns the backoff delay, or
    /// `None` when the attempt budget is spent and the key was dropped.
    pub fn retry(&self, key: &str) -> Option<Duration> {
        let attempt = {
            let mut state = self.lock();
            let attempts = state.attempts.entry(key.to_string()).or_insert(0);
            *attempts += 1;
            *attempts
        };
        if attempt >= self.inner.config.max_attempts {
            self.forget(key);
            warn!(key = %key, attempts = attempt, "Giving up after exhausting retries");
            return None;
        }
        let delay = self.inner.config.backoff(attempt);
        debug!(key = %key, attempt, delay_ms = delay.as_millis() as u64, "Requeue with backoff");
        self.add_after(key, delay);
        Some(delay)
    }

    /// Requeue `key` after the backoff for its current attempt count,
    /// without counting this as an attempt.
    pub fn requeue(&self, key: &str) -> Duration {
        let attempt = self.lock().attempts.get(key).copied().unwrap_or(0);
        let delay = self.inner.config.backoff(attempt + 1);
        self.add_after(key, delay);
        delay
    }

    /// Reset the attempt count of `key`.
    pub fn forget(&self, key: &str) {
        self.lock().attempts.remove(key);
    }

    /// Failed attempts recorded for `key`.
    pub fn attempts(&self, key: &str) -> u32 {
        self.lock().attempts.get(key).copied().unwrap_or(0)
    }

    /// Keys waiting to be processed.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
