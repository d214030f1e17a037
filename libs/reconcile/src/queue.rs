//! Rate-limited, de-duplicating work queue.
//!
//! Semantics:
//! - An item added while already queued is not queued twice.
//! - An item added while being processed is queued again only after `done`.
//! - `get` blocks until an item is available or the queue shuts down.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::BackoffPolicy;

/// Cloneable handle to a shared work queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: BackoffPolicy,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Create a queue with the default per-item backoff.
    pub fn new() -> Self {
        Self::with_backoff(BackoffPolicy::for_work_queue())
    }

    pub fn with_backoff(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        // Critical sections never panic; recover the guard if one ever did.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark an item as needing processing.
    pub fn add(&self, item: K) {
        let mut state = self.state();
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

    /// Add an item once `delay` has elapsed.
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
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Add an item after its per-item backoff, counting one more requeue.
    pub fn add_rate_limited(&self, item: K)
    where
        K: std::fmt::Debug,
    {
        let attempt = {
            let mut state = self.state();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            let attempt = *failures;
            *failures += 1;
            attempt
        };
        let delay = self.inner.backoff.delay(attempt);
        trace!(?item, attempt, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(item, delay);
    }

    /// Clear the requeue history of an item.
    pub fn forget(&self, item: &K) {
        self.state().failures.remove(item);
    }

    /// How many times the item has been requeued through `add_rate_limited`.
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.state().failures.get(item).copied().unwrap_or(0)
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on so idle workers pick up the rest.
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Mark an item as processed. A re-add that arrived meanwhile is queued now.
    pub fn done(&self, item: &K) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items currently handed out and not yet `done`.
    pub fn processing_len(&self) -> usize {
        self.state().processing.len()
    }

    /// Stop handing out items and wake every blocked `get`.
    pub fn shut_down(&self) {
        let pending = {
            let mut state = self.state();
            state.shutting_down = true;
            state.queue.len()
        };
        debug!(pending, "work queue shutting down");
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}
