//! Work queue for object keys.
//!
//! A key is handed to at most one worker at a time. Adding a key that is
//! being processed marks it dirty, and it is queued again once the worker
//! calls `done`. Failed keys back off exponentially.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: &str) {
        let mut state = self.state.lock().await;
        if state.processing.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.queue.push_back(key.to_string());
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.add(&key).await;
        });
    }

    /// Re-add a failed key with exponential backoff. Returns the delay used.
    pub async fn add_rate_limited(self: &Arc<Self>, key: &str) -> Duration {
        let failures = {
            let mut state = self.state.lock().await;
            let n = state.failures.entry(key.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let delay = backoff(failures);
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff of `key` after a successful reconcile.
    pub async fn forget(&self, key: &str) {
        self.state.lock().await.failures.remove(key);
    }

    /// Wait for the next key and mark it as processing.
    pub async fn get(&self) -> String {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Finish processing `key`, re-queueing it if it changed meanwhile.
    pub async fn done(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.to_string()) {
            state.queue.push_back(key.to_string());
            self.notify.notify_one();
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    BASE_BACKOFF
        .saturating_mul(1u32 << exp)
        .min(MAX_BACKOFF)
}
