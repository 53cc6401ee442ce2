use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{AppError, AppResult};
use crate::queue::TaskQueue;

// Matches the LLEN retry budget of the Redis implementation.
const LEN_ATTEMPTS: u32 = 3;

/// In-memory queue for unit and integration testing.
///
/// Records failed-task pushes and TTL updates so tests can assert
/// persistence behavior, and can inject transient `len` failures to
/// exercise the retry contract of the trait.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    ttls: HashMap<String, u64>,
    pending_len_failures: u32,
    push_failed_calls: u32,
    pops: u32,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a work list with a payload.
    pub async fn push(&self, key: &str, payload: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(payload.to_string());
    }

    /// Snapshot of a list's entries.
    pub async fn items(&self, key: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The TTL most recently set on a list.
    pub async fn ttl(&self, key: &str) -> Option<u64> {
        let inner = self.inner.lock().await;
        inner.ttls.get(key).copied()
    }

    /// Make the next `n` internal `len` attempts fail.
    pub async fn fail_next_len(&self, n: u32) {
        let mut inner = self.inner.lock().await;
        inner.pending_len_failures = n;
    }

    pub async fn push_failed_calls(&self) -> u32 {
        let inner = self.inner.lock().await;
        inner.push_failed_calls
    }

    pub async fn pops(&self) -> u32 {
        let inner = self.inner.lock().await;
        inner.pops
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn len(&self, key: &str) -> AppResult<u64> {
        let mut inner = self.inner.lock().await;

        // absorb injected failures within the retry budget
        for attempt in 1..=LEN_ATTEMPTS {
            if inner.pending_len_failures == 0 {
                let len = inner.lists.get(key).map(VecDeque::len).unwrap_or(0);
                return Ok(len as u64);
            }

            inner.pending_len_failures -= 1;
            if attempt == LEN_ATTEMPTS {
                return Err(AppError::Redis("injected failure".to_string()));
            }
        }

        unreachable!("retry loop always returns");
    }

    async fn pop(&self, key: &str) -> AppResult<Option<String>> {
        let mut inner = self.inner.lock().await;
        inner.pops += 1;
        Ok(inner.lists.get_mut(key).and_then(VecDeque::pop_front))
    }

    async fn push_failed(&self, key: &str, payload: &str, ttl_seconds: u64) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.push_failed_calls += 1;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(payload.to_string());
        inner.ttls.insert(key.to_string(), ttl_seconds);
        Ok(())
    }
}
