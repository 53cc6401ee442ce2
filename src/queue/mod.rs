pub mod memory;
pub mod redis;
pub mod task;

pub use memory::InMemoryQueue;
pub use redis::RedisQueue;
pub use task::Task;

use async_trait::async_trait;

use crate::error::AppResult;

/// Redis list holding pending work for a task type.
pub fn work_key(queue_key: &str, task_type: &str) -> String {
    format!("{queue_key}:{task_type}")
}

/// Redis list holding the payloads of failed tasks of a type.
pub fn failed_key(queue_key: &str, task_type: &str) -> String {
    format!("{queue_key}:{task_type}:failed")
}

/// Queue backend trait for abstracting the list operations the dispatcher
/// needs. Implementations absorb transient backend errors internally with
/// bounded retries; an `Err` is the final outcome of an operation.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Number of pending entries in `key` (LLEN).
    async fn len(&self, key: &str) -> AppResult<u64>;

    /// Pop the head entry of `key` (LPOP); `None` when the list is empty.
    async fn pop(&self, key: &str) -> AppResult<Option<String>>;

    /// Append `payload` to `key` and refresh the list TTL (RPUSH + EXPIRE).
    async fn push_failed(&self, key: &str, payload: &str, ttl_seconds: u64) -> AppResult<()>;
}
