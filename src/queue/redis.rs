use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::backoff::Backoff;
use crate::error::AppResult;
use crate::queue::TaskQueue;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Retry delays for failed commands
const CMD_RETRY_MIN_MS: u64 = 250;
const CMD_RETRY_MAX_MS: u64 = 2000;
const CMD_RETRY_FACTOR: f64 = std::f64::consts::E;

// Retry counts per operation. LPOP gets a single attempt: an error there
// usually just means the list ran empty mid-round.
const LEN_RETRIES: u32 = 3;
const POP_RETRIES: u32 = 1;
const PUSH_RETRIES: u32 = 3;

/// Redis-backed queue.
///
/// The connection is established lazily and shared: a `ConnectionManager` is
/// a multiplexed, auto-reconnecting connection that is cheap to clone, so
/// concurrent workers and the scheduler all operate on clones of one handle.
/// A dispatcher started while Redis is down keeps polling; every operation
/// retries the connect until the server comes back.
pub struct RedisQueue {
    url: String,
    conn: Mutex<Option<ConnectionManager>>,
}

impl RedisQueue {
    pub fn new(network: &str, address: &str) -> Self {
        let url = match network {
            "unix" => format!("redis+unix://{address}"),
            _ => format!("redis://{address}"),
        };

        Self {
            url,
            conn: Mutex::new(None),
        }
    }

    async fn manager(&self) -> AppResult<ConnectionManager> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let client = redis::Client::open(self.url.as_str())?;
        let config = ConnectionManagerConfig::new().set_connection_timeout(CONNECT_TIMEOUT);
        let conn = ConnectionManager::new_with_config(client, config).await?;

        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn len(&self, key: &str) -> AppResult<u64> {
        with_retries(LEN_RETRIES, move || async move {
            let mut conn = self.manager().await?;
            Ok(conn.llen(key).await?)
        })
        .await
    }

    async fn pop(&self, key: &str) -> AppResult<Option<String>> {
        with_retries(POP_RETRIES, move || async move {
            let mut conn = self.manager().await?;
            Ok(conn.lpop(key, None).await?)
        })
        .await
    }

    async fn push_failed(&self, key: &str, payload: &str, ttl_seconds: u64) -> AppResult<()> {
        with_retries(PUSH_RETRIES, move || async move {
            let mut conn = self.manager().await?;
            let _: i64 = conn.rpush(key, payload).await?;
            Ok(())
        })
        .await?;

        with_retries(PUSH_RETRIES, move || async move {
            let mut conn = self.manager().await?;
            let _: bool = conn.expire(key, ttl_seconds as i64).await?;
            Ok(())
        })
        .await
    }
}

/// Runs `op` up to `retries` times with jittered exponential delays between
/// attempts. Intermediate errors log at debug; the last error surfaces.
pub(crate) async fn with_retries<T, F, Fut>(retries: u32, mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut backoff = Backoff::jittered(CMD_RETRY_MIN_MS, CMD_RETRY_MAX_MS, CMD_RETRY_FACTOR);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= retries {
                    return Err(err);
                }

                tracing::debug!(error = %err, attempt, "redis command failed, retrying");
                tokio::time::sleep(backoff.next()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_absorb_transient_errors() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;

        let result = with_retries(3, move || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AppError::Redis("transient".to_string()))
            } else {
                Ok(42u64)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn final_error_surfaces() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;

        let result: AppResult<u64> = with_retries(3, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Redis("down".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn single_attempt_does_not_retry() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;

        let result: AppResult<u64> = with_retries(1, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Redis("empty".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
