//! Usage counters and the stats HTTP endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::StatsConfig;
use crate::error::AppResult;

/// Per-type task counters plus the dispatcher's start time.
pub struct Stats {
    version: String,
    started_at: u64,
    counts: RwLock<HashMap<String, u64>>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    runtime: u64,
    task_count: HashMap<String, u64>,
    version: String,
}

impl Stats {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            started_at: now_unix(),
            counts: RwLock::new(HashMap::new()),
        }
    }

    /// Register a task type so it shows up with a zero count.
    pub fn init_task(&self, task_type: &str) {
        self.counts.write().insert(task_type.to_string(), 0);
    }

    /// Count a started task of `task_type`.
    pub fn task_started(&self, task_type: &str) {
        *self.counts.write().entry(task_type.to_string()).or_insert(0) += 1;
    }

    pub fn task_count(&self, task_type: &str) -> u64 {
        self.counts.read().get(task_type).copied().unwrap_or(0)
    }

    fn snapshot(&self) -> StatsResponse {
        StatsResponse {
            runtime: now_unix().saturating_sub(self.started_at),
            task_count: self.counts.read().clone(),
            version: self.version.clone(),
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

pub fn router(stats: Arc<Stats>, pattern: &str) -> Router {
    Router::new()
        .route(pattern, get(serve_stats))
        .with_state(stats)
}

async fn serve_stats(State(stats): State<Arc<Stats>>) -> Json<StatsResponse> {
    Json(stats.snapshot())
}

/// Serve the stats endpoint on the configured interface. Runs until the
/// process exits.
pub async fn serve(stats: Arc<Stats>, config: &StatsConfig) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(&config.interface).await?;
    tracing::info!(interface = %config.interface, pattern = %config.pattern, "serving stats");

    axum::serve(listener, router(stats, &config.pattern)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_start_at_zero_and_increment() {
        let stats = Stats::new("1.0.0");
        stats.init_task("mytask");

        assert_eq!(stats.task_count("mytask"), 0);

        stats.task_started("mytask");
        stats.task_started("mytask");
        assert_eq!(stats.task_count("mytask"), 2);
    }

    #[test]
    fn snapshot_contains_all_registered_types() {
        let stats = Stats::new("1.0.0");
        stats.init_task("a");
        stats.init_task("b");
        stats.task_started("a");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.task_count["a"], 1);
        assert_eq!(snapshot.task_count["b"], 0);
        assert_eq!(snapshot.version, "1.0.0");
    }

    #[tokio::test]
    async fn endpoint_returns_stats_json() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let stats = Arc::new(Stats::new("1.0.0"));
        stats.init_task("mytask");
        stats.task_started("mytask");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(stats, "/stats");
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(b"GET /stats HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        socket.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed["task_count"]["mytask"], 1);
        assert_eq!(parsed["version"], "1.0.0");
    }
}
