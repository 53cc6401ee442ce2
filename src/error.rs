/// Application error type shared across the dispatcher core
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Redis errors (connection or command level)
    #[error("redis error: {0}")]
    Redis(String),

    // Queue entries that could not be decoded into a task
    #[error("invalid task payload: {0}")]
    Decode(#[from] serde_json::Error),

    // Task executions that failed; the message is what the script printed
    // or what the webhook responded with
    #[error("{0}")]
    Execution(String),

    // Transport-level webhook errors
    #[error("http request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Redis(err.to_string())
    }
}

/// Result type alias used throughout the crate
pub type AppResult<T> = Result<T, AppError>;
