//! Configuration loading and validation.
//!
//! The configuration file is TOML. Raw file values go through a folding pass
//! that applies defaults, inherits task-level settings from the global level
//! and clamps backoff parameters to sane floors, so the rest of the crate
//! only ever sees a validated [`Config`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;

use crate::basepath;

const DEFAULT_INTERVAL_MIN_MS: u64 = 100;
const DEFAULT_INTERVAL_MAX_MS: u64 = 2000;
const DEFAULT_INTERVAL_FACTOR: f64 = 2.0;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Validated dispatcher configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Network type for the Redis connection ("tcp" or "unix")
    pub redis_network: String,
    /// Network address for the Redis connection
    pub redis_address: String,
    /// First part of all list names used in Redis
    pub queue_key: String,
    /// Script executed to notify about errors (empty: disabled)
    pub error_script: String,
    /// Directory for temporary files (empty: system default)
    pub temp_dir: String,
    /// File all output is written to instead of stdout (empty: stdout)
    pub logfile: String,
    /// Poll-scheduler interval backoff, milliseconds
    pub interval_min: u64,
    pub interval_max: u64,
    pub interval_factor: f64,
    /// Global default TTL for failed-task lists, seconds
    pub failed_tasks_ttl: u64,
    /// Global defaults for the per-type error backoff
    pub backoff_enabled: bool,
    pub backoff_min: u64,
    pub backoff_max: u64,
    pub backoff_factor: f64,
    pub stats: StatsConfig,
    /// Task types this dispatcher drains, by name
    pub tasks: HashMap<String, TaskConfig>,
}

/// Per-type task configuration after folding.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Second part of the Redis list names; identifies the task type
    pub task_type: String,
    /// Absolute path of the script to execute (empty: webhook only)
    pub script: String,
    pub webhook: WebhookConfig,
    /// Hard cap on concurrently running tasks of this type
    pub workers: usize,
    /// Webhook request timeout, seconds
    pub http_timeout: u64,
    /// TTL of the failed-task list, seconds; 0 disables persistence
    pub failed_tasks_ttl: u64,
    /// Error backoff for this type
    pub backoff_enabled: bool,
    pub backoff_min: u64,
    pub backoff_max: u64,
    pub backoff_factor: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl WebhookConfig {
    pub fn is_set(&self) -> bool {
        !self.url.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsConfig {
    /// Interface the stats HTTP endpoint listens on (empty: disabled)
    #[serde(default)]
    pub interface: String,
    /// Path the endpoint responds on
    #[serde(default)]
    pub pattern: String,
}

impl StatsConfig {
    pub fn is_set(&self) -> bool {
        !self.interface.is_empty()
    }
}

/// Only GET and POST are accepted, both for configured webhook methods and
/// for per-task `:method` overrides.
pub fn is_valid_webhook_method(method: &str) -> bool {
    method == "GET" || method == "POST"
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed reading configuration file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed parsing configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),

    #[error("task \"{0}\": {1}")]
    Task(String, String),
}

// Raw mirror of the TOML file, before folding.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    redis_network: String,
    #[serde(default)]
    redis_address: String,
    #[serde(default)]
    queue_key: String,
    #[serde(default)]
    error_script: String,
    #[serde(default)]
    temp_dir: String,
    #[serde(default)]
    logfile: String,
    #[serde(default)]
    interval_min: u64,
    #[serde(default)]
    interval_max: u64,
    #[serde(default)]
    interval_factor: f64,
    #[serde(default)]
    failed_tasks_ttl: u64,
    #[serde(default)]
    backoff_enabled: bool,
    #[serde(default)]
    backoff_min: u64,
    #[serde(default)]
    backoff_max: u64,
    #[serde(default)]
    backoff_factor: f64,
    #[serde(default)]
    stats: StatsConfig,
    #[serde(default)]
    tasks: HashMap<String, RawTask>,
}

#[derive(Deserialize)]
struct RawTask {
    #[serde(default)]
    script: String,
    #[serde(default)]
    webhook: WebhookConfig,
    #[serde(default)]
    workers: usize,
    #[serde(default)]
    http_timeout: u64,
    #[serde(default)]
    failed_tasks_ttl: u64,
    #[serde(default)]
    backoff_enabled: Option<bool>,
    #[serde(default)]
    backoff_min: u64,
    #[serde(default)]
    backoff_max: u64,
    #[serde(default)]
    backoff_factor: f64,
}

impl Config {
    /// Load and validate the configuration file at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;
        fold(raw)
    }
}

fn fold(raw: RawConfig) -> Result<Config, ConfigError> {
    if raw.redis_address.is_empty() {
        return Err(ConfigError::Invalid("redis_address must be set".into()));
    }
    if raw.queue_key.is_empty() {
        return Err(ConfigError::Invalid("queue_key must be set".into()));
    }

    let globals = Globals {
        failed_tasks_ttl: raw.failed_tasks_ttl,
        backoff_enabled: raw.backoff_enabled,
        backoff_min: raw.backoff_min,
        backoff_max: raw.backoff_max,
        backoff_factor: raw.backoff_factor,
    };

    let redis_network = if raw.redis_network.is_empty() {
        "tcp".to_string()
    } else {
        raw.redis_network
    };

    let mut interval_min = match raw.interval_min {
        0 => DEFAULT_INTERVAL_MIN_MS,
        ms => ms,
    };
    if interval_min < 50 {
        interval_min = 50;
    }
    let mut interval_max = match raw.interval_max {
        0 => DEFAULT_INTERVAL_MAX_MS,
        ms => ms,
    };
    if interval_max < interval_min {
        interval_max = 2 * interval_min;
    }
    let interval_factor = if raw.interval_factor < 1.0 {
        DEFAULT_INTERVAL_FACTOR
    } else {
        raw.interval_factor
    };

    let mut stats = raw.stats;
    if stats.pattern.is_empty() {
        stats.pattern = "/".to_string();
    }
    if !stats.pattern.starts_with('/') {
        return Err(ConfigError::Invalid(format!(
            "stats pattern \"{}\" must start with a slash",
            stats.pattern
        )));
    }

    let mut tasks = HashMap::with_capacity(raw.tasks.len());
    for (task_type, task) in raw.tasks {
        let folded = fold_task(&task_type, task, &globals)?;
        tasks.insert(task_type, folded);
    }

    Ok(Config {
        redis_network,
        redis_address: raw.redis_address,
        queue_key: raw.queue_key,
        error_script: resolve(&raw.error_script),
        temp_dir: resolve(&raw.temp_dir),
        logfile: resolve(&raw.logfile),
        interval_min,
        interval_max,
        interval_factor,
        failed_tasks_ttl: raw.failed_tasks_ttl,
        backoff_enabled: raw.backoff_enabled,
        backoff_min: raw.backoff_min,
        backoff_max: raw.backoff_max,
        backoff_factor: raw.backoff_factor,
        stats,
        tasks,
    })
}

// The global values a task inherits when it leaves them unset.
struct Globals {
    failed_tasks_ttl: u64,
    backoff_enabled: bool,
    backoff_min: u64,
    backoff_max: u64,
    backoff_factor: f64,
}

fn fold_task(task_type: &str, raw: RawTask, globals: &Globals) -> Result<TaskConfig, ConfigError> {
    let script = if raw.script.is_empty() {
        String::new()
    } else {
        basepath::with(&raw.script)
    };

    let mut webhook = raw.webhook;
    if webhook.is_set() {
        webhook.method = if webhook.method.is_empty() {
            "GET".to_string()
        } else {
            webhook.method.to_uppercase()
        };
        if !is_valid_webhook_method(&webhook.method) {
            return Err(ConfigError::Task(
                task_type.to_string(),
                format!("invalid webhook method \"{}\"", webhook.method),
            ));
        }
    }

    if script.is_empty() && !webhook.is_set() {
        return Err(ConfigError::Task(
            task_type.to_string(),
            "needs a script or a webhook url".to_string(),
        ));
    }

    let workers = raw.workers.max(1);

    let http_timeout = match raw.http_timeout {
        0 => DEFAULT_HTTP_TIMEOUT_SECS,
        secs => secs,
    };

    let failed_tasks_ttl = match raw.failed_tasks_ttl {
        0 => globals.failed_tasks_ttl,
        ttl => ttl,
    };

    let backoff_enabled = raw.backoff_enabled.unwrap_or(globals.backoff_enabled);

    let mut backoff_min = match raw.backoff_min {
        0 => globals.backoff_min,
        ms => ms,
    };
    let mut backoff_max = match raw.backoff_max {
        0 => globals.backoff_max,
        ms => ms,
    };
    let mut backoff_factor = match raw.backoff_factor {
        f if f == 0.0 => globals.backoff_factor,
        f => f,
    };

    // floors for the error backoff, as documented in the example config
    if backoff_min < 100 {
        backoff_min = 100;
    }
    if backoff_max < backoff_min {
        backoff_max = 2 * backoff_min;
    }
    if backoff_factor < 2.0 {
        backoff_factor = 2.0;
    }

    Ok(TaskConfig {
        task_type: task_type.to_string(),
        script,
        webhook,
        workers,
        http_timeout,
        failed_tasks_ttl,
        backoff_enabled,
        backoff_min,
        backoff_max,
        backoff_factor,
    })
}

fn resolve(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        basepath::with(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        redis_address = "127.0.0.1:6379"
        queue_key = "gordon"

        [tasks.example]
        script = "/bin/true"
    "#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = Config::parse(MINIMAL).unwrap();

        assert_eq!(config.redis_network, "tcp");
        assert_eq!(config.interval_min, 100);
        assert_eq!(config.interval_max, 2000);
        assert_eq!(config.interval_factor, 2.0);
        assert_eq!(config.stats.pattern, "/");
        assert!(!config.stats.is_set());

        let task = &config.tasks["example"];
        assert_eq!(task.task_type, "example");
        assert_eq!(task.script, "/bin/true");
        assert_eq!(task.workers, 1);
        assert_eq!(task.http_timeout, 30);
        assert!(!task.backoff_enabled);
    }

    #[test]
    fn tasks_inherit_global_settings() {
        let config = Config::parse(
            r#"
            redis_address = "127.0.0.1:6379"
            queue_key = "gordon"
            failed_tasks_ttl = 3600
            backoff_enabled = true
            backoff_min = 500
            backoff_max = 10000
            backoff_factor = 3.0

            [tasks.inheriting]
            script = "/bin/true"

            [tasks.overriding]
            script = "/bin/true"
            failed_tasks_ttl = 60
            backoff_enabled = false
            backoff_min = 200
        "#,
        )
        .unwrap();

        let inheriting = &config.tasks["inheriting"];
        assert_eq!(inheriting.failed_tasks_ttl, 3600);
        assert!(inheriting.backoff_enabled);
        assert_eq!(inheriting.backoff_min, 500);
        assert_eq!(inheriting.backoff_max, 10000);
        assert_eq!(inheriting.backoff_factor, 3.0);

        let overriding = &config.tasks["overriding"];
        assert_eq!(overriding.failed_tasks_ttl, 60);
        assert!(!overriding.backoff_enabled);
        assert_eq!(overriding.backoff_min, 200);
        assert_eq!(overriding.backoff_max, 10000);
    }

    #[test]
    fn clamps_backoff_values() {
        let config = Config::parse(
            r#"
            redis_address = "127.0.0.1:6379"
            queue_key = "gordon"

            [tasks.example]
            script = "/bin/true"
            backoff_min = 10
            backoff_max = 5
            backoff_factor = 1.1
        "#,
        )
        .unwrap();

        let task = &config.tasks["example"];
        assert_eq!(task.backoff_min, 100);
        assert_eq!(task.backoff_max, 200);
        assert_eq!(task.backoff_factor, 2.0);
    }

    #[test]
    fn clamps_interval_values() {
        let config = Config::parse(
            r#"
            redis_address = "127.0.0.1:6379"
            queue_key = "gordon"
            interval_min = 10
            interval_max = 20
            interval_factor = 0.5

            [tasks.example]
            script = "/bin/true"
        "#,
        )
        .unwrap();

        assert_eq!(config.interval_min, 50);
        assert_eq!(config.interval_max, 2000);
        assert_eq!(config.interval_factor, 2.0);
    }

    #[test]
    fn rejects_task_without_script_or_webhook() {
        let err = Config::parse(
            r#"
            redis_address = "127.0.0.1:6379"
            queue_key = "gordon"

            [tasks.broken]
            workers = 2
        "#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::Task(ref name, _) if name == "broken"));
    }

    #[test]
    fn rejects_invalid_webhook_method() {
        let err = Config::parse(
            r#"
            redis_address = "127.0.0.1:6379"
            queue_key = "gordon"

            [tasks.hook]
            [tasks.hook.webhook]
            url = "http://localhost/hook"
            method = "DELETE"
        "#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::Task(ref name, _) if name == "hook"));
    }

    #[test]
    fn webhook_method_defaults_to_get_and_uppercases() {
        let config = Config::parse(
            r#"
            redis_address = "127.0.0.1:6379"
            queue_key = "gordon"

            [tasks.defaulted]
            [tasks.defaulted.webhook]
            url = "http://localhost/hook"

            [tasks.lowercase]
            [tasks.lowercase.webhook]
            url = "http://localhost/hook"
            method = "post"
        "#,
        )
        .unwrap();

        assert_eq!(config.tasks["defaulted"].webhook.method, "GET");
        assert_eq!(config.tasks["lowercase"].webhook.method, "POST");
    }

    #[test]
    fn rejects_missing_redis_address() {
        let err = Config::parse("queue_key = \"gordon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn webhook_headers_are_parsed() {
        let config = Config::parse(
            r#"
            redis_address = "127.0.0.1:6379"
            queue_key = "gordon"

            [tasks.hook]
            [tasks.hook.webhook]
            url = "http://localhost/hook"
            method = "POST"
            [tasks.hook.webhook.headers]
            x_api_key = "secret"
        "#,
        )
        .unwrap();

        let webhook = &config.tasks["hook"].webhook;
        assert_eq!(webhook.headers["x_api_key"], "secret");
    }
}
