//! Task execution: webhook dispatch and script invocation.
//!
//! A task runs its webhook first (when configured); only a successful
//! webhook is followed by the script. The webhook contract is body-based:
//! an empty response body means success, any returned text is the failure
//! message. Scripts follow the same convention on stdout, in addition to
//! their exit status.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Request};

use crate::config::{is_valid_webhook_method, TaskConfig};
use crate::error::{AppError, AppResult};
use crate::queue::Task;

// Special keys inside a task's `env`
const ENV_HEADER_PREFIX: &str = ":header:";
const ENV_JSON_KEY: &str = ":json";
const ENV_METHOD_KEY: &str = ":method";

/// Executes tasks. Holds one HTTP client per task type, carrying that
/// type's request timeout.
pub struct Executor {
    clients: HashMap<String, Client>,
}

impl Executor {
    pub fn new(tasks: &HashMap<String, TaskConfig>) -> AppResult<Self> {
        let mut clients = HashMap::with_capacity(tasks.len());

        for (task_type, task) in tasks {
            let client = Client::builder()
                .timeout(Duration::from_secs(task.http_timeout))
                .build()?;
            clients.insert(task_type.clone(), client);
        }

        Ok(Self { clients })
    }

    /// Run `task` according to its type configuration. A webhook failure
    /// skips the script and is returned as the task's failure.
    pub async fn run(&self, task: &Task, ct: &TaskConfig) -> AppResult<()> {
        if ct.webhook.is_set() {
            self.send_webhook(task, ct).await?;
        }

        if !ct.script.is_empty() {
            run_script(&ct.script, task).await?;
        }

        Ok(())
    }

    async fn send_webhook(&self, task: &Task, ct: &TaskConfig) -> AppResult<()> {
        let request = self.build_webhook_request(task, ct)?;
        let client = self.client(&ct.task_type)?;

        let response = client.execute(request).await?;
        let body = response.text().await?;

        if !body.is_empty() {
            return Err(AppError::Execution(body));
        }

        Ok(())
    }

    fn client(&self, task_type: &str) -> AppResult<&Client> {
        self.clients.get(task_type).ok_or_else(|| {
            AppError::Execution(format!("no http client for task type \"{task_type}\""))
        })
    }

    fn build_webhook_request(&self, task: &Task, ct: &TaskConfig) -> AppResult<Request> {
        let url = build_url(&ct.webhook.url, &task.args);
        let method = effective_method(&ct.webhook.method, task.env.get(ENV_METHOD_KEY));

        let mut headers = HeaderMap::new();
        for (key, value) in &ct.webhook.headers {
            insert_header(&mut headers, key, value)?;
        }

        // split env into additional headers and request parameters
        let mut params: Vec<(&str, &str)> = Vec::new();
        for (key, value) in &task.env {
            if key == ENV_JSON_KEY || key == ENV_METHOD_KEY {
                continue;
            }

            match key.strip_prefix(ENV_HEADER_PREFIX) {
                Some(header) => insert_header(&mut headers, header, value)?,
                None => params.push((key, value)),
            }
        }

        let client = self.client(&ct.task_type)?;
        let json_body = task.env.get(ENV_JSON_KEY).filter(|body| !body.is_empty());

        let builder = if method == Method::GET {
            client.get(&url).query(&params)
        } else if let Some(body) = json_body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            client.post(&url).body(body.clone())
        } else {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
            client.post(&url).form(&params)
        };

        Ok(builder.headers(headers).build()?)
    }
}

/// The webhook URL with the task's args appended as path segments.
fn build_url(base: &str, args: &[String]) -> String {
    let joined = args.join("/");
    let url = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        joined.trim_start_matches('/')
    );

    url.trim_end_matches('/').to_string()
}

/// The configured method, unless the task carries a valid `:method`
/// override.
fn effective_method(configured: &str, requested: Option<&String>) -> Method {
    if let Some(requested) = requested {
        let requested = requested.to_uppercase();
        if is_valid_webhook_method(&requested) {
            return to_method(&requested);
        }
    }

    to_method(configured)
}

fn to_method(method: &str) -> Method {
    if method == "POST" {
        Method::POST
    } else {
        Method::GET
    }
}

fn insert_header(headers: &mut HeaderMap, key: &str, value: &str) -> AppResult<()> {
    let name = HeaderName::from_bytes(canonical_header(key).as_bytes())
        .map_err(|err| AppError::Execution(format!("invalid header name \"{key}\": {err}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|err| AppError::Execution(format!("invalid header value for \"{key}\": {err}")))?;

    headers.insert(name, value);
    Ok(())
}

/// Canonicalize a header key: `_` becomes `-`, segments are HTTP
/// title-cased (`content_type` -> `Content-Type`).
pub fn canonical_header(key: &str) -> String {
    key.replace('_', "-")
        .split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Invoke `script` with the task's args and env. The child runs in its own
/// process group so signals sent to the dispatcher do not reach it. A
/// non-zero exit or any stdout output is a failure.
pub async fn run_script(script: &str, task: &Task) -> AppResult<()> {
    let mut command = tokio::process::Command::new(script);
    command.args(&task.args).envs(&task.env);

    #[cfg(unix)]
    command.process_group(0);

    let output = command
        .output()
        .await
        .map_err(|err| AppError::Execution(format!("failed to run {script}: {err}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        if !stdout.is_empty() {
            return Err(AppError::Execution(stdout.into_owned()));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.is_empty() {
            format!("{script} exited with {}", output.status)
        } else {
            format!("{script} exited with {}: {}", output.status, stderr.trim())
        };
        return Err(AppError::Execution(message));
    }

    if !stdout.is_empty() {
        return Err(AppError::Execution(stdout.into_owned()));
    }

    Ok(())
}
