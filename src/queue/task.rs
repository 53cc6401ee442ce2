use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// A task as it is enqueued in a Redis list.
///
/// `args` are passed positionally to the script or appended to the webhook
/// URL; `env` becomes environment variables for the script, or parameters,
/// body and headers for the webhook. `error_message` is only ever written by
/// the dispatcher itself when persisting a failed task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub error_message: String,
}

impl Task {
    /// Decode a queue entry. Empty input counts as `{}`; missing fields and
    /// unknown fields are tolerated. A former `error_message` is cleared.
    pub fn decode(payload: &str) -> AppResult<Self> {
        let payload = if payload.is_empty() { "{}" } else { payload };

        let mut task: Task = serde_json::from_str(payload)?;
        task.error_message.clear();

        Ok(task)
    }

    /// JSON encoding used for failed-task persistence.
    pub fn encode(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
