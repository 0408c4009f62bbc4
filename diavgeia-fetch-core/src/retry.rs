//! Retry policy for transient network failures and the dead-letter log that
//! receives decisions once the policy gives up on them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::decision::Decision;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Exponential backoff: `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "crate::config::duration_secs")]
    pub base_delay: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Whether an item that just failed its `attempt`-th try may run again.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Wait before the attempt following `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Serialize)]
struct DeadLetter<'a> {
    ada: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    attempts: u32,
    error: &'a str,
    recorded_at: String,
    decision: &'a Map<String, Value>,
}

/// Append-only JSON-lines log of decisions that exhausted their retries.
pub struct DeadLetterLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DeadLetterLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records the decision with its full record so it can be replayed. The
    /// entry is flushed before returning. Failing to write the log is itself
    /// only logged.
    pub async fn record(&self, decision: &Decision, attempts: u32, cause: &str) {
        let ada = decision.ada();
        error!(
            target: "dead_letter",
            ada,
            attempts,
            error = cause,
            "Giving up on decision after repeated transient failures"
        );
        let entry = DeadLetter {
            ada,
            url: decision.raw().get("url").and_then(Value::as_str),
            attempts,
            error: cause,
            recorded_at: Utc::now().to_rfc3339(),
            decision: decision.raw(),
        };
        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = ?e, ada, "Failed to serialise dead letter entry");
                return;
            }
        };
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(error = ?e, path = %parent.display(), "Failed to create dead letter directory");
                return;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await;
        let result = match file {
            Ok(mut file) => match file.write_all(&line).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = ?e, path = %self.path.display(), "Failed to append dead letter entry");
        }
    }
}
