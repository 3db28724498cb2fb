use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a task.
///
/// Wrapper around a UUID string by default, but callers may force their own id
/// (e.g. to pre-register a single-flight lock under it before dispatch).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Keyword arguments handed to a task body.
pub type TaskParams = serde_json::Map<String, serde_json::Value>;

/// Lifecycle state of a task, shared by both execution backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Accepted but not yet picked up.
    Pending,
    /// A worker or thread is executing the body.
    Running,
    /// Body returned a value.
    Success,
    /// Body returned an error or panicked.
    Failed,
    /// Cancelled before or during execution.
    Revoked,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Revoked
        )
    }

    /// Statuses only move forward; a terminal status never changes again.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => next != TaskStatus::Pending,
            TaskStatus::Running => next.is_terminal(),
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Revoked => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Revoked => "REVOKED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" | "STARTED" => Ok(TaskStatus::Running),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILED" | "FAILURE" => Ok(TaskStatus::Failed),
            "REVOKED" => Ok(TaskStatus::Revoked),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Structured payload produced by a task body.
///
/// A successful outcome carries `result` and no `errors`; a failed one carries
/// a `message`, an `errors` map, or both. `result` may still be set on failure
/// to echo back what was being processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome<T> {
    pub success: bool,
    pub message: Option<String>,
    pub result: Option<T>,
    pub errors: Option<BTreeMap<String, String>>,
}

impl<T> TaskOutcome<T> {
    pub fn succeeded(result: T) -> Self {
        Self {
            success: true,
            message: None,
            result: Some(result),
            errors: None,
        }
    }

    pub fn succeeded_with_message(result: T, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::succeeded(result)
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            result: None,
            errors: None,
        }
    }

    /// Failure with a message and a machine-checkable error map.
    pub fn rejected(message: impl Into<String>, errors: BTreeMap<String, String>) -> Self {
        Self {
            errors: Some(errors),
            ..Self::failed(message)
        }
    }

    /// Attaches the input being processed to a failed outcome.
    pub fn with_result(mut self, result: T) -> Self {
        self.result = Some(result);
        self
    }

    pub fn is_consistent(&self) -> bool {
        let has_errors = self.errors.as_ref().is_some_and(|e| !e.is_empty());
        if self.success {
            self.result.is_some() && !has_errors
        } else {
            self.message.is_some() || has_errors
        }
    }
}

impl<T: Serialize> TaskOutcome<T> {
    pub fn into_value(self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
