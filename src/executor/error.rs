//! Error taxonomy of the task subsystem.

use super::types::TaskOutcome;
use crate::storage::cache::CacheError;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    /// Task name absent from the bound app's registry subset. A caller bug.
    #[error("task {task_name} is not registered for app '{app_name}'")]
    NotRegistered { app_name: String, task_name: String },

    #[error("task not found: {task_id}")]
    NotFound { task_id: String },

    /// Polling exceeded its budget. The task keeps running.
    #[error("task {task_id} is still running after {waited:?}")]
    Timeout { task_id: String, waited: Duration },

    /// The body raised during execution; `message` is the captured error text.
    #[error("task {task_id} failed: {message}")]
    RemoteFailure { task_id: String, message: String },

    #[error("task {task_id} was revoked")]
    Revoked { task_id: String },

    /// Single-flight lock hit; `task_id` is the task already in flight.
    #[error("task id {task_id} already exists for {resource_key}")]
    DuplicateSubmission {
        resource_key: String,
        task_id: String,
    },

    #[error("task registry is sealed, cannot register {task_name}")]
    RegistrySealed { task_name: String },

    #[error("task id must not be empty")]
    InvalidTaskId,

    #[error("failed to start task {task_name}: {message}")]
    StartFailure { task_name: String, message: String },

    #[error("broker error: {0}")]
    Broker(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl TaskError {
    /// Short machine-readable identifier, used as the key in outcome error maps.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotRegistered { .. } => "not_registered",
            Self::NotFound { .. } => "not_found",
            Self::Timeout { .. } => "timeout",
            Self::RemoteFailure { .. } => "remote_failure",
            Self::Revoked { .. } => "revoked",
            Self::DuplicateSubmission { .. } => "duplicate_submission",
            Self::RegistrySealed { .. } => "registry_sealed",
            Self::InvalidTaskId => "invalid_task_id",
            Self::StartFailure { .. } => "start_failure",
            Self::Broker(_) => "broker",
            Self::Cache(_) => "cache",
        }
    }

    /// HTTP-equivalent status for handlers surfacing this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidTaskId => 400,
            Self::NotFound { .. } => 404,
            Self::Revoked { .. } => 410,
            Self::DuplicateSubmission { .. } => 425,
            Self::Timeout { .. } => 504,
            Self::Broker(_) | Self::Cache(_) => 503,
            Self::NotRegistered { .. }
            | Self::RemoteFailure { .. }
            | Self::RegistrySealed { .. }
            | Self::StartFailure { .. } => 500,
        }
    }

    /// Whether the same call may succeed if simply repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Broker(_) | Self::Cache(_))
    }

    pub fn to_outcome<T>(&self) -> TaskOutcome<T> {
        let message = self.to_string();
        let mut errors = BTreeMap::new();
        errors.insert(self.kind().to_string(), message.clone());
        TaskOutcome::rejected(message, errors)
    }
}
