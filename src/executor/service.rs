//! Async Task Service
//!
//! The uniform contract request handlers use to run background work, whatever
//! executes it. Both execution backends implement [`AsyncTaskService`]; the
//! closed sum types below ([`TaskBackend`], [`TaskExecutor`], [`TaskResult`])
//! let callers hold either without boxing.
//!
//! ## Flow
//! 1. `get_executor(description, id_generator, params)` binds a registered task.
//! 2. `executor.start(expires)` dispatches it and returns a [`TaskResult`].
//! 3. The result is polled (`status`, `get`) or cancelled (`revoke`).

use super::distributed::{QueueTaskExecutor, QueueTaskResult, QueueTaskService};
use super::error::TaskError;
use super::protocol::{TaskSubmission, TaskSummary};
use super::registry::TaskDescription;
use super::thread::{ThreadTaskExecutor, ThreadTaskResult, ThreadTaskService};
use super::types::*;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Produces the id of the next dispatched task.
#[derive(Clone, Default)]
pub enum IdGenerator {
    /// Random UUID v4.
    #[default]
    Random,
    /// Always the given id. Used when a lock must be registered before dispatch.
    Fixed(TaskId),
    Custom(Arc<dyn Fn() -> String + Send + Sync>),
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => f.write_str("IdGenerator::Random"),
            Self::Fixed(id) => write!(f, "IdGenerator::Fixed({id})"),
            Self::Custom(_) => f.write_str("IdGenerator::Custom(..)"),
        }
    }
}

impl IdGenerator {
    pub fn random() -> Self {
        Self::Random
    }

    pub fn fixed(task_id: impl Into<TaskId>) -> Self {
        Self::Fixed(task_id.into())
    }

    pub fn from_fn(f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    pub fn generate(&self) -> Result<TaskId, TaskError> {
        let task_id = match self {
            Self::Random => TaskId::new(),
            Self::Fixed(task_id) => task_id.clone(),
            Self::Custom(f) => TaskId(f()),
        };

        if task_id.as_str().trim().is_empty() {
            return Err(TaskError::InvalidTaskId);
        }
        Ok(task_id)
    }
}

/// Contract shared by the distributed queue and the in-process thread backends.
#[async_trait]
pub trait AsyncTaskService: Send + Sync {
    /// The app whose registry subset this service may execute.
    fn app_name(&self) -> &str;

    /// Binds a registered task to its params. Fails with `NotRegistered` when
    /// the task is not part of this service's app.
    fn get_executor(
        &self,
        task: &TaskDescription,
        id_generator: Option<IdGenerator>,
        params: TaskParams,
    ) -> Result<TaskExecutor, TaskError>;

    async fn get_result(&self, task_id: &str) -> Result<TaskResult, TaskError>;
}

/// The backend selected once at startup.
pub enum TaskBackend {
    Queue(QueueTaskService),
    Thread(ThreadTaskService),
}

impl TaskBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Queue(_) => "queue",
            Self::Thread(_) => "thread",
        }
    }
}

#[async_trait]
impl AsyncTaskService for TaskBackend {
    fn app_name(&self) -> &str {
        match self {
            Self::Queue(service) => service.app_name(),
            Self::Thread(service) => service.app_name(),
        }
    }

    fn get_executor(
        &self,
        task: &TaskDescription,
        id_generator: Option<IdGenerator>,
        params: TaskParams,
    ) -> Result<TaskExecutor, TaskError> {
        match self {
            Self::Queue(service) => service.get_executor(task, id_generator, params),
            Self::Thread(service) => service.get_executor(task, id_generator, params),
        }
    }

    async fn get_result(&self, task_id: &str) -> Result<TaskResult, TaskError> {
        match self {
            Self::Queue(service) => service.get_result(task_id).await,
            Self::Thread(service) => service.get_result(task_id).await,
        }
    }
}

/// A task bound to its params, ready to be started once.
#[derive(Debug)]
pub enum TaskExecutor {
    Queue(QueueTaskExecutor),
    Thread(ThreadTaskExecutor),
}

impl TaskExecutor {
    pub fn task_name(&self) -> &str {
        match self {
            Self::Queue(executor) => executor.task_name(),
            Self::Thread(executor) => executor.task_name(),
        }
    }

    /// Dispatches the task. `expires` bounds how long the task may wait
    /// before a worker picks it up; the thread backend starts immediately and
    /// ignores it.
    pub async fn start(self, expires: Option<Duration>) -> Result<TaskResult, TaskError> {
        match self {
            Self::Queue(executor) => executor.start(expires).await,
            Self::Thread(executor) => executor.start(),
        }
    }
}

/// Handle to a started task.
#[derive(Debug, Clone)]
pub enum TaskResult {
    Queue(QueueTaskResult),
    Thread(ThreadTaskResult),
}

impl TaskResult {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Queue(result) => result.task_id(),
            Self::Thread(result) => result.task_id(),
        }
    }

    pub async fn status(&self) -> Result<TaskStatus, TaskError> {
        match self {
            Self::Queue(result) => result.status().await,
            Self::Thread(result) => Ok(result.status()),
        }
    }

    pub async fn is_ready(&self) -> Result<bool, TaskError> {
        Ok(self.status().await?.is_terminal())
    }

    pub async fn is_successful(&self) -> Result<bool, TaskError> {
        Ok(self.status().await? == TaskStatus::Success)
    }

    /// Waits for the task to finish and returns its value.
    ///
    /// `None` waits forever. A timeout leaves the task running.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<serde_json::Value, TaskError> {
        match self {
            Self::Queue(result) => result.get(timeout).await,
            Self::Thread(result) => result.get(timeout).await,
        }
    }

    /// Like [`TaskResult::get`], decoded into a [`TaskOutcome`]. Never fails:
    /// errors become a failed outcome with an `errors` map.
    pub async fn outcome<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> TaskOutcome<T> {
        match self.get(timeout).await {
            Ok(value) => decode_outcome(value),
            Err(e) => e.to_outcome(),
        }
    }

    pub async fn revoke(&self, terminate: bool) -> Result<(), TaskError> {
        match self {
            Self::Queue(result) => result.revoke(terminate).await,
            Self::Thread(result) => {
                result.revoke(terminate);
                Ok(())
            }
        }
    }

    pub async fn submission(&self) -> Result<TaskSubmission, TaskError> {
        Ok(TaskSubmission {
            task_id: self.task_id().to_string(),
            task_status: self.status().await?,
        })
    }

    pub async fn summary(&self) -> Result<TaskSummary, TaskError> {
        match self {
            Self::Queue(result) => result.summary().await,
            Self::Thread(result) => Ok(result.summary()),
        }
    }
}

/// Bodies usually return a serialized `TaskOutcome`; anything else is treated
/// as a bare successful result.
fn decode_outcome<T: DeserializeOwned>(value: serde_json::Value) -> TaskOutcome<T> {
    if let Ok(outcome) = serde_json::from_value::<TaskOutcome<T>>(value.clone()) {
        return outcome;
    }
    match serde_json::from_value::<T>(value) {
        Ok(result) => TaskOutcome::succeeded(result),
        Err(e) => TaskOutcome::failed(format!("unexpected task result: {e}")),
    }
}

/// Shared text for status views.
pub(crate) fn summary_message(status: TaskStatus, error: Option<&str>) -> String {
    match status {
        TaskStatus::Pending => "Task is waiting to be executed".to_string(),
        TaskStatus::Running => "Task is running".to_string(),
        TaskStatus::Success => "Task completed successfully".to_string(),
        TaskStatus::Failed => error.unwrap_or("Task failed").to_string(),
        TaskStatus::Revoked => "Task was revoked".to_string(),
    }
}
