//! In-Process Thread Executor
//!
//! Runs each task on its own named OS thread driving a private current-thread
//! runtime. Results live in a table shared by the service, keyed by task id.
//!
//! The table entry is inserted before the thread is spawned, so the id
//! returned to the caller always resolves. Cancellation is cooperative: a
//! terminating revoke cancels the body's token and the body is dropped at its
//! next await point. A body blocked in synchronous code runs to completion.

use super::error::TaskError;
use super::protocol::{REQUEST_CONTEXT_KEY, TaskSummary};
use super::registry::{ExecutionOutcome, TaskDescription, TaskInvocation, TaskRegistry};
use super::service::{AsyncTaskService, IdGenerator, TaskExecutor, TaskResult, summary_message};
use super::types::*;
use crate::context::RequestTracker;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

type ResultTable = DashMap<String, ThreadTaskResult>;

pub struct ThreadTaskService {
    app_name: String,
    registry: Arc<TaskRegistry>,
    results: Arc<ResultTable>,
}

impl ThreadTaskService {
    pub fn new(app_name: &str, registry: Arc<TaskRegistry>) -> Self {
        tracing::info!(
            "Thread task service for app '{}' serves {} tasks",
            app_name,
            registry.tasks_for(app_name).len()
        );

        Self {
            app_name: app_name.to_string(),
            registry,
            results: Arc::new(DashMap::new()),
        }
    }

    /// Number of tasks currently tracked.
    pub fn tracked(&self) -> usize {
        self.results.len()
    }
}

#[async_trait]
impl AsyncTaskService for ThreadTaskService {
    fn app_name(&self) -> &str {
        &self.app_name
    }

    fn get_executor(
        &self,
        task: &TaskDescription,
        id_generator: Option<IdGenerator>,
        params: TaskParams,
    ) -> Result<TaskExecutor, TaskError> {
        let description = self.registry.lookup(&self.app_name, task.task_name())?;

        Ok(TaskExecutor::Thread(ThreadTaskExecutor {
            description,
            id_generator: id_generator.unwrap_or_default(),
            params,
            results: self.results.clone(),
        }))
    }

    async fn get_result(&self, task_id: &str) -> Result<TaskResult, TaskError> {
        if task_id.trim().is_empty() {
            return Err(TaskError::InvalidTaskId);
        }

        self.results
            .get(task_id)
            .map(|entry| TaskResult::Thread(entry.value().clone()))
            .ok_or_else(|| TaskError::NotFound {
                task_id: task_id.to_string(),
            })
    }
}

pub struct ThreadTaskExecutor {
    description: TaskDescription,
    id_generator: IdGenerator,
    params: TaskParams,
    results: Arc<ResultTable>,
}

impl fmt::Debug for ThreadTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadTaskExecutor")
            .field("task_name", &self.description.task_name())
            .field("id_generator", &self.id_generator)
            .finish_non_exhaustive()
    }
}

impl ThreadTaskExecutor {
    pub fn task_name(&self) -> &str {
        self.description.task_name()
    }

    /// Registers the placeholder, then spawns the thread. Returns once the
    /// thread is running (or failed to spawn, in which case the task is
    /// already `FAILED`).
    pub fn start(self) -> Result<TaskResult, TaskError> {
        let task_id = self.id_generator.generate()?;

        let mut params = self.params;
        let context_value = serde_json::to_value(RequestTracker::current()).map_err(|e| {
            TaskError::StartFailure {
                task_name: self.description.task_name().to_string(),
                message: e.to_string(),
            }
        })?;
        params.insert(REQUEST_CONTEXT_KEY.to_string(), context_value);

        let result = ThreadTaskResult::new(task_id.clone(), Arc::downgrade(&self.results));
        self.results.insert(task_id.to_string(), result.clone());
        result.transition(TaskStatus::Running, None, None);

        let invocation =
            TaskInvocation::from_params(task_id.clone(), params, result.cancellation());
        let description = self.description;
        let worker = result.clone();
        let thread_name = format!("task-{}", task_id);

        let spawned = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        worker.finish(ExecutionOutcome::Failed(format!(
                            "failed to build task runtime: {e}"
                        )));
                        return;
                    }
                };
                let outcome = runtime.block_on(description.run(invocation));
                worker.finish(outcome);
            });

        match spawned {
            Ok(_) => tracing::info!("Task {} started on thread {}", task_id, thread_name),
            Err(e) => {
                tracing::error!("Failed to spawn thread for task {}: {}", task_id, e);
                result.finish(ExecutionOutcome::Failed(format!(
                    "failed to spawn task thread: {e}"
                )));
            }
        }

        Ok(TaskResult::Thread(result))
    }
}

#[derive(Debug)]
struct ResultState {
    status: TaskStatus,
    value: Option<serde_json::Value>,
    error: Option<String>,
}

struct ThreadTaskShared {
    task_id: TaskId,
    state: Mutex<ResultState>,
    done: watch::Sender<bool>,
    cancellation: CancellationToken,
    table: Weak<ResultTable>,
}

/// Shared handle to one thread-executed task. Stays usable after the task
/// was removed from the service's table.
#[derive(Clone)]
pub struct ThreadTaskResult {
    shared: Arc<ThreadTaskShared>,
}

impl fmt::Debug for ThreadTaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadTaskResult")
            .field("task_id", &self.shared.task_id)
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

impl ThreadTaskResult {
    fn new(task_id: TaskId, table: Weak<ResultTable>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            shared: Arc::new(ThreadTaskShared {
                task_id,
                state: Mutex::new(ResultState {
                    status: TaskStatus::Pending,
                    value: None,
                    error: None,
                }),
                done,
                cancellation: CancellationToken::new(),
                table,
            }),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.shared.task_id
    }

    pub fn status(&self) -> TaskStatus {
        self.shared.state.lock().status
    }

    fn cancellation(&self) -> CancellationToken {
        self.shared.cancellation.clone()
    }

    /// Applies a forward-only status change. Returns whether it was applied.
    fn transition(
        &self,
        status: TaskStatus,
        value: Option<serde_json::Value>,
        error: Option<String>,
    ) -> bool {
        let mut state = self.shared.state.lock();
        if !state.status.can_transition_to(status) {
            return false;
        }
        state.status = status;
        state.value = value;
        state.error = error;
        drop(state);

        if status.is_terminal() {
            self.shared.done.send_replace(true);
        }
        true
    }

    fn finish(&self, outcome: ExecutionOutcome) {
        let applied = match outcome {
            ExecutionOutcome::Completed(value) => {
                self.transition(TaskStatus::Success, Some(value), None)
            }
            ExecutionOutcome::Failed(message) => {
                self.transition(TaskStatus::Failed, None, Some(message))
            }
            ExecutionOutcome::Cancelled => self.transition(
                TaskStatus::Revoked,
                None,
                Some("task was terminated".to_string()),
            ),
        };

        if !applied {
            tracing::debug!(
                "Task {} finished after it was already {}",
                self.shared.task_id,
                self.status()
            );
        }
    }

    pub async fn get(&self, timeout: Option<Duration>) -> Result<serde_json::Value, TaskError> {
        let mut done = self.shared.done.subscribe();
        let finished = async move { done.wait_for(|finished| *finished).await.map(|_| ()) };

        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, finished).await.map_err(|_| {
                TaskError::Timeout {
                    task_id: self.shared.task_id.to_string(),
                    waited: limit,
                }
            })?,
            None => finished.await,
        };
        // The sender lives as long as `self`, so the channel cannot close here.
        waited.map_err(|e| TaskError::RemoteFailure {
            task_id: self.shared.task_id.to_string(),
            message: e.to_string(),
        })?;

        let state = self.shared.state.lock();
        match state.status {
            TaskStatus::Success => Ok(state.value.clone().unwrap_or(serde_json::Value::Null)),
            TaskStatus::Revoked => Err(TaskError::Revoked {
                task_id: self.shared.task_id.to_string(),
            }),
            _ => Err(TaskError::RemoteFailure {
                task_id: self.shared.task_id.to_string(),
                message: state.error.clone().unwrap_or_default(),
            }),
        }
    }

    /// Forgets the task. With `terminate`, a running body is also cancelled
    /// and the task becomes `REVOKED`.
    pub fn revoke(&self, terminate: bool) {
        if terminate && self.status() == TaskStatus::Running {
            self.shared.cancellation.cancel();
            self.transition(
                TaskStatus::Revoked,
                None,
                Some("task was terminated".to_string()),
            );
            tracing::info!("Task {} terminated", self.shared.task_id);
        }

        if let Some(table) = self.shared.table.upgrade() {
            table.remove(self.shared.task_id.as_str());
        }
    }

    pub fn summary(&self) -> TaskSummary {
        let state = self.shared.state.lock();
        let ready = state.status.is_terminal();

        TaskSummary {
            task_id: self.shared.task_id.to_string(),
            task_status: state.status,
            ready,
            is_successful: ready.then_some(state.status == TaskStatus::Success),
            message: summary_message(state.status, state.error.as_deref()),
        }
    }
}
