//! Distributed Queue Executor
//!
//! Dispatches tasks through a [`Broker`] to worker pools, possibly in other
//! processes, and reads their state back from a [`ResultBackend`].
//!
//! ## Responsibilities
//! - **Routing**: every task of the bound app is routed to its queue; unknown
//!   names fall back to the default queue.
//! - **Propagation**: the caller's request context travels inside the params,
//!   its correlation id additionally as a message header.
//! - **Polling**: results are polled from the backend at a fixed interval.

use super::error::TaskError;
use super::protocol::*;
use super::queue::{Broker, ResultBackend};
use super::registry::{TaskDescription, TaskRegistry};
use super::service::{AsyncTaskService, IdGenerator, TaskExecutor, TaskResult, summary_message};
use super::types::*;
use crate::context::{RequestTracker, UNSET};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Queue for task names with no explicit route.
    pub default_queue: String,
    /// Delay between two result backend reads in `get`.
    pub poll_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            default_queue: "common".to_string(),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Maps task names to queues.
#[derive(Debug, Clone)]
pub struct TaskRouter {
    routes: HashMap<String, String>,
    default_queue: String,
}

impl TaskRouter {
    pub fn new(default_queue: &str) -> Self {
        Self {
            routes: HashMap::new(),
            default_queue: default_queue.to_string(),
        }
    }

    pub fn add_route(&mut self, task_name: &str, queue: &str) {
        self.routes.insert(task_name.to_string(), queue.to_string());
    }

    pub fn route(&self, task_name: &str) -> &str {
        self.routes
            .get(task_name)
            .map(String::as_str)
            .unwrap_or(&self.default_queue)
    }

    /// Every queue a route points to, plus the default one.
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.routes.values().cloned().collect();
        queues.push(self.default_queue.clone());
        queues.sort();
        queues.dedup();
        queues
    }
}

pub struct QueueTaskService {
    app_name: String,
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn Broker>,
    backend: Arc<dyn ResultBackend>,
    router: TaskRouter,
    options: QueueOptions,
}

impl QueueTaskService {
    pub fn new(
        app_name: &str,
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn Broker>,
        backend: Arc<dyn ResultBackend>,
        options: QueueOptions,
    ) -> Self {
        let mut router = TaskRouter::new(&options.default_queue);
        for task in registry.tasks_for(app_name) {
            router.add_route(task.task_name(), task.queue());
        }

        tracing::info!(
            "Queue task service for app '{}' routes {} tasks over {}",
            app_name,
            registry.tasks_for(app_name).len(),
            broker.describe()
        );

        Self {
            app_name: app_name.to_string(),
            registry,
            broker,
            backend,
            router,
            options,
        }
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }
}

#[async_trait]
impl AsyncTaskService for QueueTaskService {
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
        let queue = self.router.route(description.task_name()).to_string();

        Ok(TaskExecutor::Queue(QueueTaskExecutor {
            description,
            queue,
            id_generator: id_generator.unwrap_or_default(),
            params,
            broker: self.broker.clone(),
            backend: self.backend.clone(),
            poll_interval: self.options.poll_interval,
        }))
    }

    async fn get_result(&self, task_id: &str) -> Result<TaskResult, TaskError> {
        if task_id.trim().is_empty() {
            return Err(TaskError::InvalidTaskId);
        }

        let task_id = TaskId::from(task_id);
        if self.backend.load(&task_id).await?.is_none() {
            return Err(TaskError::NotFound {
                task_id: task_id.to_string(),
            });
        }

        Ok(TaskResult::Queue(QueueTaskResult {
            task_id,
            broker: self.broker.clone(),
            backend: self.backend.clone(),
            poll_interval: self.options.poll_interval,
        }))
    }
}

pub struct QueueTaskExecutor {
    description: TaskDescription,
    queue: String,
    id_generator: IdGenerator,
    params: TaskParams,
    broker: Arc<dyn Broker>,
    backend: Arc<dyn ResultBackend>,
    poll_interval: Duration,
}

impl fmt::Debug for QueueTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueTaskExecutor")
            .field("task_name", &self.description.task_name())
            .field("queue", &self.queue)
            .field("id_generator", &self.id_generator)
            .finish_non_exhaustive()
    }
}

impl QueueTaskExecutor {
    pub fn task_name(&self) -> &str {
        self.description.task_name()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Publishes the task and returns without waiting for a worker.
    pub async fn start(self, expires: Option<Duration>) -> Result<TaskResult, TaskError> {
        let task_id = self.id_generator.generate()?;
        let context = RequestTracker::current();

        let mut params = self.params;
        let context_value =
            serde_json::to_value(&context).map_err(|e| TaskError::StartFailure {
                task_name: self.description.task_name().to_string(),
                message: e.to_string(),
            })?;
        params.insert(REQUEST_CONTEXT_KEY.to_string(), context_value);

        let mut headers = BTreeMap::new();
        if context.correlation_id != UNSET {
            headers.insert(CORRELATION_HEADER.to_string(), context.correlation_id.clone());
        }

        let created_at = now_ms();
        let message = TaskMessage {
            id: task_id.clone(),
            task_name: self.description.task_name().to_string(),
            queue: self.queue.clone(),
            params,
            headers,
            created_at,
            expires_at: expires.map(|ttl| created_at + ttl.as_millis() as u64),
        };

        // Record first so a fast worker's RUNNING write is never shadowed.
        self.backend
            .store(TaskRecord::pending(task_id.clone(), self.description.task_name()))
            .await?;
        if let Err(e) = self.broker.publish(message).await {
            if let Err(forget_error) = self.backend.forget(&task_id).await {
                tracing::warn!(
                    "Failed to drop pending record of unpublished task {}: {}",
                    task_id,
                    forget_error
                );
            }
            return Err(e);
        }

        tracing::info!(
            "Task {} ({}) sent to queue '{}'",
            task_id,
            self.description.task_name(),
            self.queue
        );

        Ok(TaskResult::Queue(QueueTaskResult {
            task_id,
            broker: self.broker,
            backend: self.backend,
            poll_interval: self.poll_interval,
        }))
    }
}

#[derive(Clone)]
pub struct QueueTaskResult {
    task_id: TaskId,
    broker: Arc<dyn Broker>,
    backend: Arc<dyn ResultBackend>,
    poll_interval: Duration,
}

impl fmt::Debug for QueueTaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueTaskResult")
            .field("task_id", &self.task_id)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl QueueTaskResult {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    async fn record(&self) -> Result<TaskRecord, TaskError> {
        self.backend
            .load(&self.task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound {
                task_id: self.task_id.to_string(),
            })
    }

    pub async fn status(&self) -> Result<TaskStatus, TaskError> {
        Ok(self.record().await?.status)
    }

    pub async fn get(&self, timeout: Option<Duration>) -> Result<serde_json::Value, TaskError> {
        let started = Instant::now();

        loop {
            let record = self.record().await?;
            match record.status {
                TaskStatus::Success => {
                    return Ok(record.result.unwrap_or(serde_json::Value::Null));
                }
                TaskStatus::Failed => {
                    return Err(TaskError::RemoteFailure {
                        task_id: self.task_id.to_string(),
                        message: record.error.unwrap_or_default(),
                    });
                }
                TaskStatus::Revoked => {
                    return Err(TaskError::Revoked {
                        task_id: self.task_id.to_string(),
                    });
                }
                TaskStatus::Pending | TaskStatus::Running => {}
            }

            let wait = match timeout {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        return Err(TaskError::Timeout {
                            task_id: self.task_id.to_string(),
                            waited: limit,
                        });
                    }
                    (limit - elapsed).min(self.poll_interval)
                }
                None => self.poll_interval,
            };

            tracing::trace!("Task {} is {}, polling again", self.task_id, record.status);
            tokio::time::sleep(wait).await;
        }
    }

    /// Cancels the task and forgets its record.
    pub async fn revoke(&self, terminate: bool) -> Result<(), TaskError> {
        self.broker.revoke(&self.task_id, terminate).await?;

        if let Some(record) = self.backend.load(&self.task_id).await? {
            self.backend
                .store(record.transitioned(TaskStatus::Revoked))
                .await?;
        }
        self.backend.forget(&self.task_id).await?;

        tracing::info!("Task {} revoked and forgotten", self.task_id);
        Ok(())
    }

    pub async fn summary(&self) -> Result<TaskSummary, TaskError> {
        let record = self.record().await?;
        let ready = record.status.is_terminal();

        Ok(TaskSummary {
            task_id: self.task_id.to_string(),
            task_status: record.status,
            ready,
            is_successful: ready.then_some(record.status == TaskStatus::Success),
            message: summary_message(record.status, record.error.as_deref()),
        })
    }
}
