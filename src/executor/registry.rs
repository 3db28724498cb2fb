//! Task Registry
//!
//! Maps (app name, task name) to executable Rust closures plus the queue each
//! task is routed to. The registry is filled once at startup by an explicit
//! registration function and then sealed; every executor only reads it.

use super::error::TaskError;
use super::protocol::REQUEST_CONTEXT_KEY;
use super::types::*;
use crate::context::{RequestContext, RequestTracker};

use anyhow::{Context, Result, anyhow};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>;

/// Type alias for a thread-safe, asynchronous task body.
pub type TaskFn = Arc<dyn Fn(TaskInvocation) -> TaskFuture + Send + Sync>;

/// Everything a task body receives when it runs.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub task_id: TaskId,
    pub params: TaskParams,
    /// Context of the request that dispatched the task, with `task_id` set.
    pub context: RequestContext,
    /// Cancelled when the task is revoked with `terminate`.
    pub cancellation: CancellationToken,
}

impl TaskInvocation {
    /// Builds an invocation from dispatched params, taking the serialized
    /// request context out of them.
    pub fn from_params(
        task_id: TaskId,
        mut params: TaskParams,
        cancellation: CancellationToken,
    ) -> Self {
        let context = params
            .remove(REQUEST_CONTEXT_KEY)
            .and_then(|value| serde_json::from_value::<RequestContext>(value).ok())
            .unwrap_or_default()
            .with_task_id(task_id.as_str())
            .normalized();

        Self {
            task_id,
            params,
            context,
            cancellation,
        }
    }

    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .params
            .get(key)
            .ok_or_else(|| anyhow!("missing task parameter '{key}'"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("invalid task parameter '{key}'"))
    }

    /// Like [`TaskInvocation::param`], but a missing or `null` value is `None`.
    pub fn optional_param<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.params.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .with_context(|| format!("invalid task parameter '{key}'")),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// How a single run of a task body ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(serde_json::Value),
    Failed(String),
    Cancelled,
}

/// Immutable handle binding a registered body to its name and queue.
#[derive(Clone)]
pub struct TaskDescription {
    app_name: String,
    task_name: String,
    queue: String,
    callable: TaskFn,
}

impl fmt::Debug for TaskDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescription")
            .field("app_name", &self.app_name)
            .field("task_name", &self.task_name)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl TaskDescription {
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Builds a dotted task name (`a.b.function`) from a Rust module path.
    pub fn qualified_name(module_path: &str, function: &str) -> String {
        format!("{}.{}", module_path.replace("::", "."), function)
    }

    /// Runs the body with the invocation's context installed and its span
    /// attached. Errors and panics are captured, never propagated. A
    /// cancellation aborts the body at its next await point.
    pub async fn run(&self, invocation: TaskInvocation) -> ExecutionOutcome {
        let context = invocation.context.clone();
        let cancellation = invocation.cancellation.clone();
        let span = context.span();
        let task_name = self.task_name.clone();
        let body = (self.callable)(invocation);

        let traced = async move {
            tracing::info!("Task {} started", task_name);
            let result = body.await;
            match &result {
                Ok(_) => tracing::info!("Task {} completed successfully", task_name),
                Err(e) => tracing::error!("Task {} failed: {:#}", task_name, e),
            }
            result
        };

        let mut handle = tokio::spawn(RequestTracker::scope(context, traced).instrument(span));

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(value)) => ExecutionOutcome::Completed(value),
                Ok(Err(e)) => ExecutionOutcome::Failed(format!("{e:#}")),
                Err(e) if e.is_panic() => {
                    ExecutionOutcome::Failed(panic_message(e.into_panic()))
                }
                Err(_) => ExecutionOutcome::Cancelled,
            },
            _ = cancellation.cancelled() => {
                handle.abort();
                tracing::warn!("Task {} cancelled", self.task_name);
                ExecutionOutcome::Cancelled
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {message}")
    } else {
        "task panicked".to_string()
    }
}

/// Registry holding every task of every app served by this process.
pub struct TaskRegistry {
    apps: DashMap<String, BTreeMap<String, TaskDescription>>,
    sealed: AtomicBool,
}

impl TaskRegistry {
    /// Creates a new, empty, unsealed registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an async body under `app_name` / `task_name`, routed to `queue`.
    ///
    /// Re-registering the same name replaces the previous body.
    pub fn register<F, Fut>(
        &self,
        app_name: &str,
        queue: &str,
        task_name: &str,
        handler: F,
    ) -> std::result::Result<TaskDescription, TaskError>
    where
        F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        // Box::pin type-erases the concrete Future so different bodies share one map.
        let callable: TaskFn =
            Arc::new(move |invocation: TaskInvocation| Box::pin(handler(invocation)) as TaskFuture);

        self.insert(TaskDescription {
            app_name: app_name.to_string(),
            task_name: task_name.to_string(),
            queue: queue.to_string(),
            callable,
        })
    }

    /// Registers a synchronous body. It runs on the blocking pool of whichever
    /// runtime executes it.
    pub fn register_blocking<F>(
        &self,
        app_name: &str,
        queue: &str,
        task_name: &str,
        handler: F,
    ) -> std::result::Result<TaskDescription, TaskError>
    where
        F: Fn(TaskInvocation) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(app_name, queue, task_name, move |invocation| {
            let handler = handler.clone();
            async move {
                tokio::task::spawn_blocking(move || handler(invocation))
                    .await
                    .map_err(|e| anyhow!("blocking task did not complete: {e}"))?
            }
        })
    }

    fn insert(
        &self,
        description: TaskDescription,
    ) -> std::result::Result<TaskDescription, TaskError> {
        if self.is_sealed() {
            return Err(TaskError::RegistrySealed {
                task_name: description.task_name,
            });
        }

        tracing::info!(
            "Task '{}' registered for app '{}' and queue '{}'",
            description.task_name,
            description.app_name,
            description.queue
        );

        self.apps
            .entry(description.app_name.clone())
            .or_default()
            .insert(description.task_name.clone(), description.clone());

        Ok(description)
    }

    pub fn lookup(
        &self,
        app_name: &str,
        task_name: &str,
    ) -> std::result::Result<TaskDescription, TaskError> {
        self.apps
            .get(app_name)
            .and_then(|tasks| tasks.get(task_name).cloned())
            .ok_or_else(|| TaskError::NotRegistered {
                app_name: app_name.to_string(),
                task_name: task_name.to_string(),
            })
    }

    /// All tasks of one app, sorted by name.
    pub fn tasks_for(&self, app_name: &str) -> Vec<TaskDescription> {
        self.apps
            .get(app_name)
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_task(&self, app_name: &str, task_name: &str) -> bool {
        self.apps
            .get(app_name)
            .is_some_and(|tasks| tasks.contains_key(task_name))
    }

    pub fn app_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apps.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Returns the total number of registered tasks across apps.
    pub fn task_count(&self) -> usize {
        self.apps.iter().map(|entry| entry.value().len()).sum()
    }

    /// Freezes the registry. Later registrations fail with `RegistrySealed`.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
        tracing::debug!("Task registry sealed with {} tasks", self.task_count());
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self {
            apps: DashMap::new(),
            sealed: AtomicBool::new(false),
        }
    }
}
