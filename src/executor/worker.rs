//! Worker Pool Implementation
//!
//! Spawns background workers that continuously pull messages from the broker
//! queues this node subscribes to and run the registered bodies.
//!
//! ## Responsibilities
//! - **Polling**: fetching the next deliverable message, sleeping with jitter
//!   when every subscribed queue is empty.
//! - **Lease Management**: a sidecar task renews the message lease while the
//!   body runs; if the worker dies the lease lapses and the message is
//!   redelivered.
//! - **Revocation**: revoked messages are skipped; a terminating revocation
//!   cancels a running body.
//! - **Execution**: re-installing the dispatching request's context and
//!   recording the outcome in the result backend before acknowledging.
//! - **Housekeeping**: one sidecar per pool purges expired results,
//!   revocations and tombstones from the result backend.

use super::error::TaskError;
use super::protocol::*;
use super::queue::{Broker, ResultBackend};
use super::registry::{ExecutionOutcome, TaskDescription, TaskInvocation, TaskRegistry};
use super::types::*;

use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Prefix of every worker name (`<node>-<index>`).
    pub node_name: String,
    pub concurrency: usize,
    pub queues: Vec<String>,
    /// How long a fetched message stays claimed without renewal.
    pub lease: Duration,
    pub lease_renewal: Duration,
    pub idle_sleep: Duration,
    /// How often a running task checks for a terminating revocation.
    pub revocation_poll: Duration,
    /// Interval between purges of expired backend entries.
    pub housekeeping: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            node_name: "worker".to_string(),
            concurrency: 4,
            queues: vec!["common".to_string()],
            lease: Duration::from_secs(30),
            lease_renewal: Duration::from_secs(10),
            idle_sleep: Duration::from_millis(100),
            revocation_poll: Duration::from_millis(500),
            housekeeping: Duration::from_secs(60),
        }
    }
}

/// The engine that drives task execution on a worker node.
pub struct WorkerPool {
    app_name: String,
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn Broker>,
    backend: Arc<dyn ResultBackend>,
    options: WorkerOptions,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        app_name: &str,
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn Broker>,
        backend: Arc<dyn ResultBackend>,
        options: WorkerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            app_name: app_name.to_string(),
            registry,
            broker,
            backend,
            options,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Spawns the workers and returns immediately.
    /// Each worker runs independently until `shutdown` is called.
    pub fn start(self: &Arc<Self>) {
        tracing::info!(
            "Starting {} task workers on queues {:?} ({})",
            self.options.concurrency,
            self.options.queues,
            self.broker.describe()
        );

        let mut handles = self.handles.lock();
        for index in 0..self.options.concurrency {
            let pool = self.clone();
            let worker = format!("{}-{}", self.options.node_name, index);
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker).await;
            }));
        }

        let pool = self.clone();
        handles.push(tokio::spawn(async move {
            pool.housekeeping_loop().await;
        }));
    }

    /// Stops fetching new messages and waits for running bodies to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Worker ended abnormally: {}", e);
            }
        }
        tracing::info!("Worker pool stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// The main loop for a single worker.
    async fn worker_loop(&self, worker: String) {
        tracing::info!("Worker {} started", worker);

        while !self.shutdown.is_cancelled() {
            match self.process_next(&worker).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::warn!("Worker {} failed to fetch: {}", worker, e),
            }

            // Sleep if no work to avoid busy-waiting
            let max_jitter = self.options.idle_sleep.as_millis() as u64 / 2;
            let jitter = rand::thread_rng().gen_range(0..=max_jitter);
            let pause = self.options.idle_sleep + Duration::from_millis(jitter);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        tracing::info!("Worker {} stopped", worker);
    }

    async fn housekeeping_loop(&self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.options.housekeeping) => {}
                _ = self.shutdown.cancelled() => break,
            }

            match self.backend.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::info!("Housekeeping purged {} expired entries", purged),
                Err(e) => tracing::warn!("Housekeeping failed: {}", e),
            }
        }
    }

    /// Fetches and handles at most one message. Returns whether one was found.
    pub async fn process_next(&self, worker: &str) -> Result<bool, TaskError> {
        let Some(message) = self
            .broker
            .fetch(&self.options.queues, worker, self.options.lease)
            .await?
        else {
            return Ok(false);
        };

        tracing::debug!(
            "Worker {} received task {} ({})",
            worker,
            message.id,
            message.task_name
        );

        if self.broker.revocation(&message.id).await?.is_some() {
            tracing::info!("Skipping revoked task {}", message.id);
            self.broker.ack(&message.id).await?;
            return Ok(true);
        }

        if message.is_expired(now_ms()) {
            tracing::warn!("Task {} expired before it could start", message.id);
            let mut record = TaskRecord::pending(message.id.clone(), &message.task_name)
                .transitioned(TaskStatus::Revoked);
            record.error = Some("task expired before execution".to_string());
            record.worker = Some(worker.to_string());
            self.backend.store(record).await?;
            self.broker.ack(&message.id).await?;
            return Ok(true);
        }

        // Redelivery of a message whose result was stored before the ack.
        if let Some(record) = self.backend.load(&message.id).await? {
            if record.status.is_terminal() {
                tracing::debug!("Task {} already {}, acknowledging", message.id, record.status);
                self.broker.ack(&message.id).await?;
                return Ok(true);
            }
        }

        match self.registry.lookup(&self.app_name, &message.task_name) {
            Ok(description) => self.execute_with_lease(worker, description, message).await,
            Err(e) => {
                tracing::error!("Cannot run task {}: {}", message.id, e);
                let mut record = TaskRecord::pending(message.id.clone(), &message.task_name)
                    .transitioned(TaskStatus::Failed);
                record.error = Some(e.to_string());
                record.worker = Some(worker.to_string());
                self.backend.store(record).await?;
                self.broker.ack(&message.id).await?;
            }
        }

        Ok(true)
    }

    /// Wraps the actual execution with lease management and revocation watch.
    async fn execute_with_lease(
        &self,
        worker: &str,
        description: TaskDescription,
        message: TaskMessage,
    ) {
        let task_id = message.id.clone();
        let mut running = TaskRecord::pending(task_id.clone(), &message.task_name)
            .transitioned(TaskStatus::Running);
        running.worker = Some(worker.to_string());
        if let Err(e) = self.backend.store(running.clone()).await {
            tracing::warn!("Failed to mark task {} as running: {}", task_id, e);
        }

        let cancellation = CancellationToken::new();
        let mut invocation =
            TaskInvocation::from_params(task_id.clone(), message.params, cancellation.clone());
        if let Some(correlation_id) = message.headers.get(CORRELATION_HEADER) {
            invocation.context.correlation_id = correlation_id.clone();
        }

        // Start heartbeat and revocation watch
        let renewal = self.spawn_lease_renewal(&task_id, worker);
        let watcher = self.spawn_revocation_watch(&task_id, cancellation);

        let outcome = description.run(invocation).await;

        renewal.abort();
        watcher.abort();

        let mut record = match outcome {
            ExecutionOutcome::Completed(value) => {
                let mut record = running.transitioned(TaskStatus::Success);
                record.result = Some(value);
                record
            }
            ExecutionOutcome::Failed(message) => {
                let mut record = running.transitioned(TaskStatus::Failed);
                record.result = Some(serde_json::Value::String(message.clone()));
                record.error = Some(message);
                record
            }
            ExecutionOutcome::Cancelled => {
                let mut record = running.transitioned(TaskStatus::Revoked);
                record.error = Some("task was terminated".to_string());
                record
            }
        };
        record.worker = Some(worker.to_string());

        let status = record.status;
        match self.backend.store(record).await {
            Ok(true) => tracing::debug!("Task {} marked as {}", task_id, status),
            Ok(false) => tracing::debug!("Result of task {} discarded", task_id),
            Err(e) => tracing::error!("Failed to store result of task {}: {}", task_id, e),
        }

        if let Err(e) = self.broker.ack(&task_id).await {
            tracing::error!("Failed to acknowledge task {}: {}", task_id, e);
        }
    }

    /// Periodically renews the lease of a running task so a long body is not
    /// redelivered while it is still processing.
    fn spawn_lease_renewal(&self, task_id: &TaskId, worker: &str) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let task_id = task_id.clone();
        let worker = worker.to_string();
        let every = self.options.lease_renewal;
        let lease = self.options.lease;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;

                match broker.renew_lease(&task_id, &worker, lease).await {
                    Ok(true) => tracing::trace!("Renewed lease for task {}", task_id),
                    Ok(false) => {
                        // Task might have finished or been reassigned
                        tracing::trace!("Task {} no longer needs lease renewal", task_id);
                        break;
                    }
                    Err(e) => tracing::warn!("Lease renewal for task {} failed: {}", task_id, e),
                }
            }
        })
    }

    fn spawn_revocation_watch(
        &self,
        task_id: &TaskId,
        cancellation: CancellationToken,
    ) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let task_id = task_id.clone();
        let every = self.options.revocation_poll;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;

                if let Ok(Some(revocation)) = broker.revocation(&task_id).await {
                    if revocation.terminate {
                        tracing::info!("Terminating revoked task {}", task_id);
                        cancellation.cancel();
                        break;
                    }
                }
            }
        })
    }
}
