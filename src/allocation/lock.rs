//! Cache-backed single-flight lock.
//!
//! A key `<operation>:<resource>` holds the id of the task currently mutating
//! that resource. A second dispatch for the same key is refused with the
//! holder's id so the caller can poll it instead. The task body deletes the
//! key when it finishes; the TTL bounds how long a crashed task blocks others.

use crate::executor::{
    AsyncTaskService, IdGenerator, TaskDescription, TaskError, TaskId, TaskParams, TaskResult,
};
use crate::storage::CacheService;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(600);

/// How the lock key is claimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockMode {
    /// Read the key, then write it. Two callers racing between the read and
    /// the write may both proceed; the downstream write detects the duplicate.
    CheckThenSet,
    /// A single set-if-absent. No race window.
    #[default]
    Atomic,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockMode::CheckThenSet => "check-then-set",
            LockMode::Atomic => "atomic",
        })
    }
}

impl FromStr for LockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check-then-set" => Ok(LockMode::CheckThenSet),
            "atomic" => Ok(LockMode::Atomic),
            other => Err(format!("unknown lock mode: {other}")),
        }
    }
}

#[derive(Clone)]
pub struct SingleFlightLock {
    cache: Arc<dyn CacheService>,
    mode: LockMode,
    ttl: Duration,
}

impl fmt::Debug for SingleFlightLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlightLock")
            .field("cache", &self.cache.connection_repr())
            .field("mode", &self.mode)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SingleFlightLock {
    pub fn new(cache: Arc<dyn CacheService>, mode: LockMode, ttl: Duration) -> Self {
        Self { cache, mode, ttl }
    }

    pub fn key(operation: &str, resource: &str) -> String {
        format!("{operation}:{resource}")
    }

    pub fn cache(&self) -> &Arc<dyn CacheService> {
        &self.cache
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Claims `key` for `task_id`, or reports the task already holding it.
    pub async fn acquire(&self, key: &str, task_id: &TaskId) -> Result<(), TaskError> {
        match self.mode {
            LockMode::CheckThenSet => {
                if let Some(holder) = self.cache.get(key).await? {
                    return Err(duplicate(key, holder));
                }
                self.cache
                    .set(key, task_id.as_str(), Some(self.ttl))
                    .await?;
            }
            LockMode::Atomic => self.claim(key, task_id).await?,
        }

        tracing::debug!("Lock {} acquired by task {}", key, task_id);
        Ok(())
    }

    /// Set-if-absent, retried once when the refusing holder expired before
    /// it could be read back.
    async fn claim(&self, key: &str, task_id: &TaskId) -> Result<(), TaskError> {
        for _ in 0..2 {
            if self
                .cache
                .set_if_absent(key, task_id.as_str(), Some(self.ttl))
                .await?
            {
                return Ok(());
            }
            if let Some(holder) = self.cache.get(key).await? {
                return Err(duplicate(key, holder));
            }
            tracing::debug!("Holder of lock {} expired before it was read, retrying", key);
        }
        Err(duplicate(key, String::new()))
    }

    pub async fn holder(&self, key: &str) -> Result<Option<TaskId>, TaskError> {
        Ok(self.cache.get(key).await?.map(TaskId::from))
    }

    /// Returns whether a key was held.
    pub async fn release(&self, key: &str) -> Result<bool, TaskError> {
        let released = self.cache.delete(key).await?;
        if released {
            tracing::debug!("Lock {} released", key);
        }
        Ok(released)
    }

    /// Dispatches `task` under the lock: the id is generated first, the key is
    /// claimed with it, then the task starts with that id forced. The key is
    /// released again if the task cannot be started.
    pub async fn start_guarded(
        &self,
        key: &str,
        service: &dyn AsyncTaskService,
        task: &TaskDescription,
        id_generator: Option<IdGenerator>,
        params: TaskParams,
        expires: Option<Duration>,
    ) -> Result<TaskResult, TaskError> {
        let task_id = id_generator.unwrap_or_default().generate()?;
        self.acquire(key, &task_id).await?;

        let forced = IdGenerator::fixed(task_id.clone());
        let started = match service.get_executor(task, Some(forced), params) {
            Ok(executor) => executor.start(expires).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &started {
            tracing::warn!("Task {} did not start, releasing {}: {}", task_id, key, e);
            if let Err(release_error) = self.release(key).await {
                tracing::error!("Failed to release lock {}: {}", key, release_error);
            }
        }
        started
    }
}

fn duplicate(key: &str, holder: String) -> TaskError {
    TaskError::DuplicateSubmission {
        resource_key: key.to_string(),
        task_id: holder,
    }
}
