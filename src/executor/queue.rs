//! Broker and Result Backend
//!
//! The distributed executor talks to two collaborators: a **broker** holding
//! published messages per named queue, and a **result backend** holding one
//! [`TaskRecord`] per task id. [`MemoryBroker`] implements both inside the
//! process; the `redis` feature adds a networked implementation.
//!
//! ## Delivery
//! - **Ordering**: FIFO within a queue, by publish order.
//! - **Leasing**: `fetch` claims a message for a worker until its lease
//!   expires. Messages are acknowledged only after the body finished, so a
//!   worker that dies mid-task lets the lease lapse and the message is
//!   delivered again (at-least-once).
//! - **Revocation**: revoked ids are remembered; workers skip them and, when
//!   the revocation asks to terminate, cancel a running body.
//!
//! ## Results
//! Records only move forward through the status lifecycle. A forgotten id
//! leaves a tombstone so late writes from a worker cannot bring it back.

use super::error::TaskError;
use super::protocol::{TaskMessage, TaskRecord};
use super::types::*;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A revocation request recorded by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    /// Also cancel the body if a worker is already running it.
    pub terminate: bool,
    pub revoked_at: u64,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, message: TaskMessage) -> Result<(), TaskError>;

    /// Claims the oldest deliverable message across `queues` for `worker`.
    async fn fetch(
        &self,
        queues: &[String],
        worker: &str,
        lease: Duration,
    ) -> Result<Option<TaskMessage>, TaskError>;

    /// Extends the lease held by `worker`. Returns `false` once the worker no
    /// longer owns the message.
    async fn renew_lease(
        &self,
        task_id: &TaskId,
        worker: &str,
        lease: Duration,
    ) -> Result<bool, TaskError>;

    async fn ack(&self, task_id: &TaskId) -> Result<(), TaskError>;

    async fn revoke(&self, task_id: &TaskId, terminate: bool) -> Result<(), TaskError>;

    async fn revocation(&self, task_id: &TaskId) -> Result<Option<Revocation>, TaskError>;

    /// Human readable location of the broker, for logs.
    fn describe(&self) -> String;
}

#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Writes `record` if its status is a legal successor of the stored one.
    /// Returns whether the write was applied.
    async fn store(&self, record: TaskRecord) -> Result<bool, TaskError>;

    async fn load(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, TaskError>;

    /// Drops the record and tombstones the id.
    async fn forget(&self, task_id: &TaskId) -> Result<(), TaskError>;

    /// Removes entries past their retention. Backends whose keys expire on
    /// their own keep the default.
    async fn purge_expired(&self) -> Result<usize, TaskError> {
        Ok(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DeliveryState {
    Ready,
    Leased { worker: String, lease_expires: u64 },
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    message: TaskMessage,
    state: DeliveryState,
    sequence: u64,
    deliveries: u32,
}

impl QueuedMessage {
    fn is_deliverable(&self, now: u64) -> bool {
        match &self.state {
            DeliveryState::Ready => true,
            // Lease expiration check
            DeliveryState::Leased { lease_expires, .. } => now > *lease_expires,
        }
    }
}

/// In-process broker and result backend.
pub struct MemoryBroker {
    messages: DashMap<TaskId, QueuedMessage>,
    records: DashMap<TaskId, TaskRecord>,
    revocations: DashMap<TaskId, Revocation>,
    tombstones: DashMap<TaskId, u64>,
    sequence: AtomicU64,
    /// How long terminal records, revocations and tombstones are kept.
    result_expires: Option<Duration>,
}

impl MemoryBroker {
    pub fn new(result_expires: Option<Duration>) -> Self {
        Self {
            messages: DashMap::new(),
            records: DashMap::new(),
            revocations: DashMap::new(),
            tombstones: DashMap::new(),
            sequence: AtomicU64::new(0),
            result_expires,
        }
    }

    /// Messages published to `queue` and not yet acknowledged.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.messages
            .iter()
            .filter(|entry| entry.message.queue == queue)
            .count()
    }

    pub fn in_flight(&self) -> usize {
        self.messages
            .iter()
            .filter(|entry| matches!(entry.state, DeliveryState::Leased { .. }))
            .count()
    }

    /// Number of times the message was handed to a worker.
    pub fn deliveries(&self, task_id: &TaskId) -> Option<u32> {
        self.messages.get(task_id).map(|entry| entry.deliveries)
    }

    /// Drops expired terminal records, revocations and tombstones.
    pub fn purge_expired(&self) -> usize {
        let Some(ttl) = self.result_expires else {
            return 0;
        };
        let cutoff = now_ms().saturating_sub(ttl.as_millis() as u64);
        let before = self.records.len() + self.revocations.len() + self.tombstones.len();

        self.records
            .retain(|_, record| !(record.status.is_terminal() && record.updated_at < cutoff));
        self.revocations
            .retain(|_, revocation| revocation.revoked_at >= cutoff);
        self.tombstones.retain(|_, forgotten_at| *forgotten_at >= cutoff);

        let purged =
            before - (self.records.len() + self.revocations.len() + self.tombstones.len());
        if purged > 0 {
            tracing::debug!("Purged {} expired task entries", purged);
        }
        purged
    }

    fn is_result_expired(&self, record: &TaskRecord) -> bool {
        match self.result_expires {
            Some(ttl) if record.status.is_terminal() => {
                now_ms().saturating_sub(record.updated_at) > ttl.as_millis() as u64
            }
            _ => false,
        }
    }

    /// Atomically moves a message into the leased state if it is still
    /// deliverable (another worker might have raced us).
    fn try_claim(&self, task_id: &TaskId, worker: &str, lease: Duration) -> Option<TaskMessage> {
        let mut entry = self.messages.get_mut(task_id)?;
        let now = now_ms();
        if !entry.is_deliverable(now) {
            return None;
        }

        if let DeliveryState::Leased { worker: previous, .. } = &entry.state {
            tracing::warn!(
                "Lease of {} on task {} expired, redelivering",
                previous,
                task_id
            );
        }

        entry.state = DeliveryState::Leased {
            worker: worker.to_string(),
            lease_expires: now + lease.as_millis() as u64,
        };
        entry.deliveries += 1;
        Some(entry.message.clone())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, message: TaskMessage) -> Result<(), TaskError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            "Published task {} ({}) to queue '{}'",
            message.id,
            message.task_name,
            message.queue
        );

        // Only insert if not exists (idempotency)
        self.messages
            .entry(message.id.clone())
            .or_insert_with(|| QueuedMessage {
                message,
                state: DeliveryState::Ready,
                sequence,
                deliveries: 0,
            });
        Ok(())
    }

    async fn fetch(
        &self,
        queues: &[String],
        worker: &str,
        lease: Duration,
    ) -> Result<Option<TaskMessage>, TaskError> {
        let now = now_ms();
        let mut candidates: Vec<(u64, TaskId)> = self
            .messages
            .iter()
            .filter(|entry| queues.contains(&entry.message.queue) && entry.is_deliverable(now))
            .map(|entry| (entry.sequence, entry.key().clone()))
            .collect();
        candidates.sort();

        for (_, task_id) in candidates {
            if let Some(message) = self.try_claim(&task_id, worker, lease) {
                tracing::trace!("Worker {} claimed task {}", worker, task_id);
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    async fn renew_lease(
        &self,
        task_id: &TaskId,
        worker: &str,
        lease: Duration,
    ) -> Result<bool, TaskError> {
        let Some(mut entry) = self.messages.get_mut(task_id) else {
            return Ok(false);
        };

        match &entry.state {
            DeliveryState::Leased { worker: owner, .. } if owner == worker => {
                entry.state = DeliveryState::Leased {
                    worker: worker.to_string(),
                    lease_expires: now_ms() + lease.as_millis() as u64,
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ack(&self, task_id: &TaskId) -> Result<(), TaskError> {
        self.messages.remove(task_id);
        Ok(())
    }

    async fn revoke(&self, task_id: &TaskId, terminate: bool) -> Result<(), TaskError> {
        self.revocations.insert(
            task_id.clone(),
            Revocation {
                terminate,
                revoked_at: now_ms(),
            },
        );
        tracing::info!("Revoked task {} (terminate: {})", task_id, terminate);
        Ok(())
    }

    async fn revocation(&self, task_id: &TaskId) -> Result<Option<Revocation>, TaskError> {
        Ok(self.revocations.get(task_id).map(|entry| *entry))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

#[async_trait]
impl ResultBackend for MemoryBroker {
    async fn store(&self, record: TaskRecord) -> Result<bool, TaskError> {
        if self.tombstones.contains_key(&record.task_id) {
            tracing::debug!("Ignoring result for forgotten task {}", record.task_id);
            return Ok(false);
        }

        let task_id = record.task_id.clone();
        let status = record.status;
        let applied = match self.records.entry(task_id.clone()) {
            Entry::Occupied(mut current) => {
                if current.get().status.can_transition_to(status) {
                    current.insert(record);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        };

        if !applied {
            tracing::debug!("Rejected status change to {} for task {}", status, task_id);
        }
        Ok(applied)
    }

    async fn load(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, TaskError> {
        let record = self.records.get(task_id).map(|entry| entry.value().clone());
        match record {
            Some(record) if self.is_result_expired(&record) => {
                self.records.remove(task_id);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn forget(&self, task_id: &TaskId) -> Result<(), TaskError> {
        self.records.remove(task_id);
        self.tombstones.insert(task_id.clone(), now_ms());
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, TaskError> {
        Ok(MemoryBroker::purge_expired(self))
    }
}
