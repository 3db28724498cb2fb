//! Wire Payload Definitions
//!
//! Defines what travels through the broker (`TaskMessage`), what the result
//! backend stores (`TaskRecord`), and the envelopes handed back to request
//! handlers (`TaskSubmission`, `TaskSummary`).

use super::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Params key under which the dispatching request's context travels.
pub const REQUEST_CONTEXT_KEY: &str = "request_context";
/// Message header that, when present, overrides the context's correlation id.
pub const CORRELATION_HEADER: &str = "correlation_id";

/// A unit of work published to the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    pub id: TaskId,
    pub task_name: String,
    /// Routing key: the queue the message was published to.
    pub queue: String,
    pub params: TaskParams,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Timestamp (ms) when the message was published.
    pub created_at: u64,
    /// Timestamp (ms) after which a worker must not start the message.
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl TaskMessage {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// The state of a task as kept by the result backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub task_name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Failure text when `status` is `FAILED` (or the revocation reason).
    #[serde(default)]
    pub error: Option<String>,
    /// Worker that last touched the record.
    #[serde(default)]
    pub worker: Option<String>,
    pub updated_at: u64,
}

impl TaskRecord {
    pub fn pending(task_id: TaskId, task_name: &str) -> Self {
        Self {
            task_id,
            task_name: task_name.to_string(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            worker: None,
            updated_at: now_ms(),
        }
    }

    pub fn transitioned(&self, status: TaskStatus) -> Self {
        Self {
            status,
            updated_at: now_ms(),
            ..self.clone()
        }
    }
}

/// Returned to the caller right after a task is started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSubmission {
    pub task_id: String,
    pub task_status: TaskStatus,
}

/// Point-in-time view of a task for status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSummary {
    pub task_id: String,
    pub task_status: TaskStatus,
    pub ready: bool,
    pub is_successful: Option<bool>,
    pub message: String,
}
