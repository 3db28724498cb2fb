use super::TaskDeps;
use crate::executor::{TaskInvocation, TaskOutcome};

use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;

pub(crate) const MODULE: &str = module_path!();

/// Round-trip check of the execution path: answers with the executing task's
/// id, the request it came from and whether the cache is reachable.
pub async fn ping_task(deps: Arc<TaskDeps>, invocation: TaskInvocation) -> Result<Value> {
    let cache_reachable = deps.cache.ping().await.unwrap_or(false);
    tracing::info!("Ping received by task {}", invocation.task_id);

    let reply = json!({
        "reply": "pong",
        "task_id": invocation.task_id.as_str(),
        "correlation_id": invocation.context.correlation_id,
        "cache": cache_reachable,
        "answered_at": Utc::now(),
    });
    Ok(TaskOutcome::succeeded(reply).into_value()?)
}
