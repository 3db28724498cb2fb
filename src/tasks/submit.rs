//! Request-side dispatch of the guarded tasks.
//!
//! Each helper claims the single-flight key of the resource, then starts the
//! task with the id stored under that key. A second request for the same
//! resource while the first is in flight gets
//! [`TaskError::DuplicateSubmission`] carrying the running task's id
//! (HTTP 425).

use super::TaskCatalog;
use super::submission::revision_lock_key;
use super::validation::{ValidationKind, file_sha256};
use crate::allocation::SingleFlightLock;
use crate::context::RequestTracker;
use crate::executor::protocol::TaskSubmission;
use crate::executor::{AsyncTaskService, IdGenerator, TaskError, TaskId, TaskParams};

use serde_json::{Value, json};

fn params(value: Value) -> TaskParams {
    match value {
        Value::Object(map) => map,
        _ => TaskParams::new(),
    }
}

/// Starts revision creation for `accession`.
pub async fn submit_revision(
    service: &dyn AsyncTaskService,
    lock: &SingleFlightLock,
    catalog: &TaskCatalog,
    repository_id: &str,
    accession: &str,
    announcement_file_json: Value,
    announcement_reason: &str,
) -> Result<TaskSubmission, TaskError> {
    let key = revision_lock_key(accession);
    let params = params(json!({
        "repository_id": repository_id,
        "accession": accession,
        "announcement_file_json": announcement_file_json,
        "announcement_reason": announcement_reason,
    }));

    let result = lock
        .start_guarded(&key, service, &catalog.add_submission, None, params, None)
        .await
        .inspect_err(|e| tracing::error!("{}", e))?;

    tracing::info!(
        "New revision task started for {} with task id {} (request {})",
        accession,
        result.task_id(),
        RequestTracker::current().correlation_id
    );
    result.submission().await
}

/// Starts validation of an uploaded file. The key is the file's content
/// hash, so only identical uploads from one repository are deduplicated.
pub async fn submit_file_validation(
    service: &dyn AsyncTaskService,
    lock: &SingleFlightLock,
    catalog: &TaskCatalog,
    kind: ValidationKind,
    repository_id: &str,
    filename: &str,
    file_json: Value,
) -> Result<TaskSubmission, TaskError> {
    let sha256 = file_sha256(&file_json);
    let key = kind.lock_key(repository_id, &sha256);

    let (task, file_param) = match kind {
        ValidationKind::Announcement => {
            (&catalog.validate_announcement_file, "announcement_file_json")
        }
        ValidationKind::DatasetFile => (&catalog.validate_dataset_file, "file_json"),
    };
    let mut params = params(json!({
        "repository_id": repository_id,
        "filename": filename,
    }));
    params.insert(file_param.to_string(), file_json);

    // The task deletes this key when it finishes.
    let task_id = TaskId::new();
    let task_key = kind.task_key(repository_id, task_id.as_str());
    lock.cache()
        .set(&task_key, &sha256, Some(lock.ttl()))
        .await?;

    let started = lock
        .start_guarded(
            &key,
            service,
            task,
            Some(IdGenerator::fixed(task_id.clone())),
            params,
            None,
        )
        .await;
    let result = match started {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("{}", e);
            if let Err(release_error) = lock.cache().delete(&task_key).await {
                tracing::warn!("Failed to delete {}: {}", task_key, release_error);
            }
            return Err(e);
        }
    };

    tracing::info!("New file validation task started for the task {}", task_id);
    result.submission().await
}
