//! Revision creation task.

use super::TaskDeps;
use super::models::{RevisionModel, scalar_text};
use super::validation::{file_sha256, release};
use crate::allocation::{RevisionRequest, SingleFlightLock};
use crate::executor::{TaskInvocation, TaskOutcome};

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

pub(crate) const MODULE: &str = module_path!();

/// Operation name of the single-flight key guarding revision creation.
pub const NEW_REVISION_OPERATION: &str = "new-revision";

pub fn revision_lock_key(accession: &str) -> String {
    SingleFlightLock::key(NEW_REVISION_OPERATION, accession)
}

/// Validates an announcement file and records it as the next revision of its
/// dataset. The revision lock of the accession is released however the
/// task ends.
pub async fn add_submission_task(deps: Arc<TaskDeps>, invocation: TaskInvocation) -> Result<Value> {
    let accession: String = invocation.param("accession")?;

    let outcome = add_submission(&deps, &invocation, &accession).await;
    release(deps.cache.as_ref(), &[revision_lock_key(&accession)]).await;

    Ok(outcome?.into_value()?)
}

async fn add_submission(
    deps: &TaskDeps,
    invocation: &TaskInvocation,
    accession: &str,
) -> Result<TaskOutcome<RevisionModel>> {
    let repository_id: String = invocation.param("repository_id")?;
    let file: Value = invocation.param("announcement_file_json")?;
    let reason: String = invocation
        .optional_param("announcement_reason")?
        .unwrap_or_default();

    tracing::info!("Checking announcement file for {}", accession);
    let errors = deps.announcement_validator.validate(&file);
    if !errors.is_empty() {
        tracing::error!("{} announcement file has errors", accession);
        return Ok(TaskOutcome::rejected(
            "Announcement file is not valid.",
            errors,
        ));
    }

    tracing::info!("Adding dataset revision for {}", accession);
    let request = RevisionRequest {
        repository_id,
        accession: accession.to_string(),
        task_id: invocation.task_id.to_string(),
        description: reason,
        file_sha256: file_sha256(&file),
        repository_revision: scalar_text(file.get("repository_revision")),
    };

    match deps.revisions.create_revision(&request).await {
        Ok(revision) => Ok(TaskOutcome::succeeded(RevisionModel::new(accession, revision))),
        Err(e) => {
            tracing::error!("Failed to add revision for {}: {}", accession, e);
            Ok(e.to_outcome())
        }
    }
}
