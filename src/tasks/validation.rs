//! File validation tasks.
//!
//! The rules themselves are pluggable through [`FileValidator`]; the tasks
//! only hash the file, run the validator, shape the outcome and release the
//! cache keys that guarded the submission.

use super::TaskDeps;
use super::models::FileValidationModel;
use crate::executor::{TaskInvocation, TaskOutcome};
use crate::storage::CacheService;

use anyhow::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) const MODULE: &str = module_path!();

/// Numbered error messages (`"1"`, `"2"`, …), empty when the file is valid.
pub type ValidationErrors = BTreeMap<String, String>;

pub trait FileValidator: Send + Sync {
    fn validate(&self, file: &Value) -> ValidationErrors;
}

/// Requires a JSON object whose listed fields are present and not empty.
#[derive(Debug, Clone)]
pub struct RequiredFieldsValidator {
    fields: Vec<String>,
}

impl RequiredFieldsValidator {
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn announcement() -> Self {
        Self::new([
            "$schema",
            "profile_uri",
            "repository_name",
            "mhd_identifier",
            "repository_identifier",
        ])
    }

    pub fn dataset_file() -> Self {
        Self::new(["$schema", "repository_name", "repository_identifier"])
    }
}

impl FileValidator for RequiredFieldsValidator {
    fn validate(&self, file: &Value) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        let Some(object) = file.as_object() else {
            errors.insert("1".to_string(), "$: file content is not a JSON object".to_string());
            return errors;
        };

        for field in &self.fields {
            let message = match object.get(field) {
                None | Some(Value::Null) => format!("{field}: '{field}' is a required property"),
                Some(Value::String(s)) if s.trim().is_empty() => {
                    format!("{field}: '{field}' should be non-empty")
                }
                Some(_) => continue,
            };
            errors.insert((errors.len() + 1).to_string(), message);
        }
        errors
    }
}

/// Hex SHA-256 of the file's compact JSON text.
pub fn file_sha256(file: &Value) -> String {
    format!("{:x}", Sha256::digest(file.to_string().as_bytes()))
}

/// Which validator a validation task runs, and the cache keys guarding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    Announcement,
    DatasetFile,
}

impl ValidationKind {
    /// Single-flight key of one file content within a repository.
    pub fn lock_key(self, repository_id: &str, sha256: &str) -> String {
        match self {
            ValidationKind::Announcement => {
                format!("new-announcement-validation:{repository_id}:{sha256}")
            }
            ValidationKind::DatasetFile => format!("new-file-validation:{repository_id}:{sha256}"),
        }
    }

    /// Key mapping a running validation task back to its file hash.
    pub fn task_key(self, repository_id: &str, task_id: &str) -> String {
        format!("new-file-validation-task:{repository_id}:{task_id}")
    }

    fn label(self) -> &'static str {
        match self {
            ValidationKind::Announcement => "Announcement file",
            ValidationKind::DatasetFile => "File",
        }
    }

    fn file_param(self) -> &'static str {
        match self {
            ValidationKind::Announcement => "announcement_file_json",
            ValidationKind::DatasetFile => "file_json",
        }
    }
}

pub async fn validate_announcement_file_task(
    deps: Arc<TaskDeps>,
    invocation: TaskInvocation,
) -> Result<Value> {
    let validator = deps.announcement_validator.clone();
    run_validation(deps, invocation, ValidationKind::Announcement, validator).await
}

pub async fn validate_dataset_file_task(
    deps: Arc<TaskDeps>,
    invocation: TaskInvocation,
) -> Result<Value> {
    let validator = deps.dataset_validator.clone();
    run_validation(deps, invocation, ValidationKind::DatasetFile, validator).await
}

async fn run_validation(
    deps: Arc<TaskDeps>,
    invocation: TaskInvocation,
    kind: ValidationKind,
    validator: Arc<dyn FileValidator>,
) -> Result<Value> {
    let repository_id: String = invocation.param("repository_id")?;
    let file: Value = invocation.param(kind.file_param())?;
    let filename: String = invocation.optional_param("filename")?.unwrap_or_default();
    let task_id = invocation.task_id.to_string();

    let sha256 = file_sha256(&file);
    let info = FileValidationModel::describe(&task_id, &filename, &repository_id, &file);

    tracing::info!("Checking {} with the task {}", kind.label().to_lowercase(), task_id);
    let errors = validator.validate(&file);

    let outcome = if errors.is_empty() {
        tracing::info!("{} is validated with the task {}", kind.label(), task_id);
        TaskOutcome::succeeded_with_message(info, format!("{} is valid.", kind.label()))
    } else {
        tracing::error!("{} has {} errors with the task {}", kind.label(), errors.len(), task_id);
        TaskOutcome::rejected(format!("{} is not valid.", kind.label()), errors).with_result(info)
    };

    release(
        deps.cache.as_ref(),
        &[
            kind.lock_key(&repository_id, &sha256),
            kind.task_key(&repository_id, &task_id),
        ],
    )
    .await;

    Ok(outcome.into_value()?)
}

/// Deletes guard keys. Failures are logged; the keys still expire on their own.
pub(crate) async fn release(cache: &dyn CacheService, keys: &[String]) {
    for key in keys {
        if let Err(e) = cache.delete(key).await {
            tracing::warn!("Failed to release cache key {}: {}", key, e);
        }
    }
}
