use crate::storage::{DatasetRevision, RevisionStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of a successful revision creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionModel {
    pub accession: String,
    pub revision: i64,
    pub revision_datetime: DateTime<Utc>,
    pub description: String,
    pub repository_revision: Option<String>,
    pub status: RevisionStatus,
    pub task_id: String,
}

impl RevisionModel {
    pub fn new(accession: &str, revision: DatasetRevision) -> Self {
        Self {
            accession: accession.to_string(),
            revision: revision.revision,
            revision_datetime: revision.revision_datetime,
            description: revision.description,
            repository_revision: revision.repository_revision,
            status: revision.status,
            task_id: revision.task_id,
        }
    }
}

/// Descriptive fields of a validated file, echoed back with every
/// validation outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileValidationModel {
    pub task_id: String,
    pub file: String,
    pub repository_id: String,
    pub repository_name: String,
    pub schema_uri: String,
    pub profile_uri: String,
    pub mhd_identifier: String,
    pub repository_identifier: String,
    pub repository_revision: Option<String>,
    pub repository_revision_datetime: Option<String>,
}

impl FileValidationModel {
    pub fn describe(task_id: &str, filename: &str, repository_id: &str, file: &Value) -> Self {
        let text = |field: &str| scalar_text(file.get(field)).unwrap_or_default();

        Self {
            task_id: task_id.to_string(),
            file: filename.to_string(),
            repository_id: repository_id.to_string(),
            repository_name: text("repository_name"),
            schema_uri: text("$schema"),
            profile_uri: text("profile_uri"),
            mhd_identifier: text("mhd_identifier"),
            repository_identifier: text("repository_identifier"),
            repository_revision: scalar_text(file.get("repository_revision")),
            repository_revision_datetime: scalar_text(file.get("repository_revision_datetime")),
        }
    }
}

/// Strings as-is, numbers and booleans rendered; anything else is absent.
pub fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
