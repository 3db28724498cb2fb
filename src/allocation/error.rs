use crate::executor::TaskOutcome;
use crate::storage::StoreError;
use std::collections::BTreeMap;
use thiserror::Error;

/// Failures of accession and revision allocation. The transaction has always
/// been rolled back by the time one of these is returned.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("identifier prefix '{prefix}' is not defined")]
    IdentifierMissing { prefix: String },

    #[error("{repository_id} dataset with identifier {repository_dataset_id} already exists.")]
    DatasetExists {
        repository_id: String,
        repository_dataset_id: String,
        accession: String,
    },

    #[error("Dataset {accession} not found in the database.")]
    DatasetNotFound { accession: String },

    #[error("Dataset {accession} has the same file already submitted.")]
    DuplicateFile { accession: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AllocationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IdentifierMissing { .. } => "identifier_missing",
            Self::DatasetExists { .. } => "dataset_exists",
            Self::DatasetNotFound { .. } => "dataset_not_found",
            Self::DuplicateFile { .. } => "duplicate_file",
            Self::Store(StoreError::LockTimeout { .. }) => "lock_timeout",
            Self::Store(_) => "store",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::DatasetExists { .. } | Self::DuplicateFile { .. } => 400,
            Self::DatasetNotFound { .. } => 404,
            Self::Store(StoreError::LockTimeout { .. }) => 503,
            Self::IdentifierMissing { .. } | Self::Store(_) => 500,
        }
    }

    pub fn to_outcome<T>(&self) -> TaskOutcome<T> {
        let message = self.to_string();
        let mut errors = BTreeMap::new();
        errors.insert(self.kind().to_string(), message.clone());
        TaskOutcome::rejected(message, errors)
    }
}
