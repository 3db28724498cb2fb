//! Relational store contract.
//!
//! A [`Database`] hands out one [`Transaction`] per unit of work. Reads named
//! `*_for_update` lock the row until the transaction ends, which serializes
//! concurrent writers of the same identifier prefix or dataset. Dropping a
//! transaction without committing rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Identifier prefixes present in a fresh store, all starting at zero.
pub const DEFAULT_IDENTIFIER_PREFIXES: [&str; 2] = ["mhd", "mhd_test"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("timed out after {waited:?} waiting for a lock on {resource}")]
    LockTimeout { resource: String, waited: Duration },

    /// A unique constraint would be violated.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("transaction is no longer active")]
    Inactive,

    #[error("database error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatasetStatus {
    Private,
    Public,
    Invalid,
}

impl DatasetStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            DatasetStatus::Private => 0,
            DatasetStatus::Public => 1,
            DatasetStatus::Invalid => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(DatasetStatus::Private),
            1 => Some(DatasetStatus::Public),
            2 => Some(DatasetStatus::Invalid),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DatasetStatus::Private => "PRIVATE",
            DatasetStatus::Public => "PUBLIC",
            DatasetStatus::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PRIVATE" => Ok(DatasetStatus::Private),
            "PUBLIC" => Ok(DatasetStatus::Public),
            "INVALID" => Ok(DatasetStatus::Invalid),
            other => Err(format!("unknown dataset status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevisionStatus {
    Valid,
    Invalid,
}

impl RevisionStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            RevisionStatus::Valid => 1,
            RevisionStatus::Invalid => 0,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(RevisionStatus::Valid),
            0 => Some(RevisionStatus::Invalid),
            _ => None,
        }
    }
}

/// Counter row behind one accession prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub prefix: String,
    pub last_value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDataset {
    pub accession: String,
    pub repository_id: String,
    pub repository_dataset_id: String,
    pub status: DatasetStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: i64,
    pub accession: String,
    pub repository_id: String,
    /// The dataset's identifier inside its source repository.
    pub repository_dataset_id: String,
    /// Latest revision number; 0 until the first revision is created.
    pub revision: i64,
    pub revision_datetime: Option<DateTime<Utc>>,
    pub status: DatasetStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRevision {
    pub dataset_id: i64,
    pub revision: i64,
    pub revision_datetime: DateTime<Utc>,
    pub task_id: String,
    pub description: String,
    pub file_sha256: String,
    pub repository_revision: Option<String>,
    pub status: RevisionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRevision {
    pub id: i64,
    pub dataset_id: i64,
    pub revision: i64,
    pub revision_datetime: DateTime<Utc>,
    pub task_id: String,
    pub description: String,
    pub file_sha256: String,
    pub repository_revision: Option<String>,
    pub status: RevisionStatus,
}

/// One unit of work. Every method fails with [`StoreError::Inactive`] once
/// the transaction was committed or rolled back.
#[async_trait]
pub trait Transaction: Send {
    /// Reads and locks the identifier row of `prefix`.
    async fn identifier_for_update(&mut self, prefix: &str)
    -> Result<Option<Identifier>, StoreError>;

    async fn insert_identifier(&mut self, identifier: &Identifier) -> Result<(), StoreError>;

    async fn save_identifier(&mut self, identifier: &Identifier) -> Result<(), StoreError>;

    /// Non-locking lookup by the repository's own dataset reference.
    async fn find_dataset(
        &mut self,
        repository_id: &str,
        repository_dataset_id: &str,
    ) -> Result<Option<Dataset>, StoreError>;

    async fn dataset_by_accession(&mut self, accession: &str)
    -> Result<Option<Dataset>, StoreError>;

    async fn insert_dataset(&mut self, dataset: NewDataset) -> Result<Dataset, StoreError>;

    /// Reads and locks the dataset row owned by `repository_id`.
    async fn dataset_for_update(
        &mut self,
        repository_id: &str,
        accession: &str,
    ) -> Result<Option<Dataset>, StoreError>;

    async fn save_dataset(&mut self, dataset: &Dataset) -> Result<(), StoreError>;

    async fn max_revision(&mut self, dataset_id: i64) -> Result<Option<i64>, StoreError>;

    async fn revision(
        &mut self,
        dataset_id: i64,
        revision: i64,
    ) -> Result<Option<DatasetRevision>, StoreError>;

    /// Revisions of a dataset in ascending order.
    async fn revisions(&mut self, dataset_id: i64) -> Result<Vec<DatasetRevision>, StoreError>;

    async fn insert_revision(&mut self, revision: NewRevision)
    -> Result<DatasetRevision, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    fn describe(&self) -> String;

    /// Creates the identifier row for `prefix` unless it already exists.
    async fn ensure_identifier(&self, prefix: &str, last_value: i64) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        if tx.identifier_for_update(prefix).await?.is_none() {
            tx.insert_identifier(&Identifier {
                prefix: prefix.to_string(),
                last_value,
            })
            .await?;
        }
        tx.commit().await
    }

    async fn identifier(&self, prefix: &str) -> Result<Option<Identifier>, StoreError> {
        let mut tx = self.begin().await?;
        let identifier = tx.identifier_for_update(prefix).await?;
        tx.rollback().await?;
        Ok(identifier)
    }

    async fn dataset(&self, accession: &str) -> Result<Option<Dataset>, StoreError> {
        let mut tx = self.begin().await?;
        let dataset = tx.dataset_by_accession(accession).await?;
        tx.rollback().await?;
        Ok(dataset)
    }

    async fn revisions(&self, dataset_id: i64) -> Result<Vec<DatasetRevision>, StoreError> {
        let mut tx = self.begin().await?;
        let revisions = tx.revisions(dataset_id).await?;
        tx.rollback().await?;
        Ok(revisions)
    }
}
