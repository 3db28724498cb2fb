//! Accession allocation.
//!
//! Each accession prefix is backed by one counter row. Allocation locks that
//! row for the length of the transaction, so concurrent callers on the same
//! prefix are served one at a time and receive consecutive numbers. Callers on
//! different prefixes never wait for each other.

use super::AllocationError;
use super::abort;
use crate::storage::{Database, Dataset, DatasetStatus, NewDataset, Transaction};

use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_ACCESSION_WIDTH: usize = 6;

/// How the counter of one table prefix is rendered as an accession.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessionFormat {
    pub accession_prefix: String,
    pub width: usize,
}

impl AccessionFormat {
    pub fn new(accession_prefix: &str, width: usize) -> Self {
        Self {
            accession_prefix: accession_prefix.to_string(),
            width,
        }
    }

    pub fn render(&self, value: i64) -> String {
        format!("{}{:0width$}", self.accession_prefix, value, width = self.width)
    }
}

pub struct IdentifierAllocator {
    db: Arc<dyn Database>,
    formats: HashMap<String, AccessionFormat>,
}

impl IdentifierAllocator {
    /// Allocator with the built-in formats (`mhd` → `MHDA`, `mhd_test` → `MHDT`).
    pub fn new(db: Arc<dyn Database>) -> Self {
        let mut formats = HashMap::new();
        formats.insert(
            "mhd".to_string(),
            AccessionFormat::new("MHDA", DEFAULT_ACCESSION_WIDTH),
        );
        formats.insert(
            "mhd_test".to_string(),
            AccessionFormat::new("MHDT", DEFAULT_ACCESSION_WIDTH),
        );
        Self { db, formats }
    }

    pub fn with_format(mut self, prefix: &str, format: AccessionFormat) -> Self {
        self.formats.insert(prefix.to_string(), format);
        self
    }

    /// Format of `prefix`. Unknown prefixes render as themselves, zero-padded.
    pub fn format_for(&self, prefix: &str) -> AccessionFormat {
        self.formats
            .get(prefix)
            .cloned()
            .unwrap_or_else(|| AccessionFormat::new(prefix, DEFAULT_ACCESSION_WIDTH))
    }

    /// Issues the next accession of `prefix`.
    pub async fn allocate(&self, prefix: &str) -> Result<String, AllocationError> {
        let mut tx = self.db.begin().await?;
        match self.next_accession(tx.as_mut(), prefix).await {
            Ok(accession) => {
                tx.commit().await?;
                tracing::info!("Accession {} allocated", accession);
                Ok(accession)
            }
            Err(e) => Err(abort(tx, e).await),
        }
    }

    /// Creates a dataset for a repository's own reference and gives it the
    /// next accession of `prefix`, in one transaction.
    pub async fn assign_dataset(
        &self,
        prefix: &str,
        repository_id: &str,
        repository_dataset_id: &str,
    ) -> Result<Dataset, AllocationError> {
        let mut tx = self.db.begin().await?;

        let assigned = self
            .insert_dataset(tx.as_mut(), prefix, repository_id, repository_dataset_id)
            .await;

        match assigned {
            Ok(dataset) => {
                tx.commit().await?;
                tracing::info!(
                    "New identifier {} created for {} dataset {}",
                    dataset.accession,
                    repository_id,
                    repository_dataset_id
                );
                Ok(dataset)
            }
            Err(e) => Err(abort(tx, e).await),
        }
    }

    async fn insert_dataset(
        &self,
        tx: &mut dyn Transaction,
        prefix: &str,
        repository_id: &str,
        repository_dataset_id: &str,
    ) -> Result<Dataset, AllocationError> {
        if let Some(existing) = tx.find_dataset(repository_id, repository_dataset_id).await? {
            return Err(AllocationError::DatasetExists {
                repository_id: repository_id.to_string(),
                repository_dataset_id: repository_dataset_id.to_string(),
                accession: existing.accession,
            });
        }

        let accession = self.next_accession(tx, prefix).await?;
        let dataset = tx
            .insert_dataset(NewDataset {
                accession,
                repository_id: repository_id.to_string(),
                repository_dataset_id: repository_dataset_id.to_string(),
                status: DatasetStatus::Private,
            })
            .await?;
        Ok(dataset)
    }

    async fn next_accession(
        &self,
        tx: &mut dyn Transaction,
        prefix: &str,
    ) -> Result<String, AllocationError> {
        let mut identifier = tx.identifier_for_update(prefix).await?.ok_or_else(|| {
            AllocationError::IdentifierMissing {
                prefix: prefix.to_string(),
            }
        })?;

        identifier.last_value += 1;
        tx.save_identifier(&identifier).await?;

        Ok(self.format_for(prefix).render(identifier.last_value))
    }
}
