//! Revision allocation.
//!
//! The dataset row is locked for the whole transaction, so concurrent
//! submissions for one dataset are numbered one after another. The next
//! number is one past the larger of the dataset's recorded revision and the
//! highest stored revision row, which keeps numbering strictly increasing even
//! when the two disagree.

use super::AllocationError;
use super::abort;
use crate::storage::{Database, DatasetRevision, NewRevision, RevisionStatus, Transaction};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A file accepted for a dataset, waiting for its revision number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRequest {
    pub repository_id: String,
    pub accession: String,
    pub task_id: String,
    pub description: String,
    pub file_sha256: String,
    #[serde(default)]
    pub repository_revision: Option<String>,
}

pub struct RevisionAllocator {
    db: Arc<dyn Database>,
}

impl RevisionAllocator {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn create_revision(
        &self,
        request: &RevisionRequest,
    ) -> Result<DatasetRevision, AllocationError> {
        let mut tx = self.db.begin().await?;
        match Self::insert_next(tx.as_mut(), request).await {
            Ok(revision) => {
                tx.commit().await?;
                tracing::info!(
                    "Dataset {} has new revision {} at {}",
                    request.accession,
                    revision.revision,
                    revision.revision_datetime
                );
                Ok(revision)
            }
            Err(e) => Err(abort(tx, e).await),
        }
    }

    async fn insert_next(
        tx: &mut dyn Transaction,
        request: &RevisionRequest,
    ) -> Result<DatasetRevision, AllocationError> {
        let mut dataset = tx
            .dataset_for_update(&request.repository_id, &request.accession)
            .await?
            .ok_or_else(|| AllocationError::DatasetNotFound {
                accession: request.accession.clone(),
            })?;

        if let Some(latest) = tx.revision(dataset.id, dataset.revision).await? {
            if latest.file_sha256 == request.file_sha256 {
                return Err(AllocationError::DuplicateFile {
                    accession: request.accession.clone(),
                });
            }
        }

        let next = match tx.max_revision(dataset.id).await? {
            Some(max) if max > dataset.revision => max + 1,
            _ => dataset.revision + 1,
        };

        let now = Utc::now();
        let revision = tx
            .insert_revision(NewRevision {
                dataset_id: dataset.id,
                revision: next,
                revision_datetime: now,
                task_id: request.task_id.clone(),
                description: request.description.clone(),
                file_sha256: request.file_sha256.clone(),
                repository_revision: request.repository_revision.clone(),
                status: RevisionStatus::Valid,
            })
            .await?;

        dataset.revision = next;
        dataset.revision_datetime = Some(now);
        dataset.updated_at = Some(now);
        tx.save_dataset(&dataset).await?;

        Ok(revision)
    }
}
