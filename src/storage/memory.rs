//! In-memory relational store with row-level locking.
//!
//! Committed rows live behind one short-lived mutex. A transaction stages its
//! writes privately and publishes them on commit, after re-checking unique
//! constraints. `*_for_update` reads take a per-row async lock that is held
//! until the transaction ends, so two transactions touching the same row run
//! one after the other while different rows never contend.

use super::database::*;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Default)]
struct Tables {
    identifiers: BTreeMap<String, Identifier>,
    datasets: BTreeMap<i64, Dataset>,
    revisions: BTreeMap<i64, DatasetRevision>,
}

impl Tables {
    fn dataset_where(&self, predicate: impl Fn(&Dataset) -> bool) -> Option<Dataset> {
        self.datasets.values().find(|d| predicate(*d)).cloned()
    }
}

struct Shared {
    tables: Mutex<Tables>,
    row_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    next_dataset_id: AtomicI64,
    next_revision_id: AtomicI64,
    lock_timeout: Duration,
}

#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: DashMap::new(),
                next_dataset_id: AtomicI64::new(1),
                next_revision_id: AtomicI64::new(1),
                lock_timeout,
            }),
        }
    }

    /// A store holding the default identifier rows.
    pub fn seeded(lock_timeout: Duration) -> Self {
        let db = Self::new(lock_timeout);
        {
            let mut tables = db.shared.tables.lock();
            for prefix in DEFAULT_IDENTIFIER_PREFIXES {
                tables.identifiers.insert(
                    prefix.to_string(),
                    Identifier {
                        prefix: prefix.to_string(),
                        last_value: 0,
                    },
                );
            }
        }
        db
    }

    /// Number of committed revision rows.
    pub fn revision_count(&self) -> usize {
        self.shared.tables.lock().revisions.len()
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::seeded(Duration::from_secs(30))
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            shared: self.shared.clone(),
            guards: HashMap::new(),
            identifiers: BTreeMap::new(),
            datasets: BTreeMap::new(),
            revisions: Vec::new(),
            active: true,
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

pub struct MemoryTransaction {
    shared: Arc<Shared>,
    guards: HashMap<String, OwnedMutexGuard<()>>,
    identifiers: BTreeMap<String, Identifier>,
    datasets: BTreeMap<i64, Dataset>,
    revisions: Vec<DatasetRevision>,
    active: bool,
}

impl MemoryTransaction {
    fn ensure_active(&self) -> Result<(), StoreError> {
        if self.active {
            Ok(())
        } else {
            Err(StoreError::Inactive)
        }
    }

    async fn lock_row(&mut self, resource: String) -> Result<(), StoreError> {
        if self.guards.contains_key(&resource) {
            return Ok(());
        }

        let lock = self
            .shared
            .row_locks
            .entry(resource.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let waited = self.shared.lock_timeout;
        let guard = tokio::time::timeout(waited, lock.lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout {
                resource: resource.clone(),
                waited,
            })?;

        tracing::trace!("Locked row {}", resource);
        self.guards.insert(resource, guard);
        Ok(())
    }

    /// Committed rows overlaid with this transaction's staged rows.
    fn dataset_where(&self, predicate: impl Fn(&Dataset) -> bool) -> Option<Dataset> {
        if let Some(staged) = self.datasets.values().find(|d| predicate(*d)) {
            return Some(staged.clone());
        }
        self.shared
            .tables
            .lock()
            .dataset_where(&predicate)
            .map(|committed| {
                self.datasets
                    .get(&committed.id)
                    .cloned()
                    .unwrap_or(committed)
            })
    }

    fn all_revisions(&self, dataset_id: i64) -> Vec<DatasetRevision> {
        let mut revisions: Vec<DatasetRevision> = self
            .shared
            .tables
            .lock()
            .revisions
            .values()
            .filter(|r| r.dataset_id == dataset_id)
            .cloned()
            .collect();
        revisions.extend(
            self.revisions
                .iter()
                .filter(|r| r.dataset_id == dataset_id)
                .cloned(),
        );
        revisions.sort_by_key(|r| r.revision);
        revisions
    }

    /// Unique constraints, checked against what other transactions committed
    /// since these rows were staged.
    fn unique_violation(&self, tables: &Tables) -> Option<String> {
        for staged in self.datasets.values() {
            let clash = tables.datasets.values().any(|d| {
                d.id != staged.id
                    && (d.accession == staged.accession
                        || (d.repository_id == staged.repository_id
                            && d.repository_dataset_id == staged.repository_dataset_id))
            });
            if clash {
                return Some(format!("dataset {} already exists", staged.accession));
            }
        }

        self.revisions.iter().find_map(|staged| {
            tables
                .revisions
                .values()
                .any(|r| r.dataset_id == staged.dataset_id && r.revision == staged.revision)
                .then(|| {
                    format!(
                        "revision {} of dataset {} already exists",
                        staged.revision, staged.dataset_id
                    )
                })
        })
    }

    fn finish(&mut self) {
        self.active = false;
        self.identifiers.clear();
        self.datasets.clear();
        self.revisions.clear();
        // Row locks are released last.
        self.guards.clear();
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn identifier_for_update(
        &mut self,
        prefix: &str,
    ) -> Result<Option<Identifier>, StoreError> {
        self.ensure_active()?;
        self.lock_row(format!("identifier:{prefix}")).await?;

        if let Some(staged) = self.identifiers.get(prefix) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.shared.tables.lock().identifiers.get(prefix).cloned())
    }

    async fn insert_identifier(&mut self, identifier: &Identifier) -> Result<(), StoreError> {
        self.ensure_active()?;
        let exists = self.identifiers.contains_key(&identifier.prefix)
            || self
                .shared
                .tables
                .lock()
                .identifiers
                .contains_key(&identifier.prefix);
        if exists {
            return Err(StoreError::Conflict(format!(
                "identifier prefix {} already exists",
                identifier.prefix
            )));
        }
        self.identifiers
            .insert(identifier.prefix.clone(), identifier.clone());
        Ok(())
    }

    async fn save_identifier(&mut self, identifier: &Identifier) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.identifiers
            .insert(identifier.prefix.clone(), identifier.clone());
        Ok(())
    }

    async fn find_dataset(
        &mut self,
        repository_id: &str,
        repository_dataset_id: &str,
    ) -> Result<Option<Dataset>, StoreError> {
        self.ensure_active()?;
        Ok(self.dataset_where(|d| {
            d.repository_id == repository_id && d.repository_dataset_id == repository_dataset_id
        }))
    }

    async fn dataset_by_accession(
        &mut self,
        accession: &str,
    ) -> Result<Option<Dataset>, StoreError> {
        self.ensure_active()?;
        Ok(self.dataset_where(|d| d.accession == accession))
    }

    async fn insert_dataset(&mut self, dataset: NewDataset) -> Result<Dataset, StoreError> {
        self.ensure_active()?;
        if self
            .dataset_where(|d| {
                d.accession == dataset.accession
                    || (d.repository_id == dataset.repository_id
                        && d.repository_dataset_id == dataset.repository_dataset_id)
            })
            .is_some()
        {
            return Err(StoreError::Conflict(format!(
                "dataset {} ({}/{}) already exists",
                dataset.accession, dataset.repository_id, dataset.repository_dataset_id
            )));
        }

        let row = Dataset {
            id: self.shared.next_dataset_id.fetch_add(1, Ordering::SeqCst),
            accession: dataset.accession,
            repository_id: dataset.repository_id,
            repository_dataset_id: dataset.repository_dataset_id,
            revision: 0,
            revision_datetime: None,
            status: dataset.status,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.datasets.insert(row.id, row.clone());
        Ok(row)
    }

    async fn dataset_for_update(
        &mut self,
        repository_id: &str,
        accession: &str,
    ) -> Result<Option<Dataset>, StoreError> {
        self.ensure_active()?;
        let Some(found) =
            self.dataset_where(|d| d.accession == accession && d.repository_id == repository_id)
        else {
            return Ok(None);
        };

        self.lock_row(format!("dataset:{}", found.id)).await?;

        // Re-read: the row may have been updated while we waited for the lock.
        let id = found.id;
        Ok(self.dataset_where(|d| d.id == id))
    }

    async fn save_dataset(&mut self, dataset: &Dataset) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.datasets.insert(dataset.id, dataset.clone());
        Ok(())
    }

    async fn max_revision(&mut self, dataset_id: i64) -> Result<Option<i64>, StoreError> {
        self.ensure_active()?;
        Ok(self
            .all_revisions(dataset_id)
            .iter()
            .map(|r| r.revision)
            .max())
    }

    async fn revision(
        &mut self,
        dataset_id: i64,
        revision: i64,
    ) -> Result<Option<DatasetRevision>, StoreError> {
        self.ensure_active()?;
        Ok(self
            .all_revisions(dataset_id)
            .into_iter()
            .find(|r| r.revision == revision))
    }

    async fn revisions(&mut self, dataset_id: i64) -> Result<Vec<DatasetRevision>, StoreError> {
        self.ensure_active()?;
        Ok(self.all_revisions(dataset_id))
    }

    async fn insert_revision(
        &mut self,
        revision: NewRevision,
    ) -> Result<DatasetRevision, StoreError> {
        self.ensure_active()?;
        if self
            .all_revisions(revision.dataset_id)
            .iter()
            .any(|r| r.revision == revision.revision)
        {
            return Err(StoreError::Conflict(format!(
                "revision {} of dataset {} already exists",
                revision.revision, revision.dataset_id
            )));
        }

        let row = DatasetRevision {
            id: self.shared.next_revision_id.fetch_add(1, Ordering::SeqCst),
            dataset_id: revision.dataset_id,
            revision: revision.revision,
            revision_datetime: revision.revision_datetime,
            task_id: revision.task_id,
            description: revision.description,
            file_sha256: revision.file_sha256,
            repository_revision: revision.repository_revision,
            status: revision.status,
        };
        self.revisions.push(row.clone());
        Ok(row)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.ensure_active()?;

        let shared = self.shared.clone();
        let mut tables = shared.tables.lock();
        if let Some(message) = self.unique_violation(&tables) {
            drop(tables);
            self.finish();
            return Err(StoreError::Conflict(message));
        }

        for (prefix, identifier) in std::mem::take(&mut self.identifiers) {
            tables.identifiers.insert(prefix, identifier);
        }
        for (id, dataset) in std::mem::take(&mut self.datasets) {
            tables.datasets.insert(id, dataset);
        }
        for revision in std::mem::take(&mut self.revisions) {
            tables.revisions.insert(revision.id, revision);
        }
        drop(tables);

        self.finish();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.ensure_active()?;
        self.finish();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.active {
            let staged = self.identifiers.len() + self.datasets.len() + self.revisions.len();
            if staged > 0 {
                tracing::debug!("Transaction dropped, discarding {} staged rows", staged);
            }
            self.finish();
        }
    }
}
