//! SQLite relational store.
//!
//! SQLite locks whole databases, not rows: a transaction holds the connection
//! from `BEGIN IMMEDIATE` until it ends, so `*_for_update` reads are plain
//! selects and writers are serialized by the connection lock.

use super::database::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS identifiers (
    prefix      TEXT PRIMARY KEY,
    last_value  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS datasets (
    id                     INTEGER PRIMARY KEY AUTOINCREMENT,
    accession              TEXT NOT NULL UNIQUE,
    repository_id          TEXT NOT NULL,
    repository_dataset_id  TEXT NOT NULL,
    revision               INTEGER NOT NULL DEFAULT 0,
    revision_datetime      TEXT,
    status                 INTEGER NOT NULL DEFAULT 0,
    created_at             TEXT NOT NULL,
    updated_at             TEXT,
    UNIQUE (repository_id, repository_dataset_id)
);

CREATE TABLE IF NOT EXISTS dataset_revisions (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset_id           INTEGER NOT NULL REFERENCES datasets (id),
    revision             INTEGER NOT NULL,
    revision_datetime    TEXT NOT NULL,
    task_id              TEXT NOT NULL,
    description          TEXT NOT NULL,
    file_sha256          TEXT NOT NULL,
    repository_revision  TEXT,
    status               INTEGER NOT NULL DEFAULT 1,
    UNIQUE (dataset_id, revision)
);
"#;

const DATASET_COLUMNS: &str = "id, accession, repository_id, repository_dataset_id, revision, \
     revision_datetime, status, created_at, updated_at";

const REVISION_COLUMNS: &str = "id, dataset_id, revision, revision_datetime, task_id, \
     description, file_sha256, repository_revision, status";

fn backend(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::SqliteFailure(code, message)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(message.unwrap_or_else(|| code.to_string()))
        }
        other => StoreError::Backend(other.to_string()),
    }
}

fn dataset_from_row(row: &Row<'_>) -> rusqlite::Result<Dataset> {
    let status: i64 = row.get(6)?;
    Ok(Dataset {
        id: row.get(0)?,
        accession: row.get(1)?,
        repository_id: row.get(2)?,
        repository_dataset_id: row.get(3)?,
        revision: row.get(4)?,
        revision_datetime: row.get::<_, Option<DateTime<Utc>>>(5)?,
        status: DatasetStatus::from_i64(status).unwrap_or(DatasetStatus::Invalid),
        created_at: row.get(7)?,
        updated_at: row.get::<_, Option<DateTime<Utc>>>(8)?,
    })
}

fn revision_from_row(row: &Row<'_>) -> rusqlite::Result<DatasetRevision> {
    let status: i64 = row.get(8)?;
    Ok(DatasetRevision {
        id: row.get(0)?,
        dataset_id: row.get(1)?,
        revision: row.get(2)?,
        revision_datetime: row.get(3)?,
        task_id: row.get(4)?,
        description: row.get(5)?,
        file_sha256: row.get(6)?,
        repository_revision: row.get(7)?,
        status: RevisionStatus::from_i64(status).unwrap_or(RevisionStatus::Invalid),
    })
}

#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    location: String,
    lock_timeout: Duration,
}

impl SqliteDatabase {
    /// Opens (or creates) a database file and applies the schema.
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self, StoreError> {
        let location = path.as_ref().display().to_string();
        let conn = Connection::open(path).map_err(backend)?;
        Self::init(conn, location, lock_timeout)
    }

    pub fn open_in_memory(lock_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::init(conn, ":memory:".to_string(), lock_timeout)
    }

    fn init(conn: Connection, location: String, lock_timeout: Duration) -> Result<Self, StoreError> {
        conn.busy_timeout(lock_timeout).map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        for prefix in DEFAULT_IDENTIFIER_PREFIXES {
            conn.execute(
                "INSERT OR IGNORE INTO identifiers (prefix, last_value) VALUES (?1, 0)",
                params![prefix],
            )
            .map_err(backend)?;
        }

        tracing::info!("SQLite store ready at {}", location);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location,
            lock_timeout,
        })
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let waited = self.lock_timeout;
        let conn = tokio::time::timeout(waited, self.conn.clone().lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout {
                resource: format!("sqlite:{}", self.location),
                waited,
            })?;

        conn.execute_batch("BEGIN IMMEDIATE").map_err(backend)?;
        Ok(Box::new(SqliteTransaction {
            conn,
            active: true,
        }))
    }

    fn describe(&self) -> String {
        format!("sqlite://{}", self.location)
    }
}

pub struct SqliteTransaction {
    conn: OwnedMutexGuard<Connection>,
    active: bool,
}

impl SqliteTransaction {
    fn conn(&self) -> Result<&Connection, StoreError> {
        if self.active {
            Ok(&self.conn)
        } else {
            Err(StoreError::Inactive)
        }
    }

    fn end(&mut self, statement: &str) -> Result<(), StoreError> {
        let result = self.conn()?.execute_batch(statement).map_err(backend);
        self.active = false;
        result
    }

    fn select_dataset(
        &self,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<Dataset>, StoreError> {
        let sql = format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE {clause} LIMIT 1");
        self.conn()?
            .query_row(&sql, args, dataset_from_row)
            .optional()
            .map_err(backend)
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn identifier_for_update(
        &mut self,
        prefix: &str,
    ) -> Result<Option<Identifier>, StoreError> {
        self.conn()?
            .query_row(
                "SELECT prefix, last_value FROM identifiers WHERE prefix = ?1",
                params![prefix],
                |row| {
                    Ok(Identifier {
                        prefix: row.get(0)?,
                        last_value: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(backend)
    }

    async fn insert_identifier(&mut self, identifier: &Identifier) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO identifiers (prefix, last_value) VALUES (?1, ?2)",
                params![identifier.prefix, identifier.last_value],
            )
            .map_err(backend)?;
        Ok(())
    }

    async fn save_identifier(&mut self, identifier: &Identifier) -> Result<(), StoreError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE identifiers SET last_value = ?2 WHERE prefix = ?1",
                params![identifier.prefix, identifier.last_value],
            )
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "identifier",
                key: identifier.prefix.clone(),
            });
        }
        Ok(())
    }

    async fn find_dataset(
        &mut self,
        repository_id: &str,
        repository_dataset_id: &str,
    ) -> Result<Option<Dataset>, StoreError> {
        self.select_dataset(
            "repository_id = ?1 AND repository_dataset_id = ?2",
            params![repository_id, repository_dataset_id],
        )
    }

    async fn dataset_by_accession(
        &mut self,
        accession: &str,
    ) -> Result<Option<Dataset>, StoreError> {
        self.select_dataset("accession = ?1", params![accession])
    }

    async fn insert_dataset(&mut self, dataset: NewDataset) -> Result<Dataset, StoreError> {
        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO datasets (accession, repository_id, repository_dataset_id, revision, \
             status, created_at) VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            params![
                dataset.accession,
                dataset.repository_id,
                dataset.repository_dataset_id,
                dataset.status.as_i64(),
                now
            ],
        )
        .map_err(backend)?;

        Ok(Dataset {
            id: conn.last_insert_rowid(),
            accession: dataset.accession,
            repository_id: dataset.repository_id,
            repository_dataset_id: dataset.repository_dataset_id,
            revision: 0,
            revision_datetime: None,
            status: dataset.status,
            created_at: now,
            updated_at: None,
        })
    }

    async fn dataset_for_update(
        &mut self,
        repository_id: &str,
        accession: &str,
    ) -> Result<Option<Dataset>, StoreError> {
        self.select_dataset(
            "accession = ?1 AND repository_id = ?2",
            params![accession, repository_id],
        )
    }

    async fn save_dataset(&mut self, dataset: &Dataset) -> Result<(), StoreError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE datasets SET revision = ?2, revision_datetime = ?3, status = ?4, \
                 updated_at = ?5 WHERE id = ?1",
                params![
                    dataset.id,
                    dataset.revision,
                    dataset.revision_datetime,
                    dataset.status.as_i64(),
                    dataset.updated_at
                ],
            )
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "dataset",
                key: dataset.accession.clone(),
            });
        }
        Ok(())
    }

    async fn max_revision(&mut self, dataset_id: i64) -> Result<Option<i64>, StoreError> {
        self.conn()?
            .query_row(
                "SELECT MAX(revision) FROM dataset_revisions WHERE dataset_id = ?1",
                params![dataset_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .map_err(backend)
    }

    async fn revision(
        &mut self,
        dataset_id: i64,
        revision: i64,
    ) -> Result<Option<DatasetRevision>, StoreError> {
        let sql = format!(
            "SELECT {REVISION_COLUMNS} FROM dataset_revisions WHERE dataset_id = ?1 AND revision = ?2"
        );
        self.conn()?
            .query_row(&sql, params![dataset_id, revision], revision_from_row)
            .optional()
            .map_err(backend)
    }

    async fn revisions(&mut self, dataset_id: i64) -> Result<Vec<DatasetRevision>, StoreError> {
        let sql = format!(
            "SELECT {REVISION_COLUMNS} FROM dataset_revisions WHERE dataset_id = ?1 ORDER BY revision"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = stmt
            .query_map(params![dataset_id], revision_from_row)
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    async fn insert_revision(
        &mut self,
        revision: NewRevision,
    ) -> Result<DatasetRevision, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO dataset_revisions (dataset_id, revision, revision_datetime, task_id, \
             description, file_sha256, repository_revision, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                revision.dataset_id,
                revision.revision,
                revision.revision_datetime,
                revision.task_id,
                revision.description,
                revision.file_sha256,
                revision.repository_revision,
                revision.status.as_i64()
            ],
        )
        .map_err(backend)?;

        Ok(DatasetRevision {
            id: conn.last_insert_rowid(),
            dataset_id: revision.dataset_id,
            revision: revision.revision,
            revision_datetime: revision.revision_datetime,
            task_id: revision.task_id,
            description: revision.description,
            file_sha256: revision.file_sha256,
            repository_revision: revision.repository_revision,
            status: revision.status,
        })
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.end("COMMIT")
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.end("ROLLBACK")
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.end("ROLLBACK") {
                tracing::warn!("Failed to roll back dropped transaction: {}", e);
            }
        }
    }
}
