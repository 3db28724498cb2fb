//! Storage Collaborators
//!
//! The two stores the task subsystem and the allocator lean on.
//!
//! ## Core Concepts
//! - **Cache**: a shared key-value store with per-key expiry. Holds single-flight
//!   lock keys and is shared by request handlers and workers.
//! - **Relational store**: transactional sessions with row-locking reads. One
//!   session per unit of work, never held long-term.
//!
//! ## Backends
//! - `MemoryCache` / `MemoryDatabase`: in-process, for local mode and tests.
//! - `RedisCache` (feature `redis`), `SqliteDatabase` (feature `sqlite`).

pub mod cache;
pub mod database;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use cache::{CacheError, CacheService, CacheTtl, MemoryCache};
pub use database::{
    Database, Dataset, DatasetRevision, DatasetStatus, Identifier, NewDataset, NewRevision,
    RevisionStatus, StoreError, Transaction,
};
pub use memory::MemoryDatabase;

#[cfg(test)]
mod tests;
