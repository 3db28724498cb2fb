//! Identifier and Revision Allocation
//!
//! Hands out accession numbers and per-dataset revision numbers under
//! concurrent submission.
//!
//! ## Components
//! - **`lock`**: the cache-backed single-flight lock that refuses a second
//!   dispatch for a resource while one is in flight.
//! - **`identifier`**: accession allocation under a row lock on the prefix's
//!   counter.
//! - **`revision`**: revision allocation under a row lock on the dataset.
//!
//! Allocation failures always roll the transaction back before returning, so
//! no accession or revision is ever issued partially.

pub mod error;
pub mod identifier;
pub mod lock;
pub mod revision;

pub use error::AllocationError;
pub use identifier::{AccessionFormat, IdentifierAllocator};
pub use lock::{DEFAULT_LOCK_TTL, LockMode, SingleFlightLock};
pub use revision::{RevisionAllocator, RevisionRequest};

use crate::storage::Transaction;

/// Rolls `tx` back and hands the original failure back to the caller.
async fn abort(tx: Box<dyn Transaction>, error: AllocationError) -> AllocationError {
    tracing::warn!("Allocation rolled back: {}", error);
    if let Err(e) = tx.rollback().await {
        tracing::error!("Rollback failed: {}", e);
    }
    error
}

#[cfg(test)]
mod tests;
