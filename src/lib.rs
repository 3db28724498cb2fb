//! Dataset Hub Task Core
//!
//! This library crate holds the asynchronous task subsystem of a dataset
//! registration service and the allocation logic its tasks rely on.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`executor`**: the task engine. A sealed registry of task bodies, a
//!   broker-backed queue executor with a leasing worker pool, and an
//!   in-process executor running each task on its own thread.
//! - **`context`**: request diagnostics (user, route, correlation id) that
//!   follow a task from the request that started it into its body and logs.
//! - **`storage`**: the collaborator contracts (key-value cache, relational
//!   store) with in-memory, SQLite and Redis implementations.
//! - **`allocation`**: the cache single-flight lock and the row-locking
//!   accession and revision allocators.
//! - **`tasks`**: the registered task bodies and their request-side helpers.
//! - **`config`** / **`app`** / **`logging`**: node settings, assembly and
//!   log output.

pub mod allocation;
pub mod app;
pub mod config;
pub mod context;
pub mod executor;
pub mod logging;
pub mod storage;
pub mod tasks;
