//! Asynchronous Task Executor Module
//!
//! Lets request-handling code hand long-running work (file validation,
//! revision creation) to a background executor, track it, read its result
//! and cancel it, without knowing which executor runs it.
//!
//! ## Architecture Overview
//! 1. **Registration**: task bodies are registered once at startup into a
//!    sealed [`registry::TaskRegistry`], grouped by app and routed to a queue.
//! 2. **Dispatch**: an [`service::AsyncTaskService`] turns a registered task
//!    and its params into an executor; starting it yields a
//!    [`service::TaskResult`].
//! 3. **Execution**: either a pull-based worker pool behind a broker
//!    (`distributed` + `worker`), or a dedicated OS thread per task (`thread`).
//! 4. **Leasing**: a worker claims a message with a lease and acknowledges it
//!    only after the result is stored. If the worker dies, the lease expires
//!    and another worker retries the task (at-least-once semantics).
//!
//! ## Submodules
//! - **`registry`**: maps (app, task name) to executable Rust closures.
//! - **`service`**: the shared contract and the backend sum types.
//! - **`queue`**: broker and result backend contracts, in-memory implementation.
//! - **`distributed`** / **`worker`**: the queue executor and its worker pool.
//! - **`thread`**: the in-process executor.
//! - **`protocol`**: payloads exchanged with the broker and handed to callers.

pub mod distributed;
pub mod error;
pub mod protocol;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis;
pub mod registry;
pub mod service;
pub mod thread;
pub mod types;
pub mod worker;

pub use error::TaskError;
pub use registry::{TaskDescription, TaskInvocation, TaskRegistry};
pub use service::{AsyncTaskService, IdGenerator, TaskBackend, TaskExecutor, TaskResult};
pub use types::{TaskId, TaskOutcome, TaskParams, TaskStatus};
