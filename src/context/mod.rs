//! Request Context Propagation
//!
//! Diagnostic fields of the request being served (user, route, resource,
//! client, correlation id, task id) live in a task-local slot. They are read by
//! logging and copied into task params on dispatch, then re-installed on the
//! executing side so logs emitted by a worker or a background thread still
//! carry the identifiers of the request that started the work.

pub mod tracker;

pub use tracker::{RequestContext, RequestTracker, UNSET};
