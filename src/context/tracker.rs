use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::future::Future;

/// Sentinel value for a diagnostic field with no value.
pub const UNSET: &str = "-";

fn unset() -> String {
    UNSET.to_string()
}

/// Per-request diagnostic fields carried across the task boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default = "unset")]
    pub user_id: String,
    #[serde(default = "unset")]
    pub route_path: String,
    #[serde(default = "unset")]
    pub resource_id: String,
    #[serde(default = "unset")]
    pub client: String,
    #[serde(default = "unset", alias = "request_id")]
    pub correlation_id: String,
    #[serde(default = "unset")]
    pub task_id: String,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            user_id: unset(),
            route_path: unset(),
            resource_id: unset(),
            client: unset(),
            correlation_id: unset(),
            task_id: unset(),
        }
    }
}

impl RequestContext {
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_route_path(mut self, route_path: impl Into<String>) -> Self {
        self.route_path = route_path.into();
        self
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = resource_id.into();
        self
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    /// Replaces blank fields with the sentinel.
    pub fn normalized(mut self) -> Self {
        for field in [
            &mut self.user_id,
            &mut self.route_path,
            &mut self.resource_id,
            &mut self.client,
            &mut self.correlation_id,
            &mut self.task_id,
        ] {
            if field.trim().is_empty() {
                *field = unset();
            }
        }
        self
    }

    /// A span carrying every field, so events emitted inside it (including on
    /// a worker) are tagged with the originating request.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "request",
            user_id = %self.user_id,
            route = %self.route_path,
            resource_id = %self.resource_id,
            client = %self.client,
            correlation_id = %self.correlation_id,
            task_id = %self.task_id,
        )
    }
}

tokio::task_local! {
    static CURRENT_CONTEXT: RefCell<RequestContext>;
}

/// Access point for the context of the currently executing request or task.
///
/// Every scope owns its own copy, so concurrent requests never observe each
/// other's values. Outside of a scope all reads return the sentinel context.
pub struct RequestTracker;

impl RequestTracker {
    /// Runs `fut` with a fresh copy of `context` installed.
    pub async fn scope<F: Future>(context: RequestContext, fut: F) -> F::Output {
        CURRENT_CONTEXT
            .scope(RefCell::new(context.normalized()), fut)
            .await
    }

    /// Synchronous variant of [`RequestTracker::scope`].
    pub fn sync_scope<R>(context: RequestContext, f: impl FnOnce() -> R) -> R {
        CURRENT_CONTEXT.sync_scope(RefCell::new(context.normalized()), f)
    }

    pub fn is_active() -> bool {
        CURRENT_CONTEXT.try_with(|_| ()).is_ok()
    }

    /// Snapshot of the current context. Never fails.
    pub fn current() -> RequestContext {
        CURRENT_CONTEXT
            .try_with(|context| context.borrow().clone())
            .unwrap_or_default()
    }

    /// Overwrites all fields of the current scope. Returns `false` (and changes
    /// nothing) outside of a scope.
    pub fn update(context: RequestContext) -> bool {
        let context = context.normalized();
        CURRENT_CONTEXT
            .try_with(|current| *current.borrow_mut() = context)
            .is_ok()
    }

    pub fn reset() -> bool {
        Self::update(RequestContext::default())
    }

    pub fn set_task_id(task_id: &str) -> bool {
        let task_id = if task_id.trim().is_empty() {
            unset()
        } else {
            task_id.to_string()
        };
        CURRENT_CONTEXT
            .try_with(|current| current.borrow_mut().task_id = task_id)
            .is_ok()
    }
}
