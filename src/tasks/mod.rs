//! Registered Task Bodies
//!
//! The work the service defers to an executor, registered explicitly by
//! [`register_all`] at startup. Bodies receive their collaborators through
//! [`TaskDeps`], captured at registration time.
//!
//! | Task | Queue |
//! |------|-------|
//! | `tasks.submission.add_submission_task` | `submission` |
//! | `tasks.validation.validate_announcement_file_task` | `submission` |
//! | `tasks.validation.validate_dataset_file_task` | `submission` |
//! | `tasks.ping.ping_task` | `common` |

pub mod models;
pub mod ping;
pub mod submission;
pub mod submit;
pub mod validation;

pub use models::{FileValidationModel, RevisionModel};
pub use submit::{submit_file_validation, submit_revision};
pub use validation::{FileValidator, RequiredFieldsValidator, ValidationKind};

use crate::allocation::RevisionAllocator;
use crate::executor::{TaskDescription, TaskError, TaskInvocation, TaskRegistry};
use crate::storage::{CacheService, Database};

use anyhow::Result;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Default app name the tasks are registered under.
pub const APP_NAME: &str = "hub";
pub const SUBMISSION_QUEUE: &str = "submission";
pub const COMMON_QUEUE: &str = "common";

/// Collaborators shared by all task bodies.
pub struct TaskDeps {
    pub cache: Arc<dyn CacheService>,
    pub revisions: RevisionAllocator,
    pub announcement_validator: Arc<dyn FileValidator>,
    pub dataset_validator: Arc<dyn FileValidator>,
}

impl TaskDeps {
    /// Dependencies with the built-in required-field validators.
    pub fn new(cache: Arc<dyn CacheService>, db: Arc<dyn Database>) -> Self {
        Self {
            cache,
            revisions: RevisionAllocator::new(db),
            announcement_validator: Arc::new(RequiredFieldsValidator::announcement()),
            dataset_validator: Arc::new(RequiredFieldsValidator::dataset_file()),
        }
    }

    pub fn with_validators(
        mut self,
        announcement: Arc<dyn FileValidator>,
        dataset_file: Arc<dyn FileValidator>,
    ) -> Self {
        self.announcement_validator = announcement;
        self.dataset_validator = dataset_file;
        self
    }
}

/// Descriptions of the registered tasks, handed to request-side code.
#[derive(Debug, Clone)]
pub struct TaskCatalog {
    pub add_submission: TaskDescription,
    pub validate_announcement_file: TaskDescription,
    pub validate_dataset_file: TaskDescription,
    pub ping: TaskDescription,
}

/// Dotted task name relative to the crate root (`tasks.ping.ping_task`).
fn task_name(module_path: &str, function: &str) -> String {
    let relative = module_path
        .strip_prefix(concat!(env!("CARGO_CRATE_NAME"), "::"))
        .unwrap_or(module_path);
    TaskDescription::qualified_name(relative, function)
}

fn register<F, Fut>(
    registry: &TaskRegistry,
    app_name: &str,
    deps: &Arc<TaskDeps>,
    queue: &str,
    name: String,
    body: F,
) -> Result<TaskDescription, TaskError>
where
    F: Fn(Arc<TaskDeps>, TaskInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    let deps = deps.clone();
    registry.register(app_name, queue, &name, move |invocation| {
        body(deps.clone(), invocation)
    })
}

/// Registers every task body of the crate under `app_name`. The caller
/// seals the registry.
pub fn register_all(
    registry: &TaskRegistry,
    app_name: &str,
    deps: Arc<TaskDeps>,
) -> Result<TaskCatalog, TaskError> {
    let catalog = TaskCatalog {
        add_submission: register(
            registry,
            app_name,
            &deps,
            SUBMISSION_QUEUE,
            task_name(submission::MODULE, "add_submission_task"),
            submission::add_submission_task,
        )?,
        validate_announcement_file: register(
            registry,
            app_name,
            &deps,
            SUBMISSION_QUEUE,
            task_name(validation::MODULE, "validate_announcement_file_task"),
            validation::validate_announcement_file_task,
        )?,
        validate_dataset_file: register(
            registry,
            app_name,
            &deps,
            SUBMISSION_QUEUE,
            task_name(validation::MODULE, "validate_dataset_file_task"),
            validation::validate_dataset_file_task,
        )?,
        ping: register(
            registry,
            app_name,
            &deps,
            COMMON_QUEUE,
            task_name(ping::MODULE, "ping_task"),
            ping::ping_task,
        )?,
    };

    tracing::info!(
        "{} tasks registered for app '{}'",
        registry.tasks_for(app_name).len(),
        app_name
    );
    Ok(catalog)
}
