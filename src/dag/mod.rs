//! Task graph construction and execution.
//!
//! A build request names one root configuration. The graph is expanded into a
//! [`Submission`] with one task per configuration that needs building, and the
//! [`SubmissionExecutor`] runs those tasks in dependency order.
//!
//! ## Architecture
//!
//! 1. **Builder** - loads the configuration graph from the catalog and expands it into tasks
//! 2. **Scheduler** - the task table: readiness, state transitions and failure propagation
//! 3. **Executor** - runs ready tasks concurrently through provisioning, build and promotion
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use conveyor::catalog::MemoryCatalog;
//! use conveyor::dag::{GraphBuilder, Submission};
//! use conveyor_common::{Configuration, ProductVersion, SubmissionId};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let catalog = Arc::new(MemoryCatalog::with_configurations([
//!     Configuration::new("core", "core"),
//!     Configuration::new("api", "api").with_dependencies(["core"]),
//!     Configuration::new("cli", "cli").with_dependencies(["core"]),
//!     Configuration::new("app", "app").with_dependencies(["api", "cli"]),
//! ]));
//!
//! let mut submission = Submission::new(SubmissionId::new(), ProductVersion::new("suite", "1.0"));
//! GraphBuilder::new(catalog).build(&"app".into(), &mut submission).await?;
//!
//! // Wave 0: [core]
//! // Wave 1: [api, cli]
//! // Wave 2: [app]
//! let waves = submission.compute_waves();
//! # Ok(())
//! # }
//! ```

mod builder;
mod executor;
mod scheduler;
mod state;

pub use builder::{ConfigurationGraph, GraphBuilder};
pub use executor::{ExecutorContext, SubmissionExecutor};
pub use scheduler::{BuildTask, SchedulerConfig, SharedSubmission, Submission, lock};
pub use state::{
    FailureKind, FailureReport, SubmissionSnapshot, SubmissionStatus, TaskEvent, TaskFailure,
    TaskSnapshot, TaskState,
};
