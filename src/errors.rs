//! Typed error hierarchy for the orchestration core.
//!
//! One enum or struct per failure class:
//! - `GraphError`: submission-time configuration errors (cycles, unknown ids)
//! - `WorkspaceProvisioningError`: a store tier could not be set up
//! - `BuildExecutionError`: the driver reported failure or could not be reached
//! - `PromotionError`: outputs or imports could not be promoted, with an optional
//!   nested `RollbackError`
//! - `CleanupError`: teardown failures; logged, never decisive

use conveyor_common::{
    CatalogError, ConfigurationId, DriverError, PromoteRequest, StoreError, StoreKey, TaskId,
};
use std::fmt;
use thiserror::Error;

use crate::dag::TaskState;
use crate::repository::StoreTier;

/// Errors raised while expanding a configuration graph into build tasks.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Cyclic dependency between configurations: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<ConfigurationId> },

    #[error("Configuration {id} does not exist{}", referenced_by_suffix(.referenced_by))]
    UnknownConfiguration {
        id: ConfigurationId,
        referenced_by: Option<ConfigurationId>,
    },

    #[error("Failed to load configuration {id}: {source}")]
    Catalog {
        id: ConfigurationId,
        #[source]
        source: CatalogError,
    },
}

fn format_cycle(cycle: &[ConfigurationId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn referenced_by_suffix(referenced_by: &Option<ConfigurationId>) -> String {
    match referenced_by {
        Some(parent) => format!(" (referenced by {})", parent),
        None => String::new(),
    }
}

/// A task was asked to move to a state its current state cannot reach.
#[derive(Debug, Clone, Error)]
#[error("Illegal transition for task {task}: {from} -> {to}")]
pub struct TransitionError {
    pub task: TaskId,
    pub from: TaskState,
    pub to: TaskState,
}

/// A store tier needed by the build workspace could not be created.
#[derive(Debug, Error)]
#[error("Failed to set up {tier} store {store}: {source}")]
pub struct WorkspaceProvisioningError {
    pub tier: StoreTier,
    pub store: StoreKey,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Error)]
pub enum BuildExecutionError {
    #[error("Build could not be dispatched: {0}")]
    Dispatch(#[source] DriverError),

    #[error("Build driver transport fault: {0}")]
    Transport(#[source] DriverError),

    #[error("Build failed (log: {log_reference})")]
    Failed { log_reference: String },
}

/// Raised when a failed promotion could not be rolled back either.
#[derive(Debug, Clone, Error)]
#[error("promotion rollback also failed: {reason}")]
pub struct RollbackError {
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("Failed to retrieve tracking report for {session}: {source}")]
    TrackingReport {
        session: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to promote {request}: {source}")]
    Transport {
        request: PromoteRequest,
        #[source]
        source: StoreError,
    },

    #[error("Failed to promote {request}. Reason given was: {reason}{}", rollback_suffix(.rollback))]
    Rejected {
        request: PromoteRequest,
        reason: String,
        rollback: Option<RollbackError>,
    },
}

fn rollback_suffix(rollback: &Option<RollbackError>) -> String {
    match rollback {
        Some(err) => format!("; {}", err),
        None => String::new(),
    }
}

impl PromotionError {
    pub fn rollback_error(&self) -> Option<&RollbackError> {
        match self {
            PromotionError::Rejected { rollback, .. } => rollback.as_ref(),
            _ => None,
        }
    }
}

/// Teardown of a build workspace failed in one or more steps.
#[derive(Debug, Error)]
pub struct CleanupError {
    pub build_id: String,
    pub failures: Vec<String>,
}

impl fmt::Display for CleanupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to clean up build workspace {}: {}",
            self.build_id,
            self.failures.join("; ")
        )
    }
}

/// Errors surfaced by the coordinator's upward API.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Submission {0} not found")]
    SubmissionNotFound(String),
}
