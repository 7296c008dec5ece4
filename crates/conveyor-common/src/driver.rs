//! Build driver interface.
//!
//! A driver receives a configuration together with the connection info of its
//! isolated workspace and runs the build somewhere. Completion is reported exactly once
//! through a one-shot channel; cancellation travels the other way on an independent
//! token.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::model::{Configuration, TaskId};
use crate::store::RepositoryConfiguration;

/// What a driver needs to run one build.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub task: TaskId,
    pub configuration: Configuration,
    pub repository: RepositoryConfiguration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Success,
    Failed,
}

/// The single completion event of a dispatched build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedBuild {
    pub status: DriverStatus,
    pub log_reference: String,
}

impl CompletedBuild {
    pub fn success(log_reference: impl Into<String>) -> Self {
        Self {
            status: DriverStatus::Success,
            log_reference: log_reference.into(),
        }
    }

    pub fn failed(log_reference: impl Into<String>) -> Self {
        Self {
            status: DriverStatus::Failed,
            log_reference: log_reference.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("Failed to dispatch build: {0}")]
    Dispatch(String),

    #[error("Lost contact with running build: {0}")]
    Transport(String),

    #[error("Build driver dropped the completion channel without reporting")]
    Disconnected,
}

/// Driver side of a running build: report completion once, watch for cancellation.
pub struct CompletionSender {
    sender: oneshot::Sender<Result<CompletedBuild, DriverError>>,
    cancel: CancellationToken,
}

impl CompletionSender {
    /// Report the outcome. Consumes the sender so it can only fire once.
    pub fn complete(self, outcome: Result<CompletedBuild, DriverError>) {
        // The receiver may already be gone if the task was cancelled.
        let _ = self.sender.send(outcome);
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Orchestrator side of a running build.
pub struct RunningBuild {
    completion: oneshot::Receiver<Result<CompletedBuild, DriverError>>,
    cancel: CancellationToken,
}

impl RunningBuild {
    /// Create a connected pair for a freshly dispatched build.
    pub fn pending() -> (CompletionSender, RunningBuild) {
        let (sender, completion) = oneshot::channel();
        let cancel = CancellationToken::new();
        (
            CompletionSender {
                sender,
                cancel: cancel.clone(),
            },
            RunningBuild { completion, cancel },
        )
    }

    /// Wait for the completion event. Cancel safe; may be polled again after a
    /// `select!` picks another branch.
    pub async fn completion(&mut self) -> Result<CompletedBuild, DriverError> {
        match (&mut self.completion).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DriverError::Disconnected),
        }
    }

    /// Ask the driver to stop the build. Best effort.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
pub trait BuildDriver: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<RunningBuild, DriverError>;
}
