//! Task lifecycle states and submission-level summaries.
//!
//! A task moves forward through
//! `New → WaitingOnDependencies → WorkspaceProvisioning → Dispatched → Promoting → Success`
//! and may end early in one of the failure states or `Cancelled`.

use chrono::{DateTime, Utc};
use conveyor_common::{BuildRecordId, ConfigurationId, SubmissionId, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a build task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created during graph expansion
    #[default]
    New,
    /// Waiting for every dependency to reach `Success`
    WaitingOnDependencies,
    /// Build stores are being created
    WorkspaceProvisioning,
    /// Handed to the build driver, awaiting completion
    Dispatched,
    /// Build succeeded, outputs and imports are being promoted
    Promoting,
    /// Build and promotion succeeded
    Success,
    /// Workspace could not be set up; no build was attempted
    FailedWorkspace,
    /// Driver reported failure or could not be reached
    FailedBuild,
    /// Build succeeded but promotion failed
    FailedPromotion,
    /// Cancelled by the user or because a dependency did not succeed
    Cancelled,
}

impl TaskState {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::FailedWorkspace
                | Self::FailedBuild
                | Self::FailedPromotion
                | Self::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Terminal and not successful. Dependents of such a task are cancelled.
    pub fn is_unsuccessful(&self) -> bool {
        self.is_terminal() && !self.is_success()
    }

    /// Whether the task has left the waiting area and owns (or is creating) a workspace.
    pub fn has_started(&self) -> bool {
        matches!(
            self,
            Self::WorkspaceProvisioning | Self::Dispatched | Self::Promoting
        )
    }

    /// Check whether the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (New, WaitingOnDependencies)
                | (WaitingOnDependencies, WorkspaceProvisioning)
                | (WorkspaceProvisioning, Dispatched)
                | (WorkspaceProvisioning, FailedWorkspace)
                | (Dispatched, Promoting)
                | (Dispatched, FailedBuild)
                | (Promoting, Success)
                | (Promoting, FailedPromotion)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::WaitingOnDependencies => "waiting_on_dependencies",
            Self::WorkspaceProvisioning => "workspace_provisioning",
            Self::Dispatched => "dispatched",
            Self::Promoting => "promoting",
            Self::Success => "success",
            Self::FailedWorkspace => "failed_workspace",
            Self::FailedBuild => "failed_build",
            Self::FailedPromotion => "failed_promotion",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a task failure, as reported upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Workspace,
    Build,
    Promotion,
    Cancelled,
}

impl FailureKind {
    /// Terminal state a task lands in for this kind of failure.
    pub fn terminal_state(&self) -> TaskState {
        match self {
            FailureKind::Workspace => TaskState::FailedWorkspace,
            FailureKind::Build => TaskState::FailedBuild,
            FailureKind::Promotion => TaskState::FailedPromotion,
            FailureKind::Cancelled => TaskState::Cancelled,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Workspace => write!(f, "workspace_provisioning_error"),
            FailureKind::Build => write!(f, "build_execution_error"),
            FailureKind::Promotion => write!(f, "promotion_error"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One entry of a submission's event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Strictly increasing within a submission.
    pub sequence: u64,
    pub submission: SubmissionId,
    pub task: TaskId,
    pub configuration: ConfigurationId,
    pub state: TaskState,
    pub at: DateTime<Utc>,
}

/// Aggregate state of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// At least one task is not terminal
    Running,
    /// Every task succeeded
    Succeeded,
    /// Every task is terminal and at least one failed or was cancelled
    Failed,
}

impl SubmissionStatus {
    pub fn is_done(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionStatus::Running => write!(f, "running"),
            SubmissionStatus::Succeeded => write!(f, "succeeded"),
            SubmissionStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub configuration: ConfigurationId,
    pub state: TaskState,
    pub dependencies: Vec<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_record: Option<BuildRecordId>,
}

/// A failed or cancelled task, with enough context to locate the break in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub task: TaskId,
    pub configuration: ConfigurationId,
    pub kind: FailureKind,
    pub message: String,
}

/// Point-in-time view of a submission for the upward API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionSnapshot {
    pub id: SubmissionId,
    pub root: Option<TaskId>,
    pub status: SubmissionStatus,
    pub tasks: Vec<TaskSnapshot>,
    pub failures: Vec<FailureReport>,
}

impl SubmissionSnapshot {
    pub fn task(&self, id: TaskId) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_for(&self, configuration: &ConfigurationId) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|t| &t.configuration == configuration)
    }

    pub fn count_in(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::New.is_terminal());
        assert!(!TaskState::WaitingOnDependencies.is_terminal());
        assert!(!TaskState::Dispatched.is_terminal());
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::FailedWorkspace.is_terminal());
        assert!(TaskState::FailedBuild.is_terminal());
        assert!(TaskState::FailedPromotion.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn test_forward_path_is_allowed() {
        let path = [
            TaskState::New,
            TaskState::WaitingOnDependencies,
            TaskState::WorkspaceProvisioning,
            TaskState::Dispatched,
            TaskState::Promoting,
            TaskState::Success,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_skipping_phases_is_rejected() {
        assert!(!TaskState::WaitingOnDependencies.can_transition_to(TaskState::Dispatched));
        assert!(!TaskState::WorkspaceProvisioning.can_transition_to(TaskState::Promoting));
        assert!(!TaskState::Dispatched.can_transition_to(TaskState::Success));
        assert!(!TaskState::Dispatched.can_transition_to(TaskState::FailedWorkspace));
    }

    #[test]
    fn test_cancel_from_any_non_terminal_state() {
        for state in [
            TaskState::New,
            TaskState::WaitingOnDependencies,
            TaskState::WorkspaceProvisioning,
            TaskState::Dispatched,
            TaskState::Promoting,
        ] {
            assert!(state.can_transition_to(TaskState::Cancelled));
        }
        assert!(!TaskState::Success.can_transition_to(TaskState::Cancelled));
        assert!(!TaskState::FailedBuild.can_transition_to(TaskState::Cancelled));
    }

    #[test]
    fn test_failure_kind_maps_to_terminal_state() {
        assert_eq!(
            FailureKind::Promotion.terminal_state(),
            TaskState::FailedPromotion
        );
        assert_eq!(FailureKind::Cancelled.terminal_state(), TaskState::Cancelled);
        assert!(FailureKind::Workspace.terminal_state().is_unsuccessful());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&TaskState::WaitingOnDependencies).unwrap();
        assert_eq!(json, "\"waiting_on_dependencies\"");
        assert_eq!(TaskState::FailedPromotion.to_string(), "failed_promotion");
    }
}
