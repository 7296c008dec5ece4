//! Submission bookkeeping: the task table, readiness and failure propagation.
//!
//! A [`Submission`] owns every task created for one root build request. Its
//! configuration index is the deduplication map used during graph expansion; its
//! dependents index is the non-owning back-reference used to cancel everything
//! downstream of a failed task.

use chrono::Utc;
use conveyor_common::{
    BuildRecord, Configuration, ConfigurationId, ProductVersion, RepositoryConfiguration,
    SubmissionId, TaskId,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::dag::state::{
    FailureKind, FailureReport, SubmissionSnapshot, SubmissionStatus, TaskEvent, TaskFailure,
    TaskSnapshot, TaskState,
};
use crate::errors::TransitionError;

/// Configuration for the task scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum tasks holding a workspace at the same time
    pub max_parallel: usize,
    /// Build dependencies even when a successful record already exists
    pub rebuild_dependencies: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            rebuild_dependencies: false,
        }
    }
}

impl SchedulerConfig {
    /// Create a config with specific max parallelism.
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max;
        self
    }

    pub fn with_rebuild_dependencies(mut self, rebuild: bool) -> Self {
        self.rebuild_dependencies = rebuild;
        self
    }
}

/// One attempt to build a configuration within a submission.
#[derive(Debug, Clone)]
pub struct BuildTask {
    pub id: TaskId,
    pub configuration: Configuration,
    pub dependencies: Vec<TaskId>,
    pub state: TaskState,
    pub repository: Option<RepositoryConfiguration>,
    pub record: Option<BuildRecord>,
    pub failure: Option<TaskFailure>,
}

impl BuildTask {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            configuration: self.configuration.id.clone(),
            state: self.state,
            dependencies: self.dependencies.clone(),
            failure: self.failure.clone(),
            build_record: self.record.as_ref().map(|r| r.id),
        }
    }
}

/// Every task of one build request.
#[derive(Debug)]
pub struct Submission {
    id: SubmissionId,
    product: ProductVersion,
    root: Option<TaskId>,
    tasks: HashMap<TaskId, BuildTask>,
    /// Creation order; dependencies always precede their dependents
    order: Vec<TaskId>,
    by_configuration: HashMap<ConfigurationId, TaskId>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    events: Vec<TaskEvent>,
    next_sequence: u64,
    event_tx: Option<mpsc::UnboundedSender<TaskEvent>>,
}

/// A submission shared between its executor and the task lifecycles it spawns.
pub type SharedSubmission = Arc<Mutex<Submission>>;

/// Lock a shared submission. Critical sections never panic half-way through an
/// update, so a poisoned lock still guards consistent data.
pub fn lock(submission: &SharedSubmission) -> MutexGuard<'_, Submission> {
    submission
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Submission {
    pub fn new(id: SubmissionId, product: ProductVersion) -> Self {
        Self {
            id,
            product,
            root: None,
            tasks: HashMap::new(),
            order: Vec::new(),
            by_configuration: HashMap::new(),
            dependents: HashMap::new(),
            events: Vec::new(),
            next_sequence: 0,
            event_tx: None,
        }
    }

    /// Forward every recorded event to a channel as well.
    pub fn with_event_channel(mut self, tx: mpsc::UnboundedSender<TaskEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn into_shared(self) -> SharedSubmission {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> SubmissionId {
        self.id
    }

    pub fn product(&self) -> &ProductVersion {
        &self.product
    }

    pub fn root(&self) -> Option<TaskId> {
        self.root
    }

    pub fn set_root(&mut self, root: TaskId) {
        self.root = Some(root);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: TaskId) -> Option<&BuildTask> {
        self.tasks.get(&id)
    }

    /// Tasks in creation order (leaves first).
    pub fn tasks(&self) -> impl Iterator<Item = &BuildTask> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn task_for_configuration(&self, id: &ConfigurationId) -> Option<TaskId> {
        self.by_configuration.get(id).copied()
    }

    pub fn dependents(&self, id: TaskId) -> &[TaskId] {
        self.dependents.get(&id).map_or(&[], |v| v.as_slice())
    }

    pub fn events(&self) -> &[TaskEvent] {
        &self.events
    }

    /// Register a task for a configuration not yet present in this submission.
    ///
    /// The task is created in `New` and moves to `WaitingOnDependencies` at once.
    /// Callers must check [`Self::task_for_configuration`] first; registering the
    /// same configuration twice would break the one-task-per-configuration invariant.
    pub fn add_task(&mut self, configuration: Configuration, dependencies: Vec<TaskId>) -> TaskId {
        debug_assert!(
            !self.by_configuration.contains_key(&configuration.id),
            "configuration registered twice"
        );
        let id = TaskId::new();
        for dep in &dependencies {
            self.dependents.entry(*dep).or_default().push(id);
        }
        self.by_configuration.insert(configuration.id.clone(), id);
        self.tasks.insert(
            id,
            BuildTask {
                id,
                configuration,
                dependencies,
                state: TaskState::New,
                repository: None,
                record: None,
                failure: None,
            },
        );
        self.order.push(id);
        self.record_event(id, TaskState::New);
        // New -> WaitingOnDependencies is always legal.
        let _ = self.transition(id, TaskState::WaitingOnDependencies);
        id
    }

    /// Move a task to `next`, appending to the event log.
    pub fn transition(&mut self, id: TaskId, next: TaskState) -> Result<(), TransitionError> {
        let Some(task) = self.tasks.get_mut(&id) else {
            return Ok(());
        };
        if !task.state.can_transition_to(next) {
            return Err(TransitionError {
                task: id,
                from: task.state,
                to: next,
            });
        }
        task.state = next;
        self.record_event(id, next);
        Ok(())
    }

    /// End a task in a failure state and cancel everything downstream of it.
    ///
    /// Returns the ids of the dependents that were cancelled.
    pub fn fail(
        &mut self,
        id: TaskId,
        failure: TaskFailure,
    ) -> Result<Vec<TaskId>, TransitionError> {
        self.transition(id, failure.kind.terminal_state())?;
        if let Some(task) = self.tasks.get_mut(&id) {
            task.failure = Some(failure);
        }
        Ok(self.cancel_dependents(id))
    }

    /// Record the workspace a task provisioned.
    pub fn set_repository(&mut self, id: TaskId, repository: RepositoryConfiguration) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.repository = Some(repository);
        }
    }

    pub fn set_record(&mut self, id: TaskId, record: BuildRecord) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.record = Some(record);
        }
    }

    /// Tasks waiting on dependencies whose dependencies have all succeeded.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.tasks()
            .filter(|task| task.state == TaskState::WaitingOnDependencies)
            .filter(|task| {
                task.dependencies.iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .is_some_and(|d| d.state.is_success())
                })
            })
            .map(|task| task.id)
            .collect()
    }

    /// Cancel every transitive dependent of `failed` that has not finished.
    fn cancel_dependents(&mut self, failed: TaskId) -> Vec<TaskId> {
        let failed_config = self
            .tasks
            .get(&failed)
            .map(|t| t.configuration.id.clone());
        let mut cancelled = Vec::new();
        let mut queue: VecDeque<TaskId> = self.dependents(failed).iter().copied().collect();
        let mut seen: HashSet<TaskId> = HashSet::new();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            if task.state.is_terminal() {
                continue;
            }
            let message = match &failed_config {
                Some(cfg) => format!("dependency {} did not succeed", cfg),
                None => "dependency did not succeed".to_string(),
            };
            if self.transition(id, TaskState::Cancelled).is_ok() {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.failure = Some(TaskFailure::new(FailureKind::Cancelled, message));
                }
                cancelled.push(id);
            }
            queue.extend(self.dependents(id).iter().copied());
        }
        cancelled
    }

    /// Cancel every task that has not started yet. Running tasks observe their own
    /// cancellation token.
    pub fn cancel_waiting(&mut self, reason: &str) -> Vec<TaskId> {
        let waiting: Vec<TaskId> = self
            .tasks()
            .filter(|t| matches!(t.state, TaskState::New | TaskState::WaitingOnDependencies))
            .map(|t| t.id)
            .collect();
        for id in &waiting {
            let _ = self.transition(*id, TaskState::Cancelled);
            if let Some(task) = self.tasks.get_mut(id) {
                task.failure = Some(TaskFailure::new(FailureKind::Cancelled, reason));
            }
        }
        waiting
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.state.is_terminal())
    }

    pub fn has_running(&self) -> bool {
        self.tasks.values().any(|t| t.state.has_started())
    }

    pub fn status(&self) -> SubmissionStatus {
        if !self.all_terminal() {
            SubmissionStatus::Running
        } else if self.tasks.values().all(|t| t.state.is_success()) {
            SubmissionStatus::Succeeded
        } else {
            SubmissionStatus::Failed
        }
    }

    pub fn snapshot(&self) -> SubmissionSnapshot {
        let tasks: Vec<TaskSnapshot> = self.tasks().map(BuildTask::snapshot).collect();
        let failures = self
            .tasks()
            .filter(|t| t.state.is_unsuccessful())
            .map(|t| {
                let (kind, message) = match &t.failure {
                    Some(f) => (f.kind, f.message.clone()),
                    None => (FailureKind::Cancelled, t.state.to_string()),
                };
                FailureReport {
                    task: t.id,
                    configuration: t.configuration.id.clone(),
                    kind,
                    message,
                }
            })
            .collect();
        SubmissionSnapshot {
            id: self.id,
            root: self.root,
            status: self.status(),
            tasks,
            failures,
        }
    }

    /// Compute execution waves - groups of configurations that can be built in
    /// parallel once all previous waves complete.
    pub fn compute_waves(&self) -> Vec<Vec<ConfigurationId>> {
        let mut waves = Vec::new();
        let mut completed: HashSet<TaskId> = HashSet::new();

        loop {
            let ready: Vec<&BuildTask> = self
                .tasks()
                .filter(|t| !completed.contains(&t.id))
                .filter(|t| t.dependencies.iter().all(|d| completed.contains(d)))
                .collect();

            if ready.is_empty() {
                break;
            }

            let mut wave: Vec<ConfigurationId> =
                ready.iter().map(|t| t.configuration.id.clone()).collect();
            wave.sort();
            completed.extend(ready.iter().map(|t| t.id));
            waves.push(wave);
        }

        waves
    }

    fn record_event(&mut self, id: TaskId, state: TaskState) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        self.next_sequence += 1;
        let event = TaskEvent {
            sequence: self.next_sequence,
            submission: self.id,
            task: id,
            configuration: task.configuration.id.clone(),
            state,
            at: Utc::now(),
        };
        if let Some(tx) = &self.event_tx {
            tx.send(event.clone()).ok();
        }
        self.events.push(event);
    }
}
