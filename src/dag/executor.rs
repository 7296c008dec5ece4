//! Submission executor.
//!
//! Drives every task of a submission through its lifecycle: claims tasks whose
//! dependencies have succeeded, provisions a workspace, dispatches the build, promotes
//! its outputs and tears the workspace down. Independent tasks run concurrently up to
//! `max_parallel`.

use conveyor_common::{
    ArtifactStore, BuildDriver, BuildRecord, BuildStatus, Catalog, DispatchRequest, DriverStatus,
    RepositoryConfiguration, TaskId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dag::scheduler::{SchedulerConfig, SharedSubmission, lock};
use crate::dag::state::{FailureKind, SubmissionSnapshot, TaskFailure, TaskState};
use crate::errors::BuildExecutionError;
use crate::repository::{HierarchyManager, HierarchySettings, PromotionEngine};

/// Collaborators a task lifecycle needs.
pub struct ExecutorContext {
    pub driver: Arc<dyn BuildDriver>,
    pub catalog: Arc<dyn Catalog>,
    pub hierarchy: Arc<HierarchyManager>,
    pub promotion: Arc<PromotionEngine>,
}

impl ExecutorContext {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        driver: Arc<dyn BuildDriver>,
        catalog: Arc<dyn Catalog>,
        settings: HierarchySettings,
    ) -> Self {
        Self {
            driver,
            catalog,
            hierarchy: Arc::new(HierarchyManager::new(store.clone(), settings)),
            promotion: Arc::new(PromotionEngine::new(store)),
        }
    }
}

/// Runs submissions to completion.
pub struct SubmissionExecutor {
    context: Arc<ExecutorContext>,
    config: SchedulerConfig,
}

impl SubmissionExecutor {
    pub fn new(context: Arc<ExecutorContext>, config: SchedulerConfig) -> Self {
        Self { context, config }
    }

    /// Run every task of `submission` until all are terminal.
    ///
    /// Cancelling `cancel` cancels tasks that have not started and signals running
    /// tasks to stop; the call still returns only once every task is terminal.
    pub async fn run(
        &self,
        submission: SharedSubmission,
        cancel: CancellationToken,
    ) -> SubmissionSnapshot {
        let max_parallel = self.config.max_parallel.max(1);
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut running: JoinSet<()> = JoinSet::new();
        let mut active: HashMap<tokio::task::Id, TaskId> = HashMap::new();
        let mut cancel_handled = false;

        let submission_id = lock(&submission).id();
        info!(submission = %submission_id, tasks = lock(&submission).len(), "submission started");

        loop {
            if cancel.is_cancelled() && !cancel_handled {
                cancel_handled = true;
                let cancelled = lock(&submission).cancel_waiting("submission cancelled");
                info!(
                    submission = %submission_id,
                    cancelled = cancelled.len(),
                    "submission cancelled"
                );
            }

            // Claim ready tasks under the lock so no task is started twice.
            if !cancel.is_cancelled() {
                let claimed = {
                    let mut sub = lock(&submission);
                    let mut claimed = Vec::new();
                    for id in sub.ready_tasks() {
                        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                            break;
                        };
                        match sub.transition(id, TaskState::WorkspaceProvisioning) {
                            Ok(()) => claimed.push((id, permit)),
                            Err(e) => warn!(error = %e, "could not claim task"),
                        }
                    }
                    claimed
                };

                for (id, permit) in claimed {
                    let context = self.context.clone();
                    let submission = submission.clone();
                    let token = cancel.child_token();
                    let handle = running.spawn(async move {
                        let _permit = permit;
                        run_task(context, submission, id, token).await;
                    });
                    active.insert(handle.id(), id);
                }
            }

            if running.is_empty() {
                let mut sub = lock(&submission);
                if !sub.all_terminal() {
                    // Nothing running and nothing ready: whatever is left can never start.
                    let stranded = sub.cancel_waiting("no runnable dependency path");
                    if !stranded.is_empty() {
                        warn!(submission = %submission_id, stranded = stranded.len(), "cancelled stranded tasks");
                    }
                }
                break;
            }

            tokio::select! {
                joined = running.join_next_with_id() => {
                    match joined {
                        Some(Ok((handle, ()))) => {
                            active.remove(&handle);
                        }
                        Some(Err(join_error)) => {
                            let Some(task) = active.remove(&join_error.id()) else {
                                continue;
                            };
                            error!(task = %task, error = %join_error, "task lifecycle aborted");
                            abort_task(&submission, task, &join_error.to_string());
                        }
                        None => {}
                    }
                }
                _ = cancel.cancelled(), if !cancel_handled => {}
            }
        }

        let snapshot = lock(&submission).snapshot();
        info!(
            submission = %submission_id,
            status = %snapshot.status,
            failures = snapshot.failures.len(),
            "submission finished"
        );
        snapshot
    }
}

/// How a lifecycle ended, before it is applied to the submission.
struct Outcome {
    state: TaskState,
    failure: Option<TaskFailure>,
}

impl Outcome {
    fn success() -> Self {
        Self {
            state: TaskState::Success,
            failure: None,
        }
    }

    fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            state: kind.terminal_state(),
            failure: Some(TaskFailure::new(kind, message)),
        }
    }

    fn cancelled() -> Self {
        Self::failed(FailureKind::Cancelled, "cancelled while running")
    }
}

/// Full lifecycle of one claimed task. The task is in `WorkspaceProvisioning` on entry.
async fn run_task(
    context: Arc<ExecutorContext>,
    submission: SharedSubmission,
    task: TaskId,
    cancel: CancellationToken,
) {
    let claimed = {
        let sub = lock(&submission);
        sub.task(task)
            .map(|t| (t.configuration.clone(), sub.product().clone()))
    };
    let Some((configuration, product)) = claimed else {
        return;
    };

    let repository = match context.hierarchy.provision(&configuration, &product).await {
        Ok(repository) => repository,
        Err(e) => {
            warn!(task = %task, configuration = %configuration.id, error = %e, "workspace provisioning failed");
            finish(&submission, task, Outcome::failed(FailureKind::Workspace, e.to_string()));
            return;
        }
    };
    lock(&submission).set_repository(task, repository.clone());

    if cancel.is_cancelled() {
        teardown(&context, &repository).await;
        finish(&submission, task, Outcome::cancelled());
        return;
    }

    advance(&submission, task, TaskState::Dispatched);
    let mut record = BuildRecord::start(task, &configuration);
    let outcome = build_and_promote(
        &context,
        &submission,
        DispatchRequest {
            task,
            configuration,
            repository: repository.clone(),
        },
        &mut record,
        &cancel,
    )
    .await;

    teardown(&context, &repository).await;

    if let Err(e) = context.catalog.save_build_record(&record).await {
        warn!(task = %task, record = %record.id, error = %e, "failed to save build record");
    }
    lock(&submission).set_record(task, record);
    finish(&submission, task, outcome);
}

/// Dispatch, await completion and promote. Fills in `record` along the way.
async fn build_and_promote(
    context: &ExecutorContext,
    submission: &SharedSubmission,
    request: DispatchRequest,
    record: &mut BuildRecord,
    cancel: &CancellationToken,
) -> Outcome {
    let task = request.task;
    let repository = request.repository.clone();

    let mut running = match context.driver.dispatch(request).await {
        Ok(running) => running,
        Err(e) => {
            let err = BuildExecutionError::Dispatch(e);
            warn!(task = %task, error = %err, "dispatch failed");
            record.finish(BuildStatus::Failed, Some(err.to_string()));
            return Outcome::failed(FailureKind::Build, err.to_string());
        }
    };
    info!(task = %task, configuration = %record.configuration, build_store = %repository.build_id, "build dispatched");

    let completion = tokio::select! {
        completion = running.completion() => completion,
        _ = cancel.cancelled() => {
            running.cancel();
            // Wait for the driver to confirm the build stopped before tearing down.
            let _ = running.completion().await;
            record.finish(BuildStatus::Cancelled, Some("cancelled while running".to_string()));
            return Outcome::cancelled();
        }
    };

    let completed = match completion {
        Ok(completed) => completed,
        Err(e) => {
            let err = BuildExecutionError::Transport(e);
            warn!(task = %task, error = %err, "lost contact with build");
            record.finish(BuildStatus::Failed, Some(err.to_string()));
            return Outcome::failed(FailureKind::Build, err.to_string());
        }
    };
    record.log_reference = Some(completed.log_reference.clone());

    if completed.status == DriverStatus::Failed {
        let err = BuildExecutionError::Failed {
            log_reference: completed.log_reference,
        };
        info!(task = %task, error = %err, "build failed");
        record.finish(BuildStatus::Failed, Some(err.to_string()));
        return Outcome::failed(FailureKind::Build, err.to_string());
    }

    advance(submission, task, TaskState::Promoting);
    match context.promotion.persist_artifacts(&repository, record).await {
        Ok(()) => {
            record.finish(BuildStatus::Success, None);
            info!(
                task = %task,
                built = record.built_artifacts.len(),
                dependencies = record.dependencies.len(),
                "build promoted"
            );
            Outcome::success()
        }
        Err(e) => {
            warn!(task = %task, error = %e, "promotion failed");
            record.finish(BuildStatus::PromotionFailed, Some(e.to_string()));
            Outcome::failed(FailureKind::Promotion, e.to_string())
        }
    }
}

/// Remove a task's workspace. Failures are logged and never change the task's outcome.
async fn teardown(context: &ExecutorContext, repository: &RepositoryConfiguration) {
    if let Err(e) = context.promotion.cleanup(repository).await {
        warn!(build_store = %repository.build_id, error = %e, "workspace cleanup failed");
    }
}

fn advance(submission: &SharedSubmission, task: TaskId, state: TaskState) {
    if let Err(e) = lock(submission).transition(task, state) {
        error!(error = %e, "task state update rejected");
    }
}

/// Apply a lifecycle's outcome, cancelling dependents when it failed.
fn finish(submission: &SharedSubmission, task: TaskId, outcome: Outcome) {
    let mut sub = lock(submission);
    let result = match outcome.failure {
        Some(failure) => sub.fail(task, failure).map(|cancelled| {
            if !cancelled.is_empty() {
                info!(task = %task, cancelled = cancelled.len(), "cancelled dependents of failed task");
            }
        }),
        None => sub.transition(task, outcome.state),
    };
    match result {
        Ok(()) => debug!(task = %task, state = %outcome.state, "task finished"),
        Err(e) => error!(error = %e, "task state update rejected"),
    }
}

/// Fail a task whose lifecycle panicked, in whichever failure state its phase allows.
fn abort_task(submission: &SharedSubmission, task: TaskId, reason: &str) {
    let mut sub = lock(submission);
    let Some(state) = sub.task(task).map(|t| t.state) else {
        return;
    };
    let kind = match state {
        TaskState::WorkspaceProvisioning => FailureKind::Workspace,
        TaskState::Dispatched => FailureKind::Build,
        TaskState::Promoting => FailureKind::Promotion,
        _ => return,
    };
    let failure = TaskFailure::new(kind, format!("task lifecycle aborted: {}", reason));
    if let Err(e) = sub.fail(task, failure) {
        error!(error = %e, "task state update rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::dag::builder::GraphBuilder;
    use crate::dag::scheduler::Submission;
    use crate::dag::state::SubmissionStatus;
    use crate::driver::{BuildActivity, ScriptedDriver, ScriptedOutcome};
    use crate::repository::MemoryStore;
    use conveyor_common::{Configuration, ProductVersion, StoreKey, StoreKind, SubmissionId};
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        catalog: Arc<MemoryCatalog>,
        driver: Arc<ScriptedDriver>,
    }

    impl Harness {
        fn new(configurations: Vec<Configuration>) -> Self {
            let store = Arc::new(MemoryStore::new());
            let driver = ScriptedDriver::new().with_store(store.clone());
            Self {
                catalog: Arc::new(MemoryCatalog::with_configurations(configurations)),
                driver: Arc::new(driver),
                store,
            }
        }

        fn executor(&self, max_parallel: usize) -> SubmissionExecutor {
            let context = ExecutorContext::new(
                self.store.clone(),
                self.driver.clone(),
                self.catalog.clone(),
                HierarchySettings::default().with_retries(0, Duration::ZERO),
            );
            SubmissionExecutor::new(
                Arc::new(context),
                SchedulerConfig::default().with_max_parallel(max_parallel),
            )
        }

        async fn submission(&self, root: &str) -> SharedSubmission {
            let mut submission = Submission::new(SubmissionId::new(), ProductVersion::new("suite", "1.0"));
            GraphBuilder::new(self.catalog.clone())
                .build(&root.into(), &mut submission)
                .await
                .unwrap();
            submission.into_shared()
        }
    }

    fn chain() -> Vec<Configuration> {
        vec![
            Configuration::new("lib", "lib"),
            Configuration::new("app", "app").with_dependencies(["lib"]),
        ]
    }

    #[tokio::test]
    async fn test_chain_builds_in_dependency_order() {
        let harness = Harness::new(chain());
        harness.driver.add_activity(
            "lib",
            BuildActivity::Upload {
                path: "org/lib/1.0/lib-1.0.jar".into(),
            },
        );
        let submission = harness.submission("app").await;

        let snapshot = harness
            .executor(4)
            .run(submission.clone(), CancellationToken::new())
            .await;

        assert_eq!(snapshot.status, SubmissionStatus::Succeeded);
        assert_eq!(
            harness.driver.dispatched_configurations(),
            vec![
                conveyor_common::ConfigurationId::from("lib"),
                conveyor_common::ConfigurationId::from("app")
            ]
        );

        let records = harness.catalog.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.is_success()));
        let lib = records.iter().find(|r| r.project == "lib").unwrap();
        assert_eq!(lib.built_artifacts.len(), 1);

        // Workspaces are gone, the product tier remains.
        let product = StoreKey::hosted("product+suite+1-0");
        assert_eq!(harness.store.paths(&product), vec!["org/lib/1.0/lib-1.0.jar"]);
        assert!(
            harness
                .store
                .store_keys()
                .iter()
                .all(|k| !k.id.starts_with("build+"))
        );
    }

    #[tokio::test]
    async fn test_build_failure_cancels_dependents() {
        let harness = Harness::new(chain());
        harness.driver.set_outcome("lib", ScriptedOutcome::Fail);
        let submission = harness.submission("app").await;

        let snapshot = harness
            .executor(4)
            .run(submission, CancellationToken::new())
            .await;

        assert_eq!(snapshot.status, SubmissionStatus::Failed);
        assert_eq!(
            snapshot.task_for(&"lib".into()).unwrap().state,
            TaskState::FailedBuild
        );
        assert_eq!(
            snapshot.task_for(&"app".into()).unwrap().state,
            TaskState::Cancelled
        );
        assert_eq!(harness.driver.dispatched().len(), 1);
        assert_eq!(harness.catalog.records()[0].status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn test_lost_contact_is_a_build_failure() {
        let harness = Harness::new(vec![Configuration::new("solo", "solo")]);
        harness
            .driver
            .set_outcome("solo", ScriptedOutcome::LoseContact("agent vanished".into()));
        let submission = harness.submission("solo").await;

        let snapshot = harness
            .executor(1)
            .run(submission, CancellationToken::new())
            .await;

        let failure = &snapshot.failures[0];
        assert_eq!(failure.kind, FailureKind::Build);
        assert!(failure.message.contains("agent vanished"));
    }

    #[tokio::test]
    async fn test_workspace_failure_skips_dispatch() {
        let harness = Harness::new(vec![Configuration::new("solo", "solo")]);
        harness
            .store
            .fail_creates_of_kind(StoreKind::Group, "disk full");
        let submission = harness.submission("solo").await;

        let snapshot = harness
            .executor(1)
            .run(submission, CancellationToken::new())
            .await;

        assert_eq!(snapshot.count_in(TaskState::FailedWorkspace), 1);
        assert!(harness.driver.dispatched().is_empty());
        assert!(harness.catalog.records().is_empty());
    }

    #[tokio::test]
    async fn test_promotion_failure_is_reported() {
        let harness = Harness::new(vec![Configuration::new("solo", "solo")]);
        harness.driver.add_activity(
            "solo",
            BuildActivity::Upload {
                path: "org/solo/1/solo-1.jar".into(),
            },
        );
        harness
            .store
            .fail_promotions_into(StoreKey::hosted("product+suite+1-0"), "checksum mismatch");
        let submission = harness.submission("solo").await;

        let snapshot = harness
            .executor(1)
            .run(submission, CancellationToken::new())
            .await;

        assert_eq!(snapshot.count_in(TaskState::FailedPromotion), 1);
        assert_eq!(harness.catalog.records()[0].status, BuildStatus::PromotionFailed);
        assert_eq!(harness.store.rollbacks().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_change_outcome() {
        let harness = Harness::new(vec![Configuration::new("solo", "solo")]);
        harness.store.fail_deletes("store locked");
        let submission = harness.submission("solo").await;

        let snapshot = harness
            .executor(1)
            .run(submission, CancellationToken::new())
            .await;

        assert_eq!(snapshot.status, SubmissionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_stops_running_and_waiting_tasks() {
        let harness = Harness::new(chain());
        harness.driver.set_outcome("lib", ScriptedOutcome::Hang);
        let submission = harness.submission("app").await;
        let cancel = CancellationToken::new();

        let executor = harness.executor(2);
        let run = executor.run(submission.clone(), cancel.clone());
        let trigger = async {
            while lock(&submission)
                .tasks()
                .all(|t| t.state != TaskState::Dispatched)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        };
        let (snapshot, ()) = tokio::join!(run, trigger);

        assert_eq!(snapshot.count_in(TaskState::Cancelled), 2);
        assert_eq!(harness.catalog.records()[0].status, BuildStatus::Cancelled);
        assert!(
            harness
                .store
                .deleted()
                .iter()
                .any(|k| k.id.starts_with("build+lib+"))
        );
    }

    #[tokio::test]
    async fn test_cancel_during_provisioning_skips_build() {
        let harness = Harness::new(vec![Configuration::new("lib", "lib")]);
        harness.store.set_latency(Duration::from_millis(20));
        let submission = harness.submission("lib").await;
        let cancel = CancellationToken::new();

        let executor = harness.executor(1);
        let run = executor.run(submission.clone(), cancel.clone());
        let trigger = async {
            while lock(&submission)
                .tasks()
                .all(|t| t.state != TaskState::WorkspaceProvisioning)
            {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            cancel.cancel();
        };
        let (snapshot, ()) = tokio::join!(run, trigger);

        assert_eq!(
            snapshot.task_for(&"lib".into()).unwrap().state,
            TaskState::Cancelled
        );
        assert!(harness.driver.dispatched().is_empty());
        let deleted: Vec<StoreKind> = harness
            .store
            .deleted()
            .iter()
            .filter(|k| k.id.starts_with("build+lib+"))
            .map(|k| k.kind)
            .collect();
        assert!(deleted.contains(&StoreKind::Hosted));
        assert!(deleted.contains(&StoreKind::Group));
        assert!(
            harness
                .store
                .store_keys()
                .iter()
                .all(|k| !k.id.starts_with("build+"))
        );
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let configurations: Vec<Configuration> = (0..6)
            .map(|i| Configuration::new(format!("leaf{}", i), "leaves"))
            .chain(std::iter::once(
                Configuration::new("root", "root")
                    .with_dependencies((0..6).map(|i| format!("leaf{}", i))),
            ))
            .collect();
        let store = Arc::new(MemoryStore::new());
        let harness = Harness {
            catalog: Arc::new(MemoryCatalog::with_configurations(configurations)),
            driver: Arc::new(
                ScriptedDriver::new()
                    .with_store(store.clone())
                    .with_delay(Duration::from_millis(20)),
            ),
            store,
        };
        let submission = harness.submission("root").await;

        let observed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let watcher = {
            let submission = submission.clone();
            let observed = observed.clone();
            tokio::spawn(async move {
                loop {
                    let (started, done) = {
                        let sub = lock(&submission);
                        (
                            sub.tasks().filter(|t| t.state.has_started()).count(),
                            sub.all_terminal(),
                        )
                    };
                    observed.fetch_max(started, std::sync::atomic::Ordering::SeqCst);
                    if done {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let snapshot = harness
            .executor(2)
            .run(submission, CancellationToken::new())
            .await;
        watcher.await.unwrap();

        assert_eq!(snapshot.status, SubmissionStatus::Succeeded);
        assert!(observed.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    }
}
