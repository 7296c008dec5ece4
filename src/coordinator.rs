//! Upward API: submit build requests and observe them.
//!
//! Each submission runs on its own tokio task. Finished submissions stay queryable
//! until more than `retention` newer ones have finished, or until [`BuildCoordinator::forget`]
//! drops them; their task tables are released then.

use conveyor_common::{
    ArtifactStore, BuildDriver, Catalog, ConfigurationId, ProductVersion, SubmissionId, TaskId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dag::{
    ExecutorContext, GraphBuilder, SchedulerConfig, SharedSubmission, Submission,
    SubmissionExecutor, SubmissionSnapshot, TaskEvent, TaskState, lock,
};
use crate::errors::CoordinatorError;
use crate::repository::HierarchySettings;

const DEFAULT_RETENTION: usize = 32;

struct Entry {
    submission: SharedSubmission,
    tasks: Vec<TaskId>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct Registry {
    submissions: HashMap<SubmissionId, Entry>,
    tasks: HashMap<TaskId, SubmissionId>,
    /// Finished submissions, oldest first
    finished: VecDeque<SubmissionId>,
}

impl Registry {
    fn remove(&mut self, id: SubmissionId) -> bool {
        let Some(entry) = self.submissions.remove(&id) else {
            return false;
        };
        for task in &entry.tasks {
            self.tasks.remove(task);
        }
        self.finished.retain(|f| *f != id);
        true
    }

    fn mark_finished(&mut self, id: SubmissionId, retention: usize) {
        if !self.submissions.contains_key(&id) {
            return;
        }
        self.finished.push_back(id);
        while self.finished.len() > retention {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            self.remove(oldest);
            debug!(submission = %oldest, "released finished submission");
        }
    }
}

fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BuildCoordinator {
    catalog: Arc<dyn Catalog>,
    context: Arc<ExecutorContext>,
    config: SchedulerConfig,
    default_product: ProductVersion,
    events: Option<mpsc::UnboundedSender<TaskEvent>>,
    retention: usize,
    registry: Arc<Mutex<Registry>>,
}

impl BuildCoordinator {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        driver: Arc<dyn BuildDriver>,
        catalog: Arc<dyn Catalog>,
        settings: HierarchySettings,
    ) -> Self {
        let context = ExecutorContext::new(store, driver, catalog.clone(), settings);
        Self {
            catalog,
            context: Arc::new(context),
            config: SchedulerConfig::default(),
            default_product: ProductVersion::new("default", "1.0"),
            events: None,
            retention: DEFAULT_RETENTION,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Product used when the root configuration does not name one.
    pub fn with_default_product(mut self, product: ProductVersion) -> Self {
        self.default_product = product;
        self
    }

    /// Forward task events of every submission to `tx`.
    pub fn with_event_channel(mut self, tx: mpsc::UnboundedSender<TaskEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Number of finished submissions kept for status queries.
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock_registry(&self.registry)
    }

    /// Expand `root` into a new submission and start running it.
    ///
    /// Graph errors (cycles, unknown configurations) are returned here and no task
    /// is created.
    pub async fn submit(&self, root: &ConfigurationId) -> Result<SubmissionId, CoordinatorError> {
        let graph = GraphBuilder::new(self.catalog.clone())
            .with_rebuild_dependencies(self.config.rebuild_dependencies)
            .load(root)
            .await?;

        let product = graph
            .root_configuration()
            .and_then(|c| c.product_version.clone())
            .unwrap_or_else(|| self.default_product.clone());

        let id = SubmissionId::new();
        let mut submission = Submission::new(id, product);
        if let Some(tx) = &self.events {
            submission = submission.with_event_channel(tx.clone());
        }
        GraphBuilder::expand(&graph, &mut submission)?;

        let task_ids: Vec<TaskId> = submission.tasks().map(|t| t.id).collect();
        info!(
            submission = %id,
            root = %root,
            product = %submission.product(),
            tasks = task_ids.len(),
            "submission accepted"
        );

        let submission = submission.into_shared();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        {
            let mut registry = self.registry();
            for task in &task_ids {
                registry.tasks.insert(*task, id);
            }
            registry.submissions.insert(
                id,
                Entry {
                    submission: submission.clone(),
                    tasks: task_ids,
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
        }

        let executor = SubmissionExecutor::new(self.context.clone(), self.config.clone());
        let registry = self.registry.clone();
        let retention = self.retention;
        tokio::spawn(async move {
            executor.run(submission, cancel).await;
            lock_registry(&registry).mark_finished(id, retention);
            let _ = done_tx.send(true);
        });

        Ok(id)
    }

    /// Current state of a task, from any submission.
    pub fn task_status(&self, task: TaskId) -> Option<TaskState> {
        let submission = {
            let registry = self.registry();
            let id = registry.tasks.get(&task)?;
            registry.submissions.get(id)?.submission.clone()
        };
        let state = lock(&submission).task(task).map(|t| t.state);
        state
    }

    /// Snapshot of every task in a submission.
    pub fn submission(&self, id: SubmissionId) -> Option<SubmissionSnapshot> {
        let submission = self.registry().submissions.get(&id)?.submission.clone();
        let snapshot = lock(&submission).snapshot();
        Some(snapshot)
    }

    /// Cancel every non-terminal task of a submission. Running builds are asked to stop.
    pub fn cancel(&self, id: SubmissionId) -> Result<(), CoordinatorError> {
        let registry = self.registry();
        let entry = registry
            .submissions
            .get(&id)
            .ok_or_else(|| CoordinatorError::SubmissionNotFound(id.to_string()))?;
        info!(submission = %id, "cancelling submission");
        entry.cancel.cancel();
        Ok(())
    }

    /// Drop a finished submission and its task table. Returns `false` when the
    /// submission is unknown or still running.
    pub fn forget(&self, id: SubmissionId) -> bool {
        let mut registry = self.registry();
        if !registry.finished.contains(&id) {
            return false;
        }
        registry.remove(id)
    }

    /// Wait until every task of a submission is terminal and return the final snapshot.
    pub async fn wait(&self, id: SubmissionId) -> Result<SubmissionSnapshot, CoordinatorError> {
        let (submission, mut done) = {
            let registry = self.registry();
            let entry = registry
                .submissions
                .get(&id)
                .ok_or_else(|| CoordinatorError::SubmissionNotFound(id.to_string()))?;
            (entry.submission.clone(), entry.done.clone())
        };
        // A closed channel means the runner is gone; the snapshot is as final as it gets.
        let _ = done.wait_for(|finished| *finished).await;
        let snapshot = lock(&submission).snapshot();
        Ok(snapshot)
    }
}
