//! Driver that plays back canned outcomes.

use async_trait::async_trait;
use conveyor_common::{
    BuildDriver, CompletedBuild, ConfigurationId, DispatchRequest, DriverError, RunningBuild,
    StoreKey,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::repository::MemoryStore;

/// How a scripted build ends.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScriptedOutcome {
    #[default]
    Succeed,
    Fail,
    /// Completion arrives as a transport error.
    LoseContact(String),
    /// `dispatch` itself fails.
    RejectDispatch(String),
    /// Never completes on its own; ends only when cancelled.
    Hang,
}

/// Content a scripted build reads or writes through its tracked workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildActivity {
    Download { origin: StoreKey, path: String },
    Upload { path: String },
}

#[derive(Default)]
struct Script {
    outcomes: HashMap<ConfigurationId, ScriptedOutcome>,
    activity: HashMap<ConfigurationId, Vec<BuildActivity>>,
    dispatched: Vec<DispatchRequest>,
}

/// Build driver for tests and dry runs.
///
/// Builds succeed after `delay` unless told otherwise. When a [`MemoryStore`] is
/// attached, each build's scripted downloads and uploads are recorded against its
/// tracking session before it completes.
#[derive(Default)]
pub struct ScriptedDriver {
    script: Mutex<Script>,
    store: Option<Arc<MemoryStore>>,
    delay: Duration,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_outcome(&self, configuration: impl Into<ConfigurationId>, outcome: ScriptedOutcome) {
        self.script().outcomes.insert(configuration.into(), outcome);
    }

    pub fn add_activity(&self, configuration: impl Into<ConfigurationId>, activity: BuildActivity) {
        self.script()
            .activity
            .entry(configuration.into())
            .or_default()
            .push(activity);
    }

    /// Every request this driver accepted or rejected, in dispatch order.
    pub fn dispatched(&self) -> Vec<DispatchRequest> {
        self.script().dispatched.clone()
    }

    pub fn dispatched_configurations(&self) -> Vec<ConfigurationId> {
        self.script()
            .dispatched
            .iter()
            .map(|r| r.configuration.id.clone())
            .collect()
    }
}

#[async_trait]
impl BuildDriver for ScriptedDriver {
    async fn dispatch(&self, request: DispatchRequest) -> Result<RunningBuild, DriverError> {
        let (outcome, activity) = {
            let mut script = self.script();
            script.dispatched.push(request.clone());
            let id = &request.configuration.id;
            (
                script.outcomes.get(id).cloned().unwrap_or_default(),
                script.activity.get(id).cloned().unwrap_or_default(),
            )
        };

        if let ScriptedOutcome::RejectDispatch(reason) = &outcome {
            return Err(DriverError::Dispatch(reason.clone()));
        }

        let (sender, running) = RunningBuild::pending();
        let store = self.store.clone();
        let delay = self.delay;
        let session = request.repository.build_id.clone();
        let log_reference = format!("scripted://{}/{}", request.configuration.id, request.task);

        tokio::spawn(async move {
            let cancel = sender.cancellation();
            if outcome == ScriptedOutcome::Hang {
                cancel.cancelled().await;
                sender.complete(Ok(CompletedBuild::failed(log_reference)));
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    sender.complete(Ok(CompletedBuild::failed(log_reference)));
                    return;
                }
            }

            if let Some(store) = store {
                for item in &activity {
                    match item {
                        BuildActivity::Download { origin, path } => {
                            store.record_download(&session, origin, path, path.as_bytes())
                        }
                        BuildActivity::Upload { path } => {
                            store.record_upload(&session, path, path.as_bytes())
                        }
                    }
                }
            }

            let result = match outcome {
                ScriptedOutcome::Fail => Ok(CompletedBuild::failed(log_reference)),
                ScriptedOutcome::LoseContact(reason) => Err(DriverError::Transport(reason)),
                _ => Ok(CompletedBuild::success(log_reference)),
            };
            sender.complete(result);
        });

        Ok(running)
    }
}
