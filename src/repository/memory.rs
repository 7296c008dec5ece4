//! In-process artifact store.
//!
//! Keeps store definitions, content and tracking records in memory and records every
//! call so tests can assert on what the orchestrator asked for. Failures can be
//! injected per operation.

use async_trait::async_trait;
use conveyor_common::{
    ArtifactStore, PromoteRequest, PromoteResult, StoreDefinition, StoreError, StoreKey,
    StoreKind, TrackedEntry, TrackingReport,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct State {
    stores: BTreeMap<StoreKey, StoreDefinition>,
    content: HashMap<StoreKey, BTreeMap<String, String>>,
    reports: HashMap<String, TrackingReport>,
    create_counts: HashMap<StoreKey, usize>,
    promotions: Vec<PromoteRequest>,
    rollbacks: Vec<PromoteRequest>,
    cleared_sessions: Vec<String>,
    deleted: Vec<StoreKey>,

    exists_failures: Vec<StoreError>,
    create_failures: HashMap<StoreKind, String>,
    promote_failures: HashMap<StoreKey, String>,
    rollback_failure: Option<String>,
    report_failure: Option<StoreError>,
    clear_failure: Option<String>,
    delete_failure: Option<String>,
    latency: Option<Duration>,
}

/// Artifact store held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay every store call, widening race windows in concurrency tests.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn definition(&self, key: &StoreKey) -> Option<StoreDefinition> {
        self.state().stores.get(key).cloned()
    }

    pub fn store_keys(&self) -> Vec<StoreKey> {
        self.state().stores.keys().cloned().collect()
    }

    /// Number of successful creates for a key.
    pub fn create_count(&self, key: &StoreKey) -> usize {
        self.state().create_counts.get(key).copied().unwrap_or(0)
    }

    pub fn promotions(&self) -> Vec<PromoteRequest> {
        self.state().promotions.clone()
    }

    pub fn rollbacks(&self) -> Vec<PromoteRequest> {
        self.state().rollbacks.clone()
    }

    pub fn cleared_sessions(&self) -> Vec<String> {
        self.state().cleared_sessions.clone()
    }

    pub fn deleted(&self) -> Vec<StoreKey> {
        self.state().deleted.clone()
    }

    /// Paths currently held by a store.
    pub fn paths(&self, key: &StoreKey) -> Vec<String> {
        self.state()
            .content
            .get(key)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Put content directly into a store, bypassing tracking.
    pub fn put(&self, key: &StoreKey, path: &str, bytes: &[u8]) -> String {
        let sha = sha256_hex(bytes);
        self.state()
            .content
            .entry(key.clone())
            .or_default()
            .insert(path.to_string(), sha.clone());
        sha
    }

    /// Record that the build tracked under `session` downloaded `path` from `origin`.
    pub fn record_download(&self, session: &str, origin: &StoreKey, path: &str, bytes: &[u8]) {
        let sha = self.put(origin, path, bytes);
        self.state()
            .reports
            .entry(session.to_string())
            .or_default()
            .downloads
            .push(TrackedEntry::new(origin.clone(), path, sha));
    }

    /// Record that the build tracked under `session` uploaded `path`. The content lands
    /// in the build's hosted store, which shares its id with the session.
    pub fn record_upload(&self, session: &str, path: &str, bytes: &[u8]) {
        let hosted = StoreKey::hosted(session);
        let sha = self.put(&hosted, path, bytes);
        let local_url = self.content_url(&hosted, path);
        self.state()
            .reports
            .entry(session.to_string())
            .or_default()
            .uploads
            .push(TrackedEntry::new(hosted, path, sha).with_local_url(local_url));
    }

    /// Fail the next `count` existence checks with `error`.
    pub fn fail_next_exists(&self, count: usize, error: StoreError) {
        let mut state = self.state();
        for _ in 0..count {
            state.exists_failures.push(error.clone());
        }
    }

    pub fn fail_creates_of_kind(&self, kind: StoreKind, reason: impl Into<String>) {
        self.state().create_failures.insert(kind, reason.into());
    }

    /// Report a service-side error for promotions into `target`.
    pub fn fail_promotions_into(&self, target: StoreKey, reason: impl Into<String>) {
        self.state().promote_failures.insert(target, reason.into());
    }

    pub fn fail_rollbacks(&self, reason: impl Into<String>) {
        self.state().rollback_failure = Some(reason.into());
    }

    pub fn fail_tracking_reports(&self, error: StoreError) {
        self.state().report_failure = Some(error);
    }

    pub fn fail_clear_tracking(&self, reason: impl Into<String>) {
        self.state().clear_failure = Some(reason.into());
    }

    pub fn fail_deletes(&self, reason: impl Into<String>) {
        self.state().delete_failure = Some(reason.into());
    }
}

fn status_error(key: &StoreKey, message: &str) -> StoreError {
    StoreError::Status {
        status: 500,
        url: format!("memory://{}", key),
        message: message.to_string(),
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn exists_store(&self, key: &StoreKey) -> Result<bool, StoreError> {
        self.delay().await;
        let mut state = self.state();
        if !state.exists_failures.is_empty() {
            return Err(state.exists_failures.remove(0));
        }
        Ok(state.stores.contains_key(key))
    }

    async fn create_store(&self, definition: &StoreDefinition) -> Result<(), StoreError> {
        self.delay().await;
        let mut state = self.state();
        if let Some(reason) = state.create_failures.get(&definition.key.kind) {
            return Err(StoreError::Status {
                status: 400,
                url: format!("memory://{}", definition.key),
                message: reason.clone(),
            });
        }
        if state.stores.contains_key(&definition.key) {
            return Err(StoreError::Conflict(definition.key.clone()));
        }
        state
            .stores
            .insert(definition.key.clone(), definition.clone());
        *state
            .create_counts
            .entry(definition.key.clone())
            .or_default() += 1;
        Ok(())
    }

    async fn delete_store(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.delay().await;
        let mut state = self.state();
        if let Some(reason) = &state.delete_failure {
            return Err(status_error(key, reason));
        }
        if state.stores.remove(key).is_none() {
            return Err(StoreError::NotFound(key.clone()));
        }
        state.content.remove(key);
        state.deleted.push(key.clone());
        Ok(())
    }

    async fn fetch_tracking_report(&self, session: &str) -> Result<TrackingReport, StoreError> {
        self.delay().await;
        let state = self.state();
        if let Some(err) = &state.report_failure {
            return Err(err.clone());
        }
        Ok(state.reports.get(session).cloned().unwrap_or_default())
    }

    async fn clear_tracking_record(&self, session: &str) -> Result<(), StoreError> {
        self.delay().await;
        let mut state = self.state();
        if let Some(reason) = &state.clear_failure {
            return Err(status_error(&StoreKey::group(session), reason));
        }
        state.reports.remove(session);
        state.cleared_sessions.push(session.to_string());
        Ok(())
    }

    async fn promote(&self, request: &PromoteRequest) -> Result<PromoteResult, StoreError> {
        self.delay().await;
        let mut state = self.state();
        state.promotions.push(request.clone());

        if let Some(reason) = state.promote_failures.get(&request.target) {
            return Ok(PromoteResult::failed(request.clone(), reason.clone()));
        }
        if !state.stores.contains_key(&request.target) {
            return Err(StoreError::NotFound(request.target.clone()));
        }

        let source = state.content.get(&request.source).cloned().unwrap_or_default();
        let selected: BTreeMap<String, String> = match &request.paths {
            Some(paths) => source
                .into_iter()
                .filter(|(path, _)| paths.contains(path))
                .collect(),
            None => source,
        };
        let pending: Vec<String> = request
            .paths
            .iter()
            .flatten()
            .filter(|p| !selected.contains_key(*p))
            .cloned()
            .collect();

        let completed: Vec<String> = selected.keys().cloned().collect();
        state
            .content
            .entry(request.target.clone())
            .or_default()
            .extend(selected);
        if request.purge_source
            && let Some(source) = state.content.get_mut(&request.source)
        {
            source.retain(|path, _| !completed.contains(path));
        }

        let mut result = PromoteResult::succeeded(request.clone(), completed);
        result.pending_paths = pending;
        Ok(result)
    }

    async fn rollback(&self, result: &PromoteResult) -> Result<PromoteResult, StoreError> {
        self.delay().await;
        let mut state = self.state();
        state.rollbacks.push(result.request.clone());

        if let Some(reason) = &state.rollback_failure {
            let mut failed = result.clone();
            failed.error = Some(reason.clone());
            return Ok(failed);
        }
        if let Some(target) = state.content.get_mut(&result.request.target) {
            target.retain(|path, _| !result.completed_paths.contains(path));
        }
        Ok(PromoteResult::succeeded(
            result.request.clone(),
            Vec::new(),
        ))
    }

    fn content_url(&self, key: &StoreKey, path: &str) -> String {
        format!(
            "memory://content/{}/{}/{}",
            key.kind,
            key.id,
            path.trim_start_matches('/')
        )
    }

    fn tracking_url(&self, session: &str, group: &StoreKey) -> String {
        format!("memory://track/{}/{}/{}", session, group.kind, group.id)
    }
}
