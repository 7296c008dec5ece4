//! Remote artifact-store model and client interface.
//!
//! The store service organizes content in named stores. A store is identified by a
//! [`StoreKey`]: hosted stores are writable, groups are ordered read-through views over
//! other stores (first match wins), and remote stores proxy an external origin.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Hosted,
    Group,
    Remote,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Hosted => write!(f, "hosted"),
            StoreKind::Group => write!(f, "group"),
            StoreKind::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for StoreKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hosted" => Ok(StoreKind::Hosted),
            "group" => Ok(StoreKind::Group),
            "remote" => Ok(StoreKind::Remote),
            other => Err(StoreError::Decode(format!("unknown store kind '{}'", other))),
        }
    }
}

/// Identifies a named store. Serialized as `kind:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct StoreKey {
    pub kind: StoreKind,
    pub id: String,
}

impl StoreKey {
    pub fn new(kind: StoreKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn hosted(id: impl Into<String>) -> Self {
        Self::new(StoreKind::Hosted, id)
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new(StoreKind::Group, id)
    }

    pub fn remote(id: impl Into<String>) -> Self {
        Self::new(StoreKind::Remote, id)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for StoreKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| StoreError::Decode(format!("invalid store key '{}'", s)))?;
        if id.is_empty() {
            return Err(StoreError::Decode(format!("store key '{}' has an empty id", s)));
        }
        Ok(Self::new(kind.parse()?, id))
    }
}

impl From<StoreKey> for String {
    fn from(key: StoreKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for StoreKey {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Everything needed to create a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDefinition {
    pub key: StoreKey,
    #[serde(default)]
    pub description: String,
    /// Hosted stores only.
    #[serde(default)]
    pub allow_releases: bool,
    /// Hosted stores only.
    #[serde(default)]
    pub allow_snapshots: bool,
    /// Group stores only, in significance order.
    #[serde(default)]
    pub constituents: Vec<StoreKey>,
}

impl StoreDefinition {
    /// A hosted store accepting releases only.
    pub fn hosted_releases(id: impl Into<String>) -> Self {
        Self {
            key: StoreKey::hosted(id),
            description: String::new(),
            allow_releases: true,
            allow_snapshots: false,
            constituents: Vec::new(),
        }
    }

    pub fn group(id: impl Into<String>, constituents: Vec<StoreKey>) -> Self {
        Self {
            key: StoreKey::group(id),
            description: String::new(),
            allow_releases: false,
            allow_snapshots: false,
            constituents,
        }
    }

    pub fn with_snapshots(mut self, allow: bool) -> Self {
        self.allow_snapshots = allow;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// One path read or written through a tracked group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntry {
    /// Store the content was served from (downloads) or stored in (uploads).
    pub store_key: StoreKey,
    pub path: String,
    #[serde(default)]
    pub sha256: String,
    /// URL of the content within the store it was written to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_url: Option<String>,
}

impl TrackedEntry {
    pub fn new(store_key: StoreKey, path: impl Into<String>, sha256: impl Into<String>) -> Self {
        Self {
            store_key,
            path: path.into(),
            sha256: sha256.into(),
            local_url: None,
        }
    }

    pub fn with_local_url(mut self, url: impl Into<String>) -> Self {
        self.local_url = Some(url.into());
        self
    }
}

/// Downloads and uploads recorded for a tracking session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingReport {
    #[serde(default)]
    pub downloads: Vec<TrackedEntry>,
    #[serde(default)]
    pub uploads: Vec<TrackedEntry>,
}

/// Copy paths (or a whole store when `paths` is `None`) from one store to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteRequest {
    pub source: StoreKey,
    pub target: StoreKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<BTreeSet<String>>,
    #[serde(default)]
    pub purge_source: bool,
}

impl PromoteRequest {
    pub fn whole_store(source: StoreKey, target: StoreKey) -> Self {
        Self {
            source,
            target,
            paths: None,
            purge_source: false,
        }
    }

    pub fn paths(source: StoreKey, target: StoreKey, paths: BTreeSet<String>) -> Self {
        Self {
            source,
            target,
            paths: Some(paths),
            purge_source: false,
        }
    }

    pub fn is_whole_store(&self) -> bool {
        self.paths.is_none()
    }
}

impl fmt::Display for PromoteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.paths {
            Some(paths) => write!(f, "{} -> {} ({} paths)", self.source, self.target, paths.len()),
            None => write!(f, "{} -> {} (all content)", self.source, self.target),
        }
    }
}

/// Outcome of a promotion or rollback as reported by the store service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteResult {
    pub request: PromoteRequest,
    #[serde(default)]
    pub completed_paths: Vec<String>,
    #[serde(default)]
    pub pending_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PromoteResult {
    pub fn succeeded(request: PromoteRequest, completed_paths: Vec<String>) -> Self {
        Self {
            request,
            completed_paths,
            pending_paths: Vec::new(),
            error: None,
        }
    }

    pub fn failed(request: PromoteRequest, error: impl Into<String>) -> Self {
        Self {
            request,
            completed_paths: Vec::new(),
            pending_paths: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// How a build reaches its workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Content-tracking URL of the build group.
    pub tracking_url: String,
    pub dependency_url: String,
    pub toolchain_url: String,
    pub deploy_url: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ConnectionInfo {
    /// Derive all endpoints from the tracking URL; every read and write must go through
    /// the tracked group so the store service records it.
    pub fn from_tracking_url(tracking_url: impl Into<String>) -> Self {
        let tracking_url = tracking_url.into();
        Self {
            dependency_url: tracking_url.clone(),
            toolchain_url: tracking_url.clone(),
            deploy_url: tracking_url.clone(),
            tracking_url,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Ephemeral workspace of one build: its own hosted store and group, layered over the
/// product group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfiguration {
    /// Id shared by the build hosted store, the build group and the tracking session.
    pub build_id: String,
    /// Id shared by the product hosted store and the product group.
    pub product_id: String,
    pub connection: ConnectionInfo,
}

impl RepositoryConfiguration {
    pub fn build_hosted(&self) -> StoreKey {
        StoreKey::hosted(&self.build_id)
    }

    pub fn build_group(&self) -> StoreKey {
        StoreKey::group(&self.build_id)
    }

    pub fn product_hosted(&self) -> StoreKey {
        StoreKey::hosted(&self.product_id)
    }

    pub fn product_group(&self) -> StoreKey {
        StoreKey::group(&self.product_id)
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Store service unreachable: {0}")]
    Transport(String),

    #[error("Store service request timed out: {0}")]
    Timeout(String),

    #[error("Store service returned HTTP {status} for {url}: {message}")]
    Status {
        status: u16,
        url: String,
        message: String,
    },

    #[error("Store {0} not found")]
    NotFound(StoreKey),

    #[error("Store {0} already exists")]
    Conflict(StoreKey),

    #[error("Failed to decode store service response: {0}")]
    Decode(String),
}

impl StoreError {
    /// Transport-level failures that may succeed if the same call is repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transport(_) | StoreError::Timeout(_) => true,
            StoreError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Client interface to the remote artifact-store service.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn exists_store(&self, key: &StoreKey) -> Result<bool, StoreError>;

    async fn create_store(&self, definition: &StoreDefinition) -> Result<(), StoreError>;

    async fn delete_store(&self, key: &StoreKey) -> Result<(), StoreError>;

    async fn fetch_tracking_report(&self, session: &str) -> Result<TrackingReport, StoreError>;

    async fn clear_tracking_record(&self, session: &str) -> Result<(), StoreError>;

    /// A returned `Ok` may still carry a service-side error in [`PromoteResult::error`].
    async fn promote(&self, request: &PromoteRequest) -> Result<PromoteResult, StoreError>;

    async fn rollback(&self, result: &PromoteResult) -> Result<PromoteResult, StoreError>;

    fn content_url(&self, key: &StoreKey, path: &str) -> String;

    /// URL through which a build reads and writes so that a group tracks its content.
    fn tracking_url(&self, session: &str, group: &StoreKey) -> String;
}
