//! REST client for the remote artifact-store service.
//!
//! Speaks the admin, content-tracking and promotion APIs of an AProx/Indy-style
//! repository manager. All paths are relative to the service's `/api` root.

use async_trait::async_trait;
use conveyor_common::{
    ArtifactStore, PromoteRequest, PromoteResult, StoreDefinition, StoreError, StoreKey,
    StoreKind, TrackedEntry, TrackingReport,
};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

/// HTTP implementation of [`ArtifactStore`].
#[derive(Debug, Clone)]
pub struct HttpStoreClient {
    client: Client,
    api_root: String,
}

/// Append `/api` to a service URL unless it already ends with it.
pub fn normalize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/api") {
        trimmed.to_string()
    } else {
        format!("{}/api", trimmed)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreDto {
    key: StoreKey,
    #[serde(rename = "type")]
    kind: StoreKind,
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_releases: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_snapshots: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    constituents: Vec<StoreKey>,
}

impl From<&StoreDefinition> for StoreDto {
    fn from(def: &StoreDefinition) -> Self {
        let hosted = def.key.kind == StoreKind::Hosted;
        Self {
            key: def.key.clone(),
            kind: def.key.kind,
            name: def.key.id.clone(),
            description: def.description.clone(),
            allow_releases: hosted.then_some(def.allow_releases),
            allow_snapshots: hosted.then_some(def.allow_snapshots),
            constituents: def.constituents.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackedEntryDto {
    store_key: StoreKey,
    path: String,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    local_url: Option<String>,
}

impl From<TrackedEntryDto> for TrackedEntry {
    fn from(dto: TrackedEntryDto) -> Self {
        Self {
            store_key: dto.store_key,
            path: dto.path,
            sha256: dto.sha256.unwrap_or_default(),
            local_url: dto.local_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TrackingReportDto {
    #[serde(default)]
    uploads: Option<Vec<TrackedEntryDto>>,
    #[serde(default)]
    downloads: Option<Vec<TrackedEntryDto>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromoteRequestDto {
    source: StoreKey,
    target: StoreKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    paths: Option<BTreeSet<String>>,
    #[serde(default)]
    purge_source: bool,
}

impl From<&PromoteRequest> for PromoteRequestDto {
    fn from(req: &PromoteRequest) -> Self {
        Self {
            source: req.source.clone(),
            target: req.target.clone(),
            paths: req.paths.clone(),
            purge_source: req.purge_source,
        }
    }
}

impl From<PromoteRequestDto> for PromoteRequest {
    fn from(dto: PromoteRequestDto) -> Self {
        Self {
            source: dto.source,
            target: dto.target,
            paths: dto.paths,
            purge_source: dto.purge_source,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromoteResultDto {
    request: PromoteRequestDto,
    #[serde(default)]
    completed_paths: Vec<String>,
    #[serde(default)]
    pending_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<PromoteResultDto> for PromoteResult {
    fn from(dto: PromoteResultDto) -> Self {
        Self {
            request: dto.request.into(),
            completed_paths: dto.completed_paths,
            pending_paths: dto.pending_paths,
            error: dto.error,
        }
    }
}

impl From<&PromoteResult> for PromoteResultDto {
    fn from(result: &PromoteResult) -> Self {
        Self {
            request: (&result.request).into(),
            completed_paths: result.completed_paths.clone(),
            pending_paths: result.pending_paths.clone(),
            error: result.error.clone(),
        }
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout(url.to_string())
    } else {
        StoreError::Transport(format!("{}: {}", url, err))
    }
}

impl HttpStoreClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_root: normalize_base_url(base_url),
        })
    }

    pub fn api_root(&self) -> &str {
        &self.api_root
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_root, path.trim_start_matches('/'))
    }

    fn store_url(&self, key: &StoreKey) -> String {
        self.url(&format!("admin/{}/{}", key.kind, key.id))
    }

    fn tracking_record_url(&self, session: &str) -> String {
        self.url(&format!("folo/admin/{}/record", session))
    }

    /// Turn a non-success response into a [`StoreError::Status`].
    async fn check(url: &str, resp: Response) -> Result<Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            url: url.to_string(),
            message,
        })
    }

    async fn post_promotion<B: Serialize + Sync + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<PromoteResult, StoreError> {
        let url = self.url(path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        let resp = Self::check(&url, resp).await?;
        let dto: PromoteResultDto = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(format!("{}: {}", url, e)))?;
        Ok(dto.into())
    }
}

#[async_trait]
impl ArtifactStore for HttpStoreClient {
    async fn exists_store(&self, key: &StoreKey) -> Result<bool, StoreError> {
        let url = self.store_url(key);
        let resp = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Self::check(&url, resp).await.map(|_| false),
        }
    }

    async fn create_store(&self, definition: &StoreDefinition) -> Result<(), StoreError> {
        let url = self.url(&format!("admin/{}", definition.key.kind));
        debug!(store = %definition.key, "creating store");
        let resp = self
            .client
            .post(&url)
            .json(&StoreDto::from(definition))
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(StoreError::Conflict(definition.key.clone()));
        }
        Self::check(&url, resp).await.map(|_| ())
    }

    async fn delete_store(&self, key: &StoreKey) -> Result<(), StoreError> {
        let url = self.store_url(key);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(key.clone()));
        }
        Self::check(&url, resp).await.map(|_| ())
    }

    async fn fetch_tracking_report(&self, session: &str) -> Result<TrackingReport, StoreError> {
        let url = self.tracking_record_url(session);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        // No record means the build neither read nor wrote anything.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(TrackingReport::default());
        }
        let resp = Self::check(&url, resp).await?;
        let dto: TrackingReportDto = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(format!("{}: {}", url, e)))?;
        Ok(TrackingReport {
            downloads: dto
                .downloads
                .unwrap_or_default()
                .into_iter()
                .map(Into::into)
                .collect(),
            uploads: dto
                .uploads
                .unwrap_or_default()
                .into_iter()
                .map(Into::into)
                .collect(),
        })
    }

    async fn clear_tracking_record(&self, session: &str) -> Result<(), StoreError> {
        let url = self.tracking_record_url(session);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        Self::check(&url, resp).await.map(|_| ())
    }

    async fn promote(&self, request: &PromoteRequest) -> Result<PromoteResult, StoreError> {
        self.post_promotion("promotion/paths/promote", &PromoteRequestDto::from(request))
            .await
    }

    async fn rollback(&self, result: &PromoteResult) -> Result<PromoteResult, StoreError> {
        self.post_promotion("promotion/paths/rollback", &PromoteResultDto::from(result))
            .await
    }

    fn content_url(&self, key: &StoreKey, path: &str) -> String {
        self.url(&format!(
            "content/{}/{}/{}",
            key.kind,
            key.id,
            path.trim_start_matches('/')
        ))
    }

    fn tracking_url(&self, session: &str, group: &StoreKey) -> String {
        self.url(&format!("folo/track/{}/{}/{}", session, group.kind, group.id))
    }
}
