//! Promotion of build outputs and imports, and workspace teardown.

use conveyor_common::{
    Artifact, ArtifactStatus, ArtifactStore, BuildRecord, BuildRecordId, PromoteRequest, RepositoryConfiguration,
    StoreKey, TrackedEntry, TrackingReport,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{CleanupError, PromotionError, RollbackError};
use crate::repository::artifact_path::ArtifactPathInfo;
use crate::repository::naming::{SHARED_IMPORTS_ID, SHARED_RELEASES_ID};

/// Turns a build's tracking report into promotions and artifact metadata.
pub struct PromotionEngine {
    store: Arc<dyn ArtifactStore>,
}

impl PromotionEngine {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// Promote everything the build produced or imported, filling in the record's
    /// artifact lists.
    ///
    /// Uploads go first: the build hosted store is promoted whole into the product
    /// hosted store. Downloads from origins outside the shared tier are then captured
    /// into `shared-imports`, one path-scoped promotion per origin.
    pub async fn persist_artifacts(
        &self,
        repository: &RepositoryConfiguration,
        record: &mut BuildRecord,
    ) -> Result<(), PromotionError> {
        let session = &repository.build_id;
        let report = self
            .store
            .fetch_tracking_report(session)
            .await
            .map_err(|source| PromotionError::TrackingReport {
                session: session.clone(),
                source,
            })?;

        debug!(
            build_store = %session,
            downloads = report.downloads.len(),
            uploads = report.uploads.len(),
            "fetched tracking report"
        );

        self.process_uploads(&report, repository, record).await?;
        self.process_downloads(&report, record).await?;
        Ok(())
    }

    async fn process_uploads(
        &self,
        report: &TrackingReport,
        repository: &RepositoryConfiguration,
        record: &mut BuildRecord,
    ) -> Result<(), PromotionError> {
        if report.uploads.is_empty() {
            return Ok(());
        }

        let product_hosted = repository.product_hosted();
        self.do_promote(PromoteRequest::whole_store(
            repository.build_hosted(),
            product_hosted.clone(),
        ))
        .await?;

        let record_id = record.id;
        record.built_artifacts = report
            .uploads
            .iter()
            .filter_map(|upload| {
                let fallback = || self.store.content_url(&product_hosted, &upload.path);
                let deploy_url = upload.local_url.clone().unwrap_or_else(fallback);
                self.artifact(upload, deploy_url, ArtifactStatus::BuiltByTask, record_id)
            })
            .collect();
        Ok(())
    }

    async fn process_downloads(
        &self,
        report: &TrackingReport,
        record: &mut BuildRecord,
    ) -> Result<(), PromotionError> {
        let shared_imports = StoreKey::hosted(SHARED_IMPORTS_ID);
        let shared_releases = StoreKey::hosted(SHARED_RELEASES_ID);

        let mut uncaptured: BTreeMap<StoreKey, BTreeSet<String>> = BTreeMap::new();
        let mut dependencies = Vec::new();

        for download in &report.downloads {
            if download.store_key != shared_imports && download.store_key != shared_releases {
                uncaptured
                    .entry(download.store_key.clone())
                    .or_default()
                    .insert(download.path.clone());
            }
            let deploy_url = self.store.content_url(&download.store_key, &download.path);
            if let Some(artifact) =
                self.artifact(download, deploy_url, ArtifactStatus::ResolvedAsImport, record.id)
            {
                dependencies.push(artifact);
            }
        }

        for (origin, paths) in uncaptured {
            self.do_promote(PromoteRequest::paths(origin, shared_imports.clone(), paths))
                .await?;
        }

        record.dependencies = dependencies;
        Ok(())
    }

    fn artifact(
        &self,
        entry: &TrackedEntry,
        deploy_url: String,
        status: ArtifactStatus,
        build_record: BuildRecordId,
    ) -> Option<Artifact> {
        let Some(info) = ArtifactPathInfo::parse(&entry.path) else {
            debug!(path = %entry.path, "not an artifact, skipping");
            return None;
        };
        Some(Artifact {
            identifier: info.identifier(),
            checksum: entry.sha256.clone(),
            deploy_url,
            filename: info.filename,
            status,
            build_record,
        })
    }

    /// Run one promotion. A service-side error triggers a rollback of that same
    /// result; if the rollback fails too, both reasons are surfaced.
    pub async fn do_promote(&self, request: PromoteRequest) -> Result<(), PromotionError> {
        let result = match self.store.promote(&request).await {
            Ok(result) => result,
            Err(source) => return Err(PromotionError::Transport { request, source }),
        };

        let Some(reason) = result.error.clone() else {
            info!(
                promotion = %request,
                completed = result.completed_paths.len(),
                "promoted"
            );
            return Ok(());
        };

        warn!(promotion = %request, reason = %reason, "promotion failed, rolling back");
        let rollback = match self.store.rollback(&result).await {
            Ok(rolled_back) => rolled_back.error.map(|reason| RollbackError { reason }),
            Err(e) => Some(RollbackError {
                reason: e.to_string(),
            }),
        };
        if let Some(rollback) = &rollback {
            warn!(promotion = %request, reason = %rollback.reason, "promotion rollback failed");
        }

        Err(PromotionError::Rejected {
            request,
            reason,
            rollback,
        })
    }

    /// Tear down a build's workspace: clear its tracking record, delete its group,
    /// delete its hosted store. Every step is attempted; failures are collected.
    pub async fn cleanup(&self, repository: &RepositoryConfiguration) -> Result<(), CleanupError> {
        let build_id = &repository.build_id;
        let mut failures = Vec::new();

        if let Err(e) = self.store.clear_tracking_record(build_id).await {
            failures.push(format!("clear tracking record: {}", e));
        }
        for key in [repository.build_group(), repository.build_hosted()] {
            if let Err(e) = self.store.delete_store(&key).await {
                failures.push(format!("delete {}: {}", key, e));
            }
        }

        if failures.is_empty() {
            debug!(build_store = %build_id, "workspace removed");
            Ok(())
        } else {
            Err(CleanupError {
                build_id: build_id.clone(),
                failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;
    use crate::repository::hierarchy::{HierarchyManager, HierarchySettings};
    use conveyor_common::{Configuration, ProductVersion, TaskId};

    async fn workspace(store: &Arc<MemoryStore>) -> RepositoryConfiguration {
        HierarchyManager::new(store.clone(), HierarchySettings::default())
            .provision(
                &Configuration::new("app", "proj"),
                &ProductVersion::new("prod", "1"),
            )
            .await
            .unwrap()
    }

    fn record() -> BuildRecord {
        BuildRecord::start(TaskId::new(), &Configuration::new("app", "proj"))
    }

    #[tokio::test]
    async fn test_downloads_and_uploads_are_promoted() {
        let store = Arc::new(MemoryStore::new());
        let repo = workspace(&store).await;
        let session = repo.build_id.clone();

        store.record_download(
            &session,
            &StoreKey::hosted(SHARED_IMPORTS_ID),
            "org/dep/known/1.0/known-1.0.jar",
            b"known",
        );
        store.record_download(
            &session,
            &StoreKey::remote("central"),
            "org/dep/fresh/2.0/fresh-2.0.jar",
            b"fresh",
        );
        store.record_upload(&session, "org/app/app/1.0/app-1.0.jar", b"app");

        let engine = PromotionEngine::new(store.clone());
        let mut rec = record();
        engine.persist_artifacts(&repo, &mut rec).await.unwrap();

        let promotions = store.promotions();
        assert_eq!(promotions.len(), 2);
        assert!(promotions[0].is_whole_store());
        assert_eq!(promotions[0].source, repo.build_hosted());
        assert_eq!(promotions[0].target, repo.product_hosted());
        assert_eq!(promotions[1].source, StoreKey::remote("central"));
        assert_eq!(promotions[1].target, StoreKey::hosted(SHARED_IMPORTS_ID));
        assert_eq!(
            promotions[1].paths.as_ref().unwrap().len(),
            1,
            "only the uncaptured path is promoted"
        );

        assert_eq!(rec.dependencies.len(), 2);
        assert_eq!(rec.built_artifacts.len(), 1);
        let built = &rec.built_artifacts[0];
        assert_eq!(built.identifier, "org.app:app:jar:1.0");
        assert_eq!(built.status, ArtifactStatus::BuiltByTask);
        assert!(built.deploy_url.contains(&repo.build_id));
        assert!(
            store
                .paths(&repo.product_hosted())
                .contains(&"org/app/app/1.0/app-1.0.jar".to_string())
        );
    }

    #[tokio::test]
    async fn test_no_uploads_means_no_whole_store_promotion() {
        let store = Arc::new(MemoryStore::new());
        let repo = workspace(&store).await;

        let engine = PromotionEngine::new(store.clone());
        let mut rec = record();
        engine.persist_artifacts(&repo, &mut rec).await.unwrap();

        assert!(store.promotions().is_empty());
        assert!(rec.built_artifacts.is_empty());
        assert!(rec.dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_is_not_recorded_as_artifact() {
        let store = Arc::new(MemoryStore::new());
        let repo = workspace(&store).await;
        store.record_download(
            &repo.build_id,
            &StoreKey::hosted(SHARED_RELEASES_ID),
            "org/dep/lib/maven-metadata.xml",
            b"<metadata/>",
        );

        let mut rec = record();
        PromotionEngine::new(store.clone())
            .persist_artifacts(&repo, &mut rec)
            .await
            .unwrap();
        assert!(rec.dependencies.is_empty());
        assert!(store.promotions().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_promotion_is_rolled_back() {
        let store = Arc::new(MemoryStore::new());
        let repo = workspace(&store).await;
        store.record_upload(&repo.build_id, "org/app/app/1.0/app-1.0.jar", b"app");
        store.fail_promotions_into(repo.product_hosted(), "target is read-only");

        let mut rec = record();
        let err = PromotionEngine::new(store.clone())
            .persist_artifacts(&repo, &mut rec)
            .await
            .unwrap_err();

        assert_eq!(store.rollbacks().len(), 1);
        assert!(err.rollback_error().is_none());
        assert!(err.to_string().contains("target is read-only"));
        assert!(rec.built_artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_failed_rollback_surfaces_both_reasons() {
        let store = Arc::new(MemoryStore::new());
        let repo = workspace(&store).await;
        store.record_upload(&repo.build_id, "org/app/app/1.0/app-1.0.jar", b"app");
        store.fail_promotions_into(repo.product_hosted(), "checksum mismatch");
        store.fail_rollbacks("store locked");

        let err = PromotionEngine::new(store.clone())
            .persist_artifacts(&repo, &mut record())
            .await
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("checksum mismatch"));
        assert!(msg.contains("store locked"));
    }

    #[tokio::test]
    async fn test_cleanup_removes_workspace() {
        let store = Arc::new(MemoryStore::new());
        let repo = workspace(&store).await;

        PromotionEngine::new(store.clone())
            .cleanup(&repo)
            .await
            .unwrap();

        assert_eq!(store.cleared_sessions(), vec![repo.build_id.clone()]);
        assert_eq!(store.deleted(), vec![repo.build_group(), repo.build_hosted()]);
    }

    #[tokio::test]
    async fn test_cleanup_attempts_every_step() {
        let store = Arc::new(MemoryStore::new());
        let repo = workspace(&store).await;
        store.fail_clear_tracking("tracking service down");

        let err = PromotionEngine::new(store.clone())
            .cleanup(&repo)
            .await
            .unwrap_err();

        assert_eq!(err.failures.len(), 1);
        assert_eq!(store.deleted().len(), 2);
    }
}
