//! Lazy creation of the layered store hierarchy.

use conveyor_common::{
    ArtifactStore, Configuration, ConnectionInfo, ProductVersion, RepositoryConfiguration,
    StoreDefinition, StoreError, StoreKey,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::errors::WorkspaceProvisioningError;
use crate::repository::StoreTier;
use crate::repository::naming::{
    BuildIdGenerator, DEFAULT_PUBLIC_GROUP, SHARED_IMPORTS_ID, SHARED_RELEASES_ID,
    build_store_id, product_store_id,
};

/// Attempts at finding an unused build store id before giving up.
const BUILD_ID_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct HierarchySettings {
    /// Group of remote proxies placed last in every product group
    pub public_group: String,
    /// Extra attempts for existence checks and creations after a transient failure
    pub retries: u32,
    /// Delay before the first retry; grows linearly
    pub retry_backoff: Duration,
}

impl Default for HierarchySettings {
    fn default() -> Self {
        Self {
            public_group: DEFAULT_PUBLIC_GROUP.to_string(),
            retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl HierarchySettings {
    pub fn with_public_group(mut self, group: impl Into<String>) -> Self {
        self.public_group = group.into();
        self
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.retry_backoff = backoff;
        self
    }
}

/// Creates shared, product and per-build stores on demand.
///
/// "Exists, else create" is serialized per store key, so concurrent submissions for
/// the same product never race each other into a duplicate create.
pub struct HierarchyManager {
    store: Arc<dyn ArtifactStore>,
    settings: HierarchySettings,
    locks: Mutex<HashMap<StoreKey, Arc<AsyncMutex<()>>>>,
    ids: BuildIdGenerator,
}

impl HierarchyManager {
    pub fn new(store: Arc<dyn ArtifactStore>, settings: HierarchySettings) -> Self {
        Self {
            store,
            settings,
            locks: Mutex::new(HashMap::new()),
            ids: BuildIdGenerator::new(),
        }
    }

    pub fn settings(&self) -> &HierarchySettings {
        &self.settings
    }

    /// Provision the full workspace for one build of `configuration`.
    pub async fn provision(
        &self,
        configuration: &Configuration,
        product: &ProductVersion,
    ) -> Result<RepositoryConfiguration, WorkspaceProvisioningError> {
        self.setup_shared().await?;
        let product_id = self.setup_product(product).await?;
        let build_id = self.setup_build(&configuration.project, &product_id).await?;

        let tracking_url = self
            .store
            .tracking_url(&build_id, &StoreKey::group(&build_id));
        let connection = ConnectionInfo::from_tracking_url(tracking_url)
            .with_property("build-store", &build_id)
            .with_property("product-store", &product_id);

        info!(
            configuration = %configuration.id,
            build_store = %build_id,
            product_store = %product_id,
            "workspace provisioned"
        );

        Ok(RepositoryConfiguration {
            build_id,
            product_id,
            connection,
        })
    }

    /// Create `shared-releases` and `shared-imports` if absent.
    pub async fn setup_shared(&self) -> Result<(), WorkspaceProvisioningError> {
        for id in [SHARED_RELEASES_ID, SHARED_IMPORTS_ID] {
            let definition = StoreDefinition::hosted_releases(id)
                .with_description(format!("Shared {} content", id.trim_start_matches("shared-")));
            self.ensure_store(&definition, StoreTier::Shared).await?;
        }
        Ok(())
    }

    /// Create the product hosted store and group if absent, returning their id.
    pub async fn setup_product(
        &self,
        product: &ProductVersion,
    ) -> Result<String, WorkspaceProvisioningError> {
        let product_id = product_store_id(product);

        let hosted = StoreDefinition::hosted_releases(&product_id).with_description(format!(
            "Artifacts built for {} {}",
            product.product, product.version
        ));
        self.ensure_store(&hosted, StoreTier::Product).await?;

        let group = StoreDefinition::group(
            &product_id,
            vec![
                StoreKey::hosted(&product_id),
                StoreKey::hosted(SHARED_RELEASES_ID),
                StoreKey::hosted(SHARED_IMPORTS_ID),
                StoreKey::group(&self.settings.public_group),
            ],
        )
        .with_description(format!("Content visible to {} {}", product.product, product.version));
        self.ensure_store(&group, StoreTier::Product).await?;

        Ok(product_id)
    }

    /// Create a fresh build hosted store and group layered over the product group.
    ///
    /// When the group cannot be created the hosted store made by this attempt is
    /// deleted again; shared and product tiers are left alone.
    pub async fn setup_build(
        &self,
        project: &str,
        product_id: &str,
    ) -> Result<String, WorkspaceProvisioningError> {
        let build_id = self.unused_build_id(project).await?;
        let hosted_key = StoreKey::hosted(&build_id);

        let hosted = StoreDefinition::hosted_releases(&build_id)
            .with_snapshots(true)
            .with_description(format!("Output of build {}", build_id));
        self.retrying("create", &hosted_key, || self.store.create_store(&hosted))
            .await
            .map_err(|source| WorkspaceProvisioningError {
                tier: StoreTier::Build,
                store: hosted_key.clone(),
                source,
            })?;

        let group = StoreDefinition::group(
            &build_id,
            vec![hosted_key.clone(), StoreKey::group(product_id)],
        )
        .with_description(format!("Workspace of build {}", build_id));
        let group_key = group.key.clone();

        if let Err(source) = self
            .retrying("create", &group_key, || self.store.create_store(&group))
            .await
        {
            if let Err(e) = self.store.delete_store(&hosted_key).await {
                warn!(store = %hosted_key, error = %e, "failed to remove partially provisioned build store");
            }
            return Err(WorkspaceProvisioningError {
                tier: StoreTier::Build,
                store: group_key,
                source,
            });
        }

        Ok(build_id)
    }

    /// Pick a build id whose stores do not exist yet.
    async fn unused_build_id(&self, project: &str) -> Result<String, WorkspaceProvisioningError> {
        let mut last_key = StoreKey::group(build_store_id(project, 0));
        for _ in 0..BUILD_ID_ATTEMPTS {
            let build_id = build_store_id(project, self.ids.next_id());
            let group_key = StoreKey::group(&build_id);
            let hosted_key = StoreKey::hosted(&build_id);

            let taken = self.exists(&group_key, StoreTier::Build).await?
                || self.exists(&hosted_key, StoreTier::Build).await?;
            if !taken {
                return Ok(build_id);
            }
            debug!(store = %group_key, "build store id already in use, trying another");
            last_key = group_key;
        }
        Err(WorkspaceProvisioningError {
            tier: StoreTier::Build,
            store: last_key.clone(),
            source: StoreError::Conflict(last_key),
        })
    }

    /// Create a store unless it already exists. Returns whether this call created it.
    pub async fn ensure_store(
        &self,
        definition: &StoreDefinition,
        tier: StoreTier,
    ) -> Result<bool, WorkspaceProvisioningError> {
        let key = &definition.key;
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        if self.exists(key, tier).await? {
            return Ok(false);
        }

        match self
            .retrying("create", key, || self.store.create_store(definition))
            .await
        {
            Ok(()) => {
                info!(store = %key, tier = %tier, "created store");
                Ok(true)
            }
            // Created elsewhere between our check and our create.
            Err(StoreError::Conflict(_)) => Ok(false),
            Err(source) => Err(WorkspaceProvisioningError {
                tier,
                store: key.clone(),
                source,
            }),
        }
    }

    async fn exists(&self, key: &StoreKey, tier: StoreTier) -> Result<bool, WorkspaceProvisioningError> {
        self.retrying("exists", key, || self.store.exists_store(key))
            .await
            .map_err(|source| WorkspaceProvisioningError {
                tier,
                store: key.clone(),
                source,
            })
    }

    /// Run an idempotent store call, repeating it after transient failures.
    async fn retrying<T, F, Fut>(&self, op: &str, key: &StoreKey, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.settings.retries => {
                    attempt += 1;
                    warn!(store = %key, op, attempt, error = %e, "store call failed, retrying");
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn key_lock(&self, key: &StoreKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.clone()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;
    use conveyor_common::StoreKind;

    fn manager(store: Arc<MemoryStore>) -> HierarchyManager {
        HierarchyManager::new(
            store,
            HierarchySettings::default().with_retries(2, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_product_group_constituent_order() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(store.clone());

        let id = mgr
            .setup_product(&ProductVersion::new("EAP", "7.0"))
            .await
            .unwrap();
        assert_eq!(id, "product+EAP+7-0");

        let group = store.definition(&StoreKey::group(&id)).unwrap();
        assert_eq!(
            group.constituents,
            vec![
                StoreKey::hosted("product+EAP+7-0"),
                StoreKey::hosted(SHARED_RELEASES_ID),
                StoreKey::hosted(SHARED_IMPORTS_ID),
                StoreKey::group("public"),
            ]
        );
        let hosted = store.definition(&StoreKey::hosted(&id)).unwrap();
        assert!(hosted.allow_releases);
        assert!(!hosted.allow_snapshots);
    }

    #[tokio::test]
    async fn test_shared_tier_is_releases_only() {
        let store = Arc::new(MemoryStore::new());
        manager(store.clone()).setup_shared().await.unwrap();

        for id in [SHARED_RELEASES_ID, SHARED_IMPORTS_ID] {
            let def = store.definition(&StoreKey::hosted(id)).unwrap();
            assert!(def.allow_releases);
            assert!(!def.allow_snapshots);
        }
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(store.clone());
        let pv = ProductVersion::new("prod", "1");

        mgr.setup_product(&pv).await.unwrap();
        mgr.setup_product(&pv).await.unwrap();

        assert_eq!(store.create_count(&StoreKey::hosted("product+prod+1")), 1);
        assert_eq!(store.create_count(&StoreKey::group("product+prod+1")), 1);
    }

    #[tokio::test]
    async fn test_concurrent_setup_creates_once() {
        let store = Arc::new(MemoryStore::new());
        let mgr = Arc::new(manager(store.clone()));
        let pv = ProductVersion::new("prod", "2");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                let pv = pv.clone();
                tokio::spawn(async move { mgr.setup_product(&pv).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.create_count(&StoreKey::hosted("product+prod+2")), 1);
        assert_eq!(store.create_count(&StoreKey::group("product+prod+2")), 1);
        assert_eq!(store.create_count(&StoreKey::hosted(SHARED_IMPORTS_ID)), 1);
    }

    #[tokio::test]
    async fn test_provision_builds_layered_workspace() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(store.clone());
        let cfg = Configuration::new("app", "My App");

        let repo = mgr
            .provision(&cfg, &ProductVersion::new("prod", "1"))
            .await
            .unwrap();

        assert!(repo.build_id.starts_with("build+My-App+"));
        assert_eq!(repo.product_id, "product+prod+1");
        let hosted = store.definition(&repo.build_hosted()).unwrap();
        assert!(hosted.allow_snapshots && hosted.allow_releases);
        let group = store.definition(&repo.build_group()).unwrap();
        assert_eq!(
            group.constituents,
            vec![repo.build_hosted(), repo.product_group()]
        );
        assert!(repo.connection.tracking_url.contains(&repo.build_id));
        assert_eq!(repo.connection.properties["product-store"], repo.product_id);
    }

    #[tokio::test]
    async fn test_failed_group_creation_removes_build_hosted_store() {
        let store = Arc::new(MemoryStore::new());
        store.fail_creates_of_kind(StoreKind::Group, "group rejected");
        let mgr = manager(store.clone());

        let err = mgr.setup_build("proj", "product+p+1").await.unwrap_err();
        assert_eq!(err.tier, StoreTier::Build);
        assert_eq!(err.store.kind, StoreKind::Group);

        let remaining: Vec<StoreKey> = store
            .store_keys()
            .into_iter()
            .filter(|k| k.id.starts_with("build+"))
            .collect();
        assert!(remaining.is_empty(), "left behind: {remaining:?}");
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_exists(2, StoreError::Transport("connection reset".into()));
        let mgr = manager(store.clone());

        mgr.setup_shared().await.unwrap();
        assert!(store.definition(&StoreKey::hosted(SHARED_RELEASES_ID)).is_some());
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_exists(10, StoreError::Transport("down".into()));
        let mgr = manager(store.clone());

        let err = mgr.setup_shared().await.unwrap_err();
        assert_eq!(err.tier, StoreTier::Shared);
        assert!(err.to_string().contains("down"));
    }
}
