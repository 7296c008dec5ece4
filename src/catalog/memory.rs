use async_trait::async_trait;
use conveyor_common::{BuildRecord, Catalog, CatalogError, Configuration, ConfigurationId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Inner {
    configurations: HashMap<ConfigurationId, Configuration>,
    records: Vec<BuildRecord>,
}

/// Catalog held in memory.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: Mutex<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configurations(configurations: impl IntoIterator<Item = Configuration>) -> Self {
        let catalog = Self::new();
        for cfg in configurations {
            catalog.insert(cfg);
        }
        catalog
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, configuration: Configuration) {
        self.inner()
            .configurations
            .insert(configuration.id.clone(), configuration);
    }

    /// All saved records, in save order.
    pub fn records(&self) -> Vec<BuildRecord> {
        self.inner().records.clone()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn load_configuration(
        &self,
        id: &ConfigurationId,
    ) -> Result<Configuration, CatalogError> {
        self.inner()
            .configurations
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(id.clone()))
    }

    async fn save_build_record(&self, record: &BuildRecord) -> Result<(), CatalogError> {
        let mut inner = self.inner();
        match inner.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => inner.records.push(record.clone()),
        }
        Ok(())
    }

    async fn latest_successful_record(
        &self,
        id: &ConfigurationId,
    ) -> Result<Option<BuildRecord>, CatalogError> {
        let inner = self.inner();
        Ok(super::latest_success(inner.records.iter().filter(|r| &r.configuration == id)).cloned())
    }

    async fn records_for_configuration(
        &self,
        id: &ConfigurationId,
    ) -> Result<Vec<BuildRecord>, CatalogError> {
        Ok(self
            .inner()
            .records
            .iter()
            .filter(|r| &r.configuration == id)
            .cloned()
            .collect())
    }

    async fn records_for_project(&self, project: &str) -> Result<Vec<BuildRecord>, CatalogError> {
        Ok(self
            .inner()
            .records
            .iter()
            .filter(|r| r.project == project)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_common::{BuildStatus, TaskId};

    #[tokio::test]
    async fn test_unknown_configuration() {
        let catalog = MemoryCatalog::new();
        let err = catalog.load_configuration(&"nope".into()).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(id) if id.as_str() == "nope"));
    }

    #[tokio::test]
    async fn test_latest_successful_record_ignores_failures() {
        let cfg = Configuration::new("lib", "proj");
        let catalog = MemoryCatalog::with_configurations([cfg.clone()]);

        let mut ok = BuildRecord::start(TaskId::new(), &cfg);
        ok.finish(BuildStatus::Success, None);
        let mut failed = BuildRecord::start(TaskId::new(), &cfg);
        failed.finish(BuildStatus::Failed, Some("boom".into()));
        catalog.save_build_record(&ok).await.unwrap();
        catalog.save_build_record(&failed).await.unwrap();

        let latest = catalog
            .latest_successful_record(&cfg.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, ok.id);
        assert_eq!(catalog.records_for_project("proj").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_saving_same_record_twice_replaces_it() {
        let cfg = Configuration::new("lib", "proj");
        let catalog = MemoryCatalog::new();
        let mut record = BuildRecord::start(TaskId::new(), &cfg);
        catalog.save_build_record(&record).await.unwrap();
        record.finish(BuildStatus::Success, None);
        catalog.save_build_record(&record).await.unwrap();

        let records = catalog.records_for_configuration(&cfg.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_success());
    }
}
