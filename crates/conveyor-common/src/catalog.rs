//! Persistence interface for configurations and build records.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{BuildRecord, Configuration, ConfigurationId};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Configuration {0} not found")]
    NotFound(ConfigurationId),

    #[error("Catalog storage error: {0}")]
    Storage(String),

    #[error("Catalog I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize catalog data: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn load_configuration(&self, id: &ConfigurationId)
    -> Result<Configuration, CatalogError>;

    async fn save_build_record(&self, record: &BuildRecord) -> Result<(), CatalogError>;

    /// Most recent successful record for a configuration, if any.
    async fn latest_successful_record(
        &self,
        id: &ConfigurationId,
    ) -> Result<Option<BuildRecord>, CatalogError>;

    async fn records_for_configuration(
        &self,
        id: &ConfigurationId,
    ) -> Result<Vec<BuildRecord>, CatalogError>;

    async fn records_for_project(&self, project: &str) -> Result<Vec<BuildRecord>, CatalogError>;
}
