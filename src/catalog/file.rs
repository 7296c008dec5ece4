//! File-backed catalog: configurations from a TOML file, build records as JSON.
//!
//! ```toml
//! [[configuration]]
//! id = "app"
//! name = "Application"
//! project = "app"
//! build_script = "mvn deploy"
//! dependencies = ["lib"]
//!
//! [configuration.product_version]
//! product = "suite"
//! version = "2.0"
//! ```
//!
//! Each build record is written to `<records_dir>/<record-id>.json`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use conveyor_common::{BuildRecord, Catalog, CatalogError, Configuration, ConfigurationId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// On-disk shape of the configuration catalog.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default, rename = "configuration")]
    pub configurations: Vec<Configuration>,
}

impl CatalogFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse catalog: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML in catalog")
    }
}

pub struct FileCatalog {
    configurations: HashMap<ConfigurationId, Configuration>,
    records_dir: PathBuf,
}

impl FileCatalog {
    /// Read configurations from `catalog_path`; records go under `records_dir`.
    pub fn open(catalog_path: &Path, records_dir: &Path) -> Result<Self> {
        let file = CatalogFile::load(catalog_path)?;
        Ok(Self::from_file(file, records_dir))
    }

    pub fn from_file(file: CatalogFile, records_dir: &Path) -> Self {
        let configurations = file
            .configurations
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        Self {
            configurations,
            records_dir: records_dir.to_path_buf(),
        }
    }

    pub fn configurations(&self) -> impl Iterator<Item = &Configuration> {
        self.configurations.values()
    }

    fn record_path(&self, record: &BuildRecord) -> PathBuf {
        self.records_dir.join(format!("{}.json", record.id))
    }

    /// Read every record on disk. Unreadable files are skipped with a warning.
    async fn read_records(&self) -> Result<Vec<BuildRecord>, CatalogError> {
        let mut entries = match tokio::fs::read_dir(&self.records_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<BuildRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable build record"),
            }
        }
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }
}

#[async_trait]
impl Catalog for FileCatalog {
    async fn load_configuration(
        &self,
        id: &ConfigurationId,
    ) -> Result<Configuration, CatalogError> {
        self.configurations
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(id.clone()))
    }

    async fn save_build_record(&self, record: &BuildRecord) -> Result<(), CatalogError> {
        tokio::fs::create_dir_all(&self.records_dir).await?;
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(self.record_path(record), json).await?;
        Ok(())
    }

    async fn latest_successful_record(
        &self,
        id: &ConfigurationId,
    ) -> Result<Option<BuildRecord>, CatalogError> {
        let records = self.read_records().await?;
        Ok(super::latest_success(records.iter().filter(|r| &r.configuration == id)).cloned())
    }

    async fn records_for_configuration(
        &self,
        id: &ConfigurationId,
    ) -> Result<Vec<BuildRecord>, CatalogError> {
        let mut records = self.read_records().await?;
        records.retain(|r| &r.configuration == id);
        Ok(records)
    }

    async fn records_for_project(&self, project: &str) -> Result<Vec<BuildRecord>, CatalogError> {
        let mut records = self.read_records().await?;
        records.retain(|r| r.project == project);
        Ok(records)
    }
}
