//! Configurations, build records and artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a buildable configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationId(pub String);

impl ConfigurationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigurationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConfigurationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConfigurationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identifier of one build task within a submission.
    TaskId
);
uuid_id!(
    /// Identifier of a build submission (one root build request).
    SubmissionId
);
uuid_id!(
    /// Identifier of a persisted build record.
    BuildRecordId
);

/// Product and version a build contributes to.
///
/// Selects the per-product store tier builds resolve through and promote into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductVersion {
    pub product: String,
    pub version: String,
}

impl ProductVersion {
    pub fn new(product: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.product, self.version)
    }
}

/// A buildable unit with declared dependencies on other configurations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: ConfigurationId,
    pub name: String,
    /// Project this configuration belongs to. Used for build store naming.
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_version: Option<ProductVersion>,
    /// Script handed to the build driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scm_url: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<ConfigurationId>,
}

impl Configuration {
    pub fn new(id: impl Into<String>, project: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: ConfigurationId(id),
            project: project.into(),
            product_version: None,
            build_script: None,
            scm_url: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(|d| ConfigurationId(d.into())).collect();
        self
    }

    pub fn with_build_script(mut self, script: impl Into<String>) -> Self {
        self.build_script = Some(script.into());
        self
    }

    pub fn with_product_version(mut self, product_version: ProductVersion) -> Self {
        self.product_version = Some(product_version);
        self
    }
}

/// Final status of a build as recorded in its [`BuildRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Build and promotion both succeeded.
    Success,
    /// The driver reported a failed build or could not be reached.
    Failed,
    /// The build succeeded but its outputs could not be promoted.
    PromotionFailed,
    /// The build was stopped before it finished.
    Cancelled,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Success => write!(f, "success"),
            BuildStatus::Failed => write!(f, "failed"),
            BuildStatus::PromotionFailed => write!(f, "promotion_failed"),
            BuildStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How an artifact relates to the build that recorded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Downloaded by the build as a dependency.
    ResolvedAsImport,
    /// Uploaded by the build as output.
    BuiltByTask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Coordinate string, e.g. `org.foo:bar:jar:1.0`.
    pub identifier: String,
    pub checksum: String,
    pub deploy_url: String,
    pub filename: String,
    pub status: ArtifactStatus,
    pub build_record: BuildRecordId,
}

/// Durable outcome of a build task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: BuildRecordId,
    pub task: TaskId,
    pub configuration: ConfigurationId,
    pub project: String,
    pub status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_reference: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<Artifact>,
    #[serde(default)]
    pub built_artifacts: Vec<Artifact>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BuildRecord {
    /// Start a record for a task that is about to be dispatched.
    pub fn start(task: TaskId, configuration: &Configuration) -> Self {
        Self {
            id: BuildRecordId::new(),
            task,
            configuration: configuration.id.clone(),
            project: configuration.project.clone(),
            status: BuildStatus::Failed,
            log_reference: None,
            dependencies: Vec::new(),
            built_artifacts: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn finish(&mut self, status: BuildStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Success
    }
}
