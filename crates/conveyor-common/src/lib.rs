//! Shared domain types for the conveyor build orchestrator.
//!
//! This crate holds the data model that flows between the orchestration core and
//! its external collaborators, together with the collaborator interfaces:
//!
//! - [`store::ArtifactStore`]: the remote artifact-store service
//! - [`driver::BuildDriver`]: the environment that actually runs builds
//! - [`catalog::Catalog`]: persistence for configurations and build records

pub mod catalog;
pub mod driver;
pub mod model;
pub mod store;

pub use catalog::{Catalog, CatalogError};
pub use driver::{
    BuildDriver, CompletedBuild, CompletionSender, DispatchRequest, DriverError, DriverStatus,
    RunningBuild,
};
pub use model::{
    Artifact, ArtifactStatus, BuildRecord, BuildRecordId, BuildStatus, Configuration,
    ConfigurationId, ProductVersion, SubmissionId, TaskId,
};
pub use store::{
    ArtifactStore, ConnectionInfo, PromoteRequest, PromoteResult, RepositoryConfiguration,
    StoreDefinition, StoreError, StoreKey, StoreKind, TrackedEntry, TrackingReport,
};
