//! Artifact-store workspaces.
//!
//! Every build reads and writes through a layered hierarchy of stores:
//!
//! 1. **Shared** - `shared-releases` and `shared-imports`, created once and kept forever
//! 2. **Product** - one hosted store plus a group per product version
//! 3. **Build** - one hosted store plus a group per build, torn down afterwards
//!
//! [`HierarchyManager`] creates the tiers, [`PromotionEngine`] moves content out of a
//! finished build's workspace into the durable tiers.

pub mod artifact_path;
mod hierarchy;
pub mod http;
pub mod memory;
pub mod naming;
mod promotion;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use artifact_path::ArtifactPathInfo;
pub use hierarchy::{HierarchyManager, HierarchySettings};
pub use http::HttpStoreClient;
pub use memory::MemoryStore;
pub use naming::BuildIdGenerator;
pub use promotion::PromotionEngine;

/// Which layer of the store hierarchy an operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreTier {
    Shared,
    Product,
    Build,
}

impl fmt::Display for StoreTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreTier::Shared => write!(f, "shared"),
            StoreTier::Product => write!(f, "product"),
            StoreTier::Build => write!(f, "build"),
        }
    }
}
