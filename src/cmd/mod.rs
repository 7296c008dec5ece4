//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `plan`    | `Plan`           |
//! | `build`   | `Build`          |
//! | `records` | `Records`        |
//! | `config`  | `Config`         |

pub mod build;
pub mod config;
pub mod plan;
pub mod records;

pub use build::cmd_build;
pub use config::cmd_config;
pub use plan::cmd_plan;
pub use records::cmd_records;

use anyhow::Result;
use conveyor::catalog::FileCatalog;
use conveyor::config::ConveyorConfig;

/// Open the file catalog named in the configuration.
fn open_catalog(config: &ConveyorConfig) -> Result<FileCatalog> {
    FileCatalog::open(&config.catalog.path, &config.catalog.records_dir)
}
