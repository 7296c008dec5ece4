//! Configuration and build-record persistence.

mod file;
mod memory;

pub use file::{CatalogFile, FileCatalog};
pub use memory::MemoryCatalog;

use conveyor_common::BuildRecord;

/// Pick the most recent successful record from `records`.
fn latest_success<'a>(records: impl IntoIterator<Item = &'a BuildRecord>) -> Option<&'a BuildRecord> {
    records
        .into_iter()
        .filter(|r| r.is_success())
        .max_by_key(|r| r.finished_at.unwrap_or(r.started_at))
}
