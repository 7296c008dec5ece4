//! Build drivers.
//!
//! - [`ProcessDriver`] runs a configuration's build script as a local child process
//! - [`ScriptedDriver`] plays back canned outcomes, for tests and dry runs

mod process;
mod scripted;

pub use process::ProcessDriver;
pub use scripted::{BuildActivity, ScriptedDriver, ScriptedOutcome};
