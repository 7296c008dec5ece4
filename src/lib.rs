pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod dag;
pub mod driver;
pub mod errors;
pub mod logging;
pub mod repository;

pub use coordinator::BuildCoordinator;
