//! Adapters for the outside world: config, filesystem, subprocesses, storage.

pub mod assistant;
pub mod config;
pub mod git;
pub mod github;
pub mod paths;
pub mod process;
pub mod store;
