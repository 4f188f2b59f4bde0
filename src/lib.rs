// Library exports for the FoundationDB process monitor

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod paths;
pub mod process;
pub mod supervisor;
pub mod watcher;
