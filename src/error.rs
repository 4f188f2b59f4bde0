use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the process monitor
#[derive(Debug, Error)]
pub enum MonitorError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unable to lookup user {0}")]
    UnknownUser(String),

    #[error("Unable to lookup group {0}")]
    UnknownGroup(String),

    // Process lifecycle errors
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Pipe error: {0}")]
    Pipe(String),

    // Configuration watch errors
    #[error("Configuration watch error: {0}")]
    Watch(String),

    // Startup infrastructure errors
    #[error("Lockfile {0} is locked by another process")]
    LockfileBusy(PathBuf),

    #[error("Startup error: {0}")]
    Startup(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Errors surfaced by raw system calls
    #[error("System error: {0}")]
    Sys(#[from] nix::errno::Errno),
}

/// Result type alias for monitor operations
pub type Result<T> = std::result::Result<T, MonitorError>;
