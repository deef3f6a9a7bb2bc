use thiserror::Error;

/// Top-level error type for the foreman-core library.
#[derive(Debug, Error)]
pub enum ForemanError {
    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Work-item tracker error.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// Git command error.
    #[error("git error: {0}")]
    Git(String),

    /// Workspace lifecycle error.
    #[error("workspace error: {0}")]
    Workspace(String),

    /// Engine spawn or execution error.
    #[error("engine error: {0}")]
    Engine(String),

    /// Branch integration error.
    #[error("integration error: {0}")]
    Integration(String),

    /// Cross-process lock error.
    #[error("lock error: {0}")]
    Lock(String),

    /// Pre-flight check failure.
    #[error("preflight error: {0}")]
    Preflight(String),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::git::GitError> for ForemanError {
    fn from(err: crate::git::GitError) -> Self {
        ForemanError::Git(err.to_string())
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, ForemanError>;
