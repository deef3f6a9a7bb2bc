pub mod config;
pub mod coordinator;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod git;
pub mod guardrails;
pub mod integrate;
pub mod prompt;
pub mod reaper;
pub mod scheduler;
pub mod tracker;
pub mod workspace;

pub use error::{ForemanError, Result};

use tracing::info;

/// Branch and filesystem prefix shared by every foreman-owned resource.
pub const PRODUCT_PREFIX: &str = "foreman";

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("foreman tracing initialised");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ForemanError::Config("missing field".into());
        assert_eq!(err.to_string(), "config error: missing field");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: ForemanError = io_err.into();
        assert!(matches!(err, ForemanError::Io(_)));
    }
}
