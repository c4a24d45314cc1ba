//! Process configuration, assembled from environment variables.
//!
//! Mirrors the shape of the teacher's `RpcConfig`/`ConfigValidationError`:
//! a plain struct with a fallible `from_env` constructor and explicit
//! validation, rather than a config-file framework.

use std::fmt;
use std::time::Duration;

/// Default listen port (spec.md §6).
pub const DEFAULT_PORT: u16 = 3000;

/// Default timeout for the synchronous `CreateScale` RPC (spec.md §4.7,
/// §5 "Timeouts"). Minutes scale, per spec wording.
pub const DEFAULT_SCALE_TIMEOUT: Duration = Duration::from_secs(60 * 10);

/// Error assembling [`Config`] from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `PORT` was set but is not a valid u16.
    InvalidPort(String),
    /// `DATABASE_URL` is required and was not set.
    MissingDatabaseUrl,
    /// `SCALE_TIMEOUT_SECS` was set but is not a valid positive integer.
    InvalidScaleTimeout(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPort(v) => write!(f, "PORT={v:?} is not a valid port number"),
            Self::MissingDatabaseUrl => write!(f, "DATABASE_URL is required"),
            Self::InvalidScaleTimeout(v) => {
                write!(f, "SCALE_TIMEOUT_SECS={v:?} is not a valid positive integer")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Process-wide configuration (spec.md §6 "Environment").
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the demultiplexer listens on.
    pub port: u16,
    /// Default domain new apps' routes are created under. Consumed
    /// verbatim; the server does not interpret it further.
    pub default_route_domain: Option<String>,
    /// Connection string for the relational store.
    pub database_url: String,
    /// Timeout for the synchronous `CreateScale` RPC.
    pub scale_timeout: Duration,
}

impl Config {
    /// Assemble configuration from the process environment. `DATABASE_URL`
    /// is mandatory; everything else has a spec-defined default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match std::env::var("PORT") {
            Ok(v) => v.parse().map_err(|_| ConfigError::InvalidPort(v))?,
            Err(_) => DEFAULT_PORT,
        };

        let default_route_domain = std::env::var("DEFAULT_ROUTE_DOMAIN").ok();

        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let scale_timeout = match std::env::var("SCALE_TIMEOUT_SECS") {
            Ok(v) => {
                let secs: u64 = v
                    .parse()
                    .map_err(|_| ConfigError::InvalidScaleTimeout(v.clone()))?;
                if secs == 0 {
                    return Err(ConfigError::InvalidScaleTimeout(v));
                }
                Duration::from_secs(secs)
            }
            Err(_) => DEFAULT_SCALE_TIMEOUT,
        };

        Ok(Config {
            port,
            default_route_domain,
            database_url,
            scale_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment variables are process-global; these tests only exercise
    // the parsing helpers directly rather than mutating `std::env` to avoid
    // cross-test interference.

    #[test]
    fn display_messages_are_non_empty() {
        assert!(!ConfigError::MissingDatabaseUrl.to_string().is_empty());
        assert!(!ConfigError::InvalidPort("x".into()).to_string().is_empty());
        assert!(
            !ConfigError::InvalidScaleTimeout("x".into())
                .to_string()
                .is_empty()
        );
    }
}
