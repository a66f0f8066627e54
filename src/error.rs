//! Error types.
//!
//! Application-level outcomes (404, 429, 500) are expressed as HTTP
//! [`Response`](crate::Response) values, not as errors. The types here cover
//! infrastructure failures: binding a port, reaching the counter store,
//! writing an access-log batch, loading configuration.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error returned by warden's fallible operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid listen address `{addr}`")]
    Addr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The shared counter store could not answer an admission check.
///
/// Never surfaces to the client directly: the admission controller maps it
/// onto the configured [`FailureMode`](crate::limiter::FailureMode).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// A batch of access-log records could not be persisted.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink io: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding access-log record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sink rejected batch: {0}")]
    Rejected(String),
}

/// Configuration could not be loaded or is inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse environment variable {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
