//! Gateway configuration.
//!
//! Layers, later ones winning:
//!
//! 1. built-in defaults ([`GatewayConfig::default`]);
//! 2. a TOML file ([`GatewayConfig::from_file`]);
//! 3. environment variables with a prefix ([`GatewayConfig::with_env`]).
//!
//! ```toml
//! listen = "0.0.0.0:8000"
//!
//! [rate_limit]
//! failure_mode = "closed"
//! anonymous = { capacity = 10, refill_per_sec = 0.1666667 }
//!
//! [access_log]
//! batch_size = 100
//! path = "/var/log/warden/access.jsonl"
//! ```
//!
//! | Variable (prefix `WARDEN`) | Field |
//! |---|---|
//! | `WARDEN_LISTEN` | `listen` |
//! | `WARDEN_TRUST_PROXY_HEADERS` | `trust_proxy_headers` |
//! | `WARDEN_SHUTDOWN_GRACE_MS` | `shutdown_grace_ms` |
//! | `WARDEN_RATE_LIMIT_FAILURE_MODE` | `rate_limit.failure_mode` (`open` / `closed`) |
//! | `WARDEN_RATE_LIMIT_ANONYMOUS_CAPACITY` | `rate_limit.anonymous.capacity` |
//! | `WARDEN_RATE_LIMIT_ANONYMOUS_REFILL_PER_SEC` | `rate_limit.anonymous.refill_per_sec` |
//! | `WARDEN_RATE_LIMIT_AUTHENTICATED_CAPACITY` | `rate_limit.authenticated.capacity` |
//! | `WARDEN_RATE_LIMIT_AUTHENTICATED_REFILL_PER_SEC` | `rate_limit.authenticated.refill_per_sec` |
//! | `WARDEN_RATE_LIMIT_STORE_TIMEOUT_MS` | `rate_limit.store_timeout_ms` |
//! | `WARDEN_ACCESS_LOG_BATCH_SIZE` | `access_log.batch_size` |
//! | `WARDEN_ACCESS_LOG_FLUSH_INTERVAL_MS` | `access_log.flush_interval_ms` |
//! | `WARDEN_ACCESS_LOG_BUFFER_CAPACITY` | `access_log.buffer_capacity` |
//! | `WARDEN_ACCESS_LOG_PATH` | `access_log.path` |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access_log::LogConfig;
use crate::error::ConfigError;
use crate::limiter::{FailureMode, Policy, RateLimitConfig};

/// Slowest full refill a policy may have.
const MAX_FULL_REFILL: Duration = Duration::from_secs(24 * 60 * 60);

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub listen: String,
    pub trust_proxy_headers: bool,
    /// How long shutdown waits for open connections to finish.
    pub shutdown_grace_ms: u64,
    pub rate_limit: RateLimitConfig,
    pub access_log: LogConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_owned(),
            trust_proxy_headers: true,
            shutdown_grace_ms: 5_000,
            rate_limit: RateLimitConfig::default(),
            access_log: LogConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
        Self::from_toml_str(&text)
    }

    /// Applies `<PREFIX>_*` overrides from the process environment.
    pub fn with_env(self, prefix: &str) -> Result<Self, ConfigError> {
        self.with_overrides(prefix, std::env::vars())
    }

    /// Applies `<PREFIX>_*` overrides from `vars`. Unknown names are ignored.
    pub fn with_overrides(
        mut self,
        prefix: &str,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ConfigError> {
        let prefix = format!("{prefix}_");
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(&prefix) else { continue };
            let rl = &mut self.rate_limit;
            let log = &mut self.access_log;
            match key {
                "LISTEN" => self.listen = value,
                "TRUST_PROXY_HEADERS" => self.trust_proxy_headers = parse(&name, &value)?,
                "SHUTDOWN_GRACE_MS" => self.shutdown_grace_ms = parse(&name, &value)?,
                "RATE_LIMIT_FAILURE_MODE" => rl.failure_mode = parse_failure_mode(&name, &value)?,
                "RATE_LIMIT_ANONYMOUS_CAPACITY" => rl.anonymous.capacity = parse(&name, &value)?,
                "RATE_LIMIT_ANONYMOUS_REFILL_PER_SEC" => rl.anonymous.refill_per_sec = parse(&name, &value)?,
                "RATE_LIMIT_AUTHENTICATED_CAPACITY" => rl.authenticated.capacity = parse(&name, &value)?,
                "RATE_LIMIT_AUTHENTICATED_REFILL_PER_SEC" => rl.authenticated.refill_per_sec = parse(&name, &value)?,
                "RATE_LIMIT_STORE_TIMEOUT_MS" => rl.store_timeout_ms = parse(&name, &value)?,
                "ACCESS_LOG_BATCH_SIZE" => log.batch_size = parse(&name, &value)?,
                "ACCESS_LOG_FLUSH_INTERVAL_MS" => log.flush_interval_ms = parse(&name, &value)?,
                "ACCESS_LOG_BUFFER_CAPACITY" => log.buffer_capacity = parse(&name, &value)?,
                "ACCESS_LOG_PATH" => log.path = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_policy("rate_limit.anonymous", self.rate_limit.anonymous)?;
        check_policy("rate_limit.authenticated", self.rate_limit.authenticated)?;
        if self.rate_limit.authenticated.capacity <= self.rate_limit.anonymous.capacity {
            return Err(ConfigError::Invalid {
                field: "rate_limit.authenticated.capacity",
                reason: "must exceed the anonymous capacity".into(),
            });
        }
        if self.rate_limit.store_timeout_ms == 0 {
            return Err(invalid("rate_limit.store_timeout_ms"));
        }
        if self.access_log.batch_size == 0 {
            return Err(invalid("access_log.batch_size"));
        }
        if self.access_log.buffer_capacity == 0 {
            return Err(invalid("access_log.buffer_capacity"));
        }
        if self.access_log.flush_interval_ms == 0 {
            return Err(invalid("access_log.flush_interval_ms"));
        }
        Ok(())
    }
}

fn check_policy(field: &'static str, policy: Policy) -> Result<(), ConfigError> {
    if policy.capacity == 0 {
        return Err(ConfigError::Invalid { field, reason: "capacity must be positive".into() });
    }
    if !(policy.refill_per_sec.is_finite() && policy.refill_per_sec > 0.0) {
        return Err(ConfigError::Invalid { field, reason: "refill_per_sec must be positive".into() });
    }
    // Idle buckets are swept after one full refill, so the refill has to end.
    if policy.full_refill().is_none_or(|d| d > MAX_FULL_REFILL) {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("bucket must refill completely within {}s", MAX_FULL_REFILL.as_secs()),
        });
    }
    Ok(())
}

fn invalid(field: &'static str) -> ConfigError {
    ConfigError::Invalid { field, reason: "must be greater than zero".into() }
}

fn parse<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var: var.to_owned(),
        reason: e.to_string(),
    })
}

fn parse_failure_mode(var: &str, value: &str) -> Result<FailureMode, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "open" => Ok(FailureMode::Open),
        "closed" => Ok(FailureMode::Closed),
        other => Err(ConfigError::Env {
            var: var.to_owned(),
            reason: format!("expected `open` or `closed`, got `{other}`"),
        }),
    }
}
