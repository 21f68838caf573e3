//! Declarative configuration loading from TOML and environment variables.
//!
//! [`FileConfig`] mirrors [`RuntimeConfig`](crate::config::RuntimeConfig)
//! with serde-friendly types and converts into it through the builder.
//!
//! # Supported Formats
//!
//! - **TOML** (requires `config-file` feature): `RuntimeConfig::from_toml("ice.toml")`
//! - **Environment Variables** (always available): `RuntimeConfig::from_env()`
//!
//! # Example TOML
//!
//! ```toml
//! retry-intervals-ms = [0, 100, 500]
//! message-size-max-kib = 2048
//! warn-connections = true
//!
//! [default]
//! protocol = "tcp"
//! host = "10.0.0.1"
//! timeout-ms = 30000
//! endpoint-selection = "Ordered"
//!
//! [acm.client]
//! timeout-seconds = 30
//! heartbeat = "OnIdle"
//! close = "OnInvocationAndIdle"
//!
//! [trace]
//! network = 1
//! retry = 1
//! ```

use std::time::Duration;

#[cfg(feature = "config-file")]
use serde::{Deserialize, Serialize};

use crate::acm::AcmConfig;
use crate::config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder, TraceLevels};

/// Top-level file-based configuration.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(rename_all = "kebab-case", default))]
pub struct FileConfig {
    /// Defaults applied to new proxies and endpoints.
    pub default: Option<FileDefaultConfig>,
    /// Delays between invocation retries in milliseconds.
    pub retry_intervals_ms: Option<Vec<u64>>,
    /// Batch auto-flush threshold in KiB (0 disables).
    pub batch_auto_flush_kib: Option<usize>,
    /// Incoming message size limit in KiB (0 is unlimited).
    pub message_size_max_kib: Option<usize>,
    /// Graceful close timeout in milliseconds.
    pub close_timeout_ms: Option<u64>,
    /// Active connection management settings.
    pub acm: Option<FileAcmConfig>,
    /// Trace levels.
    pub trace: Option<FileTraceConfig>,
    /// Warn about unexpected connection closures.
    pub warn_connections: Option<bool>,
    /// Dispatch warning level.
    pub warn_dispatch: Option<i32>,
}

/// File-based proxy and endpoint defaults.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(rename_all = "kebab-case", default))]
pub struct FileDefaultConfig {
    /// Protocol used for `default` endpoints.
    pub protocol: Option<String>,
    /// Host used by endpoints that do not name one.
    pub host: Option<String>,
    /// Endpoint timeout in milliseconds (-1 is infinite).
    pub timeout_ms: Option<i32>,
    /// Invocation timeout in milliseconds (-1 waits forever).
    pub invocation_timeout_ms: Option<i64>,
    /// `Random` or `Ordered`.
    pub endpoint_selection: Option<String>,
    /// Whether collocated invocations bypass the network.
    pub collocation_optimized: Option<bool>,
    /// Locator cache timeout in seconds (-1 is infinite).
    pub locator_cache_timeout_seconds: Option<i32>,
    /// Try secure endpoints first.
    pub prefer_secure: Option<bool>,
}

/// File-based ACM configuration for both connection directions.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(rename_all = "kebab-case", default))]
pub struct FileAcmConfig {
    /// Settings for outgoing connections.
    pub client: Option<FileAcmSide>,
    /// Settings for incoming connections.
    pub server: Option<FileAcmSide>,
}

/// File-based ACM settings for one connection direction.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(rename_all = "kebab-case", default))]
pub struct FileAcmSide {
    /// Idle timeout in seconds (0 disables).
    pub timeout_seconds: Option<u64>,
    /// Heartbeat policy name (`Off`, `OnDispatch`, `OnIdle`, `Always`).
    pub heartbeat: Option<String>,
    /// Close policy name (`Off`, `OnIdle`, `OnInvocation`,
    /// `OnInvocationAndIdle`, `OnIdleForceful`).
    pub close: Option<String>,
}

/// File-based trace levels.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(rename_all = "kebab-case", default))]
pub struct FileTraceConfig {
    /// Network trace level.
    pub network: Option<i32>,
    /// Protocol trace level.
    pub protocol: Option<i32>,
    /// Retry trace level.
    pub retry: Option<i32>,
    /// Locator trace level.
    pub locator: Option<i32>,
}

fn apply_acm(side: FileAcmSide, base: &AcmConfig) -> Result<AcmConfig, ConfigError> {
    let heartbeat = side
        .heartbeat
        .map(|h| h.parse())
        .transpose()?;
    let close = side.close.map(|c| c.parse()).transpose()?;
    Ok(base.with_overrides(
        side.timeout_seconds.map(Duration::from_secs),
        heartbeat,
        close,
    ))
}

impl TryFrom<FileConfig> for RuntimeConfig {
    type Error = ConfigError;

    fn try_from(file: FileConfig) -> Result<Self, Self::Error> {
        let defaults = RuntimeConfig::default();
        let mut builder = RuntimeConfigBuilder::new();

        if let Some(d) = file.default {
            if let Some(protocol) = d.protocol {
                builder = builder.default_protocol(protocol);
            }
            if let Some(host) = d.host {
                builder = builder.default_host(host);
            }
            if let Some(ms) = d.timeout_ms {
                builder = builder.default_timeout(ms);
            }
            if let Some(ms) = d.invocation_timeout_ms {
                let timeout = if ms < 0 {
                    None
                } else {
                    Some(Duration::from_millis(ms as u64))
                };
                builder = builder.default_invocation_timeout(timeout);
            }
            if let Some(selection) = d.endpoint_selection {
                builder = builder.endpoint_selection(selection.parse()?);
            }
            if let Some(v) = d.collocation_optimized {
                builder = builder.collocation_optimized(v);
            }
            if let Some(secs) = d.locator_cache_timeout_seconds {
                builder = builder.locator_cache_timeout(secs);
            }
            if let Some(v) = d.prefer_secure {
                builder = builder.prefer_secure(v);
            }
        }

        if let Some(intervals) = file.retry_intervals_ms {
            builder = builder.retry_intervals(intervals.into_iter().map(Duration::from_millis));
        }

        if let Some(kib) = file.batch_auto_flush_kib {
            builder = builder.batch_auto_flush_size(kib.saturating_mul(1024));
        }

        if let Some(kib) = file.message_size_max_kib {
            builder = builder.message_size_max(kib.saturating_mul(1024));
        }

        if let Some(ms) = file.close_timeout_ms {
            builder = builder.close_timeout(Duration::from_millis(ms));
        }

        if let Some(acm) = file.acm {
            if let Some(client) = acm.client {
                builder = builder.client_acm(apply_acm(client, defaults.client_acm())?);
            }
            if let Some(server) = acm.server {
                builder = builder.server_acm(apply_acm(server, defaults.server_acm())?);
            }
        }

        if let Some(t) = file.trace {
            builder = builder.trace(TraceLevels {
                network: t.network.unwrap_or(0),
                protocol: t.protocol.unwrap_or(0),
                retry: t.retry.unwrap_or(0),
                locator: t.locator.unwrap_or(0),
            });
        }

        if let Some(v) = file.warn_connections {
            builder = builder.warn_connections(v);
        }

        if let Some(level) = file.warn_dispatch {
            builder = builder.warn_dispatch(level);
        }

        builder.build()
    }
}

impl RuntimeConfig {
    /// Loads configuration from a TOML file.
    ///
    /// Requires the `config-file` feature.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let config = RuntimeConfig::from_toml("ice.toml")?;
    /// let communicator = Communicator::with_config(config);
    /// ```
    #[cfg(feature = "config-file")]
    pub fn from_toml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::new(format!("failed to read TOML config file: {e}"))
        })?;
        let file_config: FileConfig = toml_crate::from_str(&content).map_err(|e| {
            ConfigError::new(format!("failed to parse TOML config: {e}"))
        })?;
        file_config.try_into()
    }

    /// Loads configuration from environment variables.
    ///
    /// This method is always available (no feature flag required).
    ///
    /// # Supported Environment Variables
    ///
    /// | Variable | Maps to |
    /// |----------|---------|
    /// | `ICE_DEFAULT_PROTOCOL` | `default.protocol` |
    /// | `ICE_DEFAULT_HOST` | `default.host` |
    /// | `ICE_DEFAULT_TIMEOUT_MS` | Endpoint timeout in milliseconds |
    /// | `ICE_INVOCATION_TIMEOUT_MS` | Invocation timeout in milliseconds |
    /// | `ICE_RETRY_INTERVALS_MS` | Comma-separated delays (e.g., `0,100,500`) |
    /// | `ICE_MESSAGE_SIZE_MAX_KIB` | Incoming message size limit |
    /// | `ICE_WARN_CONNECTIONS` | `"true"` or `"false"` |
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut file_config = FileConfig::default();

        if let Ok(val) = std::env::var("ICE_DEFAULT_PROTOCOL") {
            file_config.default.get_or_insert_with(Default::default).protocol = Some(val);
        }

        if let Ok(val) = std::env::var("ICE_DEFAULT_HOST") {
            file_config.default.get_or_insert_with(Default::default).host = Some(val);
        }

        if let Ok(val) = std::env::var("ICE_DEFAULT_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<i32>() {
                file_config.default.get_or_insert_with(Default::default).timeout_ms = Some(ms);
            }
        }

        if let Ok(val) = std::env::var("ICE_INVOCATION_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<i64>() {
                file_config
                    .default
                    .get_or_insert_with(Default::default)
                    .invocation_timeout_ms = Some(ms);
            }
        }

        if let Ok(val) = std::env::var("ICE_RETRY_INTERVALS_MS") {
            let parsed: Result<Vec<u64>, _> =
                val.split(',').map(|s| s.trim().parse::<u64>()).collect();
            match parsed {
                Ok(intervals) => file_config.retry_intervals_ms = Some(intervals),
                Err(_) => {
                    return Err(ConfigError::new(format!(
                        "invalid ICE_RETRY_INTERVALS_MS `{val}`"
                    )))
                }
            }
        }

        if let Ok(val) = std::env::var("ICE_MESSAGE_SIZE_MAX_KIB") {
            if let Ok(kib) = val.parse::<usize>() {
                file_config.message_size_max_kib = Some(kib);
            }
        }

        if let Ok(val) = std::env::var("ICE_WARN_CONNECTIONS") {
            file_config.warn_connections = Some(val.eq_ignore_ascii_case("true"));
        }

        file_config.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acm::{AcmClose, AcmHeartbeat};
    use crate::config::EndpointSelection;

    #[test]
    fn test_file_config_defaults_produce_valid_runtime_config() {
        let config: RuntimeConfig = FileConfig::default().try_into().unwrap();
        assert_eq!(config.default_protocol(), "tcp");
    }

    #[test]
    fn test_file_config_with_defaults_section() {
        let file_config = FileConfig {
            default: Some(FileDefaultConfig {
                host: Some("192.168.1.1".to_string()),
                timeout_ms: Some(5000),
                endpoint_selection: Some("Ordered".to_string()),
                invocation_timeout_ms: Some(250),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config: RuntimeConfig = file_config.try_into().unwrap();
        assert_eq!(config.default_host(), Some("192.168.1.1"));
        assert_eq!(config.default_timeout(), 5000);
        assert_eq!(config.endpoint_selection(), EndpointSelection::Ordered);
        assert_eq!(
            config.default_invocation_timeout(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_file_config_invalid_selection_is_rejected() {
        let file_config = FileConfig {
            default: Some(FileDefaultConfig {
                endpoint_selection: Some("Backwards".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result: Result<RuntimeConfig, _> = file_config.try_into();
        assert!(result.is_err());
    }

    #[test]
    fn test_file_config_with_acm() {
        let file_config = FileConfig {
            acm: Some(FileAcmConfig {
                client: Some(FileAcmSide {
                    timeout_seconds: Some(15),
                    heartbeat: Some("Always".to_string()),
                    close: Some("Off".to_string()),
                }),
                server: None,
            }),
            ..Default::default()
        };
        let config: RuntimeConfig = file_config.try_into().unwrap();
        assert_eq!(config.client_acm().timeout, Duration::from_secs(15));
        assert_eq!(config.client_acm().heartbeat, AcmHeartbeat::Always);
        assert_eq!(config.client_acm().close, AcmClose::Off);
        assert_eq!(config.server_acm().close, AcmClose::OnIdle);
    }

    #[test]
    fn test_file_config_with_sizes_and_retry() {
        let file_config = FileConfig {
            retry_intervals_ms: Some(vec![0, 50]),
            message_size_max_kib: Some(4),
            batch_auto_flush_kib: Some(0),
            ..Default::default()
        };
        let config: RuntimeConfig = file_config.try_into().unwrap();
        assert_eq!(
            config.retry_intervals(),
            &[Duration::ZERO, Duration::from_millis(50)]
        );
        assert_eq!(config.message_size_max(), 4096);
        assert_eq!(config.batch_auto_flush_size(), 0);
    }

    #[test]
    fn test_from_env_with_default_host() {
        std::env::set_var("ICE_DEFAULT_HOST", "env-host");
        let config = RuntimeConfig::from_env().unwrap();
        assert_eq!(config.default_host(), Some("env-host"));
        std::env::remove_var("ICE_DEFAULT_HOST");
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_toml_round_trip() {
        let file_config = FileConfig {
            retry_intervals_ms: Some(vec![0, 100]),
            warn_dispatch: Some(2),
            ..Default::default()
        };
        let toml_str = toml_crate::to_string(&file_config).unwrap();
        let parsed: FileConfig = toml_crate::from_str(&toml_str).unwrap();
        assert_eq!(parsed.retry_intervals_ms, Some(vec![0, 100]));
        assert_eq!(parsed.warn_dispatch, Some(2));
    }
}
