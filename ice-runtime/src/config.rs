//! Runtime configuration types and builders.

use std::str::FromStr;
use std::time::Duration;

use ice_core::protocol::{EncodingVersion, CURRENT_ENCODING};

use crate::acm::AcmConfig;
use crate::properties::Properties;

/// Default transport protocol for endpoints that do not name one.
const DEFAULT_PROTOCOL: &str = "tcp";
/// Default endpoint timeout in milliseconds.
const DEFAULT_TIMEOUT_MS: i32 = 60_000;
/// Default locator cache timeout in seconds (-1 is infinite).
const DEFAULT_LOCATOR_CACHE_TIMEOUT: i32 = -1;
/// Default size limit for batches before they are flushed (1 MiB).
const DEFAULT_BATCH_AUTO_FLUSH_SIZE: usize = 1024 * 1024;
/// Default size limit for incoming messages (1 MiB).
const DEFAULT_MESSAGE_SIZE_MAX: usize = 1024 * 1024;
/// Default delay before a graceful close is turned into a forceful one.
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    /// Creates a configuration error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for ice_core::IceError {
    fn from(err: ConfigError) -> Self {
        ice_core::IceError::Configuration(err.message)
    }
}

/// How a proxy orders its endpoints before connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EndpointSelection {
    /// Shuffle the endpoints for each connection attempt.
    #[default]
    Random,
    /// Try the endpoints in the order they were given.
    Ordered,
}

impl FromStr for EndpointSelection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Random" => Ok(EndpointSelection::Random),
            "Ordered" => Ok(EndpointSelection::Ordered),
            other => Err(ConfigError::new(format!(
                "illegal endpoint selection `{other}`, expected `Random` or `Ordered`"
            ))),
        }
    }
}

/// Verbosity of the trace categories.
///
/// A level of zero disables the category. Trace output goes to `tracing` at
/// `DEBUG` level under the `ice::<category>` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceLevels {
    /// Connection establishment and closure (`Ice.Trace.Network`).
    pub network: i32,
    /// Every message sent and received (`Ice.Trace.Protocol`).
    pub protocol: i32,
    /// Invocation retries (`Ice.Trace.Retry`).
    pub retry: i32,
    /// Locator lookups and cache updates (`Ice.Trace.Locator`).
    pub locator: i32,
}

impl TraceLevels {
    /// Reads the trace levels from `Ice.Trace.*` properties.
    pub fn from_properties(props: &Properties) -> Self {
        Self {
            network: props.get_property_as_int("Ice.Trace.Network"),
            protocol: props.get_property_as_int("Ice.Trace.Protocol"),
            retry: props.get_property_as_int("Ice.Trace.Retry"),
            locator: props.get_property_as_int("Ice.Trace.Locator"),
        }
    }
}

/// Values forced onto every endpoint and connection, overriding what proxies
/// and endpoints specify.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// Endpoint timeout in milliseconds.
    pub timeout: Option<i32>,
    /// Connection establishment timeout in milliseconds.
    pub connect_timeout: Option<i32>,
    /// Graceful close timeout in milliseconds.
    pub close_timeout: Option<i32>,
    /// Compression flag.
    pub compress: Option<bool>,
}

/// Complete runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    default_protocol: String,
    default_host: Option<String>,
    default_timeout: i32,
    default_invocation_timeout: Option<Duration>,
    default_encoding: EncodingVersion,
    endpoint_selection: EndpointSelection,
    collocation_optimized: bool,
    locator_cache_timeout: i32,
    prefer_secure: bool,
    background_locator_cache_updates: bool,
    retry_intervals: Vec<Duration>,
    batch_auto_flush_size: usize,
    message_size_max: usize,
    close_timeout: Duration,
    idle_timeout: Option<Duration>,
    client_acm: AcmConfig,
    server_acm: AcmConfig,
    trace: TraceLevels,
    warn_connections: bool,
    warn_dispatch: i32,
    overrides: Overrides,
}

impl RuntimeConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Builds a configuration from `Ice.*` properties.
    ///
    /// Invalid values are logged and replaced by their defaults.
    pub fn from_properties(props: &Properties) -> Self {
        let default_timeout = {
            let t = props.get_property_as_int_with_default("Ice.Default.Timeout", DEFAULT_TIMEOUT_MS);
            if t < 1 && t != -1 {
                tracing::warn!(value = t, "invalid value for Ice.Default.Timeout, using default");
                DEFAULT_TIMEOUT_MS
            } else {
                t
            }
        };

        let default_invocation_timeout = {
            let t = props.get_property_as_int_with_default("Ice.Default.InvocationTimeout", -1);
            if t < 1 && t != -1 {
                tracing::warn!(
                    value = t,
                    "invalid value for Ice.Default.InvocationTimeout, using default"
                );
                None
            } else if t == -1 {
                None
            } else {
                Some(Duration::from_millis(t as u64))
            }
        };

        let endpoint_selection = {
            let s = props.get_property_with_default("Ice.Default.EndpointSelection", "Random");
            s.parse().unwrap_or_else(|e: ConfigError| {
                tracing::warn!(error = %e, "using Random endpoint selection");
                EndpointSelection::Random
            })
        };

        let default_encoding = {
            let s = props.get_property("Ice.Default.EncodingVersion");
            if s.is_empty() {
                CURRENT_ENCODING
            } else {
                s.parse().unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "invalid Ice.Default.EncodingVersion, using default");
                    CURRENT_ENCODING
                })
            }
        };

        let retry_intervals = {
            let values = props.get_property_as_int_list("Ice.RetryIntervals", &[0]);
            if values.len() == 1 && values[0] == -1 {
                Vec::new()
            } else {
                values
                    .into_iter()
                    .map(|v| Duration::from_millis(v.max(0) as u64))
                    .collect()
            }
        };

        let kib = |key: &str, default: usize| -> usize {
            let v = props.get_property_as_int_with_default(key, (default / 1024) as i32);
            if v < 1 {
                0
            } else {
                (v as usize).saturating_mul(1024)
            }
        };

        let optional_ms = |key: &str| -> Option<i32> {
            if !props.contains(key) {
                return None;
            }
            let v = props.get_property_as_int_with_default(key, -1);
            if v < 1 && v != -1 {
                tracing::warn!(property = key, value = v, "invalid override, ignoring");
                None
            } else {
                Some(v)
            }
        };

        let overrides = Overrides {
            timeout: optional_ms("Ice.Override.Timeout"),
            connect_timeout: optional_ms("Ice.Override.ConnectTimeout"),
            close_timeout: optional_ms("Ice.Override.CloseTimeout"),
            compress: if props.contains("Ice.Override.Compress") {
                Some(props.get_property_as_int("Ice.Override.Compress") > 0)
            } else {
                None
            },
        };

        let close_timeout = match overrides.close_timeout {
            Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
            _ => DEFAULT_CLOSE_TIMEOUT,
        };

        let idle_timeout = match props.get_property_as_int("Ice.Connection.IdleTimeout") {
            v if v > 0 => Some(Duration::from_secs(v as u64)),
            0 => None,
            v => {
                tracing::warn!(value = v, "invalid value for Ice.Connection.IdleTimeout, disabling");
                None
            }
        };

        let client_default = AcmConfig::from_properties(props, "Ice.ACM", &AcmConfig::client_default());
        let server_default = AcmConfig::from_properties(props, "Ice.ACM", &AcmConfig::server_default());

        Self {
            default_protocol: props.get_property_with_default("Ice.Default.Protocol", DEFAULT_PROTOCOL),
            default_host: Some(props.get_property("Ice.Default.Host")).filter(|h| !h.is_empty()),
            default_timeout,
            default_invocation_timeout,
            default_encoding,
            endpoint_selection,
            collocation_optimized: props
                .get_property_as_int_with_default("Ice.Default.CollocationOptimized", 1)
                > 0,
            locator_cache_timeout: props.get_property_as_int_with_default(
                "Ice.Default.LocatorCacheTimeout",
                DEFAULT_LOCATOR_CACHE_TIMEOUT,
            ),
            prefer_secure: props.get_property_as_int("Ice.Default.PreferSecure") > 0,
            background_locator_cache_updates: props
                .get_property_as_int("Ice.BackgroundLocatorCacheUpdates")
                > 0,
            retry_intervals,
            batch_auto_flush_size: kib("Ice.BatchAutoFlushSize", DEFAULT_BATCH_AUTO_FLUSH_SIZE),
            message_size_max: kib("Ice.MessageSizeMax", DEFAULT_MESSAGE_SIZE_MAX),
            close_timeout,
            idle_timeout,
            client_acm: AcmConfig::from_properties(props, "Ice.ACM.Client", &client_default),
            server_acm: AcmConfig::from_properties(props, "Ice.ACM.Server", &server_default),
            trace: TraceLevels::from_properties(props),
            warn_connections: props.get_property_as_int("Ice.Warn.Connections") > 0,
            warn_dispatch: props.get_property_as_int_with_default("Ice.Warn.Dispatch", 1),
            overrides,
        }
    }

    /// Returns the protocol used for endpoints given as `default`.
    pub fn default_protocol(&self) -> &str {
        &self.default_protocol
    }

    /// Returns the host used by endpoints that do not specify one.
    pub fn default_host(&self) -> Option<&str> {
        self.default_host.as_deref()
    }

    /// Returns the default endpoint timeout in milliseconds (-1 is infinite).
    pub fn default_timeout(&self) -> i32 {
        self.default_timeout
    }

    /// Returns the default invocation timeout. `None` waits forever.
    pub fn default_invocation_timeout(&self) -> Option<Duration> {
        self.default_invocation_timeout
    }

    /// Returns the encoding used for new proxies.
    pub fn default_encoding(&self) -> EncodingVersion {
        self.default_encoding
    }

    /// Returns the default endpoint selection policy.
    pub fn endpoint_selection(&self) -> EndpointSelection {
        self.endpoint_selection
    }

    /// Returns true if invocations on local objects bypass the network.
    pub fn collocation_optimized(&self) -> bool {
        self.collocation_optimized
    }

    /// Returns the default locator cache timeout in seconds.
    pub fn locator_cache_timeout(&self) -> i32 {
        self.locator_cache_timeout
    }

    /// Returns true if secure endpoints are tried first.
    pub fn prefer_secure(&self) -> bool {
        self.prefer_secure
    }

    /// Returns true if stale locator entries are refreshed in the background.
    pub fn background_locator_cache_updates(&self) -> bool {
        self.background_locator_cache_updates
    }

    /// Returns the delays between invocation retries.
    pub fn retry_intervals(&self) -> &[Duration] {
        &self.retry_intervals
    }

    /// Returns the batch size that triggers an automatic flush (0 disables).
    pub fn batch_auto_flush_size(&self) -> usize {
        self.batch_auto_flush_size
    }

    /// Returns the largest accepted incoming message (0 is unlimited).
    pub fn message_size_max(&self) -> usize {
        self.message_size_max
    }

    /// Returns how long a graceful close may take.
    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// Returns the transport idle timeout applied to stream connections.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Returns the ACM settings for outgoing connections.
    pub fn client_acm(&self) -> &AcmConfig {
        &self.client_acm
    }

    /// Returns the ACM settings for incoming connections.
    pub fn server_acm(&self) -> &AcmConfig {
        &self.server_acm
    }

    /// Returns the trace levels.
    pub fn trace(&self) -> &TraceLevels {
        &self.trace
    }

    /// Returns true if unexpected connection closures are logged as warnings.
    pub fn warn_connections(&self) -> bool {
        self.warn_connections
    }

    /// Returns the dispatch warning level.
    pub fn warn_dispatch(&self) -> i32 {
        self.warn_dispatch
    }

    /// Returns the configured overrides.
    pub fn overrides(&self) -> &Overrides {
        &self.overrides
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_properties(&Properties::new())
    }
}

/// Builder for `RuntimeConfig`.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    default_protocol: Option<String>,
    default_host: Option<String>,
    default_timeout: Option<i32>,
    default_invocation_timeout: Option<Option<Duration>>,
    default_encoding: Option<EncodingVersion>,
    endpoint_selection: Option<EndpointSelection>,
    collocation_optimized: Option<bool>,
    locator_cache_timeout: Option<i32>,
    prefer_secure: Option<bool>,
    background_locator_cache_updates: Option<bool>,
    retry_intervals: Option<Vec<Duration>>,
    batch_auto_flush_size: Option<usize>,
    message_size_max: Option<usize>,
    close_timeout: Option<Duration>,
    idle_timeout: Option<Option<Duration>>,
    client_acm: Option<AcmConfig>,
    server_acm: Option<AcmConfig>,
    trace: Option<TraceLevels>,
    warn_connections: Option<bool>,
    warn_dispatch: Option<i32>,
    overrides: Option<Overrides>,
}

impl RuntimeConfigBuilder {
    /// Creates a new builder with every value at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the protocol used for `default` endpoints.
    pub fn default_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.default_protocol = Some(protocol.into());
        self
    }

    /// Sets the host used by endpoints that do not specify one.
    pub fn default_host(mut self, host: impl Into<String>) -> Self {
        self.default_host = Some(host.into());
        self
    }

    /// Sets the default endpoint timeout in milliseconds (-1 is infinite).
    pub fn default_timeout(mut self, timeout_ms: i32) -> Self {
        self.default_timeout = Some(timeout_ms);
        self
    }

    /// Sets the default invocation timeout. `None` waits forever.
    pub fn default_invocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_invocation_timeout = Some(timeout);
        self
    }

    /// Sets the encoding used for new proxies.
    pub fn default_encoding(mut self, encoding: EncodingVersion) -> Self {
        self.default_encoding = Some(encoding);
        self
    }

    /// Sets the default endpoint selection policy.
    pub fn endpoint_selection(mut self, selection: EndpointSelection) -> Self {
        self.endpoint_selection = Some(selection);
        self
    }

    /// Enables or disables collocation optimization.
    pub fn collocation_optimized(mut self, enabled: bool) -> Self {
        self.collocation_optimized = Some(enabled);
        self
    }

    /// Sets the default locator cache timeout in seconds.
    pub fn locator_cache_timeout(mut self, seconds: i32) -> Self {
        self.locator_cache_timeout = Some(seconds);
        self
    }

    /// Sets whether secure endpoints are tried first.
    pub fn prefer_secure(mut self, prefer: bool) -> Self {
        self.prefer_secure = Some(prefer);
        self
    }

    /// Enables background refresh of stale locator entries.
    pub fn background_locator_cache_updates(mut self, enabled: bool) -> Self {
        self.background_locator_cache_updates = Some(enabled);
        self
    }

    /// Sets the delays between invocation retries.
    pub fn retry_intervals(mut self, intervals: impl IntoIterator<Item = Duration>) -> Self {
        self.retry_intervals = Some(intervals.into_iter().collect());
        self
    }

    /// Sets the batch size that triggers an automatic flush (0 disables).
    pub fn batch_auto_flush_size(mut self, bytes: usize) -> Self {
        self.batch_auto_flush_size = Some(bytes);
        self
    }

    /// Sets the largest accepted incoming message (0 is unlimited).
    pub fn message_size_max(mut self, bytes: usize) -> Self {
        self.message_size_max = Some(bytes);
        self
    }

    /// Sets how long a graceful close may take.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = Some(timeout);
        self
    }

    /// Sets the transport idle timeout. `None` disables it.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the ACM settings for outgoing connections.
    pub fn client_acm(mut self, acm: AcmConfig) -> Self {
        self.client_acm = Some(acm);
        self
    }

    /// Sets the ACM settings for incoming connections.
    pub fn server_acm(mut self, acm: AcmConfig) -> Self {
        self.server_acm = Some(acm);
        self
    }

    /// Sets the trace levels.
    pub fn trace(mut self, trace: TraceLevels) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Enables warnings for unexpected connection closures.
    pub fn warn_connections(mut self, enabled: bool) -> Self {
        self.warn_connections = Some(enabled);
        self
    }

    /// Sets the dispatch warning level.
    pub fn warn_dispatch(mut self, level: i32) -> Self {
        self.warn_dispatch = Some(level);
        self
    }

    /// Sets the overrides.
    pub fn overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Builds the configuration, returning an error if validation fails.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `default_protocol` is empty
    /// - `default_timeout` is neither positive nor -1
    /// - `close_timeout` is zero
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        let defaults = RuntimeConfig::default();

        let default_protocol = self.default_protocol.unwrap_or(defaults.default_protocol);
        if default_protocol.trim().is_empty() {
            return Err(ConfigError::new("default_protocol must not be empty"));
        }

        let default_timeout = self.default_timeout.unwrap_or(defaults.default_timeout);
        if default_timeout < 1 && default_timeout != -1 {
            return Err(ConfigError::new(
                "default_timeout must be positive or -1 (infinite)",
            ));
        }

        let close_timeout = self.close_timeout.unwrap_or(defaults.close_timeout);
        if close_timeout.is_zero() {
            return Err(ConfigError::new("close_timeout must not be zero"));
        }

        Ok(RuntimeConfig {
            default_protocol,
            default_host: self.default_host.or(defaults.default_host),
            default_timeout,
            default_invocation_timeout: self
                .default_invocation_timeout
                .unwrap_or(defaults.default_invocation_timeout),
            default_encoding: self.default_encoding.unwrap_or(defaults.default_encoding),
            endpoint_selection: self.endpoint_selection.unwrap_or(defaults.endpoint_selection),
            collocation_optimized: self
                .collocation_optimized
                .unwrap_or(defaults.collocation_optimized),
            locator_cache_timeout: self
                .locator_cache_timeout
                .unwrap_or(defaults.locator_cache_timeout),
            prefer_secure: self.prefer_secure.unwrap_or(defaults.prefer_secure),
            background_locator_cache_updates: self
                .background_locator_cache_updates
                .unwrap_or(defaults.background_locator_cache_updates),
            retry_intervals: self.retry_intervals.unwrap_or(defaults.retry_intervals),
            batch_auto_flush_size: self
                .batch_auto_flush_size
                .unwrap_or(defaults.batch_auto_flush_size),
            message_size_max: self.message_size_max.unwrap_or(defaults.message_size_max),
            close_timeout,
            idle_timeout: self
                .idle_timeout
                .unwrap_or(defaults.idle_timeout)
                .filter(|d| !d.is_zero()),
            client_acm: self.client_acm.unwrap_or(defaults.client_acm),
            server_acm: self.server_acm.unwrap_or(defaults.server_acm),
            trace: self.trace.unwrap_or(defaults.trace),
            warn_connections: self.warn_connections.unwrap_or(defaults.warn_connections),
            warn_dispatch: self.warn_dispatch.unwrap_or(defaults.warn_dispatch),
            overrides: self.overrides.unwrap_or(defaults.overrides),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acm::{AcmClose, AcmHeartbeat};

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.default_protocol(), "tcp");
        assert_eq!(config.default_timeout(), DEFAULT_TIMEOUT_MS);
        assert_eq!(config.default_invocation_timeout(), None);
        assert_eq!(config.retry_intervals(), &[Duration::ZERO]);
        assert_eq!(config.message_size_max(), DEFAULT_MESSAGE_SIZE_MAX);
        assert_eq!(config.batch_auto_flush_size(), DEFAULT_BATCH_AUTO_FLUSH_SIZE);
        assert_eq!(config.locator_cache_timeout(), -1);
        assert!(config.collocation_optimized());
        assert_eq!(config.default_encoding(), CURRENT_ENCODING);
        assert_eq!(config.warn_dispatch(), 1);
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn test_idle_timeout_property() {
        let props = Properties::new();
        props.set_property("Ice.Connection.IdleTimeout", "15");
        let config = RuntimeConfig::from_properties(&props);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_from_properties() {
        let props = Properties::new();
        props.set_property("Ice.Default.Protocol", "ws");
        props.set_property("Ice.Default.Host", "10.0.0.1");
        props.set_property("Ice.RetryIntervals", "0 100 500");
        props.set_property("Ice.MessageSizeMax", "2048");
        props.set_property("Ice.Default.EndpointSelection", "Ordered");
        props.set_property("Ice.Trace.Retry", "2");
        props.set_property("Ice.Override.Compress", "1");

        let config = RuntimeConfig::from_properties(&props);
        assert_eq!(config.default_protocol(), "ws");
        assert_eq!(config.default_host(), Some("10.0.0.1"));
        assert_eq!(
            config.retry_intervals(),
            &[
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(500)
            ]
        );
        assert_eq!(config.message_size_max(), 2048 * 1024);
        assert_eq!(config.endpoint_selection(), EndpointSelection::Ordered);
        assert_eq!(config.trace().retry, 2);
        assert_eq!(config.overrides().compress, Some(true));
    }

    #[test]
    fn test_retry_intervals_minus_one_disables_retries() {
        let props = Properties::new();
        props.set_property("Ice.RetryIntervals", "-1");
        assert!(RuntimeConfig::from_properties(&props).retry_intervals().is_empty());
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let props = Properties::new();
        props.set_property("Ice.Default.Timeout", "-5");
        props.set_property("Ice.Default.EndpointSelection", "Sometimes");
        props.set_property("Ice.MessageSizeMax", "0");
        let config = RuntimeConfig::from_properties(&props);
        assert_eq!(config.default_timeout(), DEFAULT_TIMEOUT_MS);
        assert_eq!(config.endpoint_selection(), EndpointSelection::Random);
        assert_eq!(config.message_size_max(), 0);
    }

    #[test]
    fn test_acm_properties() {
        let props = Properties::new();
        props.set_property("Ice.ACM.Timeout", "30");
        props.set_property("Ice.ACM.Client.Heartbeat", "3");
        let config = RuntimeConfig::from_properties(&props);
        assert_eq!(config.client_acm().timeout, Duration::from_secs(30));
        assert_eq!(config.client_acm().heartbeat, AcmHeartbeat::Always);
        assert_eq!(config.server_acm().timeout, Duration::from_secs(30));
        assert_eq!(config.server_acm().close, AcmClose::OnIdle);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .default_host("127.0.0.1")
            .retry_intervals([Duration::from_millis(10)])
            .endpoint_selection(EndpointSelection::Ordered)
            .build()
            .unwrap();
        assert_eq!(config.default_host(), Some("127.0.0.1"));
        assert_eq!(config.retry_intervals(), &[Duration::from_millis(10)]);
        assert_eq!(config.endpoint_selection(), EndpointSelection::Ordered);
    }

    #[test]
    fn test_builder_rejects_invalid_timeout() {
        let result = RuntimeConfig::builder().default_timeout(0).build();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("default_timeout must be positive"));
    }

    #[test]
    fn test_builder_rejects_empty_protocol() {
        assert!(RuntimeConfig::builder().default_protocol(" ").build().is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::new("test error");
        assert_eq!(err.to_string(), "configuration error: test error");
    }

    #[test]
    fn test_config_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RuntimeConfig>();
        assert_send_sync::<ConfigError>();
    }
}
