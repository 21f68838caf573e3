//! Active connection management.
//!
//! ACM closes idle connections and keeps busy ones alive with heartbeats.
//! A [`FactoryAcmMonitor`] scans every connection of a connection factory on
//! a single timer task. A connection whose settings were overridden gets a
//! [`ConnectionAcmMonitor`] with a timer of its own.

use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::ConfigError;
use crate::connection::Connection;
use crate::properties::Properties;
use crate::timer::{Timer, TimerTask};

/// When idle connections are closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcmClose {
    /// Never close.
    Off,
    /// Close gracefully once nothing is pending in either direction.
    OnIdle,
    /// Close forcefully when invocations are pending but nothing was
    /// received for the timeout period.
    OnInvocation,
    /// Both `OnIdle` and `OnInvocation`.
    OnInvocationAndIdle,
    /// Close forcefully once idle, even with pending invocations.
    OnIdleForceful,
}

/// When heartbeats are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcmHeartbeat {
    /// Never.
    Off,
    /// While dispatches are in progress.
    OnDispatch,
    /// When the connection has been idle for a quarter of the timeout.
    OnIdle,
    /// On every monitor pass.
    Always,
}

impl TryFrom<i32> for AcmClose {
    type Error = ConfigError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => AcmClose::Off,
            1 => AcmClose::OnIdle,
            2 => AcmClose::OnInvocation,
            3 => AcmClose::OnInvocationAndIdle,
            4 => AcmClose::OnIdleForceful,
            other => return Err(ConfigError::new(format!("invalid ACM close value {other}"))),
        })
    }
}

impl FromStr for AcmClose {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Off" | "CloseOff" => Ok(AcmClose::Off),
            "OnIdle" | "CloseOnIdle" => Ok(AcmClose::OnIdle),
            "OnInvocation" | "CloseOnInvocation" => Ok(AcmClose::OnInvocation),
            "OnInvocationAndIdle" | "CloseOnInvocationAndIdle" => Ok(AcmClose::OnInvocationAndIdle),
            "OnIdleForceful" | "CloseOnIdleForceful" => Ok(AcmClose::OnIdleForceful),
            other => other
                .parse::<i32>()
                .map_err(|_| ConfigError::new(format!("invalid ACM close value `{other}`")))
                .and_then(AcmClose::try_from),
        }
    }
}

impl TryFrom<i32> for AcmHeartbeat {
    type Error = ConfigError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => AcmHeartbeat::Off,
            1 => AcmHeartbeat::OnDispatch,
            2 => AcmHeartbeat::OnIdle,
            3 => AcmHeartbeat::Always,
            other => {
                return Err(ConfigError::new(format!("invalid ACM heartbeat value {other}")))
            }
        })
    }
}

impl FromStr for AcmHeartbeat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Off" | "HeartbeatOff" => Ok(AcmHeartbeat::Off),
            "OnDispatch" | "HeartbeatOnDispatch" => Ok(AcmHeartbeat::OnDispatch),
            "OnIdle" | "HeartbeatOnIdle" => Ok(AcmHeartbeat::OnIdle),
            "Always" | "HeartbeatAlways" => Ok(AcmHeartbeat::Always),
            other => other
                .parse::<i32>()
                .map_err(|_| ConfigError::new(format!("invalid ACM heartbeat value `{other}`")))
                .and_then(AcmHeartbeat::try_from),
        }
    }
}

/// ACM settings of a connection. A zero timeout disables monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AcmConfig {
    /// Idle period after which the close policy applies.
    pub timeout: Duration,
    /// Heartbeat policy.
    pub heartbeat: AcmHeartbeat,
    /// Close policy.
    pub close: AcmClose,
}

impl AcmConfig {
    /// Defaults for outgoing connections.
    pub fn client_default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            heartbeat: AcmHeartbeat::OnDispatch,
            close: AcmClose::OnInvocationAndIdle,
        }
    }

    /// Defaults for incoming connections.
    pub fn server_default() -> Self {
        Self {
            close: AcmClose::OnIdle,
            ..Self::client_default()
        }
    }

    /// Reads `<prefix>.Timeout`, `<prefix>.Heartbeat` and `<prefix>.Close`,
    /// falling back to `default` for missing or invalid values.
    pub fn from_properties(props: &Properties, prefix: &str, default: &AcmConfig) -> Self {
        let timeout_key = format!("{prefix}.Timeout");
        let timeout = match props
            .get_property_as_int_with_default(&timeout_key, default.timeout.as_secs() as i32)
        {
            t if t >= 0 => Duration::from_secs(t as u64),
            t => {
                tracing::warn!(property = %timeout_key, value = t, "invalid ACM timeout, using default");
                default.timeout
            }
        };

        let heartbeat_key = format!("{prefix}.Heartbeat");
        let heartbeat = AcmHeartbeat::try_from(
            props.get_property_as_int_with_default(&heartbeat_key, default.heartbeat as i32),
        )
        .unwrap_or_else(|e| {
            tracing::warn!(property = %heartbeat_key, error = %e, "using default heartbeat");
            default.heartbeat
        });

        let close_key = format!("{prefix}.Close");
        let close = AcmClose::try_from(
            props.get_property_as_int_with_default(&close_key, default.close as i32),
        )
        .unwrap_or_else(|e| {
            tracing::warn!(property = %close_key, error = %e, "using default close policy");
            default.close
        });

        Self {
            timeout,
            heartbeat,
            close,
        }
    }

    /// Returns a copy with the given settings replaced.
    pub fn with_overrides(
        &self,
        timeout: Option<Duration>,
        heartbeat: Option<AcmHeartbeat>,
        close: Option<AcmClose>,
    ) -> Self {
        Self {
            timeout: timeout.unwrap_or(self.timeout),
            heartbeat: heartbeat.unwrap_or(self.heartbeat),
            close: close.unwrap_or(self.close),
        }
    }

    fn period(&self) -> Duration {
        (self.timeout / 2).max(Duration::from_millis(1))
    }
}

/// Tracks connections and periodically calls [`Connection::monitor`].
pub trait AcmMonitor: Send + Sync + std::fmt::Debug {
    /// Starts monitoring `connection`.
    fn add(&self, connection: &Arc<Connection>);

    /// Stops monitoring `connection`.
    fn remove(&self, connection: &Arc<Connection>);

    /// Hands over a finished connection for its factory to forget.
    fn reap(&self, connection: Arc<Connection>);

    /// Returns a monitor applying the given overrides.
    fn with_overrides(
        &self,
        timeout: Option<Duration>,
        heartbeat: Option<AcmHeartbeat>,
        close: Option<AcmClose>,
    ) -> Arc<dyn AcmMonitor>;

    /// Returns the settings applied by this monitor.
    fn acm(&self) -> AcmConfig;
}

#[derive(Debug, Default)]
struct FactoryState {
    connections: Vec<Arc<Connection>>,
    changes: Vec<(Arc<Connection>, bool)>,
    reaped: Vec<Arc<Connection>>,
    task: Option<TimerTask>,
}

/// The monitor shared by all connections of a connection factory.
///
/// Additions and removals are queued and applied at the start of the next
/// scan, so connections never wait on a scan in progress.
#[derive(Debug)]
pub struct FactoryAcmMonitor {
    timer: Timer,
    config: AcmConfig,
    state: Mutex<FactoryState>,
    me: Weak<FactoryAcmMonitor>,
}

impl FactoryAcmMonitor {
    /// Creates a monitor with the given settings.
    pub fn new(timer: Timer, config: AcmConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            timer,
            config,
            state: Mutex::new(FactoryState::default()),
            me: me.clone(),
        })
    }

    /// Takes the connections that finished since the last call.
    pub fn swap_reaped_connections(&self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut self.state.lock().reaped)
    }

    /// Stops the scan task and forgets every connection.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        if let Some(task) = state.task.take() {
            task.cancel();
        }
        state.connections.clear();
        state.changes.clear();
        state.reaped.clear();
    }

    fn run_timer_task(&self) {
        let connections = {
            let mut state = self.state.lock();
            for (connection, added) in std::mem::take(&mut state.changes) {
                if added {
                    state.connections.push(connection);
                } else {
                    state.connections.retain(|c| !Arc::ptr_eq(c, &connection));
                }
            }
            if state.connections.is_empty() {
                if let Some(task) = state.task.take() {
                    task.cancel();
                }
                return;
            }
            state.connections.clone()
        };

        let now = Instant::now();
        for connection in connections {
            connection.monitor(now, &self.config);
        }
    }
}

impl AcmMonitor for FactoryAcmMonitor {
    fn add(&self, connection: &Arc<Connection>) {
        if self.config.timeout.is_zero() {
            return;
        }
        let mut state = self.state.lock();
        if state.task.is_none() {
            let me = self.me.clone();
            match self.timer.schedule_repeated(self.config.period(), move || {
                if let Some(monitor) = me.upgrade() {
                    monitor.run_timer_task();
                }
            }) {
                Ok(task) => state.task = Some(task),
                Err(err) => {
                    tracing::debug!(target: "ice::acm", error = %err, "cannot schedule ACM scan");
                    return;
                }
            }
        }
        state.changes.push((connection.clone(), true));
    }

    fn remove(&self, connection: &Arc<Connection>) {
        if self.config.timeout.is_zero() {
            return;
        }
        self.state.lock().changes.push((connection.clone(), false));
    }

    fn reap(&self, connection: Arc<Connection>) {
        self.state.lock().reaped.push(connection);
    }

    fn with_overrides(
        &self,
        timeout: Option<Duration>,
        heartbeat: Option<AcmHeartbeat>,
        close: Option<AcmClose>,
    ) -> Arc<dyn AcmMonitor> {
        let config = self.config.with_overrides(timeout, heartbeat, close);
        match self.me.upgrade() {
            Some(parent) if config != self.config => {
                Arc::new(ConnectionAcmMonitor::new(parent, self.timer.clone(), config))
            }
            Some(parent) => parent,
            None => FactoryAcmMonitor::new(self.timer.clone(), config),
        }
    }

    fn acm(&self) -> AcmConfig {
        self.config
    }
}

/// A monitor dedicated to one connection with overridden settings.
#[derive(Debug)]
pub struct ConnectionAcmMonitor {
    parent: Arc<FactoryAcmMonitor>,
    timer: Timer,
    config: AcmConfig,
    state: Arc<Mutex<ConnectionMonitorState>>,
}

#[derive(Debug, Default)]
struct ConnectionMonitorState {
    connection: Option<Weak<Connection>>,
    task: Option<TimerTask>,
}

impl ConnectionAcmMonitor {
    fn new(parent: Arc<FactoryAcmMonitor>, timer: Timer, config: AcmConfig) -> Self {
        Self {
            parent,
            timer,
            config,
            state: Arc::new(Mutex::new(ConnectionMonitorState::default())),
        }
    }
}

impl AcmMonitor for ConnectionAcmMonitor {
    fn add(&self, connection: &Arc<Connection>) {
        let mut state = self.state.lock();
        state.connection = Some(Arc::downgrade(connection));
        if self.config.timeout.is_zero() || state.task.is_some() {
            return;
        }
        let shared = Arc::downgrade(&self.state);
        let config = self.config;
        match self.timer.schedule_repeated(config.period(), move || {
            let connection = shared
                .upgrade()
                .and_then(|s| s.lock().connection.as_ref().and_then(Weak::upgrade));
            if let Some(connection) = connection {
                connection.monitor(Instant::now(), &config);
            }
        }) {
            Ok(task) => state.task = Some(task),
            Err(err) => {
                tracing::debug!(target: "ice::acm", error = %err, "cannot schedule ACM task");
            }
        }
    }

    fn remove(&self, _connection: &Arc<Connection>) {
        let mut state = self.state.lock();
        state.connection = None;
        if let Some(task) = state.task.take() {
            task.cancel();
        }
    }

    fn reap(&self, connection: Arc<Connection>) {
        self.parent.reap(connection);
    }

    fn with_overrides(
        &self,
        timeout: Option<Duration>,
        heartbeat: Option<AcmHeartbeat>,
        close: Option<AcmClose>,
    ) -> Arc<dyn AcmMonitor> {
        self.parent.with_overrides(timeout, heartbeat, close)
    }

    fn acm(&self) -> AcmConfig {
        self.config
    }
}
