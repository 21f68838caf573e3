//! Idle-timeout decorator for stream transceivers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ice_core::protocol::MessageType;
use ice_core::{IceError, Message, Result};
use parking_lot::Mutex;

use super::Transceiver;
use crate::runtime::RuntimeExt;
use crate::timer::{Timer, TimerTask};

/// Wraps a stream transceiver so that a silent peer fails the connection.
///
/// A read that sees no message for `idle_timeout` fails with
/// `ConnectionTimeout`. While nothing is written, a validate-connection
/// message is sent every `idle_timeout / 2` to keep the peer's reads alive.
#[derive(Debug)]
pub struct IdleTimeoutTransceiver {
    inner: Arc<dyn Transceiver>,
    idle_timeout: Duration,
    timer: Timer,
    heartbeat: Mutex<Option<TimerTask>>,
}

impl IdleTimeoutTransceiver {
    /// Decorates `inner`. Datagram transports are rejected.
    pub fn new(inner: Arc<dyn Transceiver>, idle_timeout: Duration, timer: Timer) -> Result<Self> {
        if inner.is_datagram() {
            return Err(IceError::FeatureNotSupported(
                "idle timeout on a datagram transport".to_string(),
            ));
        }
        if idle_timeout.is_zero() {
            return Err(IceError::Configuration("idle timeout must not be zero".to_string()));
        }
        Ok(Self {
            inner,
            idle_timeout,
            timer,
            heartbeat: Mutex::new(None),
        })
    }

    /// Returns the configured idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn reschedule_heartbeat(&self) {
        let inner = self.inner.clone();
        let runtime = self.timer.runtime().clone();
        let period = (self.idle_timeout / 2).max(Duration::from_millis(1));
        let task = self.timer.schedule_repeated(period, move || {
            let inner = inner.clone();
            runtime.spawn(async move {
                let ping = Message::header_only(MessageType::ValidateConnection).to_bytes();
                if let Err(err) = inner.write(ping).await {
                    tracing::debug!(target: "ice::network", error = %err, "idle heartbeat failed");
                }
            });
        });

        let previous = match task {
            Ok(task) => self.heartbeat.lock().replace(task),
            Err(_) => self.heartbeat.lock().take(),
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
    }
}

#[async_trait]
impl Transceiver for IdleTimeoutTransceiver {
    async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await?;
        self.reschedule_heartbeat();
        Ok(())
    }

    async fn read(&self) -> Result<Option<Message>> {
        match tokio::time::timeout(self.idle_timeout, self.inner.read()).await {
            Ok(result) => result,
            Err(_) => Err(IceError::ConnectionTimeout),
        }
    }

    async fn write(&self, data: Bytes) -> Result<()> {
        self.inner.write(data).await?;
        self.reschedule_heartbeat();
        Ok(())
    }

    async fn close(&self) {
        if let Some(task) = self.heartbeat.lock().take() {
            task.cancel();
        }
        self.inner.close().await;
    }

    fn protocol(&self) -> &str {
        self.inner.protocol()
    }

    fn max_send_size(&self) -> Option<usize> {
        self.inner.max_send_size()
    }

    fn description(&self) -> String {
        self.inner.description()
    }
}
