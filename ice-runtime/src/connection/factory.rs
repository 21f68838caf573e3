use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ice_core::{IceError, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{CloseMode, Connection};
use crate::acm::{AcmMonitor, FactoryAcmMonitor};
use crate::adapter::ObjectAdapter;
use crate::endpoint::{Connector, Endpoint};
use crate::instance::Instance;
use crate::runtime::RuntimeExt;
use crate::transport::{Acceptor, IdleTimeoutTransceiver, Transceiver};

#[derive(Default)]
struct OutgoingState {
    destroyed: bool,
    by_connector: HashMap<Connector, Vec<Arc<Connection>>>,
    by_endpoint: HashMap<Endpoint, Vec<Arc<Connection>>>,
    pending: HashMap<Connector, Arc<tokio::sync::Mutex<()>>>,
}

/// Creates and shares outgoing connections.
///
/// Connections are looked up first by endpoint and then by resolved
/// connector. Concurrent requests for the same connector wait for a single
/// connection attempt.
pub struct OutgoingConnectionFactory {
    instance: Weak<Instance>,
    monitor: Arc<FactoryAcmMonitor>,
    state: Mutex<OutgoingState>,
}

impl std::fmt::Debug for OutgoingConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OutgoingConnectionFactory")
            .field("destroyed", &state.destroyed)
            .field("connectors", &state.by_connector.len())
            .finish()
    }
}

fn usable(connections: Option<&Vec<Arc<Connection>>>) -> Option<Arc<Connection>> {
    connections?.iter().find(|c| c.is_active()).cloned()
}

impl OutgoingConnectionFactory {
    pub(crate) fn new(instance: Weak<Instance>, monitor: Arc<FactoryAcmMonitor>) -> Self {
        Self {
            instance,
            monitor,
            state: Mutex::new(OutgoingState::default()),
        }
    }

    fn instance(&self) -> Result<Arc<Instance>> {
        self.instance.upgrade().ok_or(IceError::CommunicatorDestroyed)
    }

    fn remove_reaped(&self) {
        let reaped = self.monitor.swap_reaped_connections();
        let mut state = self.state.lock();
        let dead = |c: &Arc<Connection>| c.is_finished() || reaped.iter().any(|r| Arc::ptr_eq(r, c));
        state.by_connector.retain(|_, list| {
            list.retain(|c| !dead(c));
            !list.is_empty()
        });
        state.by_endpoint.retain(|_, list| {
            list.retain(|c| !dead(c));
            !list.is_empty()
        });
    }

    /// Returns an active connection to one of `endpoints`, creating one if
    /// needed. Endpoints are tried in order.
    pub async fn create(&self, endpoints: &[Endpoint]) -> Result<Arc<Connection>> {
        let instance = self.instance()?;
        self.remove_reaped();
        {
            let state = self.state.lock();
            if state.destroyed {
                return Err(IceError::CommunicatorDestroyed);
            }
            for endpoint in endpoints {
                if let Some(connection) = usable(state.by_endpoint.get(endpoint)) {
                    return Ok(connection);
                }
            }
        }

        let mut last_error = None;
        for endpoint in endpoints {
            let connectors = match endpoint.connectors(instance.resolver()).await {
                Ok(connectors) => connectors,
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            };
            for connector in connectors {
                match self.get_or_connect(&instance, endpoint, connector).await {
                    Ok(connection) => return Ok(connection),
                    Err(err @ IceError::CommunicatorDestroyed) => return Err(err),
                    Err(err) => last_error = Some(err),
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            IceError::NoEndpoint("no connector could be resolved".to_string())
        }))
    }

    async fn get_or_connect(
        &self,
        instance: &Arc<Instance>,
        endpoint: &Endpoint,
        connector: Connector,
    ) -> Result<Arc<Connection>> {
        let pending = {
            let mut state = self.state.lock();
            if let Some(connection) = usable(state.by_connector.get(&connector)) {
                state
                    .by_endpoint
                    .entry(endpoint.clone())
                    .or_default()
                    .push(connection.clone());
                return Ok(connection);
            }
            state.pending.entry(connector.clone()).or_default().clone()
        };

        let _guard = pending.lock().await;
        {
            let state = self.state.lock();
            if state.destroyed {
                return Err(IceError::CommunicatorDestroyed);
            }
            if let Some(connection) = usable(state.by_connector.get(&connector)) {
                return Ok(connection);
            }
        }

        let result = self.connect(instance, endpoint, &connector).await;
        let mut state = self.state.lock();
        state.pending.remove(&connector);
        let connection = result?;
        if state.destroyed {
            connection.abort(IceError::CommunicatorDestroyed);
            return Err(IceError::CommunicatorDestroyed);
        }
        state
            .by_connector
            .entry(connector)
            .or_default()
            .push(connection.clone());
        state
            .by_endpoint
            .entry(endpoint.clone())
            .or_default()
            .push(connection.clone());
        Ok(connection)
    }

    #[tracing::instrument(name = "connection.connect", skip(self, instance, endpoint), fields(connector = %connector))]
    async fn connect(
        &self,
        instance: &Arc<Instance>,
        endpoint: &Endpoint,
        connector: &Connector,
    ) -> Result<Arc<Connection>> {
        let config = instance.config();
        let timeout_ms = config.overrides().connect_timeout.unwrap_or_else(|| connector.timeout());
        let attempt = async {
            let transceiver = connector.connect(config.message_size_max()).await?;
            let transceiver: Arc<dyn Transceiver> = Arc::from(transceiver);
            let transceiver: Arc<dyn Transceiver> = match config.idle_timeout() {
                Some(idle) if !transceiver.is_datagram() => Arc::new(IdleTimeoutTransceiver::new(
                    transceiver,
                    idle,
                    instance.timer().clone(),
                )?),
                _ => transceiver,
            };
            let connection = Connection::new(
                instance.clone(),
                transceiver,
                Some(connector.clone()),
                endpoint.clone(),
                None,
                self.monitor.clone(),
            );
            connection.start().await?;
            Ok::<_, IceError>(connection)
        };

        let result = match u64::try_from(timeout_ms) {
            Ok(ms) => tokio::time::timeout(Duration::from_millis(ms), attempt)
                .await
                .unwrap_or(Err(IceError::ConnectTimeout)),
            Err(_) => attempt.await,
        };

        let trace = config.trace().network;
        match &result {
            Ok(connection) if trace >= 1 => tracing::debug!(
                target: "ice::network",
                connection = %connection,
                "established {} connection",
                connector.protocol()
            ),
            Err(err) if trace >= 2 => tracing::debug!(
                target: "ice::network",
                error = %err,
                "failed to establish {} connection to {}",
                connector.protocol(),
                connector
            ),
            _ => {}
        }
        result
    }

    /// Returns every connection the factory knows about.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let state = self.state.lock();
        let mut all: Vec<Arc<Connection>> = Vec::new();
        for connection in state.by_connector.values().flatten() {
            if !all.iter().any(|c| Arc::ptr_eq(c, connection)) {
                all.push(connection.clone());
            }
        }
        all
    }

    /// Sends the batch requests queued on every connection.
    pub async fn flush_batch_requests(&self) -> Result<()> {
        for connection in self.connections() {
            if connection.is_active() {
                connection.flush_batch_requests().await?;
            }
        }
        Ok(())
    }

    /// Closes every connection gracefully and refuses new ones.
    pub fn destroy(&self) {
        let connections = {
            let mut state = self.state.lock();
            if std::mem::replace(&mut state.destroyed, true) {
                return;
            }
            state.pending.clear();
            state
                .by_connector
                .drain()
                .flat_map(|(_, list)| list)
                .collect::<Vec<_>>()
        };
        for connection in connections {
            connection.destroy(IceError::CommunicatorDestroyed);
        }
    }

    /// Closes every connection right away.
    pub fn destroy_forcefully(&self) {
        let connections = {
            let mut state = self.state.lock();
            state.destroyed = true;
            state.pending.clear();
            state.by_endpoint.clear();
            state
                .by_connector
                .drain()
                .flat_map(|(_, list)| list)
                .collect::<Vec<_>>()
        };
        for connection in connections {
            connection.abort(IceError::CommunicatorDestroyed);
        }
    }

    /// Waits until every connection has closed its transport.
    pub async fn wait_until_finished(&self) {
        let connections: Vec<_> = {
            let mut state = self.state.lock();
            state.by_endpoint.drain().flat_map(|(_, list)| list).collect()
        };
        for connection in connections {
            connection.wait_until_finished().await;
        }
        self.monitor.destroy();
    }
}

enum Listener {
    Acceptor(Box<dyn Acceptor>),
    Datagram(Arc<Connection>),
}

/// Accepts connections for one endpoint of an object adapter.
pub struct IncomingConnectionFactory {
    instance: Arc<Instance>,
    endpoint: Endpoint,
    adapter: Weak<ObjectAdapter>,
    monitor: Arc<dyn AcmMonitor>,
    listener: Mutex<Option<Arc<Listener>>>,
    connections: Mutex<Vec<Arc<Connection>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for IncomingConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingConnectionFactory")
            .field("endpoint", &self.endpoint.to_string())
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}

impl IncomingConnectionFactory {
    /// Binds `endpoint`. The returned factory does not accept connections
    /// until [`activate`](Self::activate) is called.
    pub(crate) async fn new(
        instance: Arc<Instance>,
        endpoint: Endpoint,
        adapter: Weak<ObjectAdapter>,
        monitor: Arc<dyn AcmMonitor>,
    ) -> Result<Arc<Self>> {
        let max = instance.config().message_size_max();
        let (listener, bound) = if let Some(acceptor) = endpoint.acceptor(instance.resolver(), max).await? {
            let bound = acceptor.endpoint();
            (Listener::Acceptor(acceptor), bound)
        } else if let Some((transceiver, bound)) = endpoint.transceiver(instance.resolver()).await? {
            let connection = Connection::new(
                instance.clone(),
                Arc::from(transceiver),
                None,
                bound.clone(),
                Some(adapter.clone()),
                monitor.clone(),
            );
            (Listener::Datagram(connection), bound)
        } else {
            return Err(IceError::FeatureNotSupported(format!(
                "cannot listen on endpoint `{endpoint}`"
            )));
        };

        if instance.config().trace().network >= 1 {
            tracing::debug!(target: "ice::network", endpoint = %bound, "listening for connections");
        }

        Ok(Arc::new(Self {
            instance,
            endpoint: bound,
            adapter,
            monitor,
            listener: Mutex::new(Some(Arc::new(listener))),
            connections: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Returns the endpoint with the port actually bound.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Starts accepting connections.
    pub async fn activate(self: &Arc<Self>) -> Result<()> {
        let Some(listener) = self.listener.lock().clone() else {
            return Err(IceError::ObjectAdapterDeactivated(self.endpoint.to_string()));
        };
        match &*listener {
            Listener::Datagram(connection) => {
                connection.start().await?;
                self.connections.lock().push(connection.clone());
            }
            Listener::Acceptor(_) => {
                let factory = self.clone();
                self.instance
                    .runtime()
                    .spawn(async move { factory.accept_loop(listener).await });
            }
        }
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: Arc<Listener>) {
        let Listener::Acceptor(acceptor) = &*listener else { return };
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                accepted = acceptor.accept() => accepted,
            };
            let transceiver = match accepted {
                Ok(transceiver) => transceiver,
                Err(err) => {
                    tracing::warn!(endpoint = %self.endpoint, error = %err, "failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let transceiver: Arc<dyn Transceiver> = Arc::from(transceiver);
            let transceiver: Arc<dyn Transceiver> = match self.instance.config().idle_timeout() {
                Some(idle) => match IdleTimeoutTransceiver::new(transceiver.clone(), idle, self.instance.timer().clone()) {
                    Ok(wrapped) => Arc::new(wrapped),
                    Err(_) => transceiver,
                },
                None => transceiver,
            };
            let connection = Connection::new(
                self.instance.clone(),
                transceiver,
                None,
                self.endpoint.clone(),
                Some(self.adapter.clone()),
                self.monitor.clone(),
            );
            {
                let mut connections = self.connections.lock();
                connections.retain(|c| !c.is_finished());
                connections.push(connection.clone());
            }
            self.instance.runtime().spawn(async move {
                if let Err(err) = connection.start().await {
                    tracing::debug!(connection = %connection, error = %err, "connection validation failed");
                }
            });
        }
    }

    /// Returns the live connections accepted by this factory.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .iter()
            .filter(|c| !c.is_finished())
            .cloned()
            .collect()
    }

    /// Stops listening and closes every accepted connection gracefully.
    pub fn destroy(&self) {
        self.shutdown.cancel();
        self.listener.lock().take();
        let error = IceError::ObjectAdapterDeactivated(
            self.adapter
                .upgrade()
                .map(|a| a.name().to_string())
                .unwrap_or_default(),
        );
        for connection in self.connections.lock().iter() {
            connection.destroy(error.clone());
        }
    }

    /// Waits until every accepted connection has finished.
    pub async fn wait_until_finished(&self) {
        let connections = std::mem::take(&mut *self.connections.lock());
        for connection in connections {
            connection.wait_until_finished().await;
        }
    }

    /// Closes the accepted connections, waiting for outstanding invocations
    /// made over them first.
    pub async fn close_connections(&self, mode: CloseMode) {
        for connection in self.connections() {
            connection.close(mode).await;
        }
    }
}
