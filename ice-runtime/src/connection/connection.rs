//! A single protocol connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use ice_core::protocol::{MessageType, HEADER_SIZE, REQUEST_ID_SIZE};
use ice_core::{IceError, Identity, InputStream, Message, OutputStream, Result};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use super::{CloseMode, ConnectionEvent, ConnectionId};
use crate::acm::{AcmClose, AcmConfig, AcmHeartbeat, AcmMonitor};
use crate::adapter::{read_batch, IncomingRequest, ObjectAdapter, OutgoingResponse};
use crate::batch::{BatchRequestQueue, SwappedBatch};
use crate::endpoint::{Connector, Endpoint};
use crate::instance::Instance;
use crate::invocation::{CancellationHandler, InvokeStatus, OutgoingAsync};
use crate::observer::ConnectionObserverState;
use crate::proxy::ObjectPrx;
use crate::runtime::RuntimeExt;
use crate::transport::Transceiver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    NotValidated,
    Active,
    Closing,
    Closed,
    Finished,
}

impl State {
    fn observer_state(self) -> ConnectionObserverState {
        match self {
            State::NotValidated => ConnectionObserverState::Validating,
            State::Active => ConnectionObserverState::Active,
            State::Closing => ConnectionObserverState::Closing,
            State::Closed | State::Finished => ConnectionObserverState::Closed,
        }
    }
}

#[derive(Debug)]
struct ConnectionState {
    state: State,
    error: Option<IceError>,
    next_request_id: i32,
    requests: HashMap<i32, Arc<OutgoingAsync>>,
    dispatch_count: usize,
    pending_writes: usize,
    last_activity: Instant,
    close_task: Option<crate::timer::TimerTask>,
    shutdown_initiated: bool,
}

/// A connection to a peer.
///
/// The connection runs a reader task that matches replies to pending
/// requests by request id and hands incoming requests to the object adapter.
/// Writes are serialized in FIFO order. Once closed, a connection is never
/// reused.
pub struct Connection {
    id: ConnectionId,
    instance: Arc<Instance>,
    transceiver: Arc<dyn Transceiver>,
    connector: Option<Connector>,
    endpoint: Endpoint,
    description: String,
    adapter: Mutex<Option<Weak<ObjectAdapter>>>,
    monitor: Mutex<Arc<dyn AcmMonitor>>,
    state: Mutex<ConnectionState>,
    write_lock: tokio::sync::Mutex<()>,
    batch_queue: Arc<BatchRequestQueue>,
    drained: Notify,
    finished: watch::Sender<bool>,
    reader: CancellationToken,
    me: Weak<Connection>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.to_string())
            .field("state", &state.state)
            .field("requests", &state.requests.len())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl Connection {
    pub(crate) fn new(
        instance: Arc<Instance>,
        transceiver: Arc<dyn Transceiver>,
        connector: Option<Connector>,
        endpoint: Endpoint,
        adapter: Option<Weak<ObjectAdapter>>,
        monitor: Arc<dyn AcmMonitor>,
    ) -> Arc<Self> {
        let config = instance.config();
        let batch_queue = Arc::new(BatchRequestQueue::new(
            config.batch_auto_flush_size(),
            transceiver.is_datagram(),
            instance.batch_interceptor(),
        ));
        let description = transceiver.description();
        let (finished, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            id: ConnectionId::new(),
            instance,
            transceiver,
            connector,
            endpoint,
            description,
            adapter: Mutex::new(adapter),
            monitor: Mutex::new(monitor),
            state: Mutex::new(ConnectionState {
                state: State::NotValidated,
                error: None,
                next_request_id: 1,
                requests: HashMap::new(),
                dispatch_count: 0,
                pending_writes: 0,
                last_activity: Instant::now(),
                close_task: None,
                shutdown_initiated: false,
            }),
            write_lock: tokio::sync::Mutex::new(()),
            batch_queue,
            drained: Notify::new(),
            finished,
            reader: CancellationToken::new(),
            me: me.clone(),
        })
    }

    /// Returns the connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the endpoint the connection was created for.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns the connector of an outgoing connection.
    pub fn connector(&self) -> Option<&Connector> {
        self.connector.as_ref()
    }

    /// Returns the transport description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the transport protocol name.
    pub fn protocol(&self) -> &str {
        self.transceiver.protocol()
    }

    /// Returns true for connections accepted by an object adapter.
    pub fn is_incoming(&self) -> bool {
        self.connector.is_none()
    }

    /// Returns true for connectionless transports.
    pub fn is_datagram(&self) -> bool {
        self.transceiver.is_datagram()
    }

    /// Returns true while the connection accepts new requests.
    pub fn is_active(&self) -> bool {
        self.state.lock().state == State::Active
    }

    /// Returns true once the transport has been closed.
    pub fn is_finished(&self) -> bool {
        self.state.lock().state == State::Finished
    }

    /// Returns the error that closed or is closing the connection.
    pub fn close_error(&self) -> Option<IceError> {
        let state = self.state.lock();
        if state.state >= State::Closing {
            state.error.clone()
        } else {
            None
        }
    }

    /// Returns the queue for batch requests made through fixed proxies.
    pub fn batch_queue(&self) -> &Arc<BatchRequestQueue> {
        &self.batch_queue
    }

    /// Returns the adapter that dispatches requests received on this
    /// connection.
    pub fn adapter(&self) -> Option<Arc<ObjectAdapter>> {
        self.adapter.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Sets the adapter that dispatches requests received on this
    /// connection. This enables callbacks over outgoing connections.
    pub fn set_adapter(&self, adapter: Option<&Arc<ObjectAdapter>>) {
        *self.adapter.lock() = adapter.map(Arc::downgrade);
    }

    /// Creates a fixed proxy that sends requests over this connection.
    pub fn create_proxy(&self, identity: Identity) -> Result<ObjectPrx> {
        let me = self.me.upgrade().ok_or(IceError::CommunicatorDestroyed)?;
        let reference = self.instance.reference_factory().create_fixed(identity, me)?;
        Ok(ObjectPrx::new(reference))
    }

    /// Returns the ACM settings in effect.
    pub fn get_acm(&self) -> AcmConfig {
        self.monitor.lock().acm()
    }

    /// Overrides the ACM settings of this connection.
    pub fn set_acm(
        &self,
        timeout: Option<Duration>,
        close: Option<AcmClose>,
        heartbeat: Option<AcmHeartbeat>,
    ) {
        let Some(me) = self.me.upgrade() else { return };
        let active = self.state.lock().state == State::Active;
        let (old, new) = {
            let mut monitor = self.monitor.lock();
            let new = monitor.with_overrides(timeout, heartbeat, close);
            let old = std::mem::replace(&mut *monitor, new.clone());
            (old, new)
        };
        if active {
            old.remove(&me);
            new.add(&me);
        }
    }

    /// Initializes the transport, validates the connection and starts the
    /// reader.
    #[tracing::instrument(
        name = "connection.start",
        skip(self),
        fields(id = %self.id, endpoint = %self.endpoint)
    )]
    pub(crate) async fn start(&self) -> Result<()> {
        let me = self.me.upgrade().ok_or(IceError::CommunicatorDestroyed)?;
        self.instance.observer().connection_state_changed(
            &self.description,
            None,
            ConnectionObserverState::Validating,
        );
        if let Err(err) = self.validate().await {
            self.set_state(State::Closed, err.clone());
            return Err(err);
        }

        {
            let mut state = self.state.lock();
            if state.state != State::NotValidated {
                return Err(state.error.clone().unwrap_or(IceError::CommunicatorDestroyed));
            }
            state.last_activity = Instant::now();
        }
        self.set_state(State::Active, IceError::CloseConnection);
        self.monitor.lock().clone().add(&me);

        let reader = me.clone();
        self.instance.runtime().spawn(async move { reader.run_reader().await });
        Ok(())
    }

    async fn validate(&self) -> Result<()> {
        self.transceiver.initialize().await?;
        if self.is_datagram() {
            return Ok(());
        }
        let trace = self.instance.config().trace();
        if self.is_incoming() {
            let message = Message::header_only(MessageType::ValidateConnection).to_bytes();
            self.write_message(message).await?;
        } else {
            let message = self
                .transceiver
                .read()
                .await?
                .ok_or_else(|| IceError::ConnectionLost("end of stream during validation".into()))?;
            if message.message_type() != MessageType::ValidateConnection {
                return Err(IceError::Protocol(format!(
                    "expected validate connection message but received {}",
                    message.message_type().name()
                )));
            }
        }
        if trace.network >= 1 {
            tracing::debug!(
                target: "ice::network",
                connection = %self.description,
                incoming = self.is_incoming(),
                "{} connection validated",
                self.protocol()
            );
        }
        Ok(())
    }

    async fn run_reader(self: Arc<Self>) {
        loop {
            let read = tokio::select! {
                _ = self.reader.cancelled() => return,
                read = self.transceiver.read() => read,
            };
            match read {
                Ok(Some(message)) => {
                    self.instance
                        .observer()
                        .connection_received_bytes(&self.description, message.wire_size());
                    self.state.lock().last_activity = Instant::now();
                    if let Err(err) = self.handle_message(message) {
                        self.set_state(State::Closed, err);
                        return;
                    }
                }
                Ok(None) => {
                    self.set_state(
                        State::Closed,
                        IceError::ConnectionLost("end of stream".to_string()),
                    );
                    return;
                }
                Err(err) => {
                    self.set_state(State::Closed, err);
                    return;
                }
            }
        }
    }

    fn trace_message(&self, action: &str, message_type: MessageType, size: usize) {
        if self.instance.config().trace().protocol >= 1 {
            tracing::debug!(
                target: "ice::protocol",
                connection = %self.description,
                size,
                "{action} {}",
                message_type.name()
            );
        }
    }

    fn handle_message(self: &Arc<Self>, message: Message) -> Result<()> {
        let message_type = message.message_type();
        self.trace_message("received", message_type, message.wire_size());
        match message_type {
            MessageType::CloseConnection => {
                if !self.is_datagram() {
                    self.set_state(State::Closed, IceError::CloseConnection);
                }
            }
            MessageType::ValidateConnection => {
                self.instance
                    .emit_connection_event(ConnectionEvent::HeartbeatReceived { id: self.id });
            }
            MessageType::Request => {
                if self.state.lock().state >= State::Closing {
                    return Ok(());
                }
                let size = message.wire_size();
                let mut is = InputStream::new(message.body);
                let request_id = is.read_i32()?;
                let request = IncomingRequest::read(&mut is, request_id, size)?;
                self.dispatch(request);
            }
            MessageType::BatchRequest => {
                if self.state.lock().state >= State::Closing {
                    return Ok(());
                }
                let mut is = InputStream::new(message.body);
                for request in read_batch(&mut is)? {
                    self.dispatch(request);
                }
            }
            MessageType::Reply => {
                let mut is = InputStream::new(message.body);
                let request_id = is.read_i32()?;
                let (out, drained) = {
                    let mut state = self.state.lock();
                    let out = state.requests.remove(&request_id);
                    (out, state.requests.is_empty())
                };
                if drained {
                    self.drained.notify_waiters();
                }
                if let Some(out) = out {
                    out.completed_reply(&mut is);
                }
            }
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, request: IncomingRequest) {
        self.state.lock().dispatch_count += 1;
        let connection = self.clone();
        self.instance.runtime().spawn(async move {
            let request_id = request.request_id;
            let response = match connection.adapter() {
                Some(adapter) => adapter.dispatch(request, Some(connection.clone())).await,
                None => OutgoingResponse::from_error(
                    &request,
                    IceError::ObjectNotExist {
                        id: request.identity.clone(),
                        facet: request.facet.clone(),
                        operation: request.operation.clone(),
                    },
                ),
            };
            if request_id != 0 {
                let mut os = OutputStream::new_message(MessageType::Reply);
                os.write_i32(request_id);
                response.write_to(&mut os);
                if let Err(err) = connection.write_message(os.finish_message()).await {
                    connection.set_state(State::Closed, err);
                }
            }
            connection.dispatch_finished();
        });
    }

    fn dispatch_finished(&self) {
        let shutdown = {
            let mut state = self.state.lock();
            state.dispatch_count = state.dispatch_count.saturating_sub(1);
            state.state == State::Closing
                && state.dispatch_count == 0
                && !std::mem::replace(&mut state.shutdown_initiated, true)
        };
        if shutdown {
            self.initiate_shutdown();
        }
    }

    /// Writes one message, serialized with every other write.
    async fn write_message(&self, data: Bytes) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_locked(data).await
    }

    async fn write_locked(&self, data: Bytes) -> Result<()> {
        let size = data.len();
        let message_type = data
            .get(8)
            .and_then(|t| MessageType::try_from(*t).ok())
            .unwrap_or(MessageType::Request);
        self.state.lock().pending_writes += 1;
        let result = self.transceiver.write(data).await;
        {
            let mut state = self.state.lock();
            state.pending_writes -= 1;
            if message_type != MessageType::ValidateConnection {
                state.last_activity = Instant::now();
            }
        }
        if result.is_ok() {
            self.trace_message("sent", message_type, size);
            self.instance.observer().connection_sent_bytes(&self.description, size);
        }
        result
    }

    /// Writes the request of `out` and registers it for its reply.
    ///
    /// Returns `SENT | INVOKE_SENT_CALLBACK` once the request is written; the
    /// caller reports the write with [`OutgoingAsync::sent`].
    pub(crate) async fn send_async_request(&self, out: &Arc<OutgoingAsync>) -> Result<InvokeStatus> {
        let twoway = out.is_twoway();
        let _guard = self.write_lock.lock().await;

        let (data, request_id) = {
            let mut state = self.state.lock();
            if state.state >= State::Closing {
                return Err(state.error.clone().unwrap_or(IceError::CloseConnection));
            }
            let mut data = BytesMut::from(&out.request()[..]);
            let request_id = if twoway {
                let id = state.next_request_id;
                state.next_request_id = if id == i32::MAX { 1 } else { id + 1 };
                data[HEADER_SIZE..HEADER_SIZE + REQUEST_ID_SIZE].copy_from_slice(&id.to_le_bytes());
                state.requests.insert(id, out.clone());
                id
            } else {
                0
            };
            (data.freeze(), request_id)
        };

        if let Some(me) = self.me.upgrade() {
            out.set_cancellation_handler(me);
        }

        if let Some(max) = self.transceiver.max_send_size() {
            if data.len() > max {
                self.remove_request(request_id, out);
                return Err(IceError::DatagramLimit(format!(
                    "request of {} bytes exceeds the {max}-byte limit",
                    data.len()
                )));
            }
        }

        match self.write_locked(data).await {
            Ok(()) => Ok(InvokeStatus::SENT | InvokeStatus::INVOKE_SENT_CALLBACK),
            Err(err) => {
                self.remove_request(request_id, out);
                self.set_state(State::Closed, err.clone());
                Err(err)
            }
        }
    }

    fn remove_request(&self, request_id: i32, out: &Arc<OutgoingAsync>) {
        if request_id == 0 {
            return;
        }
        let mut state = self.state.lock();
        if let Some(existing) = state.requests.get(&request_id) {
            if Arc::ptr_eq(existing, out) {
                state.requests.remove(&request_id);
            }
        }
    }

    /// Sends the batch requests queued on this connection by fixed proxies.
    pub async fn flush_batch_requests(&self) -> Result<()> {
        match self.batch_queue.swap() {
            Some(batch) => self.flush_batch(batch).await,
            None => Ok(()),
        }
    }

    /// Sends a batch message taken from a batch queue.
    pub(crate) async fn flush_batch(&self, batch: SwappedBatch) -> Result<()> {
        {
            let state = self.state.lock();
            if state.state >= State::Closing {
                return Err(state.error.clone().unwrap_or(IceError::CloseConnection));
            }
        }
        if let Some(max) = self.transceiver.max_send_size() {
            if batch.message.len() > max {
                return Err(IceError::DatagramLimit(format!(
                    "batch of {} requests exceeds the {max}-byte limit",
                    batch.count
                )));
            }
        }
        // Messages always go out uncompressed.
        tracing::trace!(
            connection = %self.description,
            count = batch.count,
            compress = batch.compress,
            "sending batch requests"
        );
        if let Err(err) = self.write_message(batch.message).await {
            self.set_state(State::Closed, err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Sends a heartbeat to the peer.
    pub async fn heartbeat(&self) -> Result<()> {
        {
            let state = self.state.lock();
            if state.state >= State::Closing {
                return Err(state.error.clone().unwrap_or(IceError::CloseConnection));
            }
        }
        if self.is_datagram() {
            return Ok(());
        }
        let message = Message::header_only(MessageType::ValidateConnection).to_bytes();
        if let Err(err) = self.write_message(message).await {
            self.set_state(State::Closed, err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Applies the ACM policy. Called periodically by the ACM monitor.
    pub fn monitor(&self, now: Instant, acm: &AcmConfig) {
        let (heartbeat, close) = {
            let state = self.state.lock();
            if state.state != State::Active {
                return;
            }

            let idle_heartbeat = acm.heartbeat != AcmHeartbeat::Off
                && state.pending_writes == 0
                && now >= state.last_activity + acm.timeout / 4;
            let heartbeat = (acm.heartbeat == AcmHeartbeat::Always || idle_heartbeat)
                && (acm.heartbeat != AcmHeartbeat::OnDispatch || state.dispatch_count > 0);

            let mut close = None;
            if acm.close != AcmClose::Off
                && now >= state.last_activity + acm.timeout
                && state.pending_writes == 0
            {
                if acm.close == AcmClose::OnIdleForceful
                    || (acm.close != AcmClose::OnIdle && !state.requests.is_empty())
                {
                    close = Some(State::Closed);
                } else if acm.close != AcmClose::OnInvocation
                    && state.dispatch_count == 0
                    && self.batch_queue.is_empty()
                    && state.requests.is_empty()
                {
                    close = Some(State::Closing);
                }
            }
            (heartbeat, close)
        };

        if let Some(target) = close {
            if self.instance.config().trace().network >= 1 {
                tracing::debug!(
                    target: "ice::acm",
                    connection = %self.description,
                    forceful = target == State::Closed,
                    "closing idle connection"
                );
            }
            self.set_state(target, IceError::ConnectionTimeout);
        } else if heartbeat {
            if let Some(me) = self.me.upgrade() {
                self.instance.runtime().spawn(async move {
                    let _ = me.heartbeat().await;
                });
            }
        }
    }

    /// Closes the connection.
    pub async fn close(&self, mode: CloseMode) {
        match mode {
            CloseMode::Forcefully => {
                self.set_state(State::Closed, IceError::ConnectionManuallyClosed { graceful: false })
            }
            CloseMode::Gracefully => {
                self.set_state(State::Closing, IceError::ConnectionManuallyClosed { graceful: true })
            }
            CloseMode::GracefullyWithWait => {
                loop {
                    let drained = self.drained.notified();
                    {
                        let state = self.state.lock();
                        if state.requests.is_empty() || state.state >= State::Closing {
                            break;
                        }
                    }
                    drained.await;
                }
                self.set_state(State::Closing, IceError::ConnectionManuallyClosed { graceful: true });
            }
        }
    }

    /// Starts a graceful close on behalf of the runtime.
    pub(crate) fn destroy(&self, error: IceError) {
        self.set_state(State::Closing, error);
    }

    /// Closes the transport right away.
    pub(crate) fn abort(&self, error: IceError) {
        self.set_state(State::Closed, error);
    }

    /// Waits until the transport has been closed.
    pub async fn wait_until_finished(&self) {
        let mut finished = self.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }

    fn initiate_shutdown(&self) {
        let Some(me) = self.me.upgrade() else { return };
        if self.is_datagram() {
            self.set_state(State::Closed, IceError::CloseConnection);
            return;
        }
        self.instance.runtime().spawn(async move {
            let message = Message::header_only(MessageType::CloseConnection).to_bytes();
            if let Err(err) = me.write_message(message).await {
                me.set_state(State::Closed, err);
                return;
            }

            let config = me.instance.config();
            let timeout = config
                .overrides()
                .close_timeout
                .and_then(|ms| u64::try_from(ms).ok())
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.close_timeout());
            let weak = Arc::downgrade(&me);
            let task = me.instance.timer().schedule(timeout, move || {
                if let Some(connection) = weak.upgrade() {
                    connection.set_state(State::Closed, IceError::CloseTimeout);
                }
            });
            match task {
                Ok(task) => {
                    let mut state = me.state.lock();
                    if state.state >= State::Closed {
                        task.cancel();
                    } else {
                        state.close_task = Some(task);
                    }
                }
                // Without a timer nothing would ever bound the wait for the peer.
                Err(_) => me.set_state(State::Closed, IceError::CloseTimeout),
            }
        });
    }

    fn set_state(&self, new: State, error: IceError) {
        let (old, error, requests, shutdown) = {
            let mut state = self.state.lock();
            if new <= state.state || state.state >= State::Closed {
                return;
            }
            if new >= State::Closing && state.error.is_none() {
                state.error = Some(error);
            }
            let old = std::mem::replace(&mut state.state, new);
            let error = state.error.clone().unwrap_or(IceError::CloseConnection);

            let mut requests = Vec::new();
            let mut shutdown = false;
            match new {
                State::Closing => {
                    if state.dispatch_count == 0 && !state.shutdown_initiated {
                        state.shutdown_initiated = true;
                        shutdown = true;
                    }
                }
                State::Closed => {
                    requests = state.requests.drain().map(|(_, out)| out).collect();
                    if let Some(task) = state.close_task.take() {
                        task.cancel();
                    }
                }
                _ => {}
            }
            (old, error, requests, shutdown)
        };

        let observer = self.instance.observer();
        let old_state = (old != State::NotValidated || new != State::Active)
            .then(|| old.observer_state());
        observer.connection_state_changed(&self.description, old_state, new.observer_state());

        match new {
            State::Active => {
                tracing::debug!(id = %self.id, connection = %self.description, "connection established");
                self.instance.emit_connection_event(ConnectionEvent::Connected {
                    id: self.id,
                    description: self.description.clone(),
                });
            }
            State::Closing => {
                self.batch_queue.destroy(error.clone());
                if shutdown {
                    self.initiate_shutdown();
                }
            }
            State::Closed => {
                self.batch_queue.destroy(error.clone());
                self.reader.cancel();
                self.drained.notify_waiters();
                for out in requests {
                    out.completed_error(error.clone());
                }
                self.report_close(&error);
                self.instance.emit_connection_event(ConnectionEvent::Closed {
                    id: self.id,
                    error: Some(error.to_string()),
                });
                self.spawn_finish();
            }
            _ => {}
        }
    }

    fn report_close(&self, error: &IceError) {
        let expected = matches!(
            error,
            IceError::CloseConnection
                | IceError::ConnectionManuallyClosed { .. }
                | IceError::ConnectionTimeout
                | IceError::CommunicatorDestroyed
                | IceError::ObjectAdapterDeactivated(_)
        );
        if !expected && self.instance.config().warn_connections() {
            tracing::warn!(connection = %self.description, error = %error, "connection closed");
        } else if self.instance.config().trace().network >= 1 {
            tracing::debug!(
                target: "ice::network",
                connection = %self.description,
                error = %error,
                "closing {} connection",
                self.protocol()
            );
        }
    }

    fn spawn_finish(&self) {
        let Some(me) = self.me.upgrade() else { return };
        let finish = async move {
            me.transceiver.close().await;
            me.state.lock().state = State::Finished;
            let monitor = me.monitor.lock().clone();
            monitor.remove(&me);
            monitor.reap(me.clone());
            me.finished.send_replace(true);
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            self.instance.runtime().spawn(finish);
        } else {
            self.finished.send_replace(true);
        }
    }

    fn cancel_request(&self, out: &Arc<OutgoingAsync>, error: IceError) {
        let drained = {
            let mut state = self.state.lock();
            let id = state
                .requests
                .iter()
                .find(|(_, pending)| Arc::ptr_eq(pending, out))
                .map(|(id, _)| *id);
            if let Some(id) = id {
                state.requests.remove(&id);
            }
            state.requests.is_empty()
        };
        if drained {
            self.drained.notify_waiters();
        }
        out.completed_error(error);
    }
}

impl CancellationHandler for Connection {
    fn async_request_canceled(&self, out: &Arc<OutgoingAsync>, error: IceError) {
        self.cancel_request(out, error);
    }
}
