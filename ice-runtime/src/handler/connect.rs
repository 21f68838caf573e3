use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use ice_core::{IceError, Result};
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{ConnectionRequestHandler, RequestHandler};
use crate::batch::SwappedBatch;
use crate::connection::Connection;
use crate::invocation::{CancellationHandler, InvokeStatus, OutgoingAsync};
use crate::proxy::ObjectPrx;
use crate::reference::Reference;
use crate::runtime::{Runtime, RuntimeExt};

#[derive(Default)]
struct ConnectState {
    connection: Option<Arc<Connection>>,
    error: Option<IceError>,
    initialized: bool,
    requests: VecDeque<Arc<OutgoingAsync>>,
    handler: Option<Arc<ConnectionRequestHandler>>,
}

/// Queues requests while a connection is being established, then sends them
/// in order and hands over to a [`ConnectionRequestHandler`].
pub struct ConnectRequestHandler {
    reference: Reference,
    proxy: Mutex<Option<ObjectPrx>>,
    state: Mutex<ConnectState>,
    ready: watch::Sender<bool>,
    me: Weak<ConnectRequestHandler>,
}

impl fmt::Debug for ConnectRequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectRequestHandler")
            .field("reference", &self.reference.to_string())
            .field("initialized", &state.initialized)
            .field("queued", &state.requests.len())
            .finish()
    }
}

impl ConnectRequestHandler {
    pub(crate) fn new(reference: Reference, proxy: ObjectPrx) -> Arc<Self> {
        let (ready, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            reference,
            proxy: Mutex::new(Some(proxy)),
            state: Mutex::new(ConnectState::default()),
            ready,
            me: me.clone(),
        })
    }

    /// Starts establishing the connection in the background.
    pub(crate) fn connect(self: &Arc<Self>, runtime: &Arc<dyn Runtime>) {
        let me = self.clone();
        runtime.spawn(async move {
            match me.reference.get_connection().await {
                Ok(connection) => me.set_connection(connection).await,
                Err(err) => me.set_exception(err),
            }
        });
    }

    /// Returns the connection handler once connected, this handler otherwise.
    pub(crate) fn request_handler(self: &Arc<Self>) -> Arc<dyn RequestHandler> {
        let state = self.state.lock();
        match (&state.handler, state.initialized) {
            (Some(handler), true) => handler.clone(),
            _ => self.clone(),
        }
    }

    async fn set_connection(&self, connection: Arc<Connection>) {
        {
            let mut state = self.state.lock();
            if state.error.is_some() {
                return;
            }
            state.connection = Some(connection.clone());
        }

        if let Some(router) = self.reference.router_info() {
            let proxy = self.proxy.lock().clone();
            if let Some(proxy) = proxy {
                if let Err(err) = router.add_proxy(&proxy).await {
                    self.set_exception(err);
                    return;
                }
            }
        }

        self.flush_requests(connection).await;
    }

    async fn flush_requests(&self, connection: Arc<Connection>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.requests.pop_front() {
                    Some(out) => out,
                    None => {
                        let handler = Arc::new(ConnectionRequestHandler::new(
                            self.reference.clone(),
                            connection.clone(),
                        ));
                        state.handler = Some(handler);
                        state.initialized = true;
                        break;
                    }
                }
            };
            match connection.send_async_request(&next).await {
                Ok(status) => {
                    if status.contains(InvokeStatus::INVOKE_SENT_CALLBACK) {
                        next.sent();
                    }
                }
                Err(err) => {
                    next.completed_error(err);
                }
            }
        }
        self.ready.send_replace(true);
        self.finish();
    }

    fn set_exception(&self, error: IceError) {
        let requests = {
            let mut state = self.state.lock();
            if state.error.is_some() {
                return;
            }
            state.error = Some(error.clone());
            std::mem::take(&mut state.requests)
        };
        for out in requests {
            out.completed_error(error.clone());
        }
        self.ready.send_replace(true);
        self.finish();
    }

    fn finish(&self) {
        let instance = self.reference.instance();
        instance.request_handler_factory().remove_request_handler(&self.reference, self);

        let Some(proxy) = self.proxy.lock().take() else { return };
        let Some(me) = self.me.upgrade() else { return };
        let me: Arc<dyn RequestHandler> = me;
        let replacement = {
            let state = self.state.lock();
            state
                .handler
                .clone()
                .map(|handler| handler as Arc<dyn RequestHandler>)
        };
        proxy.update_request_handler(&me, replacement);
    }
}

impl CancellationHandler for ConnectRequestHandler {
    fn async_request_canceled(&self, out: &Arc<OutgoingAsync>, error: IceError) {
        let (queued, connection) = {
            let mut state = self.state.lock();
            let before = state.requests.len();
            state.requests.retain(|pending| !Arc::ptr_eq(pending, out));
            (state.requests.len() != before, state.connection.clone())
        };
        if queued {
            out.completed_error(error);
        } else if let Some(connection) = connection {
            connection.async_request_canceled(out, error);
        } else {
            out.completed_error(error);
        }
    }
}

#[async_trait]
impl RequestHandler for ConnectRequestHandler {
    async fn send_async_request(&self, out: &Arc<OutgoingAsync>) -> Result<InvokeStatus> {
        let connection = {
            let mut state = self.state.lock();
            if let Some(err) = &state.error {
                return Err(err.clone());
            }
            if !state.initialized {
                out.queued();
                state.requests.push_back(out.clone());
                None
            } else {
                state.connection.clone()
            }
        };

        match connection {
            Some(connection) => connection.send_async_request(out).await,
            None => {
                if let Some(me) = self.me.upgrade() {
                    out.set_cancellation_handler(me);
                }
                Ok(InvokeStatus::QUEUED)
            }
        }
    }

    async fn flush_batch(&self, batch: SwappedBatch) -> Result<()> {
        match self.get_connection().await? {
            Some(connection) => connection.flush_batch(batch).await,
            None => Err(IceError::ConnectionLost("no connection".to_string())),
        }
    }

    fn reference(&self) -> &Reference {
        &self.reference
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        let state = self.state.lock();
        if state.initialized {
            state.connection.clone()
        } else {
            None
        }
    }

    async fn get_connection(&self) -> Result<Option<Arc<Connection>>> {
        let mut ready = self.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
        let state = self.state.lock();
        match (&state.error, &state.connection) {
            (Some(err), _) => Err(err.clone()),
            (None, Some(connection)) => Ok(Some(connection.clone())),
            (None, None) => Err(IceError::ConnectionLost("no connection".to_string())),
        }
    }
}
