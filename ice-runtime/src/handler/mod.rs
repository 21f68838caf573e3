//! Request handlers route a proxy's invocations to a connection or to a
//! collocated object adapter.
//!
//! A proxy obtains its handler from the [`RequestHandlerFactory`]:
//!
//! - fixed proxies use a [`ConnectionRequestHandler`] over their connection;
//! - proxies whose target is served by an adapter of the same communicator
//!   use a [`CollocatedRequestHandler`] when collocation optimization is on;
//! - everything else uses a [`ConnectRequestHandler`], which queues requests
//!   while the connection is being established.

mod collocated;
mod connect;
mod connection;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use ice_core::{IceError, Result};
use parking_lot::Mutex;

pub use collocated::CollocatedRequestHandler;
pub use connect::ConnectRequestHandler;
pub use connection::ConnectionRequestHandler;

use crate::batch::SwappedBatch;
use crate::connection::Connection;
use crate::instance::Instance;
use crate::invocation::{CancellationHandler, InvokeStatus, OutgoingAsync};
use crate::proxy::ObjectPrx;
use crate::reference::Reference;

/// Sends the requests of one proxy.
#[async_trait]
pub trait RequestHandler: CancellationHandler {
    /// Hands `out` to the transport, or queues it.
    async fn send_async_request(&self, out: &Arc<OutgoingAsync>) -> Result<InvokeStatus>;

    /// Sends a batch of oneway requests.
    async fn flush_batch(&self, batch: SwappedBatch) -> Result<()>;

    /// Returns the reference the handler was created for.
    fn reference(&self) -> &Reference;

    /// Returns the connection if it is established already.
    fn connection(&self) -> Option<Arc<Connection>>;

    /// Waits for the connection. Collocated handlers have none.
    async fn get_connection(&self) -> Result<Option<Arc<Connection>>>;
}

/// Creates request handlers and shares connect handlers between proxies
/// with equal references.
pub struct RequestHandlerFactory {
    instance: Weak<Instance>,
    handlers: Mutex<HashMap<Reference, Arc<ConnectRequestHandler>>>,
}

impl std::fmt::Debug for RequestHandlerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandlerFactory")
            .field("pending", &self.handlers.lock().len())
            .finish()
    }
}

impl RequestHandlerFactory {
    pub(crate) fn new(instance: Weak<Instance>) -> Self {
        Self {
            instance,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the handler for `proxy`, starting a connection attempt if
    /// needed.
    pub fn get_request_handler(&self, proxy: &ObjectPrx) -> Result<Arc<dyn RequestHandler>> {
        let instance = self.instance.upgrade().ok_or(IceError::CommunicatorDestroyed)?;
        instance.check_destroyed()?;
        let reference = proxy.reference();

        if let Some(connection) = reference.fixed_connection() {
            return Ok(Arc::new(ConnectionRequestHandler::new(
                reference.clone(),
                connection.clone(),
            )));
        }

        if reference.collocation_optimized() {
            if let Some(adapter) = instance.find_adapter(reference) {
                let handler: Arc<dyn RequestHandler> =
                    CollocatedRequestHandler::new(reference.clone(), adapter);
                return Ok(handler);
            }
        }

        let (handler, created) = if reference.cache_connection() {
            let mut handlers = self.handlers.lock();
            match handlers.get(reference) {
                Some(handler) => (handler.clone(), false),
                None => {
                    let handler = ConnectRequestHandler::new(reference.clone(), proxy.clone());
                    handlers.insert(reference.clone(), handler.clone());
                    (handler, true)
                }
            }
        } else {
            (ConnectRequestHandler::new(reference.clone(), proxy.clone()), true)
        };

        if created {
            handler.connect(instance.runtime());
        }
        Ok(handler.request_handler())
    }

    /// Forgets `handler` once it has connected or failed.
    pub(crate) fn remove_request_handler(&self, reference: &Reference, handler: &ConnectRequestHandler) {
        let mut handlers = self.handlers.lock();
        if let Some(existing) = handlers.get(reference) {
            if std::ptr::eq(Arc::as_ptr(existing), handler) {
                handlers.remove(reference);
            }
        }
    }
}
