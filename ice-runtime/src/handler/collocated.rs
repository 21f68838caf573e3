use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use ice_core::{IceError, InputStream, Message, OutputStream, Result};
use parking_lot::Mutex;

use super::RequestHandler;
use crate::adapter::{read_batch, IncomingRequest, ObjectAdapter};
use crate::batch::SwappedBatch;
use crate::connection::Connection;
use crate::invocation::{CancellationHandler, InvokeStatus, OutgoingAsync};
use crate::reference::Reference;
use crate::runtime::RuntimeExt;

struct CollocatedState {
    next_request_id: i32,
    requests: HashMap<i32, Arc<OutgoingAsync>>,
}

/// Dispatches requests directly to an object adapter of the same
/// communicator, without marshaling them onto a transport.
pub struct CollocatedRequestHandler {
    reference: Reference,
    adapter: Arc<ObjectAdapter>,
    state: Mutex<CollocatedState>,
    me: Weak<CollocatedRequestHandler>,
}

impl fmt::Debug for CollocatedRequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollocatedRequestHandler")
            .field("adapter", &self.adapter.name())
            .field("pending", &self.state.lock().requests.len())
            .finish()
    }
}

impl CollocatedRequestHandler {
    /// Creates a handler that dispatches to `adapter`.
    pub fn new(reference: Reference, adapter: Arc<ObjectAdapter>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            reference,
            adapter,
            state: Mutex::new(CollocatedState {
                next_request_id: 1,
                requests: HashMap::new(),
            }),
            me: me.clone(),
        })
    }

    fn dispatch(&self, request: IncomingRequest) {
        let Some(me) = self.me.upgrade() else { return };
        let runtime = self.reference.instance().runtime().clone();
        runtime.spawn(async move {
            let request_id = request.request_id;
            let response = me.adapter.dispatch(request, None).await;
            if request_id == 0 {
                return;
            }
            let out = me.state.lock().requests.remove(&request_id);
            if let Some(out) = out {
                let mut os = OutputStream::new();
                response.write_to(&mut os);
                out.completed_reply(&mut InputStream::new(os.finished()));
            }
        });
    }
}

impl CancellationHandler for CollocatedRequestHandler {
    fn async_request_canceled(&self, out: &Arc<OutgoingAsync>, error: IceError) {
        self.state
            .lock()
            .requests
            .retain(|_, pending| !Arc::ptr_eq(pending, out));
        out.completed_error(error);
    }
}

#[async_trait]
impl RequestHandler for CollocatedRequestHandler {
    async fn send_async_request(&self, out: &Arc<OutgoingAsync>) -> Result<InvokeStatus> {
        let message = Message::parse(out.request())?;
        let size = message.wire_size();
        let mut is = InputStream::new(message.body);
        is.read_i32()?;

        let request_id = if out.is_twoway() {
            let mut state = self.state.lock();
            let id = state.next_request_id;
            state.next_request_id = if id == i32::MAX { 1 } else { id + 1 };
            state.requests.insert(id, out.clone());
            id
        } else {
            0
        };
        let request = match IncomingRequest::read(&mut is, request_id, size) {
            Ok(request) => request,
            Err(err) => {
                self.state.lock().requests.remove(&request_id);
                return Err(err);
            }
        };

        if let Some(me) = self.me.upgrade() {
            out.set_cancellation_handler(me);
        }
        out.sent();
        self.dispatch(request);
        Ok(InvokeStatus::SENT)
    }

    async fn flush_batch(&self, batch: SwappedBatch) -> Result<()> {
        let message = Message::parse(batch.message)?;
        let mut is = InputStream::new(message.body);
        for request in read_batch(&mut is)? {
            self.dispatch(request);
        }
        Ok(())
    }

    fn reference(&self) -> &Reference {
        &self.reference
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        None
    }

    async fn get_connection(&self) -> Result<Option<Arc<Connection>>> {
        Ok(None)
    }
}
