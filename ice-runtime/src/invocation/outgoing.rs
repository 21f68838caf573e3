//! The pending-invocation record and its retry loop.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use ice_core::protocol::{
    check_supported_protocol, get_compatible_protocol, MessageType, OperationMode, ReplyStatus,
};
use ice_core::{Context, IceError, Identity, InputStream, OutputStream, Result};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{retry, CancellationHandler, InvokeStatus, Reply};
use crate::handler::RequestHandler;
use crate::proxy::ObjectPrx;
use crate::reference::Reference;

/// Progress of an [`OutgoingAsync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Constructed, request not marshaled yet.
    Created,
    /// Request marshaled, not handed to a connection.
    Preparing,
    /// Waiting for a connection to be established.
    Queued,
    /// Written to a connection.
    Sent,
    /// Finished; further completions are ignored.
    Completed,
}

struct OutgoingState {
    phase: Phase,
    request: Bytes,
    attempt: Option<oneshot::Sender<Result<Reply>>>,
    handler: Option<Arc<dyn CancellationHandler>>,
    canceled: Option<IceError>,
    sent: bool,
}

/// A pending invocation.
///
/// The request is marshaled once by [`prepare`](Self::prepare) and resent
/// unchanged on retry. Each attempt completes exactly once: by a reply, by an
/// error, or by cancellation, whichever comes first.
pub struct OutgoingAsync {
    proxy: ObjectPrx,
    operation: String,
    mode: OperationMode,
    twoway_only: bool,
    user_exceptions: Vec<String>,
    state: Mutex<OutgoingState>,
    interrupt: CancellationToken,
    me: Weak<OutgoingAsync>,
}

impl fmt::Debug for OutgoingAsync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingAsync")
            .field("operation", &self.operation)
            .field("mode", &self.mode)
            .field("phase", &self.state.lock().phase)
            .finish()
    }
}

/// Writes the part of a request body shared by requests and batch requests.
pub(crate) fn write_request_header(
    os: &mut OutputStream,
    reference: &Reference,
    operation: &str,
    mode: OperationMode,
    context: &Context,
) {
    os.write(reference.identity());
    if reference.facet().is_empty() {
        os.write_size(0);
    } else {
        os.write_string_seq(&[reference.facet()]);
    }
    os.write_string(operation);
    os.write_u8(mode as u8);
    os.write_context(context);
}

impl OutgoingAsync {
    /// Creates an invocation of `operation` on `proxy`.
    ///
    /// `user_exceptions` lists the type ids the operation declares; any other
    /// user exception in the reply becomes `UnknownUserException`.
    pub fn new(
        proxy: ObjectPrx,
        operation: impl Into<String>,
        mode: OperationMode,
        twoway_only: bool,
        user_exceptions: &[&str],
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            proxy,
            operation: operation.into(),
            mode,
            twoway_only,
            user_exceptions: user_exceptions.iter().map(|s| s.to_string()).collect(),
            state: Mutex::new(OutgoingState {
                phase: Phase::Created,
                request: Bytes::new(),
                attempt: None,
                handler: None,
                canceled: None,
                sent: false,
            }),
            interrupt: CancellationToken::new(),
            me: me.clone(),
        })
    }

    /// Marshals the request.
    ///
    /// `params` is the marshaled in-parameters; they are wrapped in an
    /// encapsulation using the proxy's encoding. Without an explicit context
    /// the proxy's context is sent.
    pub fn prepare(&self, params: &[u8], context: Option<&Context>) -> Result<()> {
        let reference = self.proxy.reference();
        if self.twoway_only && !reference.is_twoway() {
            return Err(IceError::TwowayOnly(self.operation.clone()));
        }
        check_supported_protocol(get_compatible_protocol(reference.protocol()))?;

        let mut os = OutputStream::new_message(MessageType::Request);
        os.write_i32(0);
        let context = context.unwrap_or_else(|| reference.context());
        write_request_header(&mut os, reference, &self.operation, self.mode, context);
        os.write_encapsulation(reference.encoding(), params);

        let mut state = self.state.lock();
        state.request = os.finish_message();
        state.phase = Phase::Preparing;
        Ok(())
    }

    /// Returns the proxy the invocation is made on.
    pub fn proxy(&self) -> &ObjectPrx {
        &self.proxy
    }

    /// Returns the operation name.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Returns the operation mode.
    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    /// Returns true if the caller waits for a reply.
    pub fn is_twoway(&self) -> bool {
        self.proxy.reference().is_twoway()
    }

    /// Returns the current phase.
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Returns true once the current attempt was written.
    pub fn is_sent(&self) -> bool {
        self.state.lock().sent
    }

    /// Returns the marshaled request with a zero request id.
    pub fn request(&self) -> Bytes {
        self.state.lock().request.clone()
    }

    fn begin_attempt(&self) -> oneshot::Receiver<Result<Reply>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.attempt = Some(tx);
        state.handler = None;
        state.sent = false;
        state.phase = Phase::Preparing;
        rx
    }

    /// Registers where the current attempt can be withdrawn from.
    ///
    /// If the invocation was canceled already, the handler is told right
    /// away.
    pub fn set_cancellation_handler(&self, handler: Arc<dyn CancellationHandler>) {
        let canceled = {
            let mut state = self.state.lock();
            match state.canceled.clone() {
                Some(err) => Some(err),
                None => {
                    state.handler = Some(handler.clone());
                    None
                }
            }
        };
        if let (Some(err), Some(me)) = (canceled, self.me.upgrade()) {
            handler.async_request_canceled(&me, err);
        }
    }

    /// Records that the request waits for a connection.
    pub fn queued(&self) {
        let mut state = self.state.lock();
        if state.phase != Phase::Completed {
            state.phase = Phase::Queued;
        }
    }

    /// Records that the request was written. Completes oneway invocations.
    pub fn sent(&self) {
        let done = {
            let mut state = self.state.lock();
            if state.phase == Phase::Completed {
                return;
            }
            state.sent = true;
            state.phase = Phase::Sent;
            !self.is_twoway()
        };
        if done {
            self.complete(Ok(Reply::empty(self.proxy.reference().encoding())));
        }
    }

    /// Completes the current attempt with a reply read from `is`, positioned
    /// after the request id. Returns false if the attempt had completed
    /// already.
    pub fn completed_reply(&self, is: &mut InputStream) -> bool {
        let result = self.read_reply(is);
        self.complete(result)
    }

    /// Completes the current attempt with an error. Returns false if the
    /// attempt had completed already.
    pub fn completed_error(&self, error: IceError) -> bool {
        self.complete(Err(error))
    }

    fn complete(&self, result: Result<Reply>) -> bool {
        let sender = {
            let mut state = self.state.lock();
            state.handler = None;
            state.attempt.take()
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Cancels the invocation with `error`. The invocation is not retried.
    pub fn cancel(&self, error: IceError) {
        let handler = {
            let mut state = self.state.lock();
            if state.phase == Phase::Completed {
                return;
            }
            if state.canceled.is_none() {
                state.canceled = Some(error.clone());
            }
            state.handler.clone()
        };
        self.interrupt.cancel();
        match (handler, self.me.upgrade()) {
            (Some(handler), Some(me)) => handler.async_request_canceled(&me, error),
            _ => {
                self.completed_error(error);
            }
        }
    }

    fn read_reply(&self, is: &mut InputStream) -> Result<Reply> {
        let status = ReplyStatus::try_from(is.read_u8()?)?;
        match status {
            ReplyStatus::Ok => {
                let (encoding, payload) = is.read_encapsulation()?;
                Ok(Reply { encoding, payload })
            }
            ReplyStatus::UserException => {
                let (encoding, payload) = is.read_encapsulation()?;
                let mut ex = InputStream::with_encoding(payload.clone(), encoding);
                let type_id = ex.read_string()?;
                if self.user_exceptions.iter().any(|t| *t == type_id) {
                    Err(IceError::UserException {
                        type_id,
                        data: payload.slice(ex.pos()..),
                    })
                } else {
                    Err(IceError::UnknownUserException(type_id))
                }
            }
            ReplyStatus::ObjectNotExist
            | ReplyStatus::FacetNotExist
            | ReplyStatus::OperationNotExist => {
                let mut id: Identity = is.read()?;
                if id.is_null() {
                    id = self.proxy.reference().identity().clone();
                }
                let facet = match is.read_string_seq()?.as_slice() {
                    [] => String::new(),
                    [facet] => facet.clone(),
                    _ => return Err(IceError::marshal("facet sequence with more than one element")),
                };
                let operation = is.read_string()?;
                Err(match status {
                    ReplyStatus::ObjectNotExist => IceError::ObjectNotExist { id, facet, operation },
                    ReplyStatus::FacetNotExist => IceError::FacetNotExist { id, facet, operation },
                    _ => IceError::OperationNotExist { id, facet, operation },
                })
            }
            ReplyStatus::UnknownLocalException => {
                Err(IceError::UnknownLocalException(is.read_string()?))
            }
            ReplyStatus::UnknownUserException => {
                Err(IceError::UnknownUserException(is.read_string()?))
            }
            ReplyStatus::UnknownException => Err(IceError::UnknownException(is.read_string()?)),
        }
    }

    /// Runs the invocation to completion, retrying per the retry policy.
    pub async fn invoke(self: &Arc<Self>) -> Result<Reply> {
        let reference = self.proxy.reference().clone();
        let instance = reference.instance().clone();
        let observer = instance.observer();
        observer.invocation_attached(&self.operation, &reference.to_string());

        let timeout_task = reference.invocation_timeout().and_then(|timeout| {
            let me = self.me.clone();
            instance
                .timer()
                .schedule(timeout, move || {
                    if let Some(out) = me.upgrade() {
                        out.cancel(IceError::InvocationTimeout);
                    }
                })
                .ok()
        });

        let result = self.invoke_with_retry(&reference).await;

        if let Some(task) = timeout_task {
            task.cancel();
        }
        {
            let mut state = self.state.lock();
            state.phase = Phase::Completed;
            state.attempt = None;
            state.handler = None;
        }
        if let Err(err) = &result {
            observer.invocation_failed(&self.operation, err);
        }
        observer.invocation_detached(&self.operation);
        result
    }

    async fn invoke_with_retry(self: &Arc<Self>, reference: &Reference) -> Result<Reply> {
        let instance = reference.instance();
        let mut cnt = 0usize;
        loop {
            if let Some(err) = self.state.lock().canceled.clone() {
                return Err(err);
            }

            let handler = tokio::select! {
                handler = self.proxy.request_handler() => handler,
                _ = self.interrupt.cancelled() => continue,
            };
            let (handler, outcome) = match handler {
                Ok(handler) => {
                    let outcome = self.attempt(&handler).await;
                    (Some(handler), outcome)
                }
                Err(err) => (None, Err(err)),
            };
            let err = match outcome {
                Ok(reply) => return Ok(reply),
                Err(err) => err,
            };
            if err.is_remote() && !err.is_request_failed() {
                return Err(err);
            }
            if let Some(canceled) = self.state.lock().canceled.clone() {
                return Err(canceled);
            }
            if let Some(handler) = &handler {
                self.proxy.update_request_handler(handler, None);
            }

            let sent = self.is_sent();
            let delay = retry::handle_exception(err, reference, self.mode, sent, &mut cnt)?;
            instance.observer().invocation_retried(&self.operation, cnt);
            if !delay.is_zero() {
                // Cancellation ends the wait; the loop then reports it.
                tokio::select! {
                    _ = instance.runtime().sleep(delay) => {}
                    _ = self.interrupt.cancelled() => {}
                }
            }
        }
    }

    async fn attempt(self: &Arc<Self>, handler: &Arc<dyn RequestHandler>) -> Result<Reply> {
        let rx = self.begin_attempt();
        match handler.send_async_request(self).await {
            Ok(status) => {
                if status.contains(InvokeStatus::INVOKE_SENT_CALLBACK) {
                    self.sent();
                }
                rx.await.unwrap_or(Err(IceError::OperationInterrupted))
            }
            Err(err) => {
                self.state.lock().attempt = None;
                Err(err)
            }
        }
    }
}
