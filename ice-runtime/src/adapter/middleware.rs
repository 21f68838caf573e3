//! The dispatch pipeline.
//!
//! An adapter dispatches through a chain of [`Dispatcher`]s. The innermost
//! one, [`ServantDispatcher`], finds the servant and turns its result into an
//! [`OutgoingResponse`]. [`ObserverMiddleware`] and [`LoggerMiddleware`] wrap
//! it and act on the reply status afterwards.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use ice_core::protocol::ReplyStatus;
use ice_core::IceError;

use super::servant::{dispatch_builtin, ServantManager};
use super::{Current, OutgoingResponse};
use crate::observer::CommunicatorObserver;

/// One stage of the dispatch pipeline.
#[async_trait]
pub trait Dispatcher: Send + Sync + Debug {
    async fn dispatch(&self, current: &Current) -> OutgoingResponse;
}

/// Dispatches to the servant registered for the request's target.
#[derive(Debug)]
pub struct ServantDispatcher {
    servants: Arc<ServantManager>,
}

impl ServantDispatcher {
    pub fn new(servants: Arc<ServantManager>) -> Self {
        Self { servants }
    }
}

#[async_trait]
impl Dispatcher for ServantDispatcher {
    async fn dispatch(&self, current: &Current) -> OutgoingResponse {
        let request = &current.request;
        let Some(servant) = self.servants.find(&request.identity, &request.facet) else {
            let error = if self.servants.has_identity(&request.identity) {
                IceError::FacetNotExist {
                    id: request.identity.clone(),
                    facet: request.facet.clone(),
                    operation: request.operation.clone(),
                }
            } else {
                IceError::ObjectNotExist {
                    id: request.identity.clone(),
                    facet: request.facet.clone(),
                    operation: request.operation.clone(),
                }
            };
            return OutgoingResponse::from_error(request, error);
        };

        let result = match dispatch_builtin(servant.as_ref(), current) {
            Some(result) => result,
            None => servant.dispatch(current).await,
        };
        match result {
            Ok(results) => OutgoingResponse::ok(request.encoding, &results),
            Err(err) => OutgoingResponse::from_error(request, err),
        }
    }
}

/// Reports every dispatch to the communicator observer.
#[derive(Debug)]
pub struct ObserverMiddleware {
    next: Arc<dyn Dispatcher>,
    observer: Arc<dyn CommunicatorObserver>,
}

impl ObserverMiddleware {
    pub fn new(next: Arc<dyn Dispatcher>, observer: Arc<dyn CommunicatorObserver>) -> Self {
        Self { next, observer }
    }
}

#[async_trait]
impl Dispatcher for ObserverMiddleware {
    async fn dispatch(&self, current: &Current) -> OutgoingResponse {
        let operation = &current.request.operation;
        self.observer.dispatch_attached(operation, current.request.size);
        let response = self.next.dispatch(current).await;
        match response.error() {
            Some(error) if response.status() != ReplyStatus::UserException => {
                self.observer.dispatch_failed(operation, error)
            }
            _ => {
                if !current.request.is_oneway() {
                    self.observer.dispatch_reply(operation, response.size());
                }
            }
        }
        self.observer.dispatch_detached(operation);
        response
    }
}

/// Logs failed dispatches according to the `Ice.Warn.Dispatch` level.
///
/// Level 1 logs dispatches that ended in an unknown exception; level 2 also
/// logs object, facet and operation lookup failures. User exceptions are
/// never logged.
#[derive(Debug)]
pub struct LoggerMiddleware {
    next: Arc<dyn Dispatcher>,
    warning_level: i32,
    trace_protocol: i32,
}

impl LoggerMiddleware {
    pub fn new(next: Arc<dyn Dispatcher>, warning_level: i32, trace_protocol: i32) -> Self {
        Self {
            next,
            warning_level,
            trace_protocol,
        }
    }

    fn should_warn(&self, status: ReplyStatus) -> bool {
        match status {
            ReplyStatus::Ok | ReplyStatus::UserException => false,
            ReplyStatus::ObjectNotExist | ReplyStatus::FacetNotExist | ReplyStatus::OperationNotExist => {
                self.warning_level > 1
            }
            ReplyStatus::UnknownLocalException
            | ReplyStatus::UnknownUserException
            | ReplyStatus::UnknownException => self.warning_level > 0,
        }
    }
}

#[async_trait]
impl Dispatcher for LoggerMiddleware {
    async fn dispatch(&self, current: &Current) -> OutgoingResponse {
        let response = self.next.dispatch(current).await;
        let request = &current.request;

        if self.trace_protocol >= 1 {
            tracing::debug!(
                target: "ice::protocol",
                identity = %request.identity,
                facet = %request.facet,
                operation = %request.operation,
                request_id = request.request_id,
                status = ?response.status(),
                "dispatched request"
            );
        }

        if self.should_warn(response.status()) {
            if let Some(error) = response.error() {
                tracing::warn!(
                    adapter = %current.adapter,
                    identity = %request.identity,
                    facet = %request.facet,
                    operation = %request.operation,
                    connection = %current.connection_description(),
                    error = %error,
                    "dispatch failed"
                );
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{IncomingRequest, Servant};
    use bytes::Bytes;
    use ice_core::protocol::{OperationMode, ENCODING_1_1};
    use ice_core::{Context, Identity, OutputStream, Result};
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Failing;

    #[async_trait]
    impl Servant for Failing {
        async fn dispatch(&self, current: &Current) -> Result<Bytes> {
            match current.request.operation.as_str() {
                "user" => Err(IceError::UserException {
                    type_id: "::Demo::Oops".to_string(),
                    data: Bytes::new(),
                }),
                "local" => Err(IceError::Marshal("broken".to_string())),
                _ => Err(current.operation_not_exist()),
            }
        }
    }

    #[derive(Debug, Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl CommunicatorObserver for Recording {
        fn dispatch_attached(&self, operation: &str, _size: usize) {
            self.events.lock().push(format!("attached {operation}"));
        }

        fn dispatch_reply(&self, operation: &str, _size: usize) {
            self.events.lock().push(format!("reply {operation}"));
        }

        fn dispatch_failed(&self, operation: &str, _error: &IceError) {
            self.events.lock().push(format!("failed {operation}"));
        }

        fn dispatch_detached(&self, operation: &str) {
            self.events.lock().push(format!("detached {operation}"));
        }
    }

    fn current(name: &str, operation: &str, params: &[u8]) -> Current {
        Current {
            adapter: "test".to_string(),
            connection: None,
            request: IncomingRequest {
                request_id: 1,
                identity: Identity::new(name, ""),
                facet: String::new(),
                operation: operation.to_string(),
                mode: OperationMode::Normal,
                context: Context::new(),
                encoding: ENCODING_1_1,
                params: Bytes::copy_from_slice(params),
                size: 0,
            },
        }
    }

    fn pipeline(observer: Arc<Recording>) -> LoggerMiddleware {
        let servants = Arc::new(ServantManager::new());
        servants
            .add(Arc::new(Failing), &Identity::new("obj", ""), "")
            .unwrap();
        let inner: Arc<dyn Dispatcher> = Arc::new(ServantDispatcher::new(servants));
        let observed: Arc<dyn Dispatcher> = Arc::new(ObserverMiddleware::new(inner, observer));
        LoggerMiddleware::new(observed, 2, 0)
    }

    #[tokio::test]
    async fn test_status_per_outcome() {
        let pipeline = pipeline(Arc::new(Recording::default()));

        let r = pipeline.dispatch(&current("missing", "op", &[])).await;
        assert_eq!(r.status(), ReplyStatus::ObjectNotExist);
        let r = pipeline.dispatch(&current("obj", "nope", &[])).await;
        assert_eq!(r.status(), ReplyStatus::OperationNotExist);
        let r = pipeline.dispatch(&current("obj", "user", &[])).await;
        assert_eq!(r.status(), ReplyStatus::UserException);
        let r = pipeline.dispatch(&current("obj", "local", &[])).await;
        assert_eq!(r.status(), ReplyStatus::UnknownLocalException);
        let r = pipeline.dispatch(&current("obj", "ice_ping", &[])).await;
        assert_eq!(r.status(), ReplyStatus::Ok);
    }

    #[tokio::test]
    async fn test_builtin_is_a() {
        let pipeline = pipeline(Arc::new(Recording::default()));
        let mut os = OutputStream::with_encoding(ENCODING_1_1);
        os.write_string(crate::proxy::OBJECT_TYPE_ID);
        let r = pipeline
            .dispatch(&current("obj", "ice_isA", os.as_bytes()))
            .await;
        assert_eq!(r.status(), ReplyStatus::Ok);
        let mut out = OutputStream::new();
        r.write_to(&mut out);
        // status, encapsulation header, then `true`
        assert_eq!(out.as_bytes(), &[0, 7, 0, 0, 0, 1, 1, 1]);
    }

    #[tokio::test]
    async fn test_observer_sees_reply_or_failure() {
        let observer = Arc::new(Recording::default());
        let pipeline = pipeline(observer.clone());
        pipeline.dispatch(&current("obj", "ice_ping", &[])).await;
        pipeline.dispatch(&current("obj", "local", &[])).await;
        pipeline.dispatch(&current("obj", "user", &[])).await;
        assert_eq!(
            *observer.events.lock(),
            vec![
                "attached ice_ping",
                "reply ice_ping",
                "detached ice_ping",
                "attached local",
                "failed local",
                "detached local",
                "attached user",
                "reply user",
                "detached user",
            ]
        );
    }

    #[test]
    fn test_warning_levels() {
        let inner: Arc<dyn Dispatcher> = Arc::new(ServantDispatcher::new(Arc::new(ServantManager::new())));
        let quiet = LoggerMiddleware::new(inner.clone(), 0, 0);
        let normal = LoggerMiddleware::new(inner.clone(), 1, 0);
        let verbose = LoggerMiddleware::new(inner, 2, 0);
        assert!(!quiet.should_warn(ReplyStatus::UnknownLocalException));
        assert!(normal.should_warn(ReplyStatus::UnknownException));
        assert!(!normal.should_warn(ReplyStatus::ObjectNotExist));
        assert!(verbose.should_warn(ReplyStatus::FacetNotExist));
        assert!(!verbose.should_warn(ReplyStatus::UserException));
    }
}
