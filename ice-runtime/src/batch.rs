//! Batch request queue.
//!
//! Batch-oneway and batch-datagram invocations are appended to a queue
//! instead of being sent. The queue is flushed explicitly or once it grows
//! past `Ice.BatchAutoFlushSize`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use ice_core::protocol::{MessageType, HEADER_SIZE};
use ice_core::{IceError, OutputStream, Result};
use parking_lot::{Condvar, Mutex};

use crate::proxy::ObjectPrx;
use crate::transport::MAX_DATAGRAM_SIZE;

/// Decides whether a batch request is added to its queue.
///
/// The interceptor must call [`BatchRequest::enqueue`] to keep the request;
/// otherwise it is discarded. It may flush the queue from within `enqueue`.
pub trait BatchRequestInterceptor: Send + Sync + fmt::Debug {
    /// Called for each finished batch request. `count` and `size` describe
    /// the requests already queued.
    fn enqueue(&self, request: &BatchRequest<'_>, count: usize, size: usize);
}

/// A batch request handed to a [`BatchRequestInterceptor`].
pub struct BatchRequest<'a> {
    queue: &'a BatchRequestQueue,
    proxy: &'a ObjectPrx,
    operation: &'a str,
    size: usize,
}

impl BatchRequest<'_> {
    /// Keeps the request in the queue.
    pub fn enqueue(&self) {
        self.queue.enqueue_batch_request(self.proxy);
    }

    /// Returns the marshaled size of the request.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the operation name.
    pub fn operation(&self) -> &str {
        self.operation
    }

    /// Returns the proxy the request was made on.
    pub fn proxy(&self) -> &ObjectPrx {
        self.proxy
    }
}

/// A batch message taken out of the queue.
#[derive(Debug, Clone)]
pub struct SwappedBatch {
    /// The complete batch message, header included.
    pub message: Bytes,
    /// The number of requests in the message.
    pub count: usize,
    /// Set if any request in the message was made on a proxy with a
    /// compression override.
    pub compress: bool,
}

#[derive(Debug)]
struct QueueState {
    stream: OutputStream,
    in_use: bool,
    can_flush: bool,
    count: usize,
    marker: usize,
    compress: bool,
    error: Option<IceError>,
}

fn new_batch_stream() -> OutputStream {
    let mut os = OutputStream::new_message(MessageType::BatchRequest);
    os.write_i32(0);
    os
}

/// Queue of marshaled batch requests for one proxy or connection.
///
/// A request is marshaled directly into the queue's stream: the stream is
/// lent out by [`prepare_batch_request`](Self::prepare_batch_request) and
/// returned by [`finish_batch_request`](Self::finish_batch_request) or
/// [`abort_batch_request`](Self::abort_batch_request). Only one request can
/// be in preparation at a time.
pub struct BatchRequestQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
    max_size: usize,
}

impl fmt::Debug for BatchRequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BatchRequestQueue")
            .field("count", &state.count)
            .field("size", &state.marker)
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl BatchRequestQueue {
    /// Creates an empty queue.
    ///
    /// `auto_flush_size` of zero disables auto-flush. Datagram queues never
    /// grow beyond the largest datagram.
    pub fn new(
        auto_flush_size: usize,
        datagram: bool,
        interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
    ) -> Self {
        let max_size = if datagram && (auto_flush_size == 0 || auto_flush_size > MAX_DATAGRAM_SIZE) {
            MAX_DATAGRAM_SIZE
        } else {
            auto_flush_size
        };
        let stream = new_batch_stream();
        let marker = stream.len();
        Self {
            state: Mutex::new(QueueState {
                stream,
                in_use: false,
                can_flush: false,
                count: 0,
                marker,
                compress: false,
                error: None,
            }),
            cond: Condvar::new(),
            interceptor,
            max_size,
        }
    }

    /// Lends out the queue's stream so a request can be appended to it.
    pub fn prepare_batch_request(&self) -> Result<OutputStream> {
        let mut state = self.state.lock();
        if let Some(err) = &state.error {
            return Err(err.clone());
        }
        while state.in_use {
            self.cond.wait(&mut state);
        }
        state.in_use = true;
        Ok(std::mem::take(&mut state.stream))
    }

    /// Returns the stream with one more request appended.
    ///
    /// If the queue had grown past the auto-flush size, the requests queued
    /// before this one are swapped out and returned for sending.
    pub fn finish_batch_request(
        &self,
        os: OutputStream,
        proxy: &ObjectPrx,
        operation: &str,
    ) -> Option<SwappedBatch> {
        let (flushed, count, marker, size) = {
            let mut state = self.state.lock();
            debug_assert!(state.in_use);
            state.stream = os;
            state.can_flush = true;
            let flushed = if self.max_size > 0 && state.stream.len() >= self.max_size {
                Self::swap_locked(&mut state)
            } else {
                None
            };
            let size = state.stream.len() - state.marker;
            (flushed, state.count, state.marker, size)
        };

        match &self.interceptor {
            Some(interceptor) => {
                let request = BatchRequest {
                    queue: self,
                    proxy,
                    operation,
                    size,
                };
                interceptor.enqueue(&request, count, marker);
            }
            None => self.enqueue_batch_request(proxy),
        }

        let mut state = self.state.lock();
        let marker = state.marker;
        state.stream.truncate(marker);
        state.in_use = false;
        state.can_flush = false;
        self.cond.notify_all();
        flushed
    }

    /// Returns the stream, discarding the request being prepared.
    pub fn abort_batch_request(&self, os: OutputStream) {
        let mut state = self.state.lock();
        state.stream = os;
        let marker = state.marker;
        state.stream.truncate(marker);
        state.in_use = false;
        self.cond.notify_all();
    }

    fn enqueue_batch_request(&self, proxy: &ObjectPrx) {
        let mut state = self.state.lock();
        state.marker = state.stream.len();
        state.count += 1;
        if proxy.reference().compress() == Some(true) {
            state.compress = true;
        }
    }

    /// Takes every queued request out of the queue.
    ///
    /// Returns `None` if nothing is queued. A request still in preparation
    /// stays in the queue.
    pub fn swap(&self) -> Option<SwappedBatch> {
        let mut state = self.state.lock();
        if state.count == 0 {
            return None;
        }
        while state.in_use && !state.can_flush {
            self.cond.wait(&mut state);
        }
        Self::swap_locked(&mut state)
    }

    fn swap_locked(state: &mut QueueState) -> Option<SwappedBatch> {
        if state.count == 0 {
            return None;
        }
        let last_request = if state.marker < state.stream.len() {
            Some(Bytes::copy_from_slice(&state.stream.as_bytes()[state.marker..]))
        } else {
            None
        };
        let mut stream = new_batch_stream();
        state.stream.truncate(state.marker);
        state.stream.swap(&mut stream);
        stream.rewrite_i32(HEADER_SIZE, state.count as i32);

        let count = std::mem::take(&mut state.count);
        let compress = std::mem::take(&mut state.compress);
        state.marker = state.stream.len();
        if let Some(last) = last_request {
            state.stream.write_blob(&last);
        }
        Some(SwappedBatch {
            message: stream.finish_message(),
            count,
            compress,
        })
    }

    /// Returns true if no request is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().count == 0
    }

    /// Returns the number of queued requests.
    pub fn len(&self) -> usize {
        self.state.lock().count
    }

    /// Rejects further requests with `error`.
    pub fn destroy(&self, error: IceError) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
    }
}
