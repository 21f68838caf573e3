use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use ice_core::{IceError, Result};
use tokio::sync::oneshot;

use super::{OutgoingAsync, Reply};
use crate::runtime::RuntimeExt;

/// The outcome of an invocation running in the background.
///
/// If the invocation task goes away without reporting a result, the future
/// resolves to `OperationInterrupted`.
#[derive(Debug)]
pub struct InvocationFuture {
    out: Arc<OutgoingAsync>,
    rx: oneshot::Receiver<Result<Reply>>,
}

impl InvocationFuture {
    pub(crate) fn new(out: Arc<OutgoingAsync>, rx: oneshot::Receiver<Result<Reply>>) -> Self {
        Self { out, rx }
    }

    /// Starts `out` on the communicator's runtime.
    pub(crate) fn spawn(out: Arc<OutgoingAsync>) -> Self {
        let (tx, rx) = oneshot::channel();
        let runtime = out.proxy().reference().instance().runtime().clone();
        let task = out.clone();
        runtime.spawn(async move {
            let _ = tx.send(task.invoke().await);
        });
        Self::new(out, rx)
    }

    /// Cancels the invocation. The future resolves to `InvocationCanceled`
    /// unless the invocation completed first.
    pub fn cancel(&self) {
        self.out.cancel(IceError::InvocationCanceled);
    }

    /// Returns the operation name.
    pub fn operation(&self) -> &str {
        self.out.operation()
    }
}

impl Future for InvocationFuture {
    type Output = Result<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(IceError::OperationInterrupted)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ice_core::protocol::OperationMode;

    use crate::communicator::Communicator;

    #[tokio::test]
    async fn test_dropped_sender_interrupts() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let prx = communicator
            .string_to_proxy("hello:tcp -h 127.0.0.1 -p 10000")
            .unwrap()
            .unwrap();
        let out = OutgoingAsync::new(prx, "op", OperationMode::Normal, false, &[]);
        let (tx, rx) = oneshot::channel();
        let future = InvocationFuture::new(out, rx);
        drop(tx);
        assert!(matches!(future.await, Err(IceError::OperationInterrupted)));
    }
}
