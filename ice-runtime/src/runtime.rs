//! Runtime abstraction for async executors.
//!
//! Connections, timers and the invocation engine submit background work
//! through the [`Runtime`] trait instead of calling `tokio::spawn` directly.
//! The default implementation, [`TokioRuntime`], delegates to Tokio.
//!
//! # Example
//!
//! ```rust
//! use ice_runtime::runtime::{Runtime, TokioRuntime};
//! use std::time::Duration;
//!
//! let rt = TokioRuntime;
//! // rt.execute(Box::pin(async { /* background work */ }));
//! // rt.sleep(Duration::from_secs(1)).await;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// A boxed unit future submitted to a [`Runtime`].
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Abstraction over an async runtime.
///
/// The trait is object safe so that a single `Arc<dyn Runtime>` can be shared
/// by every component of a communicator.
pub trait Runtime: Send + Sync + std::fmt::Debug + 'static {
    /// Runs a future as a background task.
    ///
    /// The future runs to completion even though no handle is returned.
    fn execute(&self, future: BoxFuture);

    /// Returns a future that completes after the given duration.
    fn sleep(&self, duration: Duration) -> BoxFuture;
}

/// Extension methods for [`Runtime`] trait objects.
pub trait RuntimeExt {
    /// Boxes and submits a future.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

impl<R: Runtime + ?Sized> RuntimeExt for R {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.execute(Box::pin(future));
    }
}

/// The default [`Runtime`] implementation backed by Tokio.
///
/// This delegates `execute` to [`tokio::spawn`] and `sleep` to
/// [`tokio::time::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioRuntime;

impl TokioRuntime {
    /// Returns the runtime as a shareable trait object.
    pub fn shared() -> Arc<dyn Runtime> {
        Arc::new(TokioRuntime)
    }
}

impl Runtime for TokioRuntime {
    fn execute(&self, future: BoxFuture) {
        tokio::spawn(future);
    }

    fn sleep(&self, duration: Duration) -> BoxFuture {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokio_runtime_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TokioRuntime>();
        assert_send_sync::<Arc<dyn Runtime>>();
    }

    #[tokio::test]
    async fn test_tokio_runtime_sleep() {
        let rt = TokioRuntime::shared();
        rt.sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn test_tokio_runtime_spawn() {
        let rt = TokioRuntime::shared();
        let (tx, rx) = tokio::sync::oneshot::channel();
        rt.spawn(async move {
            let _ = tx.send(42);
        });
        assert_eq!(rx.await.unwrap(), 42);
    }
}
