//! Instrumentation hooks.
//!
//! A [`CommunicatorObserver`] receives lifecycle events for connections,
//! invocations and dispatches. Every method has an empty default body, so an
//! absent observer and [`NoopObserver`] behave the same.

use std::fmt::Debug;

use ice_core::IceError;

/// Lifecycle state of a connection as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionObserverState {
    /// Validation is in progress.
    Validating,
    /// The connection carries requests.
    Active,
    /// A graceful close is in progress.
    Closing,
    /// The connection is closed.
    Closed,
}

/// Receives instrumentation events.
pub trait CommunicatorObserver: Send + Sync + Debug {
    /// A connection changed state.
    fn connection_state_changed(
        &self,
        _description: &str,
        _old: Option<ConnectionObserverState>,
        _new: ConnectionObserverState,
    ) {
    }

    /// Bytes were sent on a connection.
    fn connection_sent_bytes(&self, _description: &str, _bytes: usize) {}

    /// Bytes were received on a connection.
    fn connection_received_bytes(&self, _description: &str, _bytes: usize) {}

    /// An invocation started.
    fn invocation_attached(&self, _operation: &str, _target: &str) {}

    /// An invocation is being retried.
    fn invocation_retried(&self, _operation: &str, _attempt: usize) {}

    /// An invocation attempt failed.
    fn invocation_failed(&self, _operation: &str, _error: &IceError) {}

    /// An invocation completed, successfully or not.
    fn invocation_detached(&self, _operation: &str) {}

    /// A dispatch started.
    fn dispatch_attached(&self, _operation: &str, _size: usize) {}

    /// A dispatch produced a reply of the given size.
    fn dispatch_reply(&self, _operation: &str, _size: usize) {}

    /// A dispatch raised an error that was converted to a reply status.
    fn dispatch_failed(&self, _operation: &str, _error: &IceError) {}

    /// A dispatch completed.
    fn dispatch_detached(&self, _operation: &str) {}
}

/// An observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CommunicatorObserver for NoopObserver {}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl CommunicatorObserver for Recording {
        fn invocation_retried(&self, operation: &str, attempt: usize) {
            self.events.lock().push(format!("{operation}#{attempt}"));
        }
    }

    #[test]
    fn test_default_methods_are_noops() {
        let observer = NoopObserver;
        observer.invocation_attached("op", "target");
        observer.invocation_failed("op", &IceError::InvocationTimeout);
        observer.connection_state_changed("tcp", None, ConnectionObserverState::Active);
    }

    #[test]
    fn test_override_single_hook() {
        let observer = Recording::default();
        observer.invocation_retried("ping", 2);
        observer.invocation_detached("ping");
        assert_eq!(*observer.events.lock(), vec!["ping#2".to_string()]);
    }
}
