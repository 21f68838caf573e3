//! Retry policy for failed invocations.
//!
//! [`handle_exception`] applies at-most-once semantics first and then
//! [`check_retry_after_exception`], which decides from the error and the
//! reference whether to retry and after which delay.

use std::time::Duration;

use ice_core::protocol::OperationMode;
use ice_core::{IceError, Result};

use crate::reference::Reference;

/// Returns the delay before the next attempt, or the error if the
/// invocation must fail.
///
/// A request that was already sent is only resent if its operation is not
/// `Normal`, or if the error guarantees the server did not run it.
pub fn handle_exception(
    err: IceError,
    reference: &Reference,
    mode: OperationMode,
    sent: bool,
    cnt: &mut usize,
) -> Result<Duration> {
    let resendable = !sent
        || mode != OperationMode::Normal
        || matches!(err, IceError::CloseConnection | IceError::ObjectNotExist { .. });
    if !resendable {
        return Err(err);
    }
    check_retry_after_exception(err, reference, cnt)
}

/// Decides whether an invocation failing with `err` is retried.
///
/// `cnt` counts the retries so far and is incremented for each retry that
/// consumes an interval of `Ice.RetryIntervals`.
pub fn check_retry_after_exception(
    err: IceError,
    reference: &Reference,
    cnt: &mut usize,
) -> Result<Duration> {
    let instance = reference.instance();
    let trace = instance.config().trace().retry;

    if reference.mode().is_batch() {
        return Err(err);
    }

    match &err {
        IceError::ObjectNotExist { operation, .. } => {
            if let Some(router) = reference.router_info() {
                if operation == "ice_add_proxy" {
                    router.clear_cache(reference);
                    if trace >= 1 {
                        tracing::debug!(
                            target: "ice::retry",
                            proxy = %reference,
                            "retrying operation call to add proxy to router"
                        );
                    }
                    return Ok(Duration::ZERO);
                }
            }
            if !reference.is_indirect() {
                return Err(err);
            }
            if reference.is_well_known() {
                if let Some(locator) = reference.locator_info() {
                    locator.clear_cache(reference);
                }
            }
        }
        e if e.is_remote() => return Err(err),
        e if e.is_marshal_error() => return Err(err),
        IceError::CommunicatorDestroyed
        | IceError::ObjectAdapterDeactivated(_)
        | IceError::ConnectionManuallyClosed { .. }
        | IceError::InvocationTimeout
        | IceError::InvocationCanceled
        | IceError::OperationInterrupted
        | IceError::TwowayOnly(_)
        | IceError::FixedProxy
        | IceError::Configuration(_) => return Err(err),
        _ => {}
    }

    *cnt += 1;
    let intervals = instance.config().retry_intervals();
    let delay = if *cnt == intervals.len() + 1 && matches!(err, IceError::CloseConnection) {
        // The peer closed the connection before reading the request.
        Duration::ZERO
    } else if *cnt > intervals.len() {
        if trace >= 1 {
            tracing::debug!(
                target: "ice::retry",
                error = %err,
                "cannot retry operation call because retry limit has been exceeded"
            );
        }
        return Err(err);
    } else {
        intervals[*cnt - 1]
    };

    if trace >= 1 {
        tracing::debug!(
            target: "ice::retry",
            error = %err,
            attempt = *cnt,
            delay_ms = delay.as_millis() as u64,
            "retrying operation call because of exception"
        );
    }
    Ok(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ice_core::Identity;

    use crate::communicator::Communicator;
    use crate::config::RuntimeConfig;

    fn communicator(intervals: &[u64]) -> Communicator {
        let config = RuntimeConfig::builder()
            .retry_intervals(intervals.iter().map(|ms| Duration::from_millis(*ms)))
            .build()
            .unwrap();
        Communicator::new(config).unwrap()
    }

    fn reference(communicator: &Communicator, s: &str) -> Reference {
        communicator.string_to_proxy(s).unwrap().unwrap().reference().clone()
    }

    fn object_not_exist() -> IceError {
        IceError::ObjectNotExist {
            id: Identity::new("obj", ""),
            facet: String::new(),
            operation: "op".to_string(),
        }
    }

    #[test]
    fn test_marshal_error_is_fatal() {
        let c = communicator(&[0, 0]);
        let r = reference(&c, "obj:tcp -h 127.0.0.1 -p 10000");
        let mut cnt = 0;
        assert!(check_retry_after_exception(IceError::marshal("bad"), &r, &mut cnt).is_err());
        assert_eq!(cnt, 0);
    }

    #[test]
    fn test_object_not_exist_on_indirect_counts_intervals() {
        let c = communicator(&[0, 10, 20]);
        let r = reference(&c, "obj @ adapter");
        let mut cnt = 0;
        let mut delays = Vec::new();
        loop {
            match check_retry_after_exception(object_not_exist(), &r, &mut cnt) {
                Ok(delay) => delays.push(delay),
                Err(err) => {
                    assert!(matches!(err, IceError::ObjectNotExist { .. }));
                    break;
                }
            }
        }
        assert_eq!(
            delays,
            vec![Duration::ZERO, Duration::from_millis(10), Duration::from_millis(20)]
        );
        assert_eq!(cnt, 4);
    }

    #[test]
    fn test_object_not_exist_on_direct_is_fatal() {
        let c = communicator(&[0]);
        let r = reference(&c, "obj:tcp -h 127.0.0.1 -p 10000");
        let mut cnt = 0;
        assert!(check_retry_after_exception(object_not_exist(), &r, &mut cnt).is_err());
        assert_eq!(cnt, 0);
    }

    #[test]
    fn test_close_connection_retried_once_past_limit() {
        let c = communicator(&[]);
        let r = reference(&c, "obj:tcp -h 127.0.0.1 -p 10000");
        let mut cnt = 0;
        assert_eq!(
            check_retry_after_exception(IceError::CloseConnection, &r, &mut cnt).unwrap(),
            Duration::ZERO
        );
        assert!(check_retry_after_exception(IceError::CloseConnection, &r, &mut cnt).is_err());
        assert_eq!(cnt, 2);
    }

    #[test]
    fn test_batch_never_retries() {
        let c = communicator(&[0, 0]);
        let r = reference(&c, "obj -O:tcp -h 127.0.0.1 -p 10000");
        let mut cnt = 0;
        assert!(
            check_retry_after_exception(IceError::ConnectionLost("x".into()), &r, &mut cnt).is_err()
        );
    }

    #[test]
    fn test_terminal_errors() {
        let c = communicator(&[0, 0]);
        let r = reference(&c, "obj:tcp -h 127.0.0.1 -p 10000");
        for err in [
            IceError::CommunicatorDestroyed,
            IceError::InvocationTimeout,
            IceError::InvocationCanceled,
            IceError::ConnectionManuallyClosed { graceful: true },
            IceError::UnknownLocalException("boom".into()),
        ] {
            let mut cnt = 0;
            assert!(check_retry_after_exception(err, &r, &mut cnt).is_err());
            assert_eq!(cnt, 0);
        }
    }

    #[test]
    fn test_at_most_once() {
        let c = communicator(&[0, 0]);
        let r = reference(&c, "obj:tcp -h 127.0.0.1 -p 10000");
        let lost = || IceError::ConnectionLost("reset".into());

        let mut cnt = 0;
        assert!(handle_exception(lost(), &r, OperationMode::Normal, true, &mut cnt).is_err());
        assert!(handle_exception(lost(), &r, OperationMode::Normal, false, &mut cnt).is_ok());
        assert!(handle_exception(lost(), &r, OperationMode::Idempotent, true, &mut cnt).is_ok());
        assert_eq!(cnt, 2);

        // A graceful close gets one extra immediate retry past the intervals,
        // even for a request that was already sent.
        let close = || IceError::CloseConnection;
        assert_eq!(
            handle_exception(close(), &r, OperationMode::Normal, true, &mut cnt).unwrap(),
            Duration::ZERO
        );
        assert_eq!(cnt, 3);
        assert!(matches!(
            handle_exception(close(), &r, OperationMode::Normal, true, &mut cnt),
            Err(IceError::CloseConnection)
        ));
        assert_eq!(cnt, 4);
    }
}
