//! Outgoing invocations: request marshaling, completion, cancellation and
//! retry.

mod future;
mod outgoing;
pub mod retry;

use std::fmt::Debug;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use ice_core::protocol::EncodingVersion;
use ice_core::{IceError, InputStream};

pub use future::InvocationFuture;
pub use outgoing::{OutgoingAsync, Phase};
pub(crate) use outgoing::write_request_header;

bitflags! {
    /// Outcome of handing a request to a request handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InvokeStatus: u8 {
        /// The request waits for a connection.
        const QUEUED = 0b001;
        /// The request was written to the transport.
        const SENT = 0b010;
        /// The caller must report the write with [`OutgoingAsync::sent`].
        const INVOKE_SENT_CALLBACK = 0b100;
    }
}

/// Results of a successful twoway invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Encoding of the result encapsulation.
    pub encoding: EncodingVersion,
    /// Marshaled results, without the encapsulation header.
    pub payload: Bytes,
}

impl Reply {
    /// The reply of a oneway invocation or an operation without results.
    pub fn empty(encoding: EncodingVersion) -> Self {
        Self {
            encoding,
            payload: Bytes::new(),
        }
    }

    /// Returns a stream over the results.
    pub fn input(&self) -> InputStream {
        InputStream::with_encoding(self.payload.clone(), self.encoding)
    }
}

/// Something an in-flight request can be withdrawn from.
pub trait CancellationHandler: Send + Sync + Debug {
    /// Withdraws `out` and completes it with `error`.
    fn async_request_canceled(&self, out: &Arc<OutgoingAsync>, error: IceError);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ice_core::protocol::ENCODING_1_1;

    #[test]
    fn test_invoke_status_flags() {
        let status = InvokeStatus::SENT | InvokeStatus::INVOKE_SENT_CALLBACK;
        assert!(status.contains(InvokeStatus::SENT));
        assert!(!status.contains(InvokeStatus::QUEUED));
    }

    #[test]
    fn test_reply_input() {
        let reply = Reply {
            encoding: ENCODING_1_1,
            payload: Bytes::from_static(&[1, 0, 0, 0]),
        };
        assert_eq!(reply.input().read_i32().unwrap(), 1);
        assert!(Reply::empty(ENCODING_1_1).payload.is_empty());
    }
}
