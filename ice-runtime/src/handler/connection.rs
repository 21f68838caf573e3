use std::sync::Arc;

use async_trait::async_trait;
use ice_core::{IceError, Result};

use super::RequestHandler;
use crate::batch::SwappedBatch;
use crate::connection::Connection;
use crate::invocation::{CancellationHandler, InvokeStatus, OutgoingAsync};
use crate::reference::Reference;

/// Sends requests over an established connection.
#[derive(Debug)]
pub struct ConnectionRequestHandler {
    reference: Reference,
    connection: Arc<Connection>,
}

impl ConnectionRequestHandler {
    /// Creates a handler for `reference` over `connection`.
    pub fn new(reference: Reference, connection: Arc<Connection>) -> Self {
        Self {
            reference,
            connection,
        }
    }
}

impl CancellationHandler for ConnectionRequestHandler {
    fn async_request_canceled(&self, out: &Arc<OutgoingAsync>, error: IceError) {
        self.connection.async_request_canceled(out, error);
    }
}

#[async_trait]
impl RequestHandler for ConnectionRequestHandler {
    async fn send_async_request(&self, out: &Arc<OutgoingAsync>) -> Result<InvokeStatus> {
        self.connection.send_async_request(out).await
    }

    async fn flush_batch(&self, batch: SwappedBatch) -> Result<()> {
        self.connection.flush_batch(batch).await
    }

    fn reference(&self) -> &Reference {
        &self.reference
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        Some(self.connection.clone())
    }

    async fn get_connection(&self) -> Result<Option<Arc<Connection>>> {
        Ok(Some(self.connection.clone()))
    }
}
