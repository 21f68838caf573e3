//! Object proxies.
//!
//! An [`ObjectPrx`] is a cheap-to-clone handle for a remote object. Clones
//! share the cached request handler and batch queue; the `ice_*` mutators
//! return independent proxies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ice_core::protocol::{EncodingVersion, OperationMode};
use ice_core::{Context, IceError, Identity, InputStream, OutputStream, Result};
use parking_lot::Mutex;

use crate::batch::{BatchRequestQueue, SwappedBatch};
use crate::config::EndpointSelection;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::handler::RequestHandler;
use crate::instance::Instance;
use crate::invocation::{write_request_header, InvocationFuture, OutgoingAsync, Reply};
use crate::reference::{InvocationMode, Reference};

/// Type id every object implements.
pub const OBJECT_TYPE_ID: &str = "::Ice::Object";

/// A proxy for a remote object.
#[derive(Clone)]
pub struct ObjectPrx {
    reference: Reference,
    handler: Arc<Mutex<Option<Arc<dyn RequestHandler>>>>,
    batch_queue: Arc<BatchRequestQueue>,
}

impl fmt::Debug for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectPrx").field(&self.reference.to_string()).finish()
    }
}

impl fmt::Display for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.reference, f)
    }
}

impl PartialEq for ObjectPrx {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
    }
}

impl Eq for ObjectPrx {}

fn same_handler(a: &Arc<dyn RequestHandler>, b: &Arc<dyn RequestHandler>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl ObjectPrx {
    /// Wraps a reference.
    pub fn new(reference: Reference) -> Self {
        let batch_queue = match reference.fixed_connection() {
            Some(connection) => connection.batch_queue().clone(),
            None => {
                let instance = reference.instance();
                Arc::new(BatchRequestQueue::new(
                    instance.config().batch_auto_flush_size(),
                    reference.mode().is_datagram(),
                    instance.batch_interceptor(),
                ))
            }
        };
        Self {
            reference,
            handler: Arc::new(Mutex::new(None)),
            batch_queue,
        }
    }

    fn with_reference(&self, reference: Reference) -> Self {
        if reference == self.reference {
            self.clone()
        } else {
            Self::new(reference)
        }
    }

    /// Returns the reference behind this proxy.
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Marshals the proxy.
    pub fn write(&self, os: &mut OutputStream) -> Result<()> {
        os.write(self.reference.identity());
        self.reference.write_to(os)
    }

    /// Unmarshals a proxy; a null proxy reads as `None`.
    pub fn read(instance: &Arc<Instance>, is: &mut InputStream) -> Result<Option<ObjectPrx>> {
        let identity: Identity = is.read()?;
        let reference = instance.reference_factory().create_from_stream(identity, is)?;
        Ok(reference.map(ObjectPrx::new))
    }

    /// Marshals a null proxy.
    pub fn write_null(os: &mut OutputStream) {
        os.write(&Identity::default());
    }

    // Invocation

    /// Invokes `operation` with marshaled `params` and the proxy's context.
    pub async fn invoke(&self, operation: &str, mode: OperationMode, params: &[u8]) -> Result<Reply> {
        self.invoke_with_exceptions(operation, mode, params, None, &[], false).await
    }

    /// Invokes `operation` with an explicit request context.
    pub async fn invoke_with_context(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
        context: &Context,
    ) -> Result<Reply> {
        self.invoke_with_exceptions(operation, mode, params, Some(context), &[], false)
            .await
    }

    /// Invokes `operation`, reporting the listed user exceptions as
    /// [`IceError::UserException`].
    ///
    /// On a batch proxy the request is queued and an empty reply returned.
    pub async fn invoke_with_exceptions(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
        context: Option<&Context>,
        user_exceptions: &[&str],
        twoway_only: bool,
    ) -> Result<Reply> {
        if self.reference.mode().is_batch() {
            if twoway_only {
                return Err(IceError::TwowayOnly(operation.to_string()));
            }
            self.queue_batch_request(operation, mode, params, context).await?;
            return Ok(Reply::empty(self.reference.encoding()));
        }
        let out = OutgoingAsync::new(self.clone(), operation, mode, twoway_only, user_exceptions);
        out.prepare(params, context)?;
        out.invoke().await
    }

    /// Starts an invocation in the background.
    pub fn invoke_async(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
        context: Option<&Context>,
    ) -> Result<InvocationFuture> {
        if self.reference.mode().is_batch() {
            return Err(IceError::FeatureNotSupported(
                "background invocations on batch proxies".to_string(),
            ));
        }
        let out = OutgoingAsync::new(self.clone(), operation, mode, false, &[]);
        out.prepare(params, context)?;
        Ok(InvocationFuture::spawn(out))
    }

    async fn queue_batch_request(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
        context: Option<&Context>,
    ) -> Result<()> {
        let mut os = self.batch_queue.prepare_batch_request()?;
        let context = context.unwrap_or_else(|| self.reference.context());
        write_request_header(&mut os, &self.reference, operation, mode, context);
        os.write_encapsulation(self.reference.encoding(), params);
        match self.batch_queue.finish_batch_request(os, self, operation) {
            Some(batch) => self.send_batch(batch).await,
            None => Ok(()),
        }
    }

    async fn send_batch(&self, batch: SwappedBatch) -> Result<()> {
        let handler = self.request_handler().await?;
        let result = handler.flush_batch(batch).await;
        if result.is_err() {
            self.update_request_handler(&handler, None);
        }
        result
    }

    /// Sends the requests queued on this batch proxy.
    pub async fn ice_flush_batch_requests(&self) -> Result<()> {
        match self.batch_queue.swap() {
            Some(batch) => self.send_batch(batch).await,
            None => Ok(()),
        }
    }

    /// Returns the batch queue used by this proxy.
    pub fn batch_queue(&self) -> &Arc<BatchRequestQueue> {
        &self.batch_queue
    }

    // Built-in operations

    /// Checks that the object exists.
    pub async fn ice_ping(&self) -> Result<()> {
        self.invoke("ice_ping", OperationMode::Nonmutating, &[]).await?;
        Ok(())
    }

    /// Asks whether the object supports `type_id`.
    pub async fn ice_is_a(&self, type_id: &str) -> Result<bool> {
        let mut os = OutputStream::with_encoding(self.reference.encoding());
        os.write_string(type_id);
        let reply = self
            .invoke_with_exceptions("ice_isA", OperationMode::Nonmutating, os.as_bytes(), None, &[], true)
            .await?;
        reply.input().read_bool()
    }

    /// Returns the most-derived type id of the object.
    pub async fn ice_id(&self) -> Result<String> {
        let reply = self
            .invoke_with_exceptions("ice_id", OperationMode::Nonmutating, &[], None, &[], true)
            .await?;
        reply.input().read_string()
    }

    /// Returns every type id the object supports.
    pub async fn ice_ids(&self) -> Result<Vec<String>> {
        let reply = self
            .invoke_with_exceptions("ice_ids", OperationMode::Nonmutating, &[], None, &[], true)
            .await?;
        reply.input().read_string_seq()
    }

    // Connections and request handlers

    /// Returns the connection used by this proxy, establishing it if needed.
    /// Collocated proxies have none.
    pub async fn ice_get_connection(&self) -> Result<Option<Arc<Connection>>> {
        let handler = self.request_handler().await?;
        match handler.get_connection().await {
            Ok(connection) => Ok(connection),
            Err(err) => {
                self.update_request_handler(&handler, None);
                Err(err)
            }
        }
    }

    /// Returns the cached connection without establishing one.
    pub fn ice_get_cached_connection(&self) -> Option<Arc<Connection>> {
        self.handler.lock().as_ref().and_then(|h| h.connection())
    }

    pub(crate) async fn request_handler(&self) -> Result<Arc<dyn RequestHandler>> {
        let cache = self.reference.cache_connection();
        if cache {
            if let Some(handler) = self.handler.lock().clone() {
                return Ok(handler);
            }
        }
        let factory = self.reference.instance().request_handler_factory();
        let handler = factory.get_request_handler(self)?;
        if cache {
            let mut slot = self.handler.lock();
            match &*slot {
                Some(existing) => return Ok(existing.clone()),
                None => *slot = Some(handler.clone()),
            }
        }
        Ok(handler)
    }

    /// Replaces `previous` with `handler` if it is still the cached one.
    pub(crate) fn update_request_handler(
        &self,
        previous: &Arc<dyn RequestHandler>,
        handler: Option<Arc<dyn RequestHandler>>,
    ) {
        let mut slot = self.handler.lock();
        if let Some(current) = &*slot {
            if same_handler(current, previous) {
                *slot = handler;
            }
        }
    }

    // Accessors

    pub fn ice_get_identity(&self) -> &Identity {
        self.reference.identity()
    }

    pub fn ice_get_facet(&self) -> &str {
        self.reference.facet()
    }

    pub fn ice_get_context(&self) -> &Context {
        self.reference.context()
    }

    pub fn ice_get_adapter_id(&self) -> &str {
        self.reference.adapter_id()
    }

    pub fn ice_get_endpoints(&self) -> &[Endpoint] {
        self.reference.endpoints()
    }

    /// Returns the proxy of the locator used by this proxy.
    pub fn ice_get_locator(&self) -> Option<ObjectPrx> {
        self.reference.locator_info().and_then(|info| info.proxy().cloned())
    }

    /// Returns the proxy of the router used by this proxy.
    pub fn ice_get_router(&self) -> Option<ObjectPrx> {
        self.reference.router_info().and_then(|info| info.proxy().cloned())
    }

    pub fn ice_get_invocation_timeout(&self) -> Option<Duration> {
        self.reference.invocation_timeout()
    }

    pub fn ice_get_connection_id(&self) -> &str {
        self.reference.connection_id()
    }

    pub fn ice_get_encoding_version(&self) -> EncodingVersion {
        self.reference.encoding()
    }

    pub fn ice_get_endpoint_selection(&self) -> EndpointSelection {
        self.reference.endpoint_selection()
    }

    pub fn ice_get_locator_cache_timeout(&self) -> i32 {
        self.reference.locator_cache_timeout()
    }

    pub fn ice_get_compress(&self) -> Option<bool> {
        self.reference.compress()
    }

    pub fn ice_get_timeout(&self) -> Option<i32> {
        self.reference.timeout()
    }

    pub fn ice_is_twoway(&self) -> bool {
        self.reference.mode() == InvocationMode::Twoway
    }

    pub fn ice_is_oneway(&self) -> bool {
        self.reference.mode() == InvocationMode::Oneway
    }

    pub fn ice_is_batch_oneway(&self) -> bool {
        self.reference.mode() == InvocationMode::BatchOneway
    }

    pub fn ice_is_datagram(&self) -> bool {
        self.reference.mode() == InvocationMode::Datagram
    }

    pub fn ice_is_batch_datagram(&self) -> bool {
        self.reference.mode() == InvocationMode::BatchDatagram
    }

    pub fn ice_is_secure(&self) -> bool {
        self.reference.secure()
    }

    pub fn ice_is_fixed(&self) -> bool {
        self.reference.is_fixed()
    }

    pub fn ice_is_collocation_optimized(&self) -> bool {
        self.reference.collocation_optimized()
    }

    pub fn ice_is_connection_cached(&self) -> bool {
        self.reference.cache_connection()
    }

    pub fn ice_is_prefer_secure(&self) -> bool {
        self.reference.prefer_secure()
    }

    // Mutators

    pub fn ice_identity(&self, identity: Identity) -> Result<ObjectPrx> {
        if identity.name.is_empty() {
            return Err(IceError::IllegalIdentity(identity.to_string()));
        }
        Ok(self.with_reference(self.reference.with_identity(identity)))
    }

    pub fn ice_facet(&self, facet: impl Into<String>) -> ObjectPrx {
        self.with_reference(self.reference.with_facet(facet))
    }

    pub fn ice_context(&self, context: Context) -> ObjectPrx {
        self.with_reference(self.reference.with_context(context))
    }

    pub fn ice_adapter_id(&self, adapter_id: impl Into<String>) -> Result<ObjectPrx> {
        Ok(self.with_reference(self.reference.with_adapter_id(adapter_id)?))
    }

    pub fn ice_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<ObjectPrx> {
        Ok(self.with_reference(self.reference.with_endpoints(endpoints)?))
    }

    /// Uses `locator` to resolve indirect references.
    pub fn ice_locator(&self, locator: Option<&ObjectPrx>) -> Result<ObjectPrx> {
        let instance = self.reference.instance();
        let info = locator.map(|l| instance.locator_manager().get(l));
        Ok(self.with_reference(self.reference.with_locator_info(info)?))
    }

    /// Routes requests through `router`.
    pub fn ice_router(&self, router: Option<&ObjectPrx>) -> Result<ObjectPrx> {
        let instance = self.reference.instance();
        let info = router.map(|r| instance.router_manager().get(r));
        Ok(self.with_reference(self.reference.with_router_info(info)?))
    }

    pub fn ice_invocation_timeout(&self, timeout: Option<Duration>) -> ObjectPrx {
        self.with_reference(self.reference.with_invocation_timeout(timeout))
    }

    pub fn ice_connection_id(&self, id: impl Into<String>) -> Result<ObjectPrx> {
        Ok(self.with_reference(self.reference.with_connection_id(id)?))
    }

    pub fn ice_encoding_version(&self, encoding: EncodingVersion) -> ObjectPrx {
        self.with_reference(self.reference.with_encoding(encoding))
    }

    pub fn ice_twoway(&self) -> ObjectPrx {
        self.with_reference(self.reference.with_mode(InvocationMode::Twoway))
    }

    pub fn ice_oneway(&self) -> ObjectPrx {
        self.with_reference(self.reference.with_mode(InvocationMode::Oneway))
    }

    pub fn ice_batch_oneway(&self) -> ObjectPrx {
        self.with_reference(self.reference.with_mode(InvocationMode::BatchOneway))
    }

    pub fn ice_datagram(&self) -> ObjectPrx {
        self.with_reference(self.reference.with_mode(InvocationMode::Datagram))
    }

    pub fn ice_batch_datagram(&self) -> ObjectPrx {
        self.with_reference(self.reference.with_mode(InvocationMode::BatchDatagram))
    }

    pub fn ice_secure(&self, secure: bool) -> ObjectPrx {
        self.with_reference(self.reference.with_secure(secure))
    }

    pub fn ice_collocation_optimized(&self, enabled: bool) -> Result<ObjectPrx> {
        Ok(self.with_reference(self.reference.with_collocation_optimized(enabled)?))
    }

    pub fn ice_connection_cached(&self, enabled: bool) -> Result<ObjectPrx> {
        Ok(self.with_reference(self.reference.with_cache_connection(enabled)?))
    }

    pub fn ice_prefer_secure(&self, prefer: bool) -> Result<ObjectPrx> {
        Ok(self.with_reference(self.reference.with_prefer_secure(prefer)?))
    }

    pub fn ice_endpoint_selection(&self, selection: EndpointSelection) -> Result<ObjectPrx> {
        Ok(self.with_reference(self.reference.with_endpoint_selection(selection)?))
    }

    pub fn ice_locator_cache_timeout(&self, seconds: i32) -> Result<ObjectPrx> {
        if seconds < -1 {
            return Err(IceError::Configuration(format!(
                "invalid locator cache timeout {seconds}"
            )));
        }
        Ok(self.with_reference(self.reference.with_locator_cache_timeout(seconds)?))
    }

    pub fn ice_compress(&self, compress: bool) -> ObjectPrx {
        self.with_reference(self.reference.with_compress(compress))
    }

    pub fn ice_timeout(&self, timeout_ms: i32) -> Result<ObjectPrx> {
        if timeout_ms < 1 && timeout_ms != -1 {
            return Err(IceError::Configuration(format!("invalid timeout {timeout_ms}")));
        }
        Ok(self.with_reference(self.reference.with_timeout(timeout_ms)?))
    }

    /// Returns a proxy bound to `connection`.
    pub fn ice_fixed(&self, connection: Arc<Connection>) -> Result<ObjectPrx> {
        let instance = self.reference.instance();
        let fixed = instance
            .reference_factory()
            .create_fixed(self.reference.identity().clone(), connection)?
            .with_facet(self.reference.facet())
            .with_context(self.reference.context().clone())
            .with_encoding(self.reference.encoding())
            .with_invocation_timeout(self.reference.invocation_timeout());
        Ok(Self::new(fixed.with_mode(self.reference.mode())))
    }
}
