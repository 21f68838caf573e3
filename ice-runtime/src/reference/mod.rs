//! References: the addressing information behind a proxy.
//!
//! A [`Reference`] is immutable. Every `with_*` method returns a new value.
//! Routable references resolve their endpoints when a connection is needed,
//! directly, through a router, or through a locator. Fixed references are
//! bound to one connection and reject the mutators that only make sense for
//! routable ones.

mod factory;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use ice_core::protocol::{EncodingVersion, ProtocolVersion, ENCODING_1_0, PROTOCOL_1_0};
use ice_core::{Context, IceError, Identity, OutputStream, Result};
use rand::seq::SliceRandom;

pub use factory::ReferenceFactory;
pub(crate) use factory::split_endpoints;

use crate::config::EndpointSelection;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::instance::Instance;
use crate::locator::LocatorInfo;
use crate::router::RouterInfo;

/// How invocations on a proxy are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum InvocationMode {
    /// Request and reply.
    #[default]
    Twoway = 0,
    /// Request only, over a stream transport.
    Oneway = 1,
    /// Oneway requests queued until flushed.
    BatchOneway = 2,
    /// Request only, over a datagram transport.
    Datagram = 3,
    /// Datagram requests queued until flushed.
    BatchDatagram = 4,
}

impl InvocationMode {
    /// Returns true for the batch modes.
    pub fn is_batch(self) -> bool {
        matches!(self, InvocationMode::BatchOneway | InvocationMode::BatchDatagram)
    }

    /// Returns true for the modes that use datagram endpoints.
    pub fn is_datagram(self) -> bool {
        matches!(self, InvocationMode::Datagram | InvocationMode::BatchDatagram)
    }

    fn flag(self) -> &'static str {
        match self {
            InvocationMode::Twoway => "-t",
            InvocationMode::Oneway => "-o",
            InvocationMode::BatchOneway => "-O",
            InvocationMode::Datagram => "-d",
            InvocationMode::BatchDatagram => "-D",
        }
    }
}

impl TryFrom<u8> for InvocationMode {
    type Error = IceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(InvocationMode::Twoway),
            1 => Ok(InvocationMode::Oneway),
            2 => Ok(InvocationMode::BatchOneway),
            3 => Ok(InvocationMode::Datagram),
            4 => Ok(InvocationMode::BatchDatagram),
            other => Err(IceError::marshal(format!("invalid invocation mode {other}"))),
        }
    }
}

#[derive(Clone)]
struct RoutableData {
    endpoints: Arc<Vec<Endpoint>>,
    adapter_id: String,
    locator_info: Option<Arc<LocatorInfo>>,
    router_info: Option<Arc<RouterInfo>>,
    collocation_optimized: bool,
    cache_connection: bool,
    prefer_secure: bool,
    endpoint_selection: EndpointSelection,
    locator_cache_timeout: i32,
    connection_id: String,
    timeout: Option<i32>,
}

#[derive(Clone)]
enum ReferenceKind {
    Routable(RoutableData),
    Fixed(Arc<Connection>),
}

/// Addressing information for a remote object.
#[derive(Clone)]
pub struct Reference {
    instance: Arc<Instance>,
    identity: Identity,
    facet: String,
    mode: InvocationMode,
    secure: bool,
    protocol: ProtocolVersion,
    encoding: EncodingVersion,
    invocation_timeout: Option<Duration>,
    context: Arc<Context>,
    compress: Option<bool>,
    kind: ReferenceKind,
}

fn opt_ptr_eq<T>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        let kinds_equal = match (&self.kind, &other.kind) {
            (ReferenceKind::Fixed(a), ReferenceKind::Fixed(b)) => Arc::ptr_eq(a, b),
            (ReferenceKind::Routable(a), ReferenceKind::Routable(b)) => {
                a.endpoints == b.endpoints
                    && a.adapter_id == b.adapter_id
                    && opt_ptr_eq(&a.locator_info, &b.locator_info)
                    && opt_ptr_eq(&a.router_info, &b.router_info)
                    && a.collocation_optimized == b.collocation_optimized
                    && a.cache_connection == b.cache_connection
                    && a.prefer_secure == b.prefer_secure
                    && a.endpoint_selection == b.endpoint_selection
                    && a.locator_cache_timeout == b.locator_cache_timeout
                    && a.connection_id == b.connection_id
                    && a.timeout == b.timeout
            }
            _ => false,
        };
        kinds_equal
            && Arc::ptr_eq(&self.instance, &other.instance)
            && self.identity == other.identity
            && self.facet == other.facet
            && self.mode == other.mode
            && self.secure == other.secure
            && self.protocol == other.protocol
            && self.encoding == other.encoding
            && self.invocation_timeout == other.invocation_timeout
            && self.context == other.context
            && self.compress == other.compress
    }
}

impl Eq for Reference {}

impl Hash for Reference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
        self.facet.hash(state);
        self.mode.hash(state);
        match &self.kind {
            ReferenceKind::Fixed(connection) => Arc::as_ptr(connection).hash(state),
            ReferenceKind::Routable(data) => {
                data.endpoints.hash(state);
                data.adapter_id.hash(state);
            }
        }
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("proxy", &self.to_string())
            .field("fixed", &self.is_fixed())
            .finish()
    }
}

fn needs_quotes(s: &str) -> bool {
    s.is_empty() || s.chars().any(|c| c.is_whitespace() || matches!(c, ':' | '@' | '"'))
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    if needs_quotes(s) {
        write!(f, "\"{}\"", s.replace('"', "\\\""))
    } else {
        f.write_str(s)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_quoted(f, &self.identity.to_string())?;
        if !self.facet.is_empty() {
            f.write_str(" -f ")?;
            write_quoted(f, &self.facet)?;
        }
        write!(f, " {}", self.mode.flag())?;
        if self.secure {
            f.write_str(" -s")?;
        }
        if self.protocol != PROTOCOL_1_0 {
            write!(f, " -p {}", self.protocol)?;
        }
        write!(f, " -e {}", self.encoding)?;

        if let ReferenceKind::Routable(data) = &self.kind {
            if !data.endpoints.is_empty() {
                for endpoint in data.endpoints.iter() {
                    write!(f, ":{endpoint}")?;
                }
            } else if !data.adapter_id.is_empty() {
                f.write_str(" @ ")?;
                write_quoted(f, &data.adapter_id)?;
            }
        }
        Ok(())
    }
}

impl Reference {
    fn routable(&self) -> Result<&RoutableData> {
        match &self.kind {
            ReferenceKind::Routable(data) => Ok(data),
            ReferenceKind::Fixed(_) => Err(IceError::FixedProxy),
        }
    }

    fn change_routable(&self, f: impl FnOnce(&mut RoutableData)) -> Result<Reference> {
        let mut data = self.routable()?.clone();
        f(&mut data);
        let mut r = self.clone();
        r.kind = ReferenceKind::Routable(data);
        Ok(r)
    }

    /// Returns the owning communicator instance.
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn facet(&self) -> &str {
        &self.facet
    }

    pub fn mode(&self) -> InvocationMode {
        self.mode
    }

    pub fn is_twoway(&self) -> bool {
        self.mode == InvocationMode::Twoway
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn encoding(&self) -> EncodingVersion {
        self.encoding
    }

    /// Returns the invocation timeout. `None` waits forever.
    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.invocation_timeout
    }

    /// Returns the context sent with each request.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Returns the compression override, if any.
    pub fn compress(&self) -> Option<bool> {
        self.compress
    }

    /// Returns true for references bound to a connection.
    pub fn is_fixed(&self) -> bool {
        matches!(self.kind, ReferenceKind::Fixed(_))
    }

    /// Returns the connection of a fixed reference.
    pub fn fixed_connection(&self) -> Option<&Arc<Connection>> {
        match &self.kind {
            ReferenceKind::Fixed(connection) => Some(connection),
            ReferenceKind::Routable(_) => None,
        }
    }

    /// Returns the direct endpoints. Empty for indirect and fixed references.
    pub fn endpoints(&self) -> &[Endpoint] {
        match &self.kind {
            ReferenceKind::Routable(data) => &data.endpoints,
            ReferenceKind::Fixed(_) => &[],
        }
    }

    pub fn adapter_id(&self) -> &str {
        match &self.kind {
            ReferenceKind::Routable(data) => &data.adapter_id,
            ReferenceKind::Fixed(_) => "",
        }
    }

    pub fn locator_info(&self) -> Option<&Arc<LocatorInfo>> {
        match &self.kind {
            ReferenceKind::Routable(data) => data.locator_info.as_ref(),
            ReferenceKind::Fixed(_) => None,
        }
    }

    pub fn router_info(&self) -> Option<&Arc<RouterInfo>> {
        match &self.kind {
            ReferenceKind::Routable(data) => data.router_info.as_ref(),
            ReferenceKind::Fixed(_) => None,
        }
    }

    pub fn collocation_optimized(&self) -> bool {
        match &self.kind {
            ReferenceKind::Routable(data) => data.collocation_optimized,
            ReferenceKind::Fixed(_) => false,
        }
    }

    pub fn cache_connection(&self) -> bool {
        match &self.kind {
            ReferenceKind::Routable(data) => data.cache_connection,
            ReferenceKind::Fixed(_) => true,
        }
    }

    pub fn prefer_secure(&self) -> bool {
        match &self.kind {
            ReferenceKind::Routable(data) => data.prefer_secure,
            ReferenceKind::Fixed(_) => false,
        }
    }

    pub fn endpoint_selection(&self) -> EndpointSelection {
        match &self.kind {
            ReferenceKind::Routable(data) => data.endpoint_selection,
            ReferenceKind::Fixed(_) => EndpointSelection::Random,
        }
    }

    /// Returns the locator cache timeout in seconds (-1 is infinite).
    pub fn locator_cache_timeout(&self) -> i32 {
        match &self.kind {
            ReferenceKind::Routable(data) => data.locator_cache_timeout,
            ReferenceKind::Fixed(_) => 0,
        }
    }

    pub fn connection_id(&self) -> &str {
        match &self.kind {
            ReferenceKind::Routable(data) => &data.connection_id,
            ReferenceKind::Fixed(connection) => connection.endpoint().connection_id(),
        }
    }

    /// Returns the endpoint timeout override in milliseconds.
    pub fn timeout(&self) -> Option<i32> {
        match &self.kind {
            ReferenceKind::Routable(data) => data.timeout,
            ReferenceKind::Fixed(_) => None,
        }
    }

    /// Returns true if endpoints are resolved through a locator.
    pub fn is_indirect(&self) -> bool {
        match &self.kind {
            ReferenceKind::Routable(data) => data.endpoints.is_empty(),
            ReferenceKind::Fixed(_) => false,
        }
    }

    /// Returns true for indirect references without an adapter id.
    pub fn is_well_known(&self) -> bool {
        self.is_indirect() && self.adapter_id().is_empty()
    }

    pub fn with_identity(&self, identity: Identity) -> Reference {
        Reference {
            identity,
            ..self.clone()
        }
    }

    pub fn with_facet(&self, facet: impl Into<String>) -> Reference {
        Reference {
            facet: facet.into(),
            ..self.clone()
        }
    }

    pub fn with_mode(&self, mode: InvocationMode) -> Reference {
        Reference { mode, ..self.clone() }
    }

    pub fn with_secure(&self, secure: bool) -> Reference {
        Reference {
            secure,
            ..self.clone()
        }
    }

    pub fn with_encoding(&self, encoding: EncodingVersion) -> Reference {
        Reference {
            encoding,
            ..self.clone()
        }
    }

    pub fn with_invocation_timeout(&self, timeout: Option<Duration>) -> Reference {
        Reference {
            invocation_timeout: timeout,
            ..self.clone()
        }
    }

    pub fn with_context(&self, context: Context) -> Reference {
        Reference {
            context: Arc::new(context),
            ..self.clone()
        }
    }

    pub fn with_compress(&self, compress: bool) -> Reference {
        Reference {
            compress: Some(compress),
            ..self.clone()
        }
    }

    /// Replaces the endpoints and clears the adapter id.
    pub fn with_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<Reference> {
        self.change_routable(|data| {
            data.endpoints = Arc::new(endpoints);
            data.adapter_id.clear();
        })
    }

    /// Replaces the adapter id and clears the endpoints.
    pub fn with_adapter_id(&self, adapter_id: impl Into<String>) -> Result<Reference> {
        let adapter_id = adapter_id.into();
        self.change_routable(|data| {
            data.adapter_id = adapter_id;
            data.endpoints = Arc::new(Vec::new());
        })
    }

    pub fn with_locator_info(&self, locator: Option<Arc<LocatorInfo>>) -> Result<Reference> {
        self.change_routable(|data| data.locator_info = locator)
    }

    pub fn with_router_info(&self, router: Option<Arc<RouterInfo>>) -> Result<Reference> {
        self.change_routable(|data| data.router_info = router)
    }

    pub fn with_collocation_optimized(&self, enabled: bool) -> Result<Reference> {
        self.change_routable(|data| data.collocation_optimized = enabled)
    }

    pub fn with_cache_connection(&self, enabled: bool) -> Result<Reference> {
        self.change_routable(|data| data.cache_connection = enabled)
    }

    pub fn with_prefer_secure(&self, prefer: bool) -> Result<Reference> {
        self.change_routable(|data| data.prefer_secure = prefer)
    }

    pub fn with_endpoint_selection(&self, selection: EndpointSelection) -> Result<Reference> {
        self.change_routable(|data| data.endpoint_selection = selection)
    }

    pub fn with_locator_cache_timeout(&self, seconds: i32) -> Result<Reference> {
        self.change_routable(|data| data.locator_cache_timeout = seconds)
    }

    /// Sets the connection id; endpoints with different ids never share a
    /// connection.
    pub fn with_connection_id(&self, id: impl Into<String>) -> Result<Reference> {
        let id = id.into();
        self.change_routable(|data| {
            data.endpoints = Arc::new(data.endpoints.iter().map(|e| e.with_connection_id(&id)).collect());
            data.connection_id = id;
        })
    }

    /// Overrides the timeout of every endpoint, in milliseconds.
    pub fn with_timeout(&self, timeout: i32) -> Result<Reference> {
        self.change_routable(|data| {
            data.endpoints = Arc::new(data.endpoints.iter().map(|e| e.with_timeout(timeout)).collect());
            data.timeout = Some(timeout);
        })
    }

    /// Marshals everything after the identity.
    pub fn write_to(&self, os: &mut OutputStream) -> Result<()> {
        let data = self.routable()?;
        if self.facet.is_empty() {
            os.write_size(0);
        } else {
            os.write_string_seq(&[self.facet.as_str()]);
        }
        os.write_u8(self.mode as u8);
        os.write_bool(self.secure);
        if os.encoding() != ENCODING_1_0 {
            os.write(&self.protocol);
            os.write(&self.encoding);
        }
        os.write_size(data.endpoints.len());
        if data.endpoints.is_empty() {
            os.write_string(&data.adapter_id);
        } else {
            for endpoint in data.endpoints.iter() {
                os.write(endpoint);
            }
        }
        Ok(())
    }

    /// Returns a connection for this reference, establishing one if needed.
    pub async fn get_connection(&self) -> Result<Arc<Connection>> {
        let data = match &self.kind {
            ReferenceKind::Fixed(connection) => {
                return match connection.close_error() {
                    Some(err) => Err(err),
                    None => Ok(connection.clone()),
                };
            }
            ReferenceKind::Routable(data) => data,
        };

        if let Some(router) = &data.router_info {
            let endpoints = router.get_client_endpoints().await?;
            if !endpoints.is_empty() {
                return self.create_connection(data, &endpoints).await;
            }
        }

        if !data.endpoints.is_empty() {
            return self.create_connection(data, &data.endpoints).await;
        }

        let Some(locator) = &data.locator_info else {
            return Err(IceError::NoEndpoint(self.to_string()));
        };
        let mut cache_cleared = false;
        loop {
            let (endpoints, cached) = locator.get_endpoints(self, data.locator_cache_timeout).await?;
            if endpoints.is_empty() {
                return Err(IceError::NoEndpoint(self.to_string()));
            }
            match self.create_connection(data, &endpoints).await {
                Ok(connection) => return Ok(connection),
                Err(err) if cached && !cache_cleared && err.is_connection_error() => {
                    locator.clear_cache(self);
                    cache_cleared = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn filter_endpoints(&self, data: &RoutableData, endpoints: &[Endpoint]) -> Vec<Endpoint> {
        let overrides = self.instance.config().overrides();
        let timeout = overrides.timeout.or(data.timeout);
        let compress = overrides.compress.or(self.compress);

        let mut filtered: Vec<Endpoint> = endpoints
            .iter()
            .filter(|e| !matches!(e, Endpoint::Opaque(_)))
            .filter(|e| e.datagram() == self.mode.is_datagram())
            .filter(|e| !self.secure || e.secure())
            .map(|e| {
                let mut e = e.with_connection_id(&data.connection_id);
                if let Some(timeout) = timeout {
                    e = e.with_timeout(timeout);
                }
                if let Some(compress) = compress {
                    e = e.with_compress(compress);
                }
                e
            })
            .collect();

        if data.endpoint_selection == EndpointSelection::Random {
            filtered.shuffle(&mut rand::thread_rng());
        }
        if data.prefer_secure {
            filtered.sort_by_key(|e| !e.secure());
        } else {
            filtered.sort_by_key(|e| e.secure());
        }
        filtered
    }

    async fn create_connection(&self, data: &RoutableData, endpoints: &[Endpoint]) -> Result<Arc<Connection>> {
        let endpoints = self.filter_endpoints(data, endpoints);
        if endpoints.is_empty() {
            return Err(IceError::NoEndpoint(self.to_string()));
        }
        let connection = self.instance.outgoing_connection_factory().create(&endpoints).await?;
        if let Some(router) = &data.router_info {
            if let Some(adapter) = router.adapter() {
                connection.set_adapter(Some(&adapter));
            }
        }
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ice_core::InputStream;

    use crate::communicator::Communicator;

    fn reference(communicator: &Communicator, s: &str) -> Reference {
        communicator.string_to_proxy(s).unwrap().unwrap().reference().clone()
    }

    #[test]
    fn test_invocation_mode_from_u8() {
        assert_eq!(InvocationMode::try_from(2).unwrap(), InvocationMode::BatchOneway);
        assert!(InvocationMode::try_from(5).is_err());
        assert!(InvocationMode::BatchDatagram.is_batch());
        assert!(InvocationMode::Datagram.is_datagram());
        assert!(!InvocationMode::Oneway.is_datagram());
    }

    #[test]
    fn test_mutators_return_new_values() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let r = reference(&communicator, "hello:tcp -h 127.0.0.1 -p 10000");
        let oneway = r.with_mode(InvocationMode::Oneway);
        assert!(r.is_twoway());
        assert!(!oneway.is_twoway());
        assert_ne!(r, oneway);
        assert_eq!(r, r.with_mode(InvocationMode::Twoway));

        let indirect = r.with_adapter_id("adapter").unwrap();
        assert!(indirect.is_indirect());
        assert!(!indirect.is_well_known());
        assert!(indirect.endpoints().is_empty());

        let timed = r.with_timeout(2500).unwrap();
        assert_eq!(timed.endpoints()[0].timeout(), 2500);
        assert_eq!(timed.timeout(), Some(2500));
    }

    #[test]
    fn test_display_round_trips() {
        let communicator = Communicator::new(Default::default()).unwrap();
        for s in [
            "cat/hello -f facet -o:tcp -h 127.0.0.1 -p 10000",
            "hello -D:udp -h 127.0.0.1 -p 10001",
            "hello @ MyAdapter",
            "\"with space\" -s:tcp -h 127.0.0.1 -p 10000 -t 500",
        ] {
            let r = reference(&communicator, s);
            let again = reference(&communicator, &r.to_string());
            assert_eq!(r, again, "{s}");
        }
    }

    #[test]
    fn test_wire_round_trip() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let r = reference(&communicator, "cat/hello -f fac -O:tcp -h 127.0.0.1 -p 10000:udp -h 127.0.0.1 -p 10001");
        let mut os = OutputStream::new();
        os.write(r.identity());
        r.write_to(&mut os).unwrap();

        let mut is = InputStream::new(os.finished());
        let identity: Identity = is.read().unwrap();
        let decoded = communicator
            .instance()
            .reference_factory()
            .create_from_stream(identity, &mut is)
            .unwrap()
            .unwrap();
        assert!(is.is_empty());
        assert_eq!(decoded.to_string(), r.to_string());
    }

    #[test]
    fn test_indirect_wire_form_carries_adapter_id() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let r = reference(&communicator, "hello @ Adapter");
        let mut os = OutputStream::new();
        r.write_to(&mut os).unwrap();
        let mut is = InputStream::new(os.finished());
        assert_eq!(is.read_size().unwrap(), 0);
        is.read_u8().unwrap();
        is.read_bool().unwrap();
        is.read::<ProtocolVersion>().unwrap();
        is.read::<EncodingVersion>().unwrap();
        assert_eq!(is.read_size().unwrap(), 0);
        assert_eq!(is.read_string().unwrap(), "Adapter");
    }

    #[tokio::test]
    async fn test_secure_reference_without_secure_endpoints() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let r = reference(&communicator, "hello -s:tcp -h 127.0.0.1 -p 10000");
        assert!(matches!(r.get_connection().await, Err(IceError::NoEndpoint(_))));
    }

    #[tokio::test]
    async fn test_well_known_without_locator_has_no_endpoint() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let r = reference(&communicator, "hello");
        assert!(r.is_well_known());
        assert!(matches!(r.get_connection().await, Err(IceError::NoEndpoint(_))));
    }
}
