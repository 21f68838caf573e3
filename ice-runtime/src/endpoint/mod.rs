//! Endpoints: transport bindings of a proxy or object adapter.
//!
//! An [`Endpoint`] is an immutable value describing how to reach a server.
//! Endpoints are parsed from strings such as `tcp -h host -p 4061 -t 5000`
//! by the [`EndpointFactoryManager`], marshaled on the wire as a type code
//! followed by an encapsulation, and expanded into [`Connector`]s once their
//! host has been resolved.

mod connector;
mod ip;
mod opaque;
mod resolver;
mod ws;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ice_core::protocol::EncodingVersion;
use ice_core::{IceError, InputStream, Marshal, OutputStream, Result};
use parking_lot::Mutex;

pub use connector::{Connector, TcpConnector, UdpConnector, WsConnector};
pub use ip::{TcpEndpoint, TcpEndpointFactory, UdpEndpoint, UdpEndpointFactory};
pub use opaque::OpaqueEndpoint;
pub use resolver::EndpointHostResolver;
pub use ws::{WsEndpoint, WsEndpointFactory};

use crate::transport::{Acceptor, Transceiver};

/// Type code of TCP endpoints.
pub const TCP_ENDPOINT_TYPE: i16 = 1;
/// Type code of SSL endpoints.
pub const SSL_ENDPOINT_TYPE: i16 = 2;
/// Type code of UDP endpoints.
pub const UDP_ENDPOINT_TYPE: i16 = 3;
/// Type code of WebSocket endpoints.
pub const WS_ENDPOINT_TYPE: i16 = 4;
/// Type code of secure WebSocket endpoints.
pub const WSS_ENDPOINT_TYPE: i16 = 5;

/// Timeout value meaning "wait forever".
pub const INFINITE_TIMEOUT: i32 = -1;

/// Values used by factories when an endpoint string omits an option.
#[derive(Debug, Clone)]
pub struct EndpointDefaults {
    /// Host for endpoints without `-h`.
    pub host: Option<String>,
    /// Timeout in milliseconds for endpoints without `-t`.
    pub timeout: i32,
}

impl Default for EndpointDefaults {
    fn default() -> Self {
        Self {
            host: None,
            timeout: 60_000,
        }
    }
}

/// A transport binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    /// A TCP endpoint.
    Tcp(TcpEndpoint),
    /// A UDP endpoint.
    Udp(UdpEndpoint),
    /// A WebSocket endpoint layered over TCP.
    Ws(WsEndpoint),
    /// An endpoint of a type this process cannot use, kept verbatim.
    Opaque(OpaqueEndpoint),
}

impl Endpoint {
    /// Returns the wire type code.
    pub fn type_code(&self) -> i16 {
        match self {
            Endpoint::Tcp(_) => TCP_ENDPOINT_TYPE,
            Endpoint::Udp(_) => UDP_ENDPOINT_TYPE,
            Endpoint::Ws(_) => WS_ENDPOINT_TYPE,
            Endpoint::Opaque(e) => e.type_code(),
        }
    }

    /// Returns the protocol name used in endpoint strings.
    pub fn protocol(&self) -> &'static str {
        match self {
            Endpoint::Tcp(_) => "tcp",
            Endpoint::Udp(_) => "udp",
            Endpoint::Ws(_) => "ws",
            Endpoint::Opaque(_) => "opaque",
        }
    }

    /// Returns the timeout in milliseconds (-1 is infinite).
    pub fn timeout(&self) -> i32 {
        match self {
            Endpoint::Tcp(e) => e.timeout,
            Endpoint::Ws(e) => e.inner.timeout,
            Endpoint::Udp(_) | Endpoint::Opaque(_) => INFINITE_TIMEOUT,
        }
    }

    /// Returns a copy with the given timeout.
    ///
    /// Transports without a timeout are returned unchanged.
    pub fn with_timeout(&self, timeout: i32) -> Endpoint {
        match self {
            Endpoint::Tcp(e) => Endpoint::Tcp(TcpEndpoint {
                timeout,
                ..e.clone()
            }),
            Endpoint::Ws(e) => Endpoint::Ws(WsEndpoint {
                inner: TcpEndpoint {
                    timeout,
                    ..e.inner.clone()
                },
                resource: e.resource.clone(),
            }),
            other => other.clone(),
        }
    }

    /// Returns true if requests sent to this endpoint should be compressed.
    pub fn compress(&self) -> bool {
        match self {
            Endpoint::Tcp(e) => e.compress,
            Endpoint::Udp(e) => e.compress,
            Endpoint::Ws(e) => e.inner.compress,
            Endpoint::Opaque(_) => false,
        }
    }

    /// Returns a copy with the given compression flag.
    pub fn with_compress(&self, compress: bool) -> Endpoint {
        match self {
            Endpoint::Tcp(e) => Endpoint::Tcp(TcpEndpoint {
                compress,
                ..e.clone()
            }),
            Endpoint::Udp(e) => Endpoint::Udp(UdpEndpoint {
                compress,
                ..e.clone()
            }),
            Endpoint::Ws(e) => Endpoint::Ws(WsEndpoint {
                inner: TcpEndpoint {
                    compress,
                    ..e.inner.clone()
                },
                resource: e.resource.clone(),
            }),
            Endpoint::Opaque(e) => Endpoint::Opaque(e.clone()),
        }
    }

    /// Returns the connection id. Endpoints with different ids never share
    /// a connection.
    pub fn connection_id(&self) -> &str {
        match self {
            Endpoint::Tcp(e) => &e.connection_id,
            Endpoint::Udp(e) => &e.connection_id,
            Endpoint::Ws(e) => &e.inner.connection_id,
            Endpoint::Opaque(_) => "",
        }
    }

    /// Returns a copy with the given connection id.
    pub fn with_connection_id(&self, connection_id: &str) -> Endpoint {
        let connection_id = connection_id.to_string();
        match self {
            Endpoint::Tcp(e) => Endpoint::Tcp(TcpEndpoint {
                connection_id,
                ..e.clone()
            }),
            Endpoint::Udp(e) => Endpoint::Udp(UdpEndpoint {
                connection_id,
                ..e.clone()
            }),
            Endpoint::Ws(e) => Endpoint::Ws(WsEndpoint {
                inner: TcpEndpoint {
                    connection_id,
                    ..e.inner.clone()
                },
                resource: e.resource.clone(),
            }),
            Endpoint::Opaque(e) => Endpoint::Opaque(e.clone()),
        }
    }

    /// Returns true for connectionless transports.
    pub fn datagram(&self) -> bool {
        matches!(self, Endpoint::Udp(_))
    }

    /// Returns true for secure transports.
    pub fn secure(&self) -> bool {
        match self {
            Endpoint::Opaque(e) => {
                e.type_code() == SSL_ENDPOINT_TYPE || e.type_code() == WSS_ENDPOINT_TYPE
            }
            _ => false,
        }
    }

    /// Returns the host for IP-based endpoints.
    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Tcp(e) => Some(&e.host),
            Endpoint::Udp(e) => Some(&e.host),
            Endpoint::Ws(e) => Some(&e.inner.host),
            Endpoint::Opaque(_) => None,
        }
    }

    /// Returns the port for IP-based endpoints.
    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Tcp(e) => Some(e.port),
            Endpoint::Udp(e) => Some(e.port),
            Endpoint::Ws(e) => Some(e.inner.port),
            Endpoint::Opaque(_) => None,
        }
    }

    /// Returns true if both endpoints would reach the same server, ignoring
    /// timeout, compression and connection id.
    pub fn equivalent(&self, other: &Endpoint) -> bool {
        match (self, other) {
            (Endpoint::Tcp(a), Endpoint::Tcp(b)) => a.equivalent(b),
            (Endpoint::Udp(a), Endpoint::Udp(b)) => a.equivalent(b),
            (Endpoint::Ws(a), Endpoint::Ws(b)) => a.inner.equivalent(&b.inner),
            (Endpoint::Opaque(a), Endpoint::Opaque(b)) => a == b,
            _ => false,
        }
    }

    /// Resolves the host and delivers the connectors to `callback`.
    ///
    /// Non-numeric hosts are resolved on the resolver thread; the callback
    /// may run on that thread.
    pub fn connectors_async<F>(&self, resolver: &EndpointHostResolver, callback: F)
    where
        F: FnOnce(Result<Vec<Connector>>) + Send + 'static,
    {
        match self {
            Endpoint::Tcp(e) => {
                let e = e.clone();
                let (host, port) = (e.host.clone(), e.port);
                resolver.resolve(&host, port, false, move |addrs| {
                    callback(addrs.map(|addrs| {
                        addrs
                            .into_iter()
                            .map(|addr| Connector::Tcp(e.connector(addr)))
                            .collect()
                    }))
                });
            }
            Endpoint::Udp(e) => {
                let e = e.clone();
                let (host, port) = (e.host.clone(), e.port);
                resolver.resolve(&host, port, false, move |addrs| {
                    callback(addrs.map(|addrs| {
                        addrs
                            .into_iter()
                            .map(|addr| Connector::Udp(e.connector(addr)))
                            .collect()
                    }))
                });
            }
            Endpoint::Ws(e) => {
                let e = e.clone();
                let (host, port) = (e.inner.host.clone(), e.inner.port);
                resolver.resolve(&host, port, false, move |addrs| {
                    callback(addrs.map(|addrs| {
                        addrs
                            .into_iter()
                            .map(|addr| Connector::Ws(e.connector(addr)))
                            .collect()
                    }))
                });
            }
            Endpoint::Opaque(_) => callback(Ok(Vec::new())),
        }
    }

    /// Resolves the host and returns the connectors.
    pub async fn connectors(&self, resolver: &EndpointHostResolver) -> Result<Vec<Connector>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.connectors_async(resolver, move |result| {
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| IceError::CommunicatorDestroyed)?
    }

    /// Binds a listening acceptor for connection-oriented transports.
    ///
    /// Returns `None` for datagram and opaque endpoints.
    pub async fn acceptor(
        &self,
        resolver: &EndpointHostResolver,
        max_message_size: usize,
    ) -> Result<Option<Box<dyn Acceptor>>> {
        match self {
            Endpoint::Tcp(e) => Ok(Some(Box::new(e.acceptor(resolver, max_message_size).await?))),
            Endpoint::Ws(e) => Ok(Some(Box::new(e.acceptor(resolver, max_message_size).await?))),
            Endpoint::Udp(_) | Endpoint::Opaque(_) => Ok(None),
        }
    }

    /// Binds a server-side transceiver for connectionless transports.
    ///
    /// Returns the transceiver together with the endpoint it was bound to.
    pub async fn transceiver(
        &self,
        resolver: &EndpointHostResolver,
    ) -> Result<Option<(Box<dyn Transceiver>, Endpoint)>> {
        match self {
            Endpoint::Udp(e) => {
                let (transceiver, bound) = e.bind(resolver).await?;
                Ok(Some((Box::new(transceiver), Endpoint::Udp(bound))))
            }
            _ => Ok(None),
        }
    }
}

impl Marshal for Endpoint {
    fn marshal(&self, os: &mut OutputStream) {
        if let Endpoint::Opaque(e) = self {
            e.marshal(os);
            return;
        }
        os.write_i16(self.type_code());
        os.start_encapsulation(os.encoding());
        match self {
            Endpoint::Tcp(e) => e.write_body(os),
            Endpoint::Udp(e) => e.write_body(os),
            Endpoint::Ws(e) => e.write_body(os),
            Endpoint::Opaque(_) => {}
        }
        os.end_encapsulation();
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(e) => write!(f, "tcp{}", e.options()),
            Endpoint::Udp(e) => write!(f, "udp{}", e.options()),
            Endpoint::Ws(e) => write!(f, "ws{}", e.options()),
            Endpoint::Opaque(e) => write!(f, "{e}"),
        }
    }
}

/// Creates endpoints of one transport from strings and streams.
pub trait EndpointFactory: Send + Sync + fmt::Debug {
    /// Returns the wire type code handled by this factory.
    fn type_code(&self) -> i16;

    /// Returns the protocol name handled by this factory.
    fn protocol(&self) -> &str;

    /// Creates an endpoint from the option tokens following the protocol.
    ///
    /// `oa_endpoint` is true for object adapter endpoints, which may leave
    /// the host empty to listen on every interface.
    fn create(&self, args: &[String], oa_endpoint: bool) -> Result<Endpoint>;

    /// Reads the endpoint body from inside its encapsulation.
    fn read(&self, is: &mut InputStream) -> Result<Endpoint>;
}

/// Registry of endpoint factories keyed by type code.
#[derive(Debug)]
pub struct EndpointFactoryManager {
    factories: Mutex<BTreeMap<i16, Arc<dyn EndpointFactory>>>,
    default_protocol: String,
}

impl EndpointFactoryManager {
    /// Creates an empty registry.
    pub fn new(default_protocol: impl Into<String>) -> Self {
        Self {
            factories: Mutex::new(BTreeMap::new()),
            default_protocol: default_protocol.into(),
        }
    }

    /// Creates a registry with the TCP, UDP and WS factories.
    pub fn with_builtin(default_protocol: impl Into<String>, defaults: EndpointDefaults) -> Self {
        let manager = Self::new(default_protocol);
        manager.add(Arc::new(TcpEndpointFactory::new(defaults.clone())));
        manager.add(Arc::new(UdpEndpointFactory::new(defaults.clone())));
        manager.add(Arc::new(WsEndpointFactory::new(defaults)));
        manager
    }

    /// Registers a factory, replacing any factory for the same type code.
    pub fn add(&self, factory: Arc<dyn EndpointFactory>) {
        self.factories.lock().insert(factory.type_code(), factory);
    }

    /// Returns the factory for a type code.
    pub fn get(&self, type_code: i16) -> Option<Arc<dyn EndpointFactory>> {
        self.factories.lock().get(&type_code).cloned()
    }

    fn by_protocol(&self, protocol: &str) -> Option<Arc<dyn EndpointFactory>> {
        self.factories
            .lock()
            .values()
            .find(|f| f.protocol() == protocol)
            .cloned()
    }

    /// Parses an endpoint string such as `tcp -h localhost -p 10000`.
    pub fn create(&self, s: &str, oa_endpoint: bool) -> Result<Endpoint> {
        self.try_create(s, oa_endpoint)?.ok_or_else(|| {
            IceError::EndpointParse(format!("unknown protocol in `{}`", s.trim()))
        })
    }

    /// Like [`create`](Self::create), but returns `None` if no factory
    /// handles the protocol.
    pub fn try_create(&self, s: &str, oa_endpoint: bool) -> Result<Option<Endpoint>> {
        let mut args = split_options(s)?;
        if args.is_empty() {
            return Err(IceError::EndpointParse("value has no non-whitespace characters".into()));
        }
        let mut protocol = args.remove(0);
        if protocol == "default" {
            protocol = self.default_protocol.clone();
        }

        if let Some(factory) = self.by_protocol(&protocol) {
            return factory.create(&args, oa_endpoint).map(Some);
        }

        let has_option = |name: &str| args.iter().any(|a| a == name);
        if protocol == "opaque" || (has_option("-t") && has_option("-v")) {
            let opaque = OpaqueEndpoint::parse(&args)?;
            return self.convert_opaque(opaque).map(Some);
        }

        Ok(None)
    }

    /// Re-reads an opaque endpoint whose type code has a registered factory.
    fn convert_opaque(&self, opaque: OpaqueEndpoint) -> Result<Endpoint> {
        let Some(factory) = self.get(opaque.type_code()) else {
            return Ok(Endpoint::Opaque(opaque));
        };
        let mut os = OutputStream::new();
        opaque.marshal(&mut os);
        let mut is = InputStream::new(os.finished());
        is.read_i16()?;
        is.start_encapsulation()?;
        let endpoint = factory.read(&mut is)?;
        is.end_encapsulation()?;
        Ok(endpoint)
    }

    /// Reads a type code and endpoint from the stream.
    ///
    /// Unknown type codes produce opaque endpoints.
    pub fn read(&self, is: &mut InputStream) -> Result<Endpoint> {
        let type_code = is.read_i16()?;
        match self.get(type_code) {
            Some(factory) => {
                is.start_encapsulation()?;
                let endpoint = factory.read(is)?;
                is.end_encapsulation()?;
                Ok(endpoint)
            }
            None => Ok(Endpoint::Opaque(OpaqueEndpoint::read(type_code, is)?)),
        }
    }
}

/// Splits an endpoint string on whitespace, honoring single and double
/// quotes.
pub(crate) fn split_options(s: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for c in s.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    out.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err(IceError::EndpointParse(format!("mismatched quotes in `{s}`")));
    }
    if in_token {
        out.push(current);
    }
    Ok(out)
}

/// Walks `-opt [arg]` pairs. An argument is the next token unless it starts
/// with `-`.
pub(crate) fn for_each_option<F>(args: &[String], mut f: F) -> Result<()>
where
    F: FnMut(&str, Option<&str>) -> Result<bool>,
{
    let mut i = 0;
    while i < args.len() {
        let option = &args[i];
        if !option.starts_with('-') {
            return Err(IceError::EndpointParse(format!(
                "expected an option but found `{option}`"
            )));
        }
        let argument = args
            .get(i + 1)
            .filter(|a| !a.starts_with('-'))
            .map(String::as_str);
        if argument.is_some() {
            i += 1;
        }
        if !f(option, argument)? {
            return Err(IceError::EndpointParse(format!("unrecognized option `{option}`")));
        }
        i += 1;
    }
    Ok(())
}

pub(crate) fn require_argument<'a>(option: &str, argument: Option<&'a str>) -> Result<&'a str> {
    argument.ok_or_else(|| {
        IceError::EndpointParse(format!("no argument provided for `{option}` option"))
    })
}

/// Quotes values containing `:` so they survive proxy string splitting.
pub(crate) fn quote_if_needed(s: &str) -> String {
    if s.contains(':') {
        format!("\"{s}\"")
    } else {
        s.to_string()
    }
}

pub(crate) fn parse_encoding(option: &str, s: &str) -> Result<EncodingVersion> {
    s.parse().map_err(|_| {
        IceError::EndpointParse(format!("invalid encoding version `{s}` for `{option}`"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> EndpointFactoryManager {
        EndpointFactoryManager::with_builtin("tcp", EndpointDefaults::default())
    }

    fn roundtrip_string(s: &str) {
        let m = manager();
        let first = m.create(s, false).unwrap();
        let printed = first.to_string();
        let second = m.create(&printed, false).unwrap();
        assert_eq!(first, second, "{s} -> {printed}");
        assert_eq!(printed, second.to_string());
    }

    #[test]
    fn test_split_options_with_quotes() {
        let args = split_options("tcp -h \"::1\" -p 10").unwrap();
        assert_eq!(args, vec!["tcp", "-h", "::1", "-p", "10"]);
        assert!(split_options("tcp -h \"oops").is_err());
    }

    #[test]
    fn test_string_roundtrip_is_stable() {
        for s in [
            "tcp -h localhost -p 10000",
            "tcp -h 127.0.0.1 -p 4061 -t infinite -z",
            "tcp -h \"::1\" -p 1 -t 500",
            "udp -h 239.255.0.1 -p 10000 --ttl 5 --interface eth0 -c",
            "ws -h example.com -p 80 -r /chat",
            "opaque -t 99 -e 1.1 -v AQIDBA==",
            "default -h localhost -p 5",
        ] {
            roundtrip_string(s);
        }
    }

    #[test]
    fn test_default_protocol() {
        let e = manager().create("default -p 7", false).unwrap();
        assert_eq!(e.protocol(), "tcp");
        assert_eq!(e.port(), Some(7));
    }

    #[test]
    fn test_unknown_protocol_with_opaque_options() {
        let e = manager().create("foo -t 42 -v AAEC", false).unwrap();
        match e {
            Endpoint::Opaque(o) => {
                assert_eq!(o.type_code(), 42);
                assert_eq!(&o.raw_bytes()[..], &[0, 1, 2]);
            }
            other => panic!("expected opaque, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_protocol_without_options_fails() {
        assert!(matches!(
            manager().create("foo -h x", false),
            Err(IceError::EndpointParse(_))
        ));
    }

    #[test]
    fn test_opaque_with_known_type_is_converted() {
        let m = manager();
        let tcp = m.create("tcp -h host -p 12 -t 100", false).unwrap();
        let mut os = OutputStream::new();
        tcp.marshal(&mut os);
        let mut is = InputStream::new(os.finished());
        is.read_i16().unwrap();
        let (enc, body) = is.read_encapsulation().unwrap();

        let opaque = OpaqueEndpoint::new(TCP_ENDPOINT_TYPE, enc, body);
        let converted = m.create(&opaque.to_string(), false).unwrap();
        assert_eq!(converted, tcp);
    }

    #[test]
    fn test_marshal_roundtrip_known_types() {
        let m = manager();
        for s in [
            "tcp -h a -p 1 -t 3",
            "udp -h b -p 2 -z",
            "ws -h c -p 3 -r /x",
        ] {
            let e = m.create(s, false).unwrap();
            let mut os = OutputStream::new();
            e.marshal(&mut os);
            let mut is = InputStream::new(os.finished());
            assert_eq!(m.read(&mut is).unwrap(), e);
            assert!(is.is_empty());
        }
    }

    #[test]
    fn test_unknown_type_code_roundtrips_as_opaque() {
        let m = manager();
        let mut os = OutputStream::new();
        os.write_i16(77);
        os.write_encapsulation(EncodingVersion::new(1, 0), &[9, 8, 7]);
        let wire = os.finished();

        let mut is = InputStream::new(wire.clone());
        let e = m.read(&mut is).unwrap();
        assert_eq!(e.type_code(), 77);

        let mut out = OutputStream::new();
        e.marshal(&mut out);
        assert_eq!(out.finished(), wire);
    }

    #[test]
    fn test_mutators_return_new_values() {
        let e = manager().create("tcp -h a -p 1 -t 10", false).unwrap();
        let changed = e.with_timeout(20).with_compress(true).with_connection_id("c");
        assert_eq!(e.timeout(), 10);
        assert_eq!(changed.timeout(), 20);
        assert!(changed.compress());
        assert_eq!(changed.connection_id(), "c");
        assert!(e.equivalent(&changed));
        assert_ne!(e, changed);
    }

    #[test]
    fn test_total_order() {
        let m = manager();
        let mut eps = vec![
            m.create("udp -h a -p 1", false).unwrap(),
            m.create("tcp -h b -p 1", false).unwrap(),
            m.create("tcp -h a -p 2", false).unwrap(),
        ];
        eps.sort();
        assert_eq!(eps[0].to_string(), "tcp -h a -p 2 -t 60000");
        assert_eq!(eps[2].protocol(), "udp");
    }
}
