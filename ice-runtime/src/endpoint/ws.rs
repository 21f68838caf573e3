//! WebSocket endpoints, composed over a TCP endpoint.

use std::fmt::Write as _;
use std::net::SocketAddr;

use ice_core::{IceError, InputStream, OutputStream, Result};

use super::connector::WsConnector;
use super::ip::TcpEndpoint;
use super::resolver::EndpointHostResolver;
use super::{quote_if_needed, split_options, Endpoint, EndpointDefaults, EndpointFactory, WS_ENDPOINT_TYPE};
use crate::transport::WsAcceptor;

/// A WebSocket endpoint: the TCP binding plus the HTTP resource path used
/// in the upgrade request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WsEndpoint {
    pub(crate) inner: TcpEndpoint,
    pub(crate) resource: String,
}

impl WsEndpoint {
    /// Creates a WebSocket endpoint over `inner`.
    pub fn new(inner: TcpEndpoint, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        Self {
            inner,
            resource: if resource.is_empty() { "/".to_string() } else { resource },
        }
    }

    /// Returns the resource path.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub(crate) fn parse(args: &[String], oa_endpoint: bool, defaults: &EndpointDefaults) -> Result<Self> {
        let mut rest = Vec::with_capacity(args.len());
        let mut resource = None;
        let mut i = 0;
        while i < args.len() {
            if args[i] == "-r" {
                let arg = args
                    .get(i + 1)
                    .filter(|a| !a.starts_with('-'))
                    .ok_or_else(|| {
                        IceError::EndpointParse("no argument provided for `-r` option".into())
                    })?;
                resource = Some(arg.clone());
                i += 2;
            } else {
                rest.push(args[i].clone());
                i += 1;
            }
        }
        let inner = TcpEndpoint::parse(&rest, oa_endpoint, defaults)?;
        Ok(Self::new(inner, resource.unwrap_or_default()))
    }

    pub(crate) fn read_body(is: &mut InputStream) -> Result<Self> {
        let inner = TcpEndpoint::read_body(is)?;
        let resource = is.read_string()?;
        Ok(Self::new(inner, resource))
    }

    pub(crate) fn write_body(&self, os: &mut OutputStream) {
        self.inner.write_body(os);
        os.write_string(&self.resource);
    }

    pub(crate) fn options(&self) -> String {
        let mut s = self.inner.options();
        if !self.resource.is_empty() {
            let _ = write!(s, " -r {}", quote_if_needed(&self.resource));
        }
        s
    }

    pub(crate) fn connector(&self, addr: SocketAddr) -> WsConnector {
        WsConnector {
            tcp: self.inner.connector(addr),
            host: self.inner.host.clone(),
            resource: self.resource.clone(),
        }
    }

    pub(crate) async fn acceptor(
        &self,
        resolver: &EndpointHostResolver,
        max_message_size: usize,
    ) -> Result<WsAcceptor> {
        let tcp = self.inner.acceptor(resolver, max_message_size).await?;
        Ok(WsAcceptor::new(tcp, self.resource.clone()))
    }
}

/// Creates WebSocket endpoints.
#[derive(Debug, Clone, Default)]
pub struct WsEndpointFactory {
    defaults: EndpointDefaults,
}

impl WsEndpointFactory {
    /// Creates a factory using the given defaults.
    pub fn new(defaults: EndpointDefaults) -> Self {
        Self { defaults }
    }

    /// Parses a WebSocket endpoint from its option string (without the
    /// leading protocol token).
    pub fn parse(&self, options: &str) -> Result<WsEndpoint> {
        WsEndpoint::parse(&split_options(options)?, false, &self.defaults)
    }
}

impl EndpointFactory for WsEndpointFactory {
    fn type_code(&self) -> i16 {
        WS_ENDPOINT_TYPE
    }

    fn protocol(&self) -> &str {
        "ws"
    }

    fn create(&self, args: &[String], oa_endpoint: bool) -> Result<Endpoint> {
        Ok(Endpoint::Ws(WsEndpoint::parse(args, oa_endpoint, &self.defaults)?))
    }

    fn read(&self, is: &mut InputStream) -> Result<Endpoint> {
        Ok(Endpoint::Ws(WsEndpoint::read_body(is)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_defaults_to_root() {
        let e = WsEndpointFactory::default().parse("-h a -p 80").unwrap();
        assert_eq!(e.resource(), "/");
        assert!(e.options().ends_with("-r /"));
    }

    #[test]
    fn test_resource_option() {
        let e = WsEndpointFactory::default()
            .parse("-h a -p 80 -r /ice -t 100")
            .unwrap();
        assert_eq!(e.resource(), "/ice");
        assert_eq!(e.inner.timeout, 100);
    }

    #[test]
    fn test_missing_resource_argument() {
        assert!(WsEndpointFactory::default().parse("-h a -r").is_err());
    }

    #[test]
    fn test_body_extends_tcp_body() {
        let e = WsEndpointFactory::default().parse("-h a -p 1 -r /x").unwrap();
        let mut tcp_os = OutputStream::new();
        e.inner.write_body(&mut tcp_os);
        let mut ws_os = OutputStream::new();
        e.write_body(&mut ws_os);
        assert!(ws_os.as_bytes().starts_with(tcp_os.as_bytes()));
        let mut is = InputStream::new(ws_os.finished());
        assert_eq!(WsEndpoint::read_body(&mut is).unwrap(), e);
    }
}
