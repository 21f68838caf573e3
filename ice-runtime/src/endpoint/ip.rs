//! TCP and UDP endpoints.

use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};

use ice_core::protocol::ENCODING_1_0;
use ice_core::{IceError, InputStream, OutputStream, Result};

use super::connector::{TcpConnector, UdpConnector};
use super::resolver::EndpointHostResolver;
use super::{
    for_each_option, quote_if_needed, require_argument, Endpoint, EndpointDefaults,
    EndpointFactory, INFINITE_TIMEOUT, TCP_ENDPOINT_TYPE, UDP_ENDPOINT_TYPE,
};
use crate::transport::{TcpAcceptor, UdpTransceiver};

/// Options shared by every IP-based endpoint.
struct IpOptions {
    host: Option<String>,
    port: u16,
    source_address: Option<IpAddr>,
}

impl IpOptions {
    fn new() -> Self {
        Self {
            host: None,
            port: 0,
            source_address: None,
        }
    }

    /// Handles `-h`, `-p` and `--sourceAddress`. Returns false for other
    /// options.
    fn check_option(&mut self, option: &str, argument: Option<&str>) -> Result<bool> {
        match option {
            "-h" => {
                self.host = Some(require_argument(option, argument)?.to_string());
            }
            "-p" => {
                let arg = require_argument(option, argument)?;
                self.port = arg.parse::<u16>().map_err(|_| {
                    IceError::EndpointParse(format!("invalid port value `{arg}`"))
                })?;
            }
            "--sourceAddress" => {
                let arg = require_argument(option, argument)?;
                let addr = arg.parse::<IpAddr>().map_err(|_| {
                    IceError::EndpointParse(format!("invalid IP address `{arg}` for --sourceAddress"))
                })?;
                self.source_address = Some(addr);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn finish(self, oa_endpoint: bool, defaults: &EndpointDefaults) -> Result<(String, u16, Option<IpAddr>)> {
        let host = match self.host {
            Some(h) if h == "*" => {
                if oa_endpoint {
                    String::new()
                } else {
                    return Err(IceError::EndpointParse(
                        "`-h *` is only valid for object adapter endpoints".into(),
                    ));
                }
            }
            Some(h) => h,
            None => defaults.host.clone().unwrap_or_default(),
        };
        if oa_endpoint && self.source_address.is_some() {
            return Err(IceError::EndpointParse(
                "`--sourceAddress` is not valid for object adapter endpoints".into(),
            ));
        }
        Ok((host, self.port, self.source_address))
    }
}

fn write_ip_options(s: &mut String, host: &str, port: u16, source: Option<IpAddr>) {
    if !host.is_empty() {
        let _ = write!(s, " -h {}", quote_if_needed(host));
    }
    let _ = write!(s, " -p {port}");
    if let Some(addr) = source {
        let _ = write!(s, " --sourceAddress {}", quote_if_needed(&addr.to_string()));
    }
}

fn parse_timeout(option: &str, argument: Option<&str>) -> Result<i32> {
    let arg = require_argument(option, argument)?;
    if arg == "infinite" {
        return Ok(INFINITE_TIMEOUT);
    }
    match arg.parse::<i32>() {
        Ok(t) if t >= 1 => Ok(t),
        _ => Err(IceError::EndpointParse(format!("invalid timeout value `{arg}`"))),
    }
}

fn read_port(is: &mut InputStream) -> Result<u16> {
    let port = is.read_i32()?;
    u16::try_from(port).map_err(|_| IceError::marshal(format!("invalid port {port}")))
}

/// A TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TcpEndpoint {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) source_address: Option<IpAddr>,
    pub(crate) timeout: i32,
    pub(crate) compress: bool,
    pub(crate) connection_id: String,
}

impl TcpEndpoint {
    /// Creates an endpoint for `host:port` with the given timeout.
    pub fn new(host: impl Into<String>, port: u16, timeout: i32) -> Self {
        Self {
            host: host.into(),
            port,
            source_address: None,
            timeout,
            compress: false,
            connection_id: String::new(),
        }
    }

    pub(crate) fn parse(args: &[String], oa_endpoint: bool, defaults: &EndpointDefaults) -> Result<Self> {
        let mut ip = IpOptions::new();
        let mut timeout = None;
        let mut compress = false;
        for_each_option(args, |option, argument| {
            if ip.check_option(option, argument)? {
                return Ok(true);
            }
            match option {
                "-t" => timeout = Some(parse_timeout(option, argument)?),
                "-z" => {
                    if argument.is_some() {
                        return Err(IceError::EndpointParse(
                            "unexpected argument supplied with `-z` option".into(),
                        ));
                    }
                    compress = true;
                }
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        let (host, port, source_address) = ip.finish(oa_endpoint, defaults)?;
        Ok(Self {
            host,
            port,
            source_address,
            timeout: timeout.unwrap_or(defaults.timeout),
            compress,
            connection_id: String::new(),
        })
    }

    pub(crate) fn read_body(is: &mut InputStream) -> Result<Self> {
        let host = is.read_string()?;
        let port = read_port(is)?;
        let timeout = is.read_i32()?;
        let compress = is.read_bool()?;
        Ok(Self {
            host,
            port,
            source_address: None,
            timeout,
            compress,
            connection_id: String::new(),
        })
    }

    pub(crate) fn write_body(&self, os: &mut OutputStream) {
        os.write_string(&self.host);
        os.write_i32(i32::from(self.port));
        os.write_i32(self.timeout);
        os.write_bool(self.compress);
    }

    pub(crate) fn options(&self) -> String {
        let mut s = String::new();
        write_ip_options(&mut s, &self.host, self.port, self.source_address);
        if self.timeout == INFINITE_TIMEOUT {
            s.push_str(" -t infinite");
        } else {
            let _ = write!(s, " -t {}", self.timeout);
        }
        if self.compress {
            s.push_str(" -z");
        }
        s
    }

    pub(crate) fn equivalent(&self, other: &TcpEndpoint) -> bool {
        self.host == other.host && self.port == other.port && self.source_address == other.source_address
    }

    pub(crate) fn connector(&self, addr: SocketAddr) -> TcpConnector {
        TcpConnector {
            addr,
            source_address: self.source_address,
            timeout: self.timeout,
            connection_id: self.connection_id.clone(),
        }
    }

    pub(crate) fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    pub(crate) async fn acceptor(
        &self,
        resolver: &EndpointHostResolver,
        max_message_size: usize,
    ) -> Result<TcpAcceptor> {
        let addr = resolver.resolve_bind_address(&self.host, self.port).await?;
        TcpAcceptor::bind(addr, self.clone(), max_message_size).await
    }
}

/// Creates TCP endpoints.
#[derive(Debug, Clone, Default)]
pub struct TcpEndpointFactory {
    defaults: EndpointDefaults,
}

impl TcpEndpointFactory {
    /// Creates a factory using the given defaults.
    pub fn new(defaults: EndpointDefaults) -> Self {
        Self { defaults }
    }
}

impl EndpointFactory for TcpEndpointFactory {
    fn type_code(&self) -> i16 {
        TCP_ENDPOINT_TYPE
    }

    fn protocol(&self) -> &str {
        "tcp"
    }

    fn create(&self, args: &[String], oa_endpoint: bool) -> Result<Endpoint> {
        Ok(Endpoint::Tcp(TcpEndpoint::parse(args, oa_endpoint, &self.defaults)?))
    }

    fn read(&self, is: &mut InputStream) -> Result<Endpoint> {
        Ok(Endpoint::Tcp(TcpEndpoint::read_body(is)?))
    }
}

/// A UDP endpoint, possibly multicast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UdpEndpoint {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) source_address: Option<IpAddr>,
    pub(crate) mcast_interface: String,
    pub(crate) mcast_ttl: i32,
    pub(crate) connect: bool,
    pub(crate) compress: bool,
    pub(crate) connection_id: String,
}

impl UdpEndpoint {
    pub(crate) fn parse(args: &[String], oa_endpoint: bool, defaults: &EndpointDefaults) -> Result<Self> {
        let mut ip = IpOptions::new();
        let mut mcast_interface = String::new();
        let mut mcast_ttl = -1;
        let mut connect = false;
        let mut compress = false;
        for_each_option(args, |option, argument| {
            if ip.check_option(option, argument)? {
                return Ok(true);
            }
            match option {
                "-c" | "-z" => {
                    if argument.is_some() {
                        return Err(IceError::EndpointParse(format!(
                            "unexpected argument supplied with `{option}` option"
                        )));
                    }
                    if option == "-c" {
                        connect = true;
                    } else {
                        compress = true;
                    }
                }
                "--ttl" => {
                    let arg = require_argument(option, argument)?;
                    mcast_ttl = match arg.parse::<i32>() {
                        Ok(t) if t >= 0 => t,
                        _ => {
                            return Err(IceError::EndpointParse(format!(
                                "invalid TTL value `{arg}`"
                            )))
                        }
                    };
                }
                "--interface" => {
                    mcast_interface = require_argument(option, argument)?.to_string();
                }
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        let (host, port, source_address) = ip.finish(oa_endpoint, defaults)?;
        Ok(Self {
            host,
            port,
            source_address,
            mcast_interface,
            mcast_ttl,
            connect,
            compress,
            connection_id: String::new(),
        })
    }

    pub(crate) fn read_body(is: &mut InputStream) -> Result<Self> {
        let host = is.read_string()?;
        let port = read_port(is)?;
        if is.encoding() == ENCODING_1_0 {
            is.read_blob(4)?;
        }
        let compress = is.read_bool()?;
        Ok(Self {
            host,
            port,
            source_address: None,
            mcast_interface: String::new(),
            mcast_ttl: -1,
            connect: false,
            compress,
            connection_id: String::new(),
        })
    }

    pub(crate) fn write_body(&self, os: &mut OutputStream) {
        os.write_string(&self.host);
        os.write_i32(i32::from(self.port));
        if os.encoding() == ENCODING_1_0 {
            // protocol 1.0, encoding 1.0
            os.write_blob(&[1, 0, 1, 0]);
        }
        os.write_bool(self.compress);
    }

    pub(crate) fn options(&self) -> String {
        let mut s = String::new();
        write_ip_options(&mut s, &self.host, self.port, self.source_address);
        if !self.mcast_interface.is_empty() {
            let _ = write!(s, " --interface {}", quote_if_needed(&self.mcast_interface));
        }
        if self.mcast_ttl != -1 {
            let _ = write!(s, " --ttl {}", self.mcast_ttl);
        }
        if self.connect {
            s.push_str(" -c");
        }
        if self.compress {
            s.push_str(" -z");
        }
        s
    }

    pub(crate) fn equivalent(&self, other: &UdpEndpoint) -> bool {
        self.host == other.host && self.port == other.port && self.source_address == other.source_address
    }

    pub(crate) fn connector(&self, addr: SocketAddr) -> UdpConnector {
        UdpConnector {
            addr,
            source_address: self.source_address,
            mcast_interface: self.mcast_interface.clone(),
            mcast_ttl: self.mcast_ttl,
            connection_id: self.connection_id.clone(),
        }
    }

    pub(crate) async fn bind(&self, resolver: &EndpointHostResolver) -> Result<(UdpTransceiver, UdpEndpoint)> {
        let addr = resolver.resolve_bind_address(&self.host, self.port).await?;
        let transceiver = UdpTransceiver::bind(addr).await?;
        let bound = UdpEndpoint {
            port: transceiver.local_port()?,
            ..self.clone()
        };
        Ok((transceiver, bound))
    }
}

/// Creates UDP endpoints.
#[derive(Debug, Clone, Default)]
pub struct UdpEndpointFactory {
    defaults: EndpointDefaults,
}

impl UdpEndpointFactory {
    /// Creates a factory using the given defaults.
    pub fn new(defaults: EndpointDefaults) -> Self {
        Self { defaults }
    }
}

impl EndpointFactory for UdpEndpointFactory {
    fn type_code(&self) -> i16 {
        UDP_ENDPOINT_TYPE
    }

    fn protocol(&self) -> &str {
        "udp"
    }

    fn create(&self, args: &[String], oa_endpoint: bool) -> Result<Endpoint> {
        Ok(Endpoint::Udp(UdpEndpoint::parse(args, oa_endpoint, &self.defaults)?))
    }

    fn read(&self, is: &mut InputStream) -> Result<Endpoint> {
        Ok(Endpoint::Udp(UdpEndpoint::read_body(is)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::split_options;

    fn tcp(s: &str, oa: bool) -> Result<TcpEndpoint> {
        TcpEndpoint::parse(&split_options(s).unwrap(), oa, &EndpointDefaults::default())
    }

    #[test]
    fn test_tcp_options() {
        let e = tcp("-h host -p 4061 -t 250 -z", false).unwrap();
        assert_eq!(e.host, "host");
        assert_eq!(e.port, 4061);
        assert_eq!(e.timeout, 250);
        assert!(e.compress);
    }

    #[test]
    fn test_tcp_defaults_apply() {
        let defaults = EndpointDefaults {
            host: Some("default-host".into()),
            timeout: 1234,
        };
        let e = TcpEndpoint::parse(&split_options("-p 1").unwrap(), false, &defaults).unwrap();
        assert_eq!(e.host, "default-host");
        assert_eq!(e.timeout, 1234);
    }

    #[test]
    fn test_tcp_invalid_values() {
        assert!(tcp("-p 70000", false).is_err());
        assert!(tcp("-t 0", false).is_err());
        assert!(tcp("-t", false).is_err());
        assert!(tcp("-x", false).is_err());
        assert!(tcp("-z yes", false).is_err());
    }

    #[test]
    fn test_wildcard_host_only_for_adapters() {
        assert!(tcp("-h * -p 1", false).is_err());
        assert_eq!(tcp("-h * -p 1", true).unwrap().host, "");
    }

    #[test]
    fn test_source_address() {
        let e = tcp("-h a -p 1 --sourceAddress 10.0.0.2", false).unwrap();
        assert_eq!(e.source_address, Some("10.0.0.2".parse().unwrap()));
        assert!(e.options().contains("--sourceAddress 10.0.0.2"));
        assert!(tcp("-p 1 --sourceAddress 10.0.0.2", true).is_err());
    }

    #[test]
    fn test_udp_options() {
        let e = UdpEndpoint::parse(
            &split_options("-h 239.1.1.1 -p 9 --ttl 3 --interface lo -c").unwrap(),
            false,
            &EndpointDefaults::default(),
        )
        .unwrap();
        assert_eq!(e.mcast_ttl, 3);
        assert_eq!(e.mcast_interface, "lo");
        assert!(e.connect);
    }

    #[test]
    fn test_udp_rejects_timeout_option() {
        assert!(UdpEndpoint::parse(
            &split_options("-h a -p 1 -t 10").unwrap(),
            false,
            &EndpointDefaults::default()
        )
        .is_err());
    }

    #[test]
    fn test_udp_body_with_encoding_1_0() {
        let e = UdpEndpoint::parse(
            &split_options("-h a -p 5 -z").unwrap(),
            false,
            &EndpointDefaults::default(),
        )
        .unwrap();
        let mut os = OutputStream::with_encoding(ENCODING_1_0);
        e.write_body(&mut os);
        // host(2) + port(4) + versions(4) + compress(1)
        assert_eq!(os.len(), 11);
        let mut is = InputStream::with_encoding(os.finished(), ENCODING_1_0);
        let read = UdpEndpoint::read_body(&mut is).unwrap();
        assert_eq!(read.port, 5);
        assert!(read.compress);
    }

    #[test]
    fn test_tcp_body_layout() {
        let e = TcpEndpoint::new("h", 258, -1);
        let mut os = OutputStream::new();
        e.write_body(&mut os);
        assert_eq!(
            os.as_bytes(),
            &[1, b'h', 2, 1, 0, 0, 0xff, 0xff, 0xff, 0xff, 0]
        );
    }
}
