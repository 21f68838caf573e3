use std::sync::{Arc, Weak};
use std::time::Duration;

use ice_core::protocol::{EncodingVersion, ProtocolVersion, ENCODING_1_0, PROTOCOL_1_0};
use ice_core::{Context, IceError, Identity, InputStream, Result};
use parking_lot::Mutex;

use super::{InvocationMode, Reference, ReferenceKind, RoutableData};
use crate::config::EndpointSelection;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::instance::Instance;
use crate::proxy::ObjectPrx;

fn proxy_parse(msg: impl Into<String>) -> IceError {
    IceError::ProxyParse(msg.into())
}

/// A tiny cursor over a proxy string that understands double quotes.
struct Scanner<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(s: &'a str) -> Self {
        Self { s, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.s[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    /// Reads a quoted token or a token ending at whitespace, `:` or `@`.
    fn token(&mut self) -> Result<String> {
        let rest = self.rest();
        if let Some(quoted) = rest.strip_prefix('"') {
            let mut out = String::new();
            let mut escaped = false;
            for (i, c) in quoted.char_indices() {
                match c {
                    _ if escaped => {
                        if c != '"' {
                            out.push('\\');
                        }
                        out.push(c);
                        escaped = false;
                    }
                    '\\' => escaped = true,
                    '"' => {
                        self.pos += 1 + i + 1;
                        return Ok(out);
                    }
                    _ => out.push(c),
                }
            }
            return Err(proxy_parse(format!("mismatched quotes in `{}`", self.s)));
        }
        let end = rest
            .find(|c: char| c.is_whitespace() || c == ':' || c == '@')
            .unwrap_or(rest.len());
        self.pos += end;
        Ok(rest[..end].to_string())
    }
}

/// Splits `s` on `:` outside double quotes.
pub(crate) fn split_endpoints(s: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ':' if !quoted => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quoted {
        return Err(proxy_parse(format!("mismatched quotes in `{s}`")));
    }
    parts.push(&s[start..]);
    Ok(parts)
}

/// Creates references from strings, streams and connections, applying the
/// communicator's defaults.
pub struct ReferenceFactory {
    instance: Weak<Instance>,
    default_locator: Mutex<Option<ObjectPrx>>,
    default_router: Mutex<Option<ObjectPrx>>,
}

impl std::fmt::Debug for ReferenceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceFactory").finish_non_exhaustive()
    }
}

impl ReferenceFactory {
    pub(crate) fn new(instance: Weak<Instance>) -> Self {
        Self {
            instance,
            default_locator: Mutex::new(None),
            default_router: Mutex::new(None),
        }
    }

    fn instance(&self) -> Result<Arc<Instance>> {
        self.instance.upgrade().ok_or(IceError::CommunicatorDestroyed)
    }

    /// Sets the locator used by references created from now on.
    pub fn set_default_locator(&self, locator: Option<ObjectPrx>) {
        *self.default_locator.lock() = locator;
    }

    /// Sets the router used by references created from now on.
    pub fn set_default_router(&self, router: Option<ObjectPrx>) {
        *self.default_router.lock() = router;
    }

    pub fn default_locator(&self) -> Option<ObjectPrx> {
        self.default_locator.lock().clone()
    }

    pub fn default_router(&self) -> Option<ObjectPrx> {
        self.default_router.lock().clone()
    }

    /// Parses a stringified proxy. Returns `None` for an empty string or a
    /// null identity.
    ///
    /// With a `prefix`, properties such as `<prefix>.Locator` or
    /// `<prefix>.Context.<key>` override the defaults.
    pub fn create_from_string(&self, s: &str, prefix: Option<&str>) -> Result<Option<Reference>> {
        let instance = self.instance()?;
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }

        let mut scanner = Scanner::new(s);
        let identity: Identity = scanner.token()?.parse()?;
        if identity.name.is_empty() {
            scanner.skip_whitespace();
            if scanner.peek().is_some() {
                return Err(proxy_parse(format!("invalid characters after identity in `{s}`")));
            }
            return Ok(None);
        }

        let mut facet = String::new();
        let mut mode = InvocationMode::Twoway;
        let mut secure = false;
        let mut encoding = instance.config().default_encoding();
        let mut protocol = PROTOCOL_1_0;

        loop {
            scanner.skip_whitespace();
            match scanner.peek() {
                None | Some(':') | Some('@') => break,
                _ => {}
            }
            let option = scanner.token()?;
            if option.len() != 2 || !option.starts_with('-') {
                return Err(proxy_parse(format!("expected a proxy option but found `{option}` in `{s}`")));
            }

            scanner.skip_whitespace();
            let argument = match scanner.peek() {
                Some(c) if c != '-' && c != ':' && c != '@' => Some(scanner.token()?),
                _ => None,
            };
            let no_argument = |argument: &Option<String>| match argument {
                Some(a) => Err(proxy_parse(format!("unexpected argument `{a}` for option `{option}` in `{s}`"))),
                None => Ok(()),
            };
            let required = |argument: Option<String>| {
                argument.ok_or_else(|| proxy_parse(format!("no argument provided for option `{option}` in `{s}`")))
            };

            match option.as_str() {
                "-f" => facet = required(argument)?,
                "-t" => {
                    no_argument(&argument)?;
                    mode = InvocationMode::Twoway;
                }
                "-o" => {
                    no_argument(&argument)?;
                    mode = InvocationMode::Oneway;
                }
                "-O" => {
                    no_argument(&argument)?;
                    mode = InvocationMode::BatchOneway;
                }
                "-d" => {
                    no_argument(&argument)?;
                    mode = InvocationMode::Datagram;
                }
                "-D" => {
                    no_argument(&argument)?;
                    mode = InvocationMode::BatchDatagram;
                }
                "-s" => {
                    no_argument(&argument)?;
                    secure = true;
                }
                "-e" => {
                    let value = required(argument)?;
                    encoding = value
                        .parse::<EncodingVersion>()
                        .map_err(|_| proxy_parse(format!("invalid encoding version `{value}` in `{s}`")))?;
                }
                "-p" => {
                    let value = required(argument)?;
                    protocol = value
                        .parse::<ProtocolVersion>()
                        .map_err(|_| proxy_parse(format!("invalid protocol version `{value}` in `{s}`")))?;
                }
                _ => return Err(proxy_parse(format!("unknown option `{option}` in `{s}`"))),
            }
        }

        let mut endpoints = Vec::new();
        let mut adapter_id = String::new();
        match scanner.peek() {
            Some(':') => {
                let mut unknown = Vec::new();
                for part in split_endpoints(&scanner.rest()[1..])? {
                    if part.trim().is_empty() {
                        continue;
                    }
                    match instance.endpoint_factories().try_create(part, false)? {
                        Some(endpoint) => endpoints.push(endpoint),
                        None => {
                            tracing::warn!(endpoint = part.trim(), proxy = s, "ignoring endpoint with unknown protocol");
                            unknown.push(part.trim().to_string());
                        }
                    }
                }
                if endpoints.is_empty() {
                    return Err(IceError::EndpointParse(format!(
                        "no valid endpoint in `{s}`{}",
                        if unknown.is_empty() { String::new() } else { format!(" (unknown: {})", unknown.join(", ")) }
                    )));
                }
            }
            Some('@') => {
                scanner.pos += 1;
                scanner.skip_whitespace();
                if scanner.peek().is_none() {
                    return Err(proxy_parse(format!("missing adapter id in `{s}`")));
                }
                let quoted = scanner.peek() == Some('"');
                adapter_id = if quoted {
                    scanner.token()?
                } else {
                    let rest = scanner.rest().trim_end().to_string();
                    scanner.pos = s.len();
                    rest
                };
                scanner.skip_whitespace();
                if scanner.peek().is_some() {
                    return Err(proxy_parse(format!("invalid trailing characters after adapter id in `{s}`")));
                }
                if adapter_id.is_empty() {
                    return Err(proxy_parse(format!("empty adapter id in `{s}`")));
                }
            }
            _ => {}
        }

        let reference = self.create(
            &instance,
            identity,
            facet,
            mode,
            secure,
            protocol,
            encoding,
            endpoints,
            adapter_id,
            prefix,
        )?;
        Ok(Some(reference))
    }

    /// Reads a reference following an already-read identity. Returns `None`
    /// for a null identity.
    pub fn create_from_stream(&self, identity: Identity, is: &mut InputStream) -> Result<Option<Reference>> {
        if identity.is_null() {
            return Ok(None);
        }
        let instance = self.instance()?;
        let facet = match is.read_string_seq()?.as_slice() {
            [] => String::new(),
            [facet] => facet.clone(),
            _ => return Err(IceError::marshal("facet sequence with more than one element")),
        };
        let mode = InvocationMode::try_from(is.read_u8()?)?;
        let secure = is.read_bool()?;
        let (protocol, encoding) = if is.encoding() != ENCODING_1_0 {
            (is.read::<ProtocolVersion>()?, is.read::<EncodingVersion>()?)
        } else {
            (PROTOCOL_1_0, ENCODING_1_0)
        };

        let count = is.read_seq_size(2)?;
        let mut endpoints = Vec::with_capacity(count);
        for _ in 0..count {
            endpoints.push(instance.endpoint_factories().read(is)?);
        }
        let adapter_id = if count == 0 { is.read_string()? } else { String::new() };

        self.create(
            &instance, identity, facet, mode, secure, protocol, encoding, endpoints, adapter_id, None,
        )
        .map(Some)
    }

    /// Creates a twoway reference to `identity`. With no endpoints the
    /// reference is indirect and resolved through `adapter_id`, or by
    /// identity when `adapter_id` is empty.
    pub fn create_with_endpoints(
        &self,
        identity: Identity,
        endpoints: Vec<Endpoint>,
        adapter_id: impl Into<String>,
    ) -> Result<Reference> {
        if identity.is_null() {
            return Err(IceError::IllegalIdentity(identity.to_string()));
        }
        let instance = self.instance()?;
        let encoding = instance.config().default_encoding();
        self.create(
            &instance,
            identity,
            String::new(),
            InvocationMode::Twoway,
            false,
            PROTOCOL_1_0,
            encoding,
            endpoints,
            adapter_id.into(),
            None,
        )
    }

    /// Creates a reference bound to `connection`.
    pub fn create_fixed(&self, identity: Identity, connection: Arc<Connection>) -> Result<Reference> {
        let instance = self.instance()?;
        let mode = if connection.is_datagram() {
            InvocationMode::Datagram
        } else {
            InvocationMode::Twoway
        };
        Ok(Reference {
            identity,
            facet: String::new(),
            mode,
            secure: false,
            protocol: PROTOCOL_1_0,
            encoding: instance.config().default_encoding(),
            invocation_timeout: instance.config().default_invocation_timeout(),
            context: Arc::new(Context::new()),
            compress: None,
            kind: ReferenceKind::Fixed(connection),
            instance,
        })
    }

    /// Creates a direct or indirect reference with the communicator defaults.
    #[allow(clippy::too_many_arguments)]
    fn create(
        &self,
        instance: &Arc<Instance>,
        identity: Identity,
        facet: String,
        mode: InvocationMode,
        secure: bool,
        protocol: ProtocolVersion,
        encoding: EncodingVersion,
        endpoints: Vec<Endpoint>,
        adapter_id: String,
        prefix: Option<&str>,
    ) -> Result<Reference> {
        let config = instance.config();
        let locator_info = self
            .default_locator()
            .map(|locator| instance.locator_manager().get(&locator));
        let router_info = self
            .default_router()
            .map(|router| instance.router_manager().get(&router));

        let mut reference = Reference {
            instance: instance.clone(),
            identity,
            facet,
            mode,
            secure,
            protocol,
            encoding,
            invocation_timeout: config.default_invocation_timeout(),
            context: Arc::new(Context::new()),
            compress: None,
            kind: ReferenceKind::Routable(RoutableData {
                endpoints: Arc::new(endpoints),
                adapter_id,
                locator_info,
                router_info,
                collocation_optimized: config.collocation_optimized(),
                cache_connection: true,
                prefer_secure: config.prefer_secure(),
                endpoint_selection: config.endpoint_selection(),
                locator_cache_timeout: config.locator_cache_timeout(),
                connection_id: String::new(),
                timeout: None,
            }),
        };

        if let Some(prefix) = prefix {
            reference = self.apply_properties(instance, reference, prefix)?;
        }
        Ok(reference)
    }

    fn apply_properties(&self, instance: &Arc<Instance>, mut reference: Reference, prefix: &str) -> Result<Reference> {
        let properties = instance.properties();
        let key = |suffix: &str| format!("{prefix}.{suffix}");

        let locator = properties.get_property(&key("Locator"));
        if !locator.is_empty() {
            let locator = self
                .create_from_string(&locator, Some(&key("Locator")))?
                .map(ObjectPrx::new);
            let info = locator.map(|locator| instance.locator_manager().get(&locator));
            reference = reference.with_locator_info(info)?;
        }

        let router = properties.get_property(&key("Router"));
        if !router.is_empty() {
            let router_prefix = key("Router");
            if prefix.ends_with(".Router") {
                tracing::warn!(property = %router_prefix, "a router cannot have a router, ignoring the property");
            } else {
                let router = self
                    .create_from_string(&router, Some(&router_prefix))?
                    .map(ObjectPrx::new);
                let info = router.map(|router| instance.router_manager().get(&router));
                reference = reference.with_router_info(info)?;
            }
        }

        let bool_property = |suffix: &str, default: bool| {
            properties.get_property_as_int_with_default(&key(suffix), i32::from(default)) > 0
        };
        reference = reference
            .with_collocation_optimized(bool_property("CollocationOptimized", reference.collocation_optimized()))?
            .with_cache_connection(bool_property("ConnectionCached", reference.cache_connection()))?
            .with_prefer_secure(bool_property("PreferSecure", reference.prefer_secure()))?;

        let selection = properties.get_property(&key("EndpointSelection"));
        if !selection.is_empty() {
            match selection.parse::<EndpointSelection>() {
                Ok(selection) => reference = reference.with_endpoint_selection(selection)?,
                Err(err) => tracing::warn!(property = %key("EndpointSelection"), error = %err, "ignoring invalid value"),
            }
        }

        let ttl = properties.get_property_as_int_with_default(&key("LocatorCacheTimeout"), reference.locator_cache_timeout());
        if ttl < -1 {
            tracing::warn!(property = %key("LocatorCacheTimeout"), value = ttl, "invalid value, using -1");
            reference = reference.with_locator_cache_timeout(-1)?;
        } else {
            reference = reference.with_locator_cache_timeout(ttl)?;
        }

        let timeout_key = key("InvocationTimeout");
        if properties.contains(&timeout_key) {
            let ms = properties.get_property_as_int(&timeout_key);
            reference = match ms {
                ms if ms > 0 => reference.with_invocation_timeout(Some(Duration::from_millis(ms as u64))),
                -1 => reference.with_invocation_timeout(None),
                _ => {
                    tracing::warn!(property = %timeout_key, value = ms, "invalid value, using the default");
                    reference
                }
            };
        }

        let context_prefix = format!("{prefix}.Context.");
        let entries = properties.get_properties_for_prefix(&context_prefix);
        if !entries.is_empty() {
            let context: Context = entries
                .into_iter()
                .map(|(k, v)| (k[context_prefix.len()..].to_string(), v))
                .collect();
            reference = reference.with_context(context);
        }

        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::Communicator;

    fn parse(communicator: &Communicator, s: &str) -> Result<Option<Reference>> {
        communicator.instance().reference_factory().create_from_string(s, None)
    }

    #[test]
    fn test_parse_options() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let r = parse(&communicator, "cat/name -f \"my facet\" -O -s -e 1.0:tcp -h 127.0.0.1 -p 4061")
            .unwrap()
            .unwrap();
        assert_eq!(r.identity(), &Identity::new("name", "cat"));
        assert_eq!(r.facet(), "my facet");
        assert_eq!(r.mode(), InvocationMode::BatchOneway);
        assert!(r.secure());
        assert_eq!(r.encoding(), ENCODING_1_0);
        assert_eq!(r.endpoints().len(), 1);
    }

    #[test]
    fn test_empty_and_null() {
        let communicator = Communicator::new(Default::default()).unwrap();
        assert!(parse(&communicator, "   ").unwrap().is_none());
        assert!(parse(&communicator, "\"\"").unwrap().is_none());
        assert!(parse(&communicator, "\"\" -t").is_err());
    }

    #[test]
    fn test_adapter_id() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let r = parse(&communicator, "hello @ \"my adapter\"").unwrap().unwrap();
        assert_eq!(r.adapter_id(), "my adapter");
        assert!(r.is_indirect());
        assert!(parse(&communicator, "hello @ ").is_err());
        assert!(parse(&communicator, "hello @ \"a\" junk").is_err());
    }

    #[test]
    fn test_invalid_options() {
        let communicator = Communicator::new(Default::default()).unwrap();
        assert!(matches!(parse(&communicator, "hello -x"), Err(IceError::ProxyParse(_))));
        assert!(matches!(parse(&communicator, "hello -f"), Err(IceError::ProxyParse(_))));
        assert!(matches!(parse(&communicator, "hello -t foo"), Err(IceError::ProxyParse(_))));
        assert!(matches!(parse(&communicator, "hello -e x.y"), Err(IceError::ProxyParse(_))));
    }

    #[test]
    fn test_unknown_endpoints() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let r = parse(&communicator, "hello:foo -h x:tcp -h 127.0.0.1 -p 1").unwrap().unwrap();
        assert_eq!(r.endpoints().len(), 1);
        assert!(matches!(parse(&communicator, "hello:foo -h x"), Err(IceError::EndpointParse(_))));
    }

    #[test]
    fn test_opaque_endpoint_in_proxy() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let r = parse(&communicator, "hello:opaque -t 99 -e 1.1 -v abcd").unwrap().unwrap();
        assert!(matches!(r.endpoints()[0], Endpoint::Opaque(_)));
    }

    #[test]
    fn test_property_overrides() {
        let communicator = Communicator::new(Default::default()).unwrap();
        let properties = communicator.instance().properties();
        properties.set_property("Test.Proxy.ConnectionCached", "0");
        properties.set_property("Test.Proxy.EndpointSelection", "Ordered");
        properties.set_property("Test.Proxy.InvocationTimeout", "1500");
        properties.set_property("Test.Proxy.Context.user", "alice");

        let r = communicator
            .instance()
            .reference_factory()
            .create_from_string("hello:tcp -h 127.0.0.1 -p 1", Some("Test.Proxy"))
            .unwrap()
            .unwrap();
        assert!(!r.cache_connection());
        assert_eq!(r.endpoint_selection(), EndpointSelection::Ordered);
        assert_eq!(r.invocation_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(r.context().get("user").map(String::as_str), Some("alice"));
    }

    #[test]
    fn test_split_endpoints_respects_quotes() {
        assert_eq!(split_endpoints("a:\"b:c\":d").unwrap(), vec!["a", "\"b:c\"", "d"]);
        assert!(split_endpoints("a:\"b").is_err());
    }
}
