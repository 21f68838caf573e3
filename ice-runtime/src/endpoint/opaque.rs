//! Endpoints of unknown transports, preserved byte for byte.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use ice_core::protocol::{EncodingVersion, ENCODING_1_0};
use ice_core::{IceError, InputStream, OutputStream, Result};

use super::{for_each_option, parse_encoding, require_argument};

/// An endpoint whose type code has no registered factory.
///
/// The encapsulated body is kept verbatim so that it marshals back exactly
/// as it was received.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpaqueEndpoint {
    type_code: i16,
    raw_encoding: EncodingVersion,
    raw_bytes: Bytes,
}

impl OpaqueEndpoint {
    /// Creates an opaque endpoint.
    pub fn new(type_code: i16, raw_encoding: EncodingVersion, raw_bytes: Bytes) -> Self {
        Self {
            type_code,
            raw_encoding,
            raw_bytes,
        }
    }

    /// Returns the type code.
    pub fn type_code(&self) -> i16 {
        self.type_code
    }

    /// Returns the encoding of the captured body.
    pub fn raw_encoding(&self) -> EncodingVersion {
        self.raw_encoding
    }

    /// Returns the captured body.
    pub fn raw_bytes(&self) -> &Bytes {
        &self.raw_bytes
    }

    /// Parses `-t type -e x.y -v base64`.
    pub(crate) fn parse(args: &[String]) -> Result<Self> {
        let mut type_code = None;
        let mut raw_encoding = None;
        let mut raw_bytes = None;

        for_each_option(args, |option, argument| {
            let arg = require_argument(option, argument)?;
            match option {
                "-t" => {
                    if type_code.is_some() {
                        return Err(IceError::EndpointParse("multiple -t options".into()));
                    }
                    let t = arg.parse::<i16>().ok().filter(|t| *t >= 0).ok_or_else(|| {
                        IceError::EndpointParse(format!("invalid type value `{arg}`"))
                    })?;
                    type_code = Some(t);
                }
                "-e" => {
                    if raw_encoding.is_some() {
                        return Err(IceError::EndpointParse("multiple -e options".into()));
                    }
                    raw_encoding = Some(parse_encoding(option, arg)?);
                }
                "-v" => {
                    if raw_bytes.is_some() {
                        return Err(IceError::EndpointParse("multiple -v options".into()));
                    }
                    let decoded = STANDARD.decode(arg).map_err(|e| {
                        IceError::EndpointParse(format!("invalid base64 value `{arg}`: {e}"))
                    })?;
                    raw_bytes = Some(Bytes::from(decoded));
                }
                _ => return Ok(false),
            }
            Ok(true)
        })?;

        let type_code =
            type_code.ok_or_else(|| IceError::EndpointParse("no -t option in endpoint".into()))?;
        let raw_bytes =
            raw_bytes.ok_or_else(|| IceError::EndpointParse("no -v option in endpoint".into()))?;
        Ok(Self {
            type_code,
            raw_encoding: raw_encoding.unwrap_or(ENCODING_1_0),
            raw_bytes,
        })
    }

    /// Reads the encapsulation following an unknown type code.
    pub(crate) fn read(type_code: i16, is: &mut InputStream) -> Result<Self> {
        let (raw_encoding, raw_bytes) = is.read_encapsulation()?;
        Ok(Self {
            type_code,
            raw_encoding,
            raw_bytes,
        })
    }

    pub(crate) fn marshal(&self, os: &mut OutputStream) {
        os.write_i16(self.type_code);
        os.write_encapsulation(self.raw_encoding, &self.raw_bytes);
    }
}

impl fmt::Display for OpaqueEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "opaque -t {} -e {} -v {}",
            self.type_code,
            self.raw_encoding,
            STANDARD.encode(&self.raw_bytes)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::split_options;

    fn parse(s: &str) -> Result<OpaqueEndpoint> {
        OpaqueEndpoint::parse(&split_options(s).unwrap())
    }

    #[test]
    fn test_parse_and_display() {
        let e = parse("-t 12 -e 1.1 -v CgsM").unwrap();
        assert_eq!(e.type_code(), 12);
        assert_eq!(&e.raw_bytes()[..], &[10, 11, 12]);
        assert_eq!(e.to_string(), "opaque -t 12 -e 1.1 -v CgsM");
    }

    #[test]
    fn test_encoding_defaults_to_1_0() {
        assert_eq!(parse("-t 1 -v AA==").unwrap().raw_encoding(), ENCODING_1_0);
    }

    #[test]
    fn test_required_and_duplicate_options() {
        assert!(parse("-v AA==").is_err());
        assert!(parse("-t 3").is_err());
        assert!(parse("-t 3 -t 4 -v AA==").is_err());
        assert!(parse("-t -3 -v AA==").is_err());
        assert!(parse("-t 3 -v !!!").is_err());
    }

    #[test]
    fn test_wire_roundtrip_preserves_bytes() {
        let e = OpaqueEndpoint::new(
            1000,
            EncodingVersion::new(3, 9),
            Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
        );
        let mut os = OutputStream::new();
        e.marshal(&mut os);
        let mut is = InputStream::new(os.finished());
        let type_code = is.read_i16().unwrap();
        assert_eq!(OpaqueEndpoint::read(type_code, &mut is).unwrap(), e);
    }
}
