//! Protocol and encoding versions and the compatibility rules between them.

use std::fmt;
use std::str::FromStr;

use crate::error::{IceError, Result};
use crate::stream::{InputStream, Marshal, OutputStream, Unmarshal};

macro_rules! version_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            /// Major version number.
            pub major: u8,
            /// Minor version number.
            pub minor: u8,
        }

        impl $name {
            /// Creates a version from its components.
            pub const fn new(major: u8, minor: u8) -> Self {
                Self { major, minor }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", self.major, self.minor)
            }
        }

        impl FromStr for $name {
            type Err = IceError;

            fn from_str(s: &str) -> Result<Self> {
                let (major, minor) = s.split_once('.').ok_or_else(|| {
                    IceError::Marshal(format!("malformed version `{s}`"))
                })?;
                let major = major
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| IceError::Marshal(format!("malformed version `{s}`")))?;
                let minor = minor
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| IceError::Marshal(format!("malformed version `{s}`")))?;
                Ok(Self { major, minor })
            }
        }

        impl Marshal for $name {
            fn marshal(&self, os: &mut OutputStream) {
                os.write_u8(self.major);
                os.write_u8(self.minor);
            }
        }

        impl Unmarshal for $name {
            fn unmarshal(is: &mut InputStream) -> Result<Self> {
                let major = is.read_u8()?;
                let minor = is.read_u8()?;
                Ok(Self { major, minor })
            }
        }
    };
}

version_type!(
    /// Version of the message protocol.
    ProtocolVersion
);

version_type!(
    /// Version of the data encoding.
    EncodingVersion
);

/// Protocol version 1.0.
pub const PROTOCOL_1_0: ProtocolVersion = ProtocolVersion::new(1, 0);

/// Encoding version 1.0.
pub const ENCODING_1_0: EncodingVersion = EncodingVersion::new(1, 0);

/// Encoding version 1.1.
pub const ENCODING_1_1: EncodingVersion = EncodingVersion::new(1, 1);

/// The protocol version spoken by this runtime.
pub const CURRENT_PROTOCOL: ProtocolVersion = PROTOCOL_1_0;

/// The encoding used for protocol messages themselves.
pub const CURRENT_PROTOCOL_ENCODING: EncodingVersion = ENCODING_1_0;

/// The most recent encoding supported for encapsulations.
pub const CURRENT_ENCODING: EncodingVersion = ENCODING_1_1;

/// Fails with `UnsupportedProtocol` unless `v` can be read locally.
///
/// A version is supported when its major matches and its minor is not newer
/// than the local one.
pub fn check_supported_protocol(v: ProtocolVersion) -> Result<()> {
    if v.major != CURRENT_PROTOCOL.major || v.minor > CURRENT_PROTOCOL.minor {
        return Err(IceError::UnsupportedProtocol {
            bad: v,
            supported: CURRENT_PROTOCOL,
        });
    }
    Ok(())
}

/// Fails with `UnsupportedEncoding` unless `v` can be read locally.
pub fn check_supported_encoding(v: EncodingVersion) -> Result<()> {
    if v.major != CURRENT_ENCODING.major || v.minor > CURRENT_ENCODING.minor {
        return Err(IceError::UnsupportedEncoding {
            bad: v,
            supported: CURRENT_ENCODING,
        });
    }
    Ok(())
}

/// Returns the protocol version to use when talking to a peer announcing `v`.
///
/// A different major is returned unchanged (the subsequent support check
/// rejects it). A newer minor is downgraded to the local version.
pub fn get_compatible_protocol(v: ProtocolVersion) -> ProtocolVersion {
    if v.major != CURRENT_PROTOCOL.major || v.minor < CURRENT_PROTOCOL.minor {
        v
    } else {
        CURRENT_PROTOCOL
    }
}

/// Returns the encoding to use when talking to a peer announcing `v`.
pub fn get_compatible_encoding(v: EncodingVersion) -> EncodingVersion {
    if v.major != CURRENT_ENCODING.major || v.minor < CURRENT_ENCODING.minor {
        v
    } else {
        CURRENT_ENCODING
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        assert_eq!(ENCODING_1_1.to_string(), "1.1");
        assert_eq!("1.0".parse::<ProtocolVersion>().unwrap(), PROTOCOL_1_0);
        assert!("1".parse::<EncodingVersion>().is_err());
        assert!("a.b".parse::<EncodingVersion>().is_err());
    }

    #[test]
    fn test_supported_protocol() {
        assert!(check_supported_protocol(PROTOCOL_1_0).is_ok());
        assert!(matches!(
            check_supported_protocol(ProtocolVersion::new(1, 1)),
            Err(IceError::UnsupportedProtocol { .. })
        ));
        assert!(matches!(
            check_supported_protocol(ProtocolVersion::new(2, 0)),
            Err(IceError::UnsupportedProtocol { .. })
        ));
    }

    #[test]
    fn test_supported_encoding() {
        assert!(check_supported_encoding(ENCODING_1_0).is_ok());
        assert!(check_supported_encoding(ENCODING_1_1).is_ok());
        assert!(check_supported_encoding(EncodingVersion::new(1, 2)).is_err());
        assert!(check_supported_encoding(EncodingVersion::new(0, 9)).is_err());
    }

    #[test]
    fn test_compatible_encoding_downgrades_newer_minor() {
        assert_eq!(
            get_compatible_encoding(EncodingVersion::new(1, 5)),
            CURRENT_ENCODING
        );
        assert_eq!(get_compatible_encoding(ENCODING_1_0), ENCODING_1_0);
    }

    #[test]
    fn test_compatible_keeps_other_major() {
        let v = EncodingVersion::new(2, 0);
        assert_eq!(get_compatible_encoding(v), v);
        assert!(check_supported_encoding(get_compatible_encoding(v)).is_err());

        let p = ProtocolVersion::new(3, 4);
        assert_eq!(get_compatible_protocol(p), p);
    }

    #[test]
    fn test_compatible_protocol_downgrades_newer_minor() {
        assert_eq!(
            get_compatible_protocol(ProtocolVersion::new(1, 7)),
            CURRENT_PROTOCOL
        );
    }
}
