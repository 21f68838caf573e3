//! Object identities.

use std::fmt;
use std::str::FromStr;

use crate::error::{IceError, Result};
use crate::stream::{InputStream, Marshal, OutputStream, Unmarshal};

/// The addressable identifier of an object: a `(name, category)` pair.
///
/// The string form is `category/name`, or just `name` when the category is
/// empty. A `/` or `\` inside either component is escaped with a backslash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    /// The object name. An empty name denotes a null proxy.
    pub name: String,
    /// The object category.
    pub category: String,
}

impl Identity {
    /// Creates a new identity.
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    /// Returns true if the name is empty.
    pub fn is_null(&self) -> bool {
        self.name.is_empty()
    }
}

fn escape(component: &str, out: &mut String) {
    for c in component.chars() {
        match c {
            '/' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
}

fn unescape(component: &str, source: &str) -> Result<String> {
    let mut out = String::with_capacity(component.len());
    let mut chars = component.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => {
                    return Err(IceError::IdentityParse(format!(
                        "trailing escape character in `{source}`"
                    )))
                }
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::with_capacity(self.name.len() + self.category.len() + 1);
        if !self.category.is_empty() {
            escape(&self.category, &mut s);
            s.push('/');
        }
        escape(&self.name, &mut s);
        f.write_str(&s)
    }
}

impl FromStr for Identity {
    type Err = IceError;

    fn from_str(s: &str) -> Result<Self> {
        let mut slash = None;
        let mut escaped = false;
        for (i, c) in s.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '/' if slash.is_some() => {
                    return Err(IceError::IdentityParse(format!(
                        "unescaped `/` in `{s}`"
                    )))
                }
                '/' => slash = Some(i),
                _ => {}
            }
        }

        let identity = match slash {
            Some(pos) => Identity {
                category: unescape(&s[..pos], s)?,
                name: unescape(&s[pos + 1..], s)?,
            },
            None => Identity {
                category: String::new(),
                name: unescape(s, s)?,
            },
        };

        if identity.name.is_empty() && !identity.category.is_empty() {
            return Err(IceError::IllegalIdentity(s.to_string()));
        }
        Ok(identity)
    }
}

impl Marshal for Identity {
    fn marshal(&self, os: &mut OutputStream) {
        os.write_string(&self.name);
        os.write_string(&self.category);
    }
}

impl Unmarshal for Identity {
    fn unmarshal(is: &mut InputStream) -> Result<Self> {
        let name = is.read_string()?;
        let category = is.read_string()?;
        Ok(Self { name, category })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_category() {
        assert_eq!(Identity::new("hello", "demo").to_string(), "demo/hello");
        assert_eq!(Identity::new("hello", "").to_string(), "hello");
    }

    #[test]
    fn test_parse_with_category() {
        let id: Identity = "demo/hello".parse().unwrap();
        assert_eq!(id, Identity::new("hello", "demo"));
    }

    #[test]
    fn test_escaped_slash_roundtrip() {
        let id = Identity::new("a/b", "c\\d");
        let s = id.to_string();
        assert_eq!(s, "c\\\\d/a\\/b");
        assert_eq!(s.parse::<Identity>().unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_two_slashes() {
        assert!(matches!(
            "a/b/c".parse::<Identity>(),
            Err(IceError::IdentityParse(_))
        ));
    }

    #[test]
    fn test_parse_rejects_category_without_name() {
        assert!(matches!(
            "cat/".parse::<Identity>(),
            Err(IceError::IllegalIdentity(_))
        ));
    }

    #[test]
    fn test_identity_ordering() {
        let a = Identity::new("a", "x");
        let b = Identity::new("b", "x");
        assert!(a < b);
    }

    #[test]
    fn test_marshal_order_is_name_then_category() {
        let mut os = OutputStream::new();
        Identity::new("n", "c").marshal(&mut os);
        assert_eq!(os.as_bytes(), &[1, b'n', 1, b'c']);
    }
}
