//! String-keyed property store with typed accessors.
//!
//! Typed accessors never fail: a value that cannot be converted logs a
//! warning and the caller's default is returned instead.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ConfigError;

/// Environment variable naming configuration files to load at startup.
pub const CONFIG_ENV_VAR: &str = "ICE_CONFIG";

/// A shared, thread-safe set of properties.
///
/// Cloning a `Properties` value yields a handle to the same store.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl Properties {
    /// Creates an empty property set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a property set from `--Key=Value` arguments.
    ///
    /// Arguments that are not property definitions are ignored. If an
    /// `--Ice.Config=file` argument is present the file is loaded first, so
    /// that explicit arguments override it.
    pub fn from_args<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let props = Self::new();
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        for arg in &args {
            if let Some(files) = arg.strip_prefix("--Ice.Config=") {
                for file in files.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                    props.load(file)?;
                }
            }
        }
        props.parse_command_line_options("", &args);
        Ok(props)
    }

    /// Creates a property set from the files listed in `ICE_CONFIG`.
    ///
    /// Returns an empty set if the variable is not defined.
    pub fn from_env() -> Result<Self, ConfigError> {
        let props = Self::new();
        if let Ok(files) = std::env::var(CONFIG_ENV_VAR) {
            for file in files.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                props.load(file)?;
            }
        }
        Ok(props)
    }

    /// Returns the value of `key`, or an empty string.
    pub fn get_property(&self, key: &str) -> String {
        self.inner.lock().get(key).cloned().unwrap_or_default()
    }

    /// Returns the value of `key`, or `default` if it is not set.
    pub fn get_property_with_default(&self, key: &str, default: &str) -> String {
        self.inner
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Returns true if `key` has a value.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Returns the value of `key` as an integer, or 0.
    pub fn get_property_as_int(&self, key: &str) -> i32 {
        self.get_property_as_int_with_default(key, 0)
    }

    /// Returns the value of `key` as an integer, or `default` if it is not
    /// set or is not a valid integer.
    pub fn get_property_as_int_with_default(&self, key: &str, default: i32) -> i32 {
        let Some(value) = self.inner.lock().get(key).cloned() else {
            return default;
        };
        match value.trim().parse::<i32>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(
                    property = key,
                    value = %value,
                    default,
                    "numeric property set to non-numeric value, using default"
                );
                default
            }
        }
    }

    /// Returns the value of `key` split into a list, or an empty list.
    pub fn get_property_as_list(&self, key: &str) -> Vec<String> {
        self.get_property_as_list_with_default(key, &[])
    }

    /// Returns the value of `key` split into a list.
    ///
    /// Elements are separated by commas or whitespace; single or double
    /// quotes group an element that contains separators.
    pub fn get_property_as_list_with_default(&self, key: &str, default: &[&str]) -> Vec<String> {
        let Some(value) = self.inner.lock().get(key).cloned() else {
            return default.iter().map(|s| s.to_string()).collect();
        };
        match split_list(&value) {
            Some(list) => list,
            None => {
                tracing::warn!(
                    property = key,
                    value = %value,
                    "mismatched quotes in property value, using default"
                );
                default.iter().map(|s| s.to_string()).collect()
            }
        }
    }

    /// Returns the value of `key` as a list of integers.
    ///
    /// Falls back to `default` if the property is unset or any element is
    /// not a valid integer.
    pub fn get_property_as_int_list(&self, key: &str, default: &[i32]) -> Vec<i32> {
        if !self.contains(key) {
            return default.to_vec();
        }
        let items = self.get_property_as_list(key);
        let parsed: Result<Vec<i32>, _> = items.iter().map(|s| s.parse::<i32>()).collect();
        match parsed {
            Ok(list) => list,
            Err(_) => {
                tracing::warn!(
                    property = key,
                    value = ?items,
                    "integer list property contains non-numeric values, using default"
                );
                default.to_vec()
            }
        }
    }

    /// Sets a property. An empty value removes the key.
    pub fn set_property(&self, key: &str, value: &str) {
        let key = key.trim();
        if key.is_empty() {
            return;
        }
        let mut map = self.inner.lock();
        if value.is_empty() {
            map.remove(key);
        } else {
            map.insert(key.to_string(), value.to_string());
        }
    }

    /// Returns every property whose key starts with `prefix`.
    pub fn get_properties_for_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.inner
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Applies `--prefix.Key=Value` arguments and returns the remaining ones.
    ///
    /// A bare `--Key` sets the value to `1`. An empty `prefix` accepts every
    /// `--Key=Value` argument.
    pub fn parse_command_line_options(&self, prefix: &str, args: &[String]) -> Vec<String> {
        let mut remaining = Vec::new();
        for arg in args {
            let Some(opt) = arg.strip_prefix("--") else {
                remaining.push(arg.clone());
                continue;
            };
            if !prefix.is_empty() && !opt.starts_with(&format!("{prefix}.")) {
                remaining.push(arg.clone());
                continue;
            }
            match opt.split_once('=') {
                Some((k, v)) => self.set_property(k, v),
                None if !opt.is_empty() => self.set_property(opt, "1"),
                None => remaining.push(arg.clone()),
            }
        }
        remaining
    }

    /// Loads `key=value` lines from a file.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::new(format!(
                "failed to read properties file {}: {e}",
                path.display()
            ))
        })?;
        self.load_str(&content);
        Ok(())
    }

    /// Loads `key=value` lines from a string.
    ///
    /// `#` starts a comment. A backslash escapes `#`, `=` and itself; other
    /// backslashes are kept. Lines without `=` or with an empty key are
    /// skipped.
    pub fn load_str(&self, content: &str) {
        for line in content.lines() {
            if let Some((k, v)) = parse_line(line) {
                self.set_property(&k, &v);
            }
        }
    }

    /// Returns a snapshot of all properties.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.inner.lock().clone()
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        let target = if in_value { &mut value } else { &mut key };
        match c {
            '\\' => match chars.peek() {
                Some(&next @ ('#' | '=' | '\\')) => {
                    target.push(next);
                    chars.next();
                }
                _ => target.push('\\'),
            },
            '#' => break,
            '=' if !in_value => in_value = true,
            _ => target.push(c),
        }
    }

    let key = key.trim();
    if !in_value || key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

fn split_list(s: &str) -> Option<Vec<String>> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (_, '\\') if matches!(chars.peek(), Some('"') | Some('\'')) => {
                if let Some(q) = chars.next() {
                    current.push(q);
                }
            }
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, c) if c == ',' || c.is_whitespace() => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if quote.is_some() {
        return None;
    }
    if !current.is_empty() {
        out.push(current);
    }
    Some(out)
}
