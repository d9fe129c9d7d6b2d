//! Flat key/value configuration.
//!
//! Values come from an optional JSON file overlaid by the process
//! environment (environment wins). Keys are upper-case strings such as
//! `PRICE_MIN` or `PRE_PRICE_MIN`; nested JSON objects are flattened with
//! `_`, so `{"PRE": {"PRICE_MIN": 1.5}}` yields `PRE_PRICE_MIN`.
//!
//! Profile parameters resolve through [`ConfigSource::resolve`], which
//! checks `<PREFIX>_<KEY>` before `<KEY>`.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result, ResultExt};

// ============================================================================
// Paths
// ============================================================================

/// Directory holding the default config file (`~/.watchlist`).
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".watchlist"),
        |dirs| dirs.home_dir().join(".watchlist"),
    )
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    config_dir().join("watchlist.json")
}

/// Expand `~` and environment references in a configured path.
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).as_ref()),
    }
}

/// Parse a boolean flag the way operators write them in env files.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" => Some(true),
        "0" | "false" | "no" | "off" | "n" => Some(false),
        _ => None,
    }
}

// ============================================================================
// Config Source
// ============================================================================

/// Merged configuration values.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    values: BTreeMap<String, String>,
}

impl ConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from explicit pairs (tests, CLI overrides).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut source = Self::new();
        for (key, value) in pairs {
            source.set(key, value);
        }
        source
    }

    /// Snapshot of the process environment.
    pub fn from_env() -> Self {
        Self::from_pairs(std::env::vars())
    }

    /// Load a JSON object file. Nested objects are flattened with `_`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read {}", path.display()))?;
        let value: Value = serde_json::from_str(&content)
            .context(format!("Failed to parse {}", path.display()))?;

        let Value::Object(map) = value else {
            return Err(Error::invalid(format!(
                "{} must contain a JSON object",
                path.display()
            )));
        };

        let mut source = Self::new();
        for (key, value) in map {
            flatten_into(&mut source.values, &key, value)?;
        }
        Ok(source)
    }

    /// Load `path` (or the default file when it exists) and overlay the
    /// environment.
    ///
    /// An explicitly given path that does not exist is an error; a missing
    /// default file is not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut source = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = default_config_path();
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    Self::new()
                }
            }
        };
        source.merge(Self::from_env());
        Ok(source)
    }

    /// Overlay `other` on top of `self`.
    pub fn merge(&mut self, other: ConfigSource) {
        self.values.extend(other.values);
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .insert(key.into().trim().to_ascii_uppercase(), value.into());
    }

    /// Raw value; blank values count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys starting with `prefix` that carry a value.
    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.values
            .iter()
            .filter(move |(k, v)| k.starts_with(prefix) && !v.trim().is_empty())
            .map(|(k, _)| k.as_str())
    }

    /// Parse a key if present.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => parse_value(key, raw).map(Some),
            None => Ok(None),
        }
    }

    /// Parse a key, using `default` when absent.
    pub fn get_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    /// Boolean flag (`1/0`, `true/false`, `yes/no`, `on/off`).
    pub fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            Some(raw) => parse_flag(raw).ok_or_else(|| {
                Error::invalid(format!("{key} must be a boolean flag, got {raw:?}"))
            }),
            None => Ok(default),
        }
    }

    /// Look up `<PREFIX>_<KEY>`, then `<KEY>`. Returns the key that matched
    /// alongside its value.
    pub fn resolve(&self, prefix: &str, key: &str) -> Option<(String, &str)> {
        let prefixed = format!("{prefix}_{key}");
        if let Some(value) = self.get(&prefixed) {
            return Some((prefixed, value));
        }
        self.get(key).map(|value| (key.to_string(), value))
    }

    /// Resolve and parse a profile key.
    ///
    /// Fails with `InvalidConfiguration` when neither the prefixed nor the
    /// base key is set and no default exists, or when the value does not
    /// parse.
    pub fn resolve_parsed<T>(&self, prefix: &str, key: &str, default: Option<T>) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.resolve(prefix, key) {
            Some((matched, raw)) => parse_value(&matched, raw),
            None => default.ok_or_else(|| {
                Error::invalid(format!(
                    "neither {prefix}_{key} nor {key} is set and no default exists"
                ))
            }),
        }
    }

    /// Resolve a profile flag with prefix fallback.
    pub fn resolve_flag(&self, prefix: &str, key: &str, default: Option<bool>) -> Result<bool> {
        match self.resolve(prefix, key) {
            Some((matched, raw)) => parse_flag(raw).ok_or_else(|| {
                Error::invalid(format!("{matched} must be a boolean flag, got {raw:?}"))
            }),
            None => default.ok_or_else(|| {
                Error::invalid(format!(
                    "neither {prefix}_{key} nor {key} is set and no default exists"
                ))
            }),
        }
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>()
        .map_err(|e| Error::invalid(format!("{key}={raw:?}: {e}")))
}

fn flatten_into(values: &mut BTreeMap<String, String>, key: &str, value: Value) -> Result<()> {
    let key = key.trim().to_ascii_uppercase();
    match value {
        Value::Null => {}
        Value::String(s) => {
            values.insert(key, s);
        }
        Value::Bool(b) => {
            values.insert(key, if b { "1".into() } else { "0".into() });
        }
        Value::Number(n) => {
            values.insert(key, n.to_string());
        }
        Value::Object(map) => {
            for (child, v) in map {
                flatten_into(values, &format!("{key}_{child}"), v)?;
            }
        }
        Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => parts.push(s),
                    Value::Number(n) => parts.push(n.to_string()),
                    other => {
                        return Err(Error::invalid(format!(
                            "{key}: unsupported list element {other}"
                        )))
                    }
                }
            }
            values.insert(key, parts.join(","));
        }
    }
    Ok(())
}
