//! Device settings
//!
//! Connectors and devices read their configuration through the [`Settings`]
//! capability, a typed key lookup. Where the values come from is up to the
//! caller; [`JsonSettings`] covers the common case of a JSON document and a
//! plain `HashMap<String, String>` works for ad-hoc settings.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use serde_json::Value;

/// Maximum number of attempts to send a command before it is dropped
pub const MAX_SEND_RETRIES: u32 = 10;

/// Default maximum wait for ethernet connections in milliseconds
pub const DEFAULT_ETHERNET_CONNECT_WAIT_MS: u64 = 3000;

/// Typed key lookup over some configuration source
pub trait Settings: Send + Sync {
    /// Textual value stored under `key`, if any
    fn raw(&self, key: &str) -> Option<String>;
}

impl dyn Settings + '_ {
    /// Look up `key` and convert it to `T`.
    ///
    /// Returns `None` if the key is missing or the value does not convert; the
    /// latter is logged so that misconfigured files are visible.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        if key.is_empty() {
            tracing::warn!("Settings::get called with an empty key");
            return None;
        }

        let raw = self.raw(key)?;
        match raw.trim().parse::<T>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Settings: unable to convert '{}' for key '{}': {}", raw, key, e);
                None
            }
        }
    }
}

impl Settings for HashMap<String, String> {
    fn raw(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Settings backed by a JSON object. Dotted keys (`serial.baudrate`) walk into
/// nested objects.
#[derive(Debug, Clone, Default)]
pub struct JsonSettings {
    root: Value,
}

impl JsonSettings {
    /// Wrap an existing JSON value
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Settings rooted at the nested section `path`. A missing section yields
    /// empty settings.
    pub fn section(&self, path: &str) -> JsonSettings {
        Self::new(self.lookup(path).cloned().unwrap_or(Value::Null))
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.root, |value, part| value.as_object()?.get(part))
    }
}

impl From<Value> for JsonSettings {
    fn from(root: Value) -> Self {
        Self::new(root)
    }
}

impl Settings for JsonSettings {
    fn raw(&self, key: &str) -> Option<String> {
        match self.lookup(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}
