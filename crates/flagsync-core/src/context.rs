//! Caller-supplied evaluation context.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Attribute name of the identity key.
pub const USER_KEY: &str = "userkey";
/// Attribute name of the caller's country.
pub const COUNTRY: &str = "country";
/// Attribute name of the caller's device class.
pub const DEVICE: &str = "device";
/// Attribute name of the caller's platform.
pub const PLATFORM: &str = "platform";
/// Attribute name of the caller's application version.
pub const VERSION: &str = "version";

/// A single custom attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Boolean(b) => write!(f, "{}", b),
            AttributeValue::Number(n) => write!(f, "{}", n),
            AttributeValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Boolean(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Number(value as f64)
    }
}

/// Attributes describing the caller a feature is evaluated for.
///
/// The identity key doubles as the sticky seed for percentage rollouts.
/// Contexts are owned by the caller and only read during evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    /// Identity key (user, session or device id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Application version, compared as a dotted version by rules that
    /// declare it so.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Open attribute map.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, AttributeValue>,
}

impl EvaluationContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the identity key.
    pub fn with_identity_key(mut self, key: impl Into<String>) -> Self {
        self.identity_key = Some(key.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Add a custom attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.custom.insert(name.into(), value.into());
        self
    }

    /// Set or replace a custom attribute in place.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.custom.insert(name.into(), value.into());
    }

    /// Remove a custom attribute.
    pub fn remove_attribute(&mut self, name: &str) -> Option<AttributeValue> {
        self.custom.remove(name)
    }

    /// Clear every attribute, including the identity key.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Look up an attribute by the name rules refer to it with.
    ///
    /// Well-known names resolve to the dedicated fields; every other name is
    /// looked up in the custom map.
    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        let field = match name {
            USER_KEY => &self.identity_key,
            COUNTRY => &self.country,
            DEVICE => &self.device,
            PLATFORM => &self.platform,
            VERSION => &self.version,
            _ => return self.custom.get(name).cloned(),
        };
        field.as_deref().map(AttributeValue::from)
    }
}
