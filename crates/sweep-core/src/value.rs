use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single parameter value. Serialized as a bare JSON/YAML scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(v) => write!(f, "{}", v),
            ConfigValue::Int(v) => write!(f, "{}", v),
            ConfigValue::Float(v) => write!(f, "{:?}", v),
            ConfigValue::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Float(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Str(value)
    }
}

/// One fully specified parameter set. Keys are kept sorted so the serialized
/// form doubles as the identity of the configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(BTreeMap<String, ConfigValue>);

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy with `key` set to `value`; `self` is left untouched.
    pub fn with(&self, key: &str, value: ConfigValue) -> Self {
        let mut next = self.0.clone();
        next.insert(key.to_string(), value);
        Configuration(next)
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.0.iter()
    }

    /// Canonical JSON text of the configuration, used for merge identity.
    pub fn identity_key(&self) -> String {
        // A map of string keys to scalars always serializes.
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    /// The stdin payload expected by the search executable: a one-element
    /// JSON array terminated by a newline.
    pub fn to_input_payload(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(&[&self.0]).unwrap_or_default();
        bytes.push(b'\n');
        bytes
    }
}

impl<K: Into<String>, V: Into<ConfigValue>> FromIterator<(K, V)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Configuration(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
