//! Typed configuration values.
//!
//! Every value a user submits for a template input is one of a closed set of
//! kinds. Plain kinds render straight into variable files; reference kinds
//! (`SecretRef`, `ResourceRef`, `ProviderRef`) are resolved by the compiler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Named configuration values of a deployment or provider.
pub type ConfigMap = BTreeMap<String, ConfigValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ConfigValue {
    String(String),
    Number(f64),
    Boolean(bool),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
    /// Identifier of a sealed secret held by the vault.
    SecretRef(String),
    /// UUID of a resource whose output feeds this input.
    ResourceRef(String),
    /// Identifier of a provider configuration.
    ProviderRef(String),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Whether the value (recursively) contains only plain data.
    pub fn is_plain(&self) -> bool {
        match self {
            ConfigValue::String(_) | ConfigValue::Number(_) | ConfigValue::Boolean(_) => true,
            ConfigValue::List(items) => items.iter().all(ConfigValue::is_plain),
            ConfigValue::Map(entries) => entries.values().all(ConfigValue::is_plain),
            ConfigValue::SecretRef(_) | ConfigValue::ResourceRef(_) | ConfigValue::ProviderRef(_) => {
                false
            }
        }
    }

    /// Convert a plain value to JSON. Returns `None` for reference kinds.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            ConfigValue::String(s) => serde_json::Value::String(s.clone()),
            ConfigValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ConfigValue::Boolean(b) => serde_json::Value::Bool(*b),
            ConfigValue::List(items) => serde_json::Value::Array(
                items.iter().map(ConfigValue::to_json).collect::<Option<Vec<_>>>()?,
            ),
            ConfigValue::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    map.insert(k.clone(), v.to_json()?);
                }
                serde_json::Value::Object(map)
            }
            ConfigValue::SecretRef(_) | ConfigValue::ResourceRef(_) | ConfigValue::ProviderRef(_) => {
                return None;
            }
        })
    }

    /// Build a plain value from executor output JSON.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ConfigValue::String(String::new()),
            serde_json::Value::Bool(b) => ConfigValue::Boolean(*b),
            serde_json::Value::Number(n) => ConfigValue::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => ConfigValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                ConfigValue::List(items.iter().map(ConfigValue::from_json).collect())
            }
            serde_json::Value::Object(map) => ConfigValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), ConfigValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}
