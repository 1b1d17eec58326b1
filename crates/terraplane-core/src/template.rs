//! Template definitions.
//!
//! A template describes one deployable unit: the module it runs, the inputs
//! users supply, the outputs it exposes, what resource a successful apply
//! materializes, and which values must be unique.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kind::DeploymentType;
use crate::rules::InputRule;
use crate::value::ConfigValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub deployment_type: DeploymentType,
    /// Module source (local path, `file://`, `git::`, registry address).
    pub source: String,
    /// Provider type deployments of this template must bind to, if any.
    #[serde(default)]
    pub provider_type: Option<String>,
    #[serde(default)]
    pub inputs: Vec<TemplateInput>,
    #[serde(default)]
    pub outputs: Vec<TemplateOutput>,
    #[serde(default)]
    pub resource: Option<ResourceSchema>,
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,
}

impl Template {
    pub fn input(&self, name: &str) -> Option<&TemplateInput> {
        self.inputs.iter().find(|i| i.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateInput {
    pub name: String,
    pub kind: InputKind,
    #[serde(default)]
    pub required: bool,
    /// Supplied indirectly from the bound provider (or its backing resource)
    /// rather than by the user.
    #[serde(default)]
    pub configuration: bool,
    /// Accepted from the user but never compiled.
    #[serde(default)]
    pub dummy: bool,
    #[serde(default)]
    pub default: Option<ConfigValue>,
    #[serde(default)]
    pub rules: Vec<InputRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputKind {
    String,
    Number,
    Boolean,
    List,
    Map,
    Secret,
    /// Reference to a resource; resolves to `output` of the owning unit.
    Resource { resource_type: String, output: String },
    /// Reference to an additional provider configuration.
    Provider { provider_type: String },
}

impl InputKind {
    /// Whether `value` has the shape this kind expects.
    pub fn accepts(&self, value: &ConfigValue) -> bool {
        match (self, value) {
            (InputKind::String, ConfigValue::String(_))
            | (InputKind::Number, ConfigValue::Number(_))
            | (InputKind::Boolean, ConfigValue::Boolean(_))
            | (InputKind::Secret, ConfigValue::String(_))
            | (InputKind::Secret, ConfigValue::SecretRef(_))
            | (InputKind::Resource { .. }, ConfigValue::ResourceRef(_))
            | (InputKind::Provider { .. }, ConfigValue::ProviderRef(_)) => true,
            (InputKind::List, ConfigValue::List(items)) => items.iter().all(ConfigValue::is_plain),
            (InputKind::Map, ConfigValue::Map(entries)) => {
                entries.values().all(ConfigValue::is_plain)
            }
            _ => false,
        }
    }

    /// Variable type expression for plain kinds.
    pub fn variable_type(&self) -> Option<&'static str> {
        match self {
            InputKind::String | InputKind::Secret => Some("string"),
            InputKind::Number => Some("number"),
            InputKind::Boolean => Some("bool"),
            InputKind::List => Some("list(any)"),
            InputKind::Map => Some("map(any)"),
            InputKind::Resource { .. } | InputKind::Provider { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateOutput {
    pub name: String,
    #[serde(default)]
    pub sensitive: bool,
}

/// What a successful apply materializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub resource_type: String,
    /// Input whose value names the resource; defaults to the deployment name.
    #[serde(default)]
    pub name_input: Option<String>,
    /// Quota consumption per metric.
    #[serde(default)]
    pub usage: BTreeMap<String, UsageSource>,
    /// Provider instance derived from the new resource's outputs.
    #[serde(default)]
    pub provider: Option<ProviderSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    Fixed(u64),
    /// Read from a numeric input.
    Input(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSchema {
    pub provider_type: String,
    /// Resource outputs copied into the derived provider's configuration.
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintScope {
    Global,
    Project,
    Resource,
}

/// A value that must be unique within `scope`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub key: String,
    /// Input whose value is constrained.
    pub input: String,
    pub scope: ConstraintScope,
    /// For `Resource` scope: the resource-reference input that scopes it.
    #[serde(default)]
    pub resource_input: Option<String>,
}
