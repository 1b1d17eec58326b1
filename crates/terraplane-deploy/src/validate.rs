//! Side-effect-free validation of templates and deployment configuration.

use std::collections::{BTreeMap, HashSet};

use terraplane_core::rules::RuleError;
use terraplane_core::template::{ConstraintScope, ResourceSchema, UsageSource};
use terraplane_core::{
    ConfigMap, ConfigValue, InputKind, InputRule, ModuleSource, Template, is_identifier,
    is_project_id, is_provider_type,
};
use terraplane_state::{ProviderConfig, Resource, StateStore};

use crate::error::{DeployError, DeployResult};

/// Outcome of a successful configuration check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validated {
    /// Quota the deployment would consume once applied.
    pub requested_usage: BTreeMap<String, u64>,
}

fn bad(msg: impl Into<String>) -> DeployError {
    DeployError::BadRequest(msg.into())
}

/// Project ids name working directories and prefix queue keys.
pub fn check_project_id(project_id: &str) -> DeployResult<()> {
    if is_project_id(project_id) {
        Ok(())
    } else {
        Err(bad(format!(
            "invalid project id {project_id:?}: expected 1 to 64 of [A-Za-z0-9_-]"
        )))
    }
}

fn check_identifier(what: &str, name: &str) -> DeployResult<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(bad(format!("{what} {name:?} is not an identifier")))
    }
}

pub(crate) fn check_provider_type(provider_type: &str) -> DeployResult<()> {
    if is_provider_type(provider_type) {
        Ok(())
    } else {
        Err(bad(format!("invalid provider type {provider_type:?}")))
    }
}

/// Check a template before it is stored.
pub fn validate_template(template: &Template) -> DeployResult<()> {
    if template.id.trim().is_empty() {
        return Err(bad("template id must not be empty"));
    }
    ModuleSource::parse(&template.source).map_err(|e| bad(e.to_string()))?;
    if let Some(provider_type) = &template.provider_type {
        check_provider_type(provider_type)?;
    }
    for output in &template.outputs {
        check_identifier("output", &output.name)?;
    }

    let mut names = HashSet::new();
    for input in &template.inputs {
        check_identifier("input", &input.name)?;
        match &input.kind {
            InputKind::Resource { output, .. } => check_identifier("referenced output", output)?,
            InputKind::Provider { provider_type } => check_provider_type(provider_type)?,
            _ => {}
        }
        if !names.insert(input.name.as_str()) {
            return Err(bad(format!("duplicate input {}", input.name)));
        }
        for rule in &input.rules {
            match rule {
                InputRule::Cidr { .. } => {
                    rule.regex()?;
                }
                InputRule::Pattern { .. } => {
                    if let Err(e @ RuleError::InvalidPattern(_)) =
                        rule.check(&input.name, &ConfigValue::String(String::new()))
                    {
                        return Err(e.into());
                    }
                }
                InputRule::Range { min: Some(min), max: Some(max) } if min > max => {
                    return Err(bad(format!("{}: range minimum exceeds maximum", input.name)));
                }
                InputRule::Quota { .. } if input.kind != InputKind::Number => {
                    return Err(bad(format!("{}: quota rules need a number input", input.name)));
                }
                _ => {}
            }
        }
        if let Some(default) = &input.default {
            if !input.kind.accepts(default) {
                return Err(bad(format!("{}: default has the wrong kind", input.name)));
            }
        }
    }

    if let Some(schema) = &template.resource {
        validate_schema(template, schema)?;
    }

    for constraint in &template.constraints {
        if template.input(&constraint.input).is_none() {
            return Err(bad(format!(
                "constraint {}: unknown input {}",
                constraint.key, constraint.input
            )));
        }
        if constraint.scope == ConstraintScope::Resource {
            let scoped = constraint
                .resource_input
                .as_deref()
                .and_then(|name| template.input(name))
                .is_some_and(|input| matches!(input.kind, InputKind::Resource { .. }));
            if !scoped {
                return Err(bad(format!(
                    "constraint {}: resource scope needs a resource input",
                    constraint.key
                )));
            }
        }
    }
    Ok(())
}

fn validate_schema(template: &Template, schema: &ResourceSchema) -> DeployResult<()> {
    if let Some(name_input) = &schema.name_input {
        let ok = template
            .input(name_input)
            .is_some_and(|i| i.kind == InputKind::String);
        if !ok {
            return Err(bad(format!("name input {name_input} must be a string input")));
        }
    }
    for (metric, source) in &schema.usage {
        if let UsageSource::Input(name) = source {
            let ok = template
                .input(name)
                .is_some_and(|i| i.kind == InputKind::Number);
            if !ok {
                return Err(bad(format!("usage of {metric}: {name} must be a number input")));
            }
        }
    }
    if let Some(provider) = &schema.provider {
        check_provider_type(&provider.provider_type)?;
        for output in &provider.outputs {
            if !template.outputs.iter().any(|o| &o.name == output) {
                return Err(bad(format!("derived provider reads unknown output {output}")));
            }
        }
    }
    Ok(())
}

/// Whole units of a numeric value, rounded up.
fn units(value: &ConfigValue) -> u64 {
    value.as_f64().map(|n| n.max(0.0).ceil() as u64).unwrap_or(0)
}

/// Usage a resource created from `schema` with `config` consumes.
pub fn resource_usage(schema: &ResourceSchema, config: &ConfigMap) -> BTreeMap<String, u64> {
    schema
        .usage
        .iter()
        .map(|(metric, source)| {
            let amount = match source {
                UsageSource::Fixed(n) => *n,
                UsageSource::Input(name) => config.get(name).map(units).unwrap_or(0),
            };
            (metric.clone(), amount)
        })
        .collect()
}

/// Usage the deployment requests: the resource schema's usage, plus any
/// input carrying a quota rule for a metric the schema does not declare.
pub fn requested_usage(template: &Template, config: &ConfigMap) -> BTreeMap<String, u64> {
    let mut usage = template
        .resource
        .as_ref()
        .map(|schema| resource_usage(schema, config))
        .unwrap_or_default();
    for input in &template.inputs {
        let Some(value) = config.get(&input.name).or(input.default.as_ref()) else {
            continue;
        };
        for rule in &input.rules {
            if let InputRule::Quota { metric } = rule {
                usage.entry(metric.clone()).or_insert_with(|| units(value));
            }
        }
    }
    usage.retain(|_, amount| *amount > 0);
    usage
}

/// Check `config` against `template` for a deployment in `project_id`.
///
/// Covers the input schema, rules, resource and provider references and
/// the resource schema. Quota is left to the caller, which checks it inside
/// the transaction that records the reservation.
pub fn validate_config(
    store: &StateStore,
    template: &Template,
    project_id: &str,
    config: &ConfigMap,
    provider_id: Option<&str>,
) -> DeployResult<Validated> {
    for key in config.keys() {
        let Some(input) = template.input(key) else {
            return Err(bad(format!("unknown input {key}")));
        };
        if input.configuration {
            return Err(bad(format!("{key} is supplied by the provider")));
        }
    }

    for input in &template.inputs {
        if input.configuration {
            continue;
        }
        let Some(value) = config.get(&input.name).or(input.default.as_ref()) else {
            if input.required {
                return Err(bad(format!("missing required input {}", input.name)));
            }
            continue;
        };
        if !input.kind.accepts(value) {
            return Err(bad(format!("{}: value has the wrong kind", input.name)));
        }
        if value.is_plain() {
            for rule in &input.rules {
                rule.check(&input.name, value)?;
            }
        }
        match (&input.kind, value) {
            (InputKind::Resource { resource_type, .. }, ConfigValue::ResourceRef(id)) => {
                check_resource(store, project_id, id, resource_type)?;
            }
            (InputKind::Provider { provider_type }, ConfigValue::ProviderRef(id)) => {
                check_provider(store, project_id, id, Some(provider_type))?;
            }
            _ => {}
        }
    }

    match (template.provider_type.as_deref(), provider_id) {
        (Some(expected), Some(id)) => check_provider(store, project_id, id, Some(expected))?,
        (Some(expected), None) => {
            return Err(bad(format!("template {} needs a {expected} provider", template.id)));
        }
        (None, Some(id)) => check_provider(store, project_id, id, None)?,
        (None, None) => {}
    }

    if let Some(schema) = &template.resource {
        if let Some(name_input) = &schema.name_input {
            let named = config
                .get(name_input)
                .and_then(ConfigValue::as_str)
                .is_some_and(|name| !name.trim().is_empty());
            if !named && template.input(name_input).is_some_and(|i| i.required) {
                return Err(bad(format!("{name_input} must name the resource")));
            }
        }
    }

    Ok(Validated {
        requested_usage: requested_usage(template, config),
    })
}

fn check_resource(
    store: &StateStore,
    project_id: &str,
    resource_id: &str,
    resource_type: &str,
) -> DeployResult<Resource> {
    let resource: Resource = store
        .get(resource_id)?
        .ok_or_else(|| DeployError::NotFound(format!("resource {resource_id}")))?;
    if resource.project_id != project_id {
        return Err(bad(format!("resource {resource_id} is not in project {project_id}")));
    }
    if resource.resource_type != resource_type {
        return Err(bad(format!(
            "resource {resource_id} is a {}, expected {resource_type}",
            resource.resource_type
        )));
    }
    Ok(resource)
}

fn check_provider(
    store: &StateStore,
    project_id: &str,
    provider_id: &str,
    provider_type: Option<&str>,
) -> DeployResult<()> {
    let provider: ProviderConfig = store
        .get(provider_id)?
        .ok_or_else(|| DeployError::NotFound(format!("provider {provider_id}")))?;
    if provider.project_id != project_id {
        return Err(bad(format!("provider {provider_id} is not in project {project_id}")));
    }
    if let Some(expected) = provider_type {
        if provider.provider_type != expected {
            return Err(bad(format!(
                "provider {provider_id} is a {}, expected {expected}",
                provider.provider_type
            )));
        }
    }
    Ok(())
}
