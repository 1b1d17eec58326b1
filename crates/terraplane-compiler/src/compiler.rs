//! ConfigCompiler — partition to artifact set.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use terraplane_core::{
    ConfigValue, DeploymentType, InputKind, InputRule, ModuleSource, SecretScope, SecretVault,
    Template, TemplateInput,
};
use terraplane_state::{
    Deployment, ProjectResourceQuota, ProviderConfig, Resource, StateStore,
    compilable_deployments, unit_name,
};
use tracing::debug;

use crate::artifacts::ArtifactSet;
use crate::error::{CompileError, CompileResult};
use crate::hcl::{Block, literal, quote, render_all};

/// Per-compile working state for one partition.
struct Partition<'a> {
    project_id: &'a str,
    deployment_type: DeploymentType,
    deployments: HashMap<&'a str, &'a Deployment>,
    compiled: HashSet<&'a str>,
    resources: HashMap<&'a str, &'a Resource>,
    quota: Option<ProjectResourceQuota>,
    providers: BTreeMap<String, ProviderConfig>,
    remote: BTreeSet<DeploymentType>,
    variables: Vec<Block>,
    tfvars: serde_json::Map<String, Value>,
    units: BTreeMap<String, String>,
    outputs: Vec<Block>,
    modules: BTreeMap<String, PathBuf>,
    secret_env: BTreeMap<String, String>,
}

impl Partition<'_> {
    /// Remaining capacity of `metric` for `deployment`, not counting the
    /// deployment's own committed usage. `None` when the metric has no quota.
    fn available_for(&self, deployment: &Deployment, metric: &str) -> Option<u64> {
        let limit = *self.quota.as_ref()?.quotas.get(metric)?;
        let used: u64 = self
            .resources
            .values()
            .filter(|r| r.deployment_id != deployment.id)
            .filter_map(|r| r.usage.get(metric))
            .sum();
        Some(limit.saturating_sub(used))
    }
}

/// Compiles one (project, deployment type) partition at a time.
#[derive(Clone)]
pub struct ConfigCompiler {
    store: StateStore,
    vault: Arc<dyn SecretVault>,
    module_root: PathBuf,
}

impl ConfigCompiler {
    pub fn new(store: StateStore, vault: Arc<dyn SecretVault>, module_root: PathBuf) -> Self {
        Self {
            store,
            vault,
            module_root,
        }
    }

    pub fn compile(
        &self,
        project_id: &str,
        deployment_type: DeploymentType,
    ) -> CompileResult<ArtifactSet> {
        let deployments = self.store.list_deployments(project_id)?;
        let resources = self.store.list_resources(project_id)?;
        let units = compilable_deployments(&deployments, deployment_type);

        let mut partition = Partition {
            project_id,
            deployment_type,
            deployments: deployments.iter().map(|d| (d.id.as_str(), d)).collect(),
            compiled: units.iter().map(|d| d.id.as_str()).collect(),
            resources: resources.iter().map(|r| (r.id.as_str(), r)).collect(),
            quota: self.store.get(project_id)?,
            providers: BTreeMap::new(),
            remote: BTreeSet::new(),
            variables: Vec::new(),
            tfvars: serde_json::Map::new(),
            units: BTreeMap::new(),
            outputs: Vec::new(),
            modules: BTreeMap::new(),
            secret_env: BTreeMap::new(),
        };

        for deployment in &units {
            self.compile_unit(&mut partition, deployment)?;
        }
        let provider_blocks = self.provider_blocks(&mut partition)?;

        let mut files = BTreeMap::new();
        files.insert("main.tf".to_string(), backend_block().render());
        files.insert("providers.tf".to_string(), render_all(&provider_blocks));
        files.insert("variables.tf".to_string(), render_all(&partition.variables));
        files.insert(
            "terraform.tfvars.json".to_string(),
            format!("{:#}\n", Value::Object(partition.tfvars)),
        );
        files.insert("outputs.tf".to_string(), render_all(&partition.outputs));
        if !partition.remote.is_empty() {
            let blocks: Vec<Block> = partition.remote.iter().map(remote_state_block).collect();
            files.insert("data.tf".to_string(), render_all(&blocks));
        }
        files.extend(partition.units);

        debug!(
            %project_id,
            partition = deployment_type.partition_name(),
            units = units.len(),
            "partition compiled"
        );
        Ok(ArtifactSet {
            project_id: project_id.to_string(),
            deployment_type: Some(deployment_type),
            files,
            modules: partition.modules,
            secret_env: partition.secret_env,
            units: units.iter().map(|d| d.id.clone()).collect(),
        })
    }

    fn compile_unit(&self, partition: &mut Partition<'_>, deployment: &Deployment) -> CompileResult<()> {
        let template: Template = self
            .store
            .get(&deployment.template_id)?
            .ok_or_else(|| CompileError::NotFound(format!("template {}", deployment.template_id)))?;
        let unit = deployment.unit_name();

        let source = ModuleSource::parse(&template.source)?;
        if let ModuleSource::Local { path } = &source {
            let resolved = if path.is_absolute() {
                path.clone()
            } else {
                self.module_root.join(path)
            };
            if !resolved.is_dir() {
                return Err(CompileError::NotFound(format!(
                    "module source {}",
                    resolved.display()
                )));
            }
            partition.modules.insert(unit.clone(), resolved);
        }

        let mut module = Block::new(format!("module {}", quote(&unit)))
            .attr("source", quote(&source.unit_source(&unit)));

        let mut bindings = Vec::new();
        if let Some(provider_id) = &deployment.provider_id {
            let provider = self.provider(
                partition.project_id,
                provider_id,
                template.provider_type.as_deref(),
            )?;
            bindings.push(format!(
                "{} = {}.{}",
                provider.provider_type,
                provider.provider_type,
                provider.alias()
            ));
            partition.providers.insert(provider.id.clone(), provider);
        } else if let Some(provider_type) = &template.provider_type {
            return Err(CompileError::BadRequest(format!(
                "deployment {} needs a {provider_type} provider",
                deployment.id
            )));
        }

        for input in &template.inputs {
            if input.dummy {
                continue;
            }
            let value = if input.configuration {
                self.configuration_value(partition, deployment, input)?
            } else {
                deployment
                    .config
                    .get(&input.name)
                    .cloned()
                    .or_else(|| input.default.clone())
            };
            let Some(value) = value else {
                if input.required {
                    return Err(CompileError::BadRequest(format!(
                        "deployment {}: missing required input {}",
                        deployment.id, input.name
                    )));
                }
                continue;
            };

            let var = format!("{unit}__{}", input.name);
            match &input.kind {
                InputKind::Resource {
                    resource_type,
                    output,
                } => {
                    let ConfigValue::ResourceRef(resource_id) = &value else {
                        return Err(CompileError::BadRequest(format!(
                            "{}: expected a resource reference",
                            input.name
                        )));
                    };
                    let expr =
                        self.resource_expr(partition, deployment, resource_id, resource_type, output)?;
                    module.push_attr(&input.name, expr);
                }
                InputKind::Provider { provider_type } => {
                    let ConfigValue::ProviderRef(provider_id) = &value else {
                        return Err(CompileError::BadRequest(format!(
                            "{}: expected a provider reference",
                            input.name
                        )));
                    };
                    let provider =
                        self.provider(partition.project_id, provider_id, Some(provider_type))?;
                    bindings.push(format!(
                        "{provider_type}.{} = {provider_type}.{}",
                        input.name,
                        provider.alias()
                    ));
                    partition.providers.insert(provider.id.clone(), provider);
                }
                InputKind::Secret => {
                    let plaintext = match &value {
                        ConfigValue::SecretRef(secret_id) => self
                            .vault
                            .decrypt(secret_id, &SecretScope::Deployment(deployment.id.clone()))?,
                        ConfigValue::String(s) => s.clone(),
                        _ => {
                            return Err(CompileError::BadRequest(format!(
                                "{}: expected a secret",
                                input.name
                            )));
                        }
                    };
                    partition.secret_env.insert(format!("TF_VAR_{var}"), plaintext);
                    let declaration = self.declare_variable(partition, deployment, input, &var)?;
                    partition.variables.push(declaration);
                    module.push_attr(&input.name, format!("var.{var}"));
                }
                _ => {
                    let json = value.to_json().ok_or_else(|| {
                        CompileError::BadRequest(format!(
                            "{}: references are not allowed in plain inputs",
                            input.name
                        ))
                    })?;
                    partition.tfvars.insert(var.clone(), json);
                    let declaration = self.declare_variable(partition, deployment, input, &var)?;
                    partition.variables.push(declaration);
                    module.push_attr(&input.name, format!("var.{var}"));
                }
            }
        }

        if !bindings.is_empty() {
            module.push_attr("providers", format!("{{ {} }}", bindings.join(", ")));
        }

        for output in &template.outputs {
            let mut block = Block::new(format!("output {}", quote(&format!("{unit}__{}", output.name))))
                .attr("value", format!("module.{unit}.{}", output.name));
            if output.sensitive {
                block.push_attr("sensitive", "true");
            }
            partition.outputs.push(block);
        }

        partition
            .units
            .insert(format!("unit_{unit}.tf"), module.render());
        Ok(())
    }

    /// Value of a `configuration` input: the bound provider's config, then
    /// the details of the resource backing that provider.
    fn configuration_value(
        &self,
        partition: &Partition<'_>,
        deployment: &Deployment,
        input: &TemplateInput,
    ) -> CompileResult<Option<ConfigValue>> {
        let Some(provider_id) = &deployment.provider_id else {
            return Ok(input.default.clone());
        };
        let provider = self.provider(partition.project_id, provider_id, None)?;
        if let Some(value) = provider.config.get(&input.name) {
            return Ok(Some(value.clone()));
        }
        let from_resource = provider
            .resource_id
            .as_deref()
            .and_then(|id| partition.resources.get(id))
            .and_then(|r| r.details.get(&input.name))
            .map(ConfigValue::from_json);
        Ok(from_resource.or_else(|| input.default.clone()))
    }

    fn resource_expr(
        &self,
        partition: &mut Partition<'_>,
        deployment: &Deployment,
        resource_id: &str,
        resource_type: &str,
        output: &str,
    ) -> CompileResult<String> {
        let Some(resource) = partition.resources.get(resource_id).copied() else {
            return Err(match self.store.get::<Resource>(resource_id)? {
                Some(_) => CompileError::BadRequest(format!(
                    "resource {resource_id} is not in project {}",
                    partition.project_id
                )),
                None => CompileError::NotFound(format!("resource {resource_id}")),
            });
        };
        if resource.resource_type != resource_type {
            return Err(CompileError::BadRequest(format!(
                "resource {resource_id} is a {}, expected {resource_type}",
                resource.resource_type
            )));
        }
        if resource.deployment_id == deployment.id {
            return Err(CompileError::BadRequest(format!(
                "deployment {} references its own resource",
                deployment.id
            )));
        }
        let owner = partition
            .deployments
            .get(resource.deployment_id.as_str())
            .copied()
            .ok_or_else(|| {
                CompileError::NotFound(format!("deployment {}", resource.deployment_id))
            })?;
        let owner_unit = unit_name(&owner.id);

        if owner.deployment_type == partition.deployment_type {
            if !partition.compiled.contains(owner.id.as_str()) {
                return Err(CompileError::BadRequest(format!(
                    "resource {resource_id} belongs to a unit that is not compiled"
                )));
            }
            Ok(format!("module.{owner_unit}.{output}"))
        } else {
            partition.remote.insert(owner.deployment_type);
            Ok(format!(
                "data.terraform_remote_state.{}.outputs.{owner_unit}__{output}",
                owner.deployment_type.partition_name()
            ))
        }
    }

    fn provider(
        &self,
        project_id: &str,
        provider_id: &str,
        expected_type: Option<&str>,
    ) -> CompileResult<ProviderConfig> {
        let provider: ProviderConfig = self
            .store
            .get(provider_id)?
            .ok_or_else(|| CompileError::NotFound(format!("provider {provider_id}")))?;
        if provider.project_id != project_id {
            return Err(CompileError::BadRequest(format!(
                "provider {provider_id} is not in project {project_id}"
            )));
        }
        if let Some(expected) = expected_type {
            if provider.provider_type != expected {
                return Err(CompileError::BadRequest(format!(
                    "provider {provider_id} is a {}, expected {expected}",
                    provider.provider_type
                )));
            }
        }
        Ok(provider)
    }

    fn declare_variable(
        &self,
        partition: &Partition<'_>,
        deployment: &Deployment,
        input: &TemplateInput,
        var: &str,
    ) -> CompileResult<Block> {
        let mut block = Block::new(format!("variable {}", quote(var)));
        if let Some(ty) = input.kind.variable_type() {
            block.push_attr("type", ty);
        }
        if input.kind == InputKind::Secret {
            block.push_attr("sensitive", "true");
        }
        for rule in &input.rules {
            let (condition, message) = match rule {
                InputRule::Cidr { range } => {
                    let regex = rule.regex()?.unwrap_or_default();
                    (
                        format!("can(regex({}, var.{var}))", quote(&regex)),
                        format!("The value of {} must be within {range}.", input.name),
                    )
                }
                InputRule::Pattern { regex } => (
                    format!("can(regex({}, var.{var}))", quote(regex)),
                    format!("The value of {} must match {regex}.", input.name),
                ),
                InputRule::Range { min, max } => {
                    let mut parts = Vec::new();
                    if let Some(min) = min {
                        parts.push(format!("var.{var} >= {min}"));
                    }
                    if let Some(max) = max {
                        parts.push(format!("var.{var} <= {max}"));
                    }
                    if parts.is_empty() {
                        continue;
                    }
                    (
                        parts.join(" && "),
                        format!("The value of {} is out of range.", input.name),
                    )
                }
                InputRule::Quota { metric } => {
                    let Some(available) = partition.available_for(deployment, metric) else {
                        continue;
                    };
                    (
                        format!("var.{var} <= {available}"),
                        format!(
                            "The value of {} exceeds the remaining {metric} quota of {available}.",
                            input.name
                        ),
                    )
                }
            };
            block.push_block(
                Block::new("validation")
                    .attr("condition", condition)
                    .attr("error_message", quote(&message)),
            );
        }
        Ok(block)
    }

    fn provider_blocks(&self, partition: &mut Partition<'_>) -> CompileResult<Vec<Block>> {
        let mut blocks = Vec::new();
        for provider in partition.providers.values() {
            let alias = provider.alias();
            let mut block = Block::new(format!("provider {}", quote(&provider.provider_type)))
                .attr("alias", quote(&alias));
            for (key, value) in &provider.config {
                match value {
                    ConfigValue::SecretRef(secret_id) => {
                        let var = format!("{alias}__{key}");
                        let plaintext = self
                            .vault
                            .decrypt(secret_id, &SecretScope::Provider(provider.id.clone()))?;
                        partition.secret_env.insert(format!("TF_VAR_{var}"), plaintext);
                        partition.variables.push(
                            Block::new(format!("variable {}", quote(&var)))
                                .attr("type", "string")
                                .attr("sensitive", "true"),
                        );
                        block.push_attr(key, format!("var.{var}"));
                    }
                    other => {
                        let json = other.to_json().ok_or_else(|| {
                            CompileError::BadRequest(format!(
                                "provider {}: {key} must be a plain value",
                                provider.id
                            ))
                        })?;
                        block.push_attr(key, literal(&json));
                    }
                }
            }
            blocks.push(block);
        }
        Ok(blocks)
    }
}

fn backend_block() -> Block {
    Block::new("terraform").block(
        Block::new(format!("backend {}", quote("local"))).attr("path", quote("terraform.tfstate")),
    )
}

fn remote_state_block(deployment_type: &DeploymentType) -> Block {
    let partition = deployment_type.partition_name();
    Block::new(format!(
        "data {} {}",
        quote("terraform_remote_state"),
        quote(partition)
    ))
    .attr("backend", quote("local"))
    .attr(
        "config",
        format!(
            "{{ path = {} }}",
            quote(&format!("../{partition}/terraform.tfstate"))
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use terraplane_core::{ConfigMap, ResourceSchema, TemplateOutput};
    use terraplane_state::{DeploymentStatus, StoreVault, epoch_secs};

    struct Fixture {
        store: StateStore,
        vault: Arc<StoreVault>,
        compiler: ConfigCompiler,
        _modules: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let modules = tempfile::tempdir().unwrap();
        for name in ["network", "app"] {
            std::fs::create_dir_all(modules.path().join(name)).unwrap();
            std::fs::write(modules.path().join(name).join("main.tf"), "# module\n").unwrap();
        }
        let store = StateStore::open_in_memory().unwrap();
        let vault = Arc::new(StoreVault::new(store.clone()));
        let compiler = ConfigCompiler::new(
            store.clone(),
            vault.clone(),
            modules.path().to_path_buf(),
        );

        store.put(&network_template()).unwrap();
        store.put(&app_template()).unwrap();
        store
            .put(&ProviderConfig {
                id: "prov-1".to_string(),
                project_id: "p1".to_string(),
                name: "cloud".to_string(),
                provider_type: "cloud".to_string(),
                config: ConfigMap::from([
                    ("region".to_string(), ConfigValue::String("eu-1".to_string())),
                    ("zone".to_string(), ConfigValue::String("eu-1a".to_string())),
                ]),
                resource_id: None,
                created_at: 0,
            })
            .unwrap();
        Fixture {
            store,
            vault,
            compiler,
            _modules: modules,
        }
    }

    fn input(name: &str, kind: InputKind) -> TemplateInput {
        TemplateInput {
            name: name.to_string(),
            kind,
            required: false,
            configuration: false,
            dummy: false,
            default: None,
            rules: Vec::new(),
        }
    }

    fn network_template() -> Template {
        let mut cidr = input("cidr", InputKind::String);
        cidr.required = true;
        cidr.rules = vec![InputRule::Cidr {
            range: "10.0.0.0/16".to_string(),
        }];
        let mut cpu = input("cpu", InputKind::Number);
        cpu.rules = vec![InputRule::Quota {
            metric: "cpu".to_string(),
        }];
        let mut zone = input("zone", InputKind::String);
        zone.configuration = true;
        let mut note = input("note", InputKind::String);
        note.dummy = true;
        Template {
            id: "t-net".to_string(),
            name: "network".to_string(),
            deployment_type: DeploymentType::Infrastructure,
            source: "./network".to_string(),
            provider_type: Some("cloud".to_string()),
            inputs: vec![
                cidr,
                cpu,
                input("password", InputKind::Secret),
                zone,
                note,
            ],
            outputs: vec![TemplateOutput {
                name: "id".to_string(),
                sensitive: false,
            }],
            resource: Some(ResourceSchema {
                resource_type: "network".to_string(),
                name_input: None,
                usage: BTreeMap::new(),
                provider: None,
            }),
            constraints: Vec::new(),
        }
    }

    fn app_template() -> Template {
        Template {
            id: "t-app".to_string(),
            name: "app".to_string(),
            deployment_type: DeploymentType::Application,
            source: "./app".to_string(),
            provider_type: None,
            inputs: vec![input(
                "network_id",
                InputKind::Resource {
                    resource_type: "network".to_string(),
                    output: "id".to_string(),
                },
            )],
            outputs: Vec::new(),
            resource: None,
            constraints: Vec::new(),
        }
    }

    fn deployment(id: &str, template: &Template, status: DeploymentStatus, config: ConfigMap) -> Deployment {
        Deployment {
            id: id.to_string(),
            project_id: "p1".to_string(),
            template_id: template.id.clone(),
            name: id.to_string(),
            deployment_type: template.deployment_type,
            status,
            config,
            active: true,
            destroy: false,
            plan: false,
            parent_deployment_id: None,
            provider_id: template.provider_type.as_ref().map(|_| "prov-1".to_string()),
            constraint_keys: Vec::new(),
            requested_usage: BTreeMap::new(),
            user_id: "alice".to_string(),
            plan_output: None,
            error: None,
            applied_at: None,
            created_at: epoch_secs(),
            updated_at: epoch_secs(),
        }
    }

    fn network_config(f: &Fixture, id: &str) -> ConfigMap {
        let secret = f
            .vault
            .encrypt(&SecretScope::Deployment(id.to_string()), "p1", "hunter2")
            .unwrap();
        ConfigMap::from([
            ("cidr".to_string(), ConfigValue::String("10.0.1.0/24".to_string())),
            ("cpu".to_string(), ConfigValue::Number(2.0)),
            ("password".to_string(), ConfigValue::SecretRef(secret)),
            ("note".to_string(), ConfigValue::String("ignored".to_string())),
        ])
    }

    fn resource(id: &str, deployment_id: &str, cpu: u64) -> Resource {
        Resource {
            id: id.to_string(),
            project_id: "p1".to_string(),
            deployment_id: deployment_id.to_string(),
            name: id.to_string(),
            resource_type: "network".to_string(),
            details: BTreeMap::from([("id".to_string(), serde_json::json!("net-123"))]),
            usage: BTreeMap::from([("cpu".to_string(), cpu)]),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn compiles_variables_units_and_outputs() {
        let f = fixture();
        let config = network_config(&f, "n1");
        let net = deployment("n1", &network_template(), DeploymentStatus::Running, config);
        f.store.put(&net).unwrap();

        let set = f.compiler.compile("p1", DeploymentType::Infrastructure).unwrap();
        assert_eq!(set.units, vec!["n1"]);

        let unit = &set.files["unit_d_n1.tf"];
        assert!(unit.contains(r#"source = "./modules/d_n1""#));
        assert!(unit.contains("cidr = var.d_n1__cidr"));
        assert!(unit.contains("zone = var.d_n1__zone"));
        assert!(unit.contains("providers = { cloud = cloud.p_prov_1 }"));
        assert!(!unit.contains("note"));

        let variables = &set.files["variables.tf"];
        assert!(variables.contains("can(regex("));
        assert!(variables.contains("sensitive = true"));

        let tfvars: Value = serde_json::from_str(&set.files["terraform.tfvars.json"]).unwrap();
        assert_eq!(tfvars["d_n1__cidr"], "10.0.1.0/24");
        assert_eq!(tfvars["d_n1__zone"], "eu-1a");
        assert!(tfvars.get("d_n1__password").is_none());
        assert_eq!(set.secret_env["TF_VAR_d_n1__password"], "hunter2");
        assert!(!set.files.values().any(|content| content.contains("hunter2")));

        assert!(set.files["outputs.tf"].contains("value = module.d_n1.id"));
        assert!(set.files["providers.tf"].contains(r#"alias = "p_prov_1""#));
        assert!(set.files["main.tf"].contains(r#"backend "local""#));
        assert!(set.modules.contains_key("d_n1"));
        assert!(!set.files.contains_key("data.tf"));
    }

    #[test]
    fn quota_validation_excludes_own_usage() {
        let f = fixture();
        let mut quota = ProjectResourceQuota::zeroed("p1");
        quota.quotas.insert("cpu".to_string(), 4);
        f.store.put(&quota).unwrap();
        f.store.put(&resource("r-other", "other", 1)).unwrap();
        f.store.put(&resource("r-own", "n1", 2)).unwrap();

        let config = network_config(&f, "n1");
        f.store
            .put(&deployment("n1", &network_template(), DeploymentStatus::Completed, config))
            .unwrap();

        let set = f.compiler.compile("p1", DeploymentType::Infrastructure).unwrap();
        assert!(set.files["variables.tf"].contains("var.d_n1__cpu <= 3"));
    }

    #[test]
    fn cross_partition_reference_reads_remote_state() {
        let f = fixture();
        let config = network_config(&f, "n1");
        f.store
            .put(&deployment("n1", &network_template(), DeploymentStatus::Completed, config))
            .unwrap();
        f.store.put(&resource("r1", "n1", 0)).unwrap();
        let app_config = ConfigMap::from([(
            "network_id".to_string(),
            ConfigValue::ResourceRef("r1".to_string()),
        )]);
        f.store
            .put(&deployment("a1", &app_template(), DeploymentStatus::Running, app_config))
            .unwrap();

        let set = f.compiler.compile("p1", DeploymentType::Application).unwrap();
        assert!(set.files["unit_d_a1.tf"].contains(
            "network_id = data.terraform_remote_state.infrastructure.outputs.d_n1__id"
        ));
        assert!(set.files["data.tf"].contains(r#"path = "../infrastructure/terraform.tfstate""#));
    }

    #[test]
    fn same_partition_reference_is_direct() {
        let f = fixture();
        let mut template = app_template();
        template.id = "t-infra-app".to_string();
        template.deployment_type = DeploymentType::Infrastructure;
        f.store.put(&template).unwrap();

        let config = network_config(&f, "n1");
        f.store
            .put(&deployment("n1", &network_template(), DeploymentStatus::Completed, config))
            .unwrap();
        f.store.put(&resource("r1", "n1", 0)).unwrap();
        let config = ConfigMap::from([(
            "network_id".to_string(),
            ConfigValue::ResourceRef("r1".to_string()),
        )]);
        f.store
            .put(&deployment("a1", &template, DeploymentStatus::Running, config))
            .unwrap();

        let set = f.compiler.compile("p1", DeploymentType::Infrastructure).unwrap();
        assert!(set.files["unit_d_a1.tf"].contains("network_id = module.d_n1.id"));
        assert!(!set.files.contains_key("data.tf"));
    }

    #[test]
    fn missing_or_foreign_resources_fail() {
        let f = fixture();
        let config = ConfigMap::from([(
            "network_id".to_string(),
            ConfigValue::ResourceRef("nope".to_string()),
        )]);
        f.store
            .put(&deployment("a1", &app_template(), DeploymentStatus::Running, config))
            .unwrap();
        assert!(matches!(
            f.compiler.compile("p1", DeploymentType::Application),
            Err(CompileError::NotFound(_))
        ));

        let mut foreign = resource("r9", "x1", 0);
        foreign.project_id = "p2".to_string();
        f.store.put(&foreign).unwrap();
        let config = ConfigMap::from([(
            "network_id".to_string(),
            ConfigValue::ResourceRef("r9".to_string()),
        )]);
        f.store
            .put(&deployment("a1", &app_template(), DeploymentStatus::Running, config))
            .unwrap();
        assert!(matches!(
            f.compiler.compile("p1", DeploymentType::Application),
            Err(CompileError::BadRequest(_))
        ));
    }

    #[test]
    fn retired_unit_follows_its_twin() {
        let f = fixture();
        let config = network_config(&f, "n1");
        let mut original = deployment("n1", &network_template(), DeploymentStatus::Completed, config);
        original.active = false;
        f.store.put(&original).unwrap();
        let mut twin = deployment("n1-x", &network_template(), DeploymentStatus::Queued, ConfigMap::new());
        twin.destroy = true;
        twin.parent_deployment_id = Some("n1".to_string());
        f.store.put(&twin).unwrap();

        let set = f.compiler.compile("p1", DeploymentType::Infrastructure).unwrap();
        assert_eq!(set.units, vec!["n1"]);

        f.store
            .transition_deployment("n1-x", &[DeploymentStatus::Queued], |d| {
                d.status = DeploymentStatus::Running;
            })
            .unwrap();
        let set = f.compiler.compile("p1", DeploymentType::Infrastructure).unwrap();
        assert!(set.is_empty());
        assert!(set.files.contains_key("main.tf"));
        assert!(!set.files.keys().any(|name| name.starts_with("unit_")));
    }

    #[test]
    fn missing_required_input_fails() {
        let f = fixture();
        let net = deployment("n1", &network_template(), DeploymentStatus::Running, ConfigMap::new());
        f.store.put(&net).unwrap();
        assert!(matches!(
            f.compiler.compile("p1", DeploymentType::Infrastructure),
            Err(CompileError::BadRequest(_))
        ));
    }
}
