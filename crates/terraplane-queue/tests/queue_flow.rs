//! End-to-end queue flows against a scripted in-process executor.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use terraplane_compiler::ConfigCompiler;
use terraplane_core::template::{ResourceSchema, TemplateInput, TemplateOutput, UsageSource};
use terraplane_core::{
    ConfigMap, ConfigValue, DeploymentType, InputKind, InputRule, SecretVault, Template,
};
use terraplane_deploy::{
    DeleteOutcome, DeployError, DeploymentService, NewDeployment, NoopNotifier, QueueNotifier,
};
use terraplane_executor::{ExecError, ExecResult, Executor, Run, StoreLogSink};
use terraplane_queue::{JobRunner, QueueManager, QueuePublisher, RunnerSettings};
use terraplane_state::{
    Deployment, DeploymentStatus, JobKind, LogStream, StateStore, StoreVault, unit_name,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ── Scripted executor ──────────────────────────────────────────────

#[derive(Default)]
struct FakeExecutor {
    /// `(command, partition, units compiled)` in call order.
    calls: Mutex<Vec<(String, String, Vec<String>)>>,
    /// Number of upcoming applies that fail.
    failing_applies: Mutex<usize>,
    /// Prefix of every output value.
    output_prefix: Mutex<String>,
    /// Per project: (running now, most ever running at once).
    in_flight: Mutex<HashMap<String, (usize, usize)>>,
    delay: Duration,
}

impl FakeExecutor {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn units(dir: &Path) -> Vec<String> {
        let mut units: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| {
                        let name = e.file_name().to_string_lossy().to_string();
                        name.strip_prefix("unit_")
                            .and_then(|n| n.strip_suffix(".tf"))
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default();
        units.sort();
        units
    }

    fn record(&self, command: &str, run: &Run) -> Vec<String> {
        let partition = run
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let units = Self::units(&run.dir);
        self.calls
            .lock()
            .unwrap()
            .push((command.to_string(), partition, units.clone()));
        units
    }

    fn project(run: &Run) -> String {
        run.dir
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    async fn occupy(&self, run: &Run) {
        let project = Self::project(run);
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let entry = in_flight.entry(project.clone()).or_default();
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }
        tokio::time::sleep(self.delay).await;
        self.in_flight.lock().unwrap().entry(project).or_default().0 -= 1;
    }

    fn applies(&self) -> Vec<(String, Vec<String>)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(command, _, _)| command == "apply")
            .map(|(_, partition, units)| (partition.clone(), units.clone()))
            .collect()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn init(&self, run: &Run) -> ExecResult<()> {
        self.record("init", run);
        run.log.push(LogStream::Stdout, "Initializing the backend...");
        Ok(())
    }

    async fn validate(&self, run: &Run) -> ExecResult<()> {
        self.record("validate", run);
        Ok(())
    }

    async fn plan(&self, run: &Run) -> ExecResult<Value> {
        let units = self.record("plan", run);
        self.occupy(run).await;
        Ok(serde_json::json!({ "format_version": "1.2", "units": units }))
    }

    async fn apply(&self, run: &Run) -> ExecResult<()> {
        self.record("apply", run);
        self.occupy(run).await;
        let mut failing = self.failing_applies.lock().unwrap();
        if *failing > 0 {
            *failing -= 1;
            run.log.push(LogStream::Stderr, "Error: quota exceeded upstream, apply rejected");
            return Err(ExecError::Failed {
                command: "terraform apply".to_string(),
                code: Some(1),
                output: "Error: quota exceeded upstream, apply rejected".to_string(),
            });
        }
        run.log.push(LogStream::Stdout, "Apply complete!");
        Ok(())
    }

    async fn refresh(&self, run: &Run) -> ExecResult<()> {
        self.record("refresh", run);
        Ok(())
    }

    async fn output(&self, run: &Run) -> ExecResult<BTreeMap<String, Value>> {
        let outputs = std::fs::read_to_string(run.dir.join("outputs.tf"))?;
        let prefix = self.output_prefix.lock().unwrap().clone();
        Ok(outputs
            .lines()
            .filter_map(|line| line.strip_prefix("output \""))
            .filter_map(|rest| rest.split('"').next())
            .map(|name| (name.to_string(), Value::String(format!("{prefix}{name}"))))
            .collect())
    }
}

// ── Harness ────────────────────────────────────────────────────────

struct Harness {
    service: DeploymentService,
    manager: QueueManager,
    executor: Arc<FakeExecutor>,
    wakeups: Option<mpsc::UnboundedReceiver<String>>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Option<JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(executor: FakeExecutor) -> Self {
        let (publisher, wakeups) = QueuePublisher::channel();
        Self::build(executor, Arc::new(publisher), Some(wakeups))
    }

    fn without_publisher(executor: FakeExecutor) -> Self {
        Self::build(executor, Arc::new(NoopNotifier), None)
    }

    fn build(
        executor: FakeExecutor,
        notifier: Arc<dyn QueueNotifier>,
        wakeups: Option<mpsc::UnboundedReceiver<String>>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let vault: Arc<dyn SecretVault> = Arc::new(StoreVault::new(store.clone()));
        let service = DeploymentService::new(store.clone(), vault.clone(), notifier);
        let compiler = ConfigCompiler::new(store.clone(), vault, dir.path().join("modules"));
        let executor = Arc::new(executor);
        let runner = JobRunner::new(
            service.clone(),
            compiler,
            executor.clone(),
            Arc::new(StoreLogSink::new(store)),
            RunnerSettings {
                work_root: dir.path().join("work"),
                flush_interval: Duration::from_millis(20),
                max_deliveries: 2,
            },
        );
        for template in [
            template("t-net", DeploymentType::Infrastructure, "network", None),
            template("t-cluster", DeploymentType::InfraConfig, "cluster", Some("network")),
        ] {
            service.register_template(template).unwrap();
        }
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            service,
            manager: QueueManager::new(runner),
            executor,
            wakeups,
            shutdown_tx,
            dispatcher: None,
            _dir: dir,
        }
    }

    fn start(&mut self) {
        if let Some(wakeups) = self.wakeups.take() {
            let handle = self.manager.spawn(wakeups, self.shutdown_tx.subscribe());
            self.dispatcher = Some(handle);
        }
    }

    fn deployment(&self, id: &str) -> Deployment {
        self.service.get_deployment(id).unwrap()
    }

    async fn wait_for_status(&self, id: &str, status: DeploymentStatus) -> Deployment {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let current = self.deployment(id);
            if current.status == status {
                return current;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "deployment {id} stuck in {} waiting for {status}",
                current.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_empty_queue(&self, project: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.service.store().queue_len(project).unwrap() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "queue of {project} never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        match self.dispatcher.take() {
            Some(handle) => handle.await.unwrap(),
            None => self.manager.stop_all().await,
        }
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

fn template(id: &str, ty: DeploymentType, resource_type: &str, upstream: Option<&str>) -> Template {
    let mut cpu = input("cpu", InputKind::Number);
    cpu.rules = vec![InputRule::Quota { metric: "cpu".to_string() }];
    let mut inputs = vec![cpu];
    if let Some(upstream_type) = upstream {
        let mut reference = input(
            "upstream",
            InputKind::Resource {
                resource_type: upstream_type.to_string(),
                output: "id".to_string(),
            },
        );
        reference.required = true;
        inputs.push(reference);
    }
    Template {
        id: id.to_string(),
        name: id.to_string(),
        deployment_type: ty,
        source: format!("git::https://git.example.com/modules.git//{resource_type}"),
        provider_type: None,
        inputs,
        outputs: vec![TemplateOutput { name: "id".to_string(), sensitive: false }],
        resource: Some(ResourceSchema {
            resource_type: resource_type.to_string(),
            name_input: None,
            usage: BTreeMap::from([("cpu".to_string(), UsageSource::Input("cpu".to_string()))]),
            provider: None,
        }),
        constraints: Vec::new(),
    }
}

fn request(template_id: &str, name: &str, cpu: f64, upstream: Option<&str>) -> NewDeployment {
    let mut config = ConfigMap::from([("cpu".to_string(), ConfigValue::Number(cpu))]);
    if let Some(resource_id) = upstream {
        config.insert(
            "upstream".to_string(),
            ConfigValue::ResourceRef(resource_id.to_string()),
        );
    }
    NewDeployment {
        template_id: template_id.to_string(),
        name: name.to_string(),
        config,
        plan: false,
        provider_id: None,
        user_id: "alice".to_string(),
    }
}

fn resource_id(service: &DeploymentService, deployment_id: &str) -> String {
    service
        .store()
        .resources_for_deployment(deployment_id)
        .unwrap()
        .pop()
        .map(|r| r.id)
        .expect("deployment has a resource")
}

// ── Flows ──────────────────────────────────────────────────────────

#[tokio::test]
async fn quota_dependency_conflict_and_cascade() {
    let mut h = Harness::new(FakeExecutor::default());
    h.start();
    h.service
        .set_quota("p1", BTreeMap::from([("cpu".to_string(), 4)]))
        .unwrap();

    let d1 = h.service.create_deployment("p1", request("t-net", "net", 2.0, None)).unwrap();
    h.wait_for_status(&d1.id, DeploymentStatus::Completed).await;
    assert_eq!(h.service.get_quota("p1").unwrap().usage["cpu"], 2);
    let net = resource_id(&h.service, &d1.id);

    let err = h
        .service
        .create_deployment("p1", request("t-cluster", "cluster", 3.0, Some(&net)))
        .unwrap_err();
    match err {
        DeployError::QuotaExceeded { metric, available, requested } => {
            assert_eq!((metric.as_str(), available, requested), ("cpu", 2, 3));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.service.get_quota("p1").unwrap().usage["cpu"], 2);

    let d2 = h
        .service
        .create_deployment("p1", request("t-cluster", "cluster", 2.0, Some(&net)))
        .unwrap();
    h.wait_for_status(&d2.id, DeploymentStatus::Completed).await;
    let cluster = resource_id(&h.service, &d2.id);
    assert_eq!(h.service.get_quota("p1").unwrap().usage["cpu"], 4);

    let outcome = h.service.delete_deployment(&d1.id, "alice", false).unwrap();
    let report = match outcome {
        DeleteOutcome::DependencyConflict(report) => report,
        other => panic!("expected a dependency conflict, got {other:?}"),
    };
    assert_eq!(report.dependents.len(), 1);
    assert_eq!(report.dependents[0].resource_id, cluster);
    assert_eq!(report.dependents[0].deployment_id, d2.id);
    assert_eq!(h.deployment(&d1.id).status, DeploymentStatus::Completed);

    let applies_before = h.executor.applies().len();
    let twins = match h.service.delete_deployment(&d1.id, "alice", true).unwrap() {
        DeleteOutcome::Cascaded(twins) => twins,
        other => panic!("expected a cascade, got {other:?}"),
    };
    assert_eq!(twins.len(), 2);
    assert_eq!(twins[0].parent_deployment_id.as_deref(), Some(d2.id.as_str()));
    assert_eq!(twins[1].parent_deployment_id.as_deref(), Some(d1.id.as_str()));
    for twin in &twins {
        h.wait_for_status(&twin.id, DeploymentStatus::Completed).await;
    }
    h.wait_for_empty_queue("p1").await;

    // The dependent partition is emptied first, then the one it read from.
    let teardown = h.executor.applies().split_off(applies_before);
    assert_eq!(
        teardown,
        vec![
            ("infra_config".to_string(), Vec::new()),
            ("infrastructure".to_string(), Vec::new()),
        ]
    );
    assert!(h.service.store().list_resources("p1").unwrap().is_empty());
    assert!(h.service.get_quota("p1").unwrap().usage.is_empty());
    assert!(!h.deployment(&d1.id).active);
    assert!(!h.deployment(&d2.id).active);

    let logs = h.service.deployment_logs(&twins[1].id).unwrap();
    assert!(logs.iter().any(|l| l.line == "Apply complete!"));
    h.shutdown().await;
}

#[tokio::test]
async fn destroy_drops_only_the_retired_unit() {
    let mut h = Harness::new(FakeExecutor::default());
    h.start();
    let keep = h.service.create_deployment("p1", request("t-net", "keep", 1.0, None)).unwrap();
    let gone = h.service.create_deployment("p1", request("t-net", "gone", 1.0, None)).unwrap();
    h.wait_for_status(&keep.id, DeploymentStatus::Completed).await;
    h.wait_for_status(&gone.id, DeploymentStatus::Completed).await;

    let twin = match h.service.delete_deployment(&gone.id, "alice", false).unwrap() {
        DeleteOutcome::DestroyQueued(twin) => twin,
        other => panic!("expected a destroy run, got {other:?}"),
    };
    h.wait_for_status(&twin.id, DeploymentStatus::Completed).await;

    let last = h.executor.applies().pop().unwrap();
    assert_eq!(last, ("infrastructure".to_string(), vec![unit_name(&keep.id)]));
    h.shutdown().await;
}

#[tokio::test]
async fn failed_apply_is_compensated_and_redelivery_is_skipped() {
    let mut h = Harness::new(FakeExecutor::default());
    h.start();
    h.service
        .set_quota("p1", BTreeMap::from([("cpu".to_string(), 4)]))
        .unwrap();

    let ok = h.service.create_deployment("p1", request("t-net", "ok", 1.0, None)).unwrap();
    h.wait_for_status(&ok.id, DeploymentStatus::Completed).await;
    let applies_before = h.executor.applies().len();

    *h.executor.failing_applies.lock().unwrap() = 1;
    let broken = h
        .service
        .create_deployment("p1", request("t-net", "broken", 2.0, None))
        .unwrap();

    let failed = h.wait_for_status(&broken.id, DeploymentStatus::Failed).await;
    h.wait_for_empty_queue("p1").await;
    let reason = failed.error.expect("failure reason recorded");
    assert!(reason.starts_with("execution failed"), "{reason}");
    assert!(reason.contains("Error: quota exceeded upstream, apply rejected"), "{reason}");
    assert!(h.service.store().resources_for_deployment(&broken.id).unwrap().is_empty());
    assert_eq!(h.service.get_quota("p1").unwrap().usage["cpu"], 1);

    // The failing apply, then a teardown apply without the failed unit.
    let applies = h.executor.applies().split_off(applies_before);
    assert_eq!(applies.len(), 2, "{applies:?}");
    assert!(applies[0].1.contains(&unit_name(&broken.id)));
    assert_eq!(applies[1].1, vec![unit_name(&ok.id)]);

    let logs = h.service.deployment_logs(&broken.id).unwrap();
    assert!(logs.iter().any(|l| l.line.contains("rejected")));

    // Retrying is legal from Failed.
    h.service.start_deployment(&broken.id).unwrap();
    h.wait_for_status(&broken.id, DeploymentStatus::Completed).await;
    assert_eq!(h.service.get_quota("p1").unwrap().usage["cpu"], 3);
    h.shutdown().await;
}

#[tokio::test]
async fn plan_then_apply() {
    let mut h = Harness::new(FakeExecutor::default());
    h.start();
    let mut req = request("t-net", "net", 1.0, None);
    req.plan = true;
    let d = h.service.create_deployment("p1", req).unwrap();

    let pending = h.wait_for_status(&d.id, DeploymentStatus::Pending).await;
    let plan = pending.plan_output.unwrap();
    assert_eq!(plan["units"], serde_json::json!([unit_name(&d.id)]));
    assert!(h.service.store().resources_for_deployment(&d.id).unwrap().is_empty());

    h.service.start_deployment(&d.id).unwrap();
    h.wait_for_status(&d.id, DeploymentStatus::Completed).await;
    assert_eq!(h.service.store().resources_for_deployment(&d.id).unwrap().len(), 1);
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_consumer_per_project() {
    let mut h = Harness::new(FakeExecutor::with_delay(Duration::from_millis(30)));
    h.start();

    let mut ids = Vec::new();
    for project in ["p1", "p2"] {
        for n in 0..3 {
            let d = h
                .service
                .create_deployment(project, request("t-net", &format!("net-{n}"), 1.0, None))
                .unwrap();
            ids.push(d.id);
        }
    }
    for id in &ids {
        h.wait_for_status(id, DeploymentStatus::Completed).await;
    }

    let in_flight = h.executor.in_flight.lock().unwrap().clone();
    assert_eq!(in_flight["p1"], (0, 1));
    assert_eq!(in_flight["p2"], (0, 1));
    assert_eq!(h.manager.active_workers().await, vec!["p1".to_string(), "p2".to_string()]);
    h.shutdown().await;
}

#[tokio::test]
async fn resume_picks_up_queued_and_interrupted_jobs() {
    let h = Harness::without_publisher(FakeExecutor::default());
    let queued = h.service.create_deployment("p1", request("t-net", "queued", 1.0, None)).unwrap();
    assert_eq!(queued.status, DeploymentStatus::Queued);

    // A second project whose run was cut short by a restart.
    let cut = h.service.create_deployment("p2", request("t-net", "cut", 1.0, None)).unwrap();
    h.service
        .begin_execution(&cut.id, JobKind::Apply)
        .unwrap()
        .unwrap();

    assert_eq!(h.manager.resume().await.unwrap(), 2);
    h.wait_for_status(&queued.id, DeploymentStatus::Completed).await;
    let failed = h.wait_for_status(&cut.id, DeploymentStatus::Failed).await;
    assert!(failed.error.unwrap_or_default().contains("interrupted"));
    h.wait_for_empty_queue("p2").await;
    h.shutdown().await;
}

#[tokio::test]
async fn refresh_rereads_outputs_in_apply_order() {
    let mut h = Harness::new(FakeExecutor::default());
    h.start();
    let net = h.service.create_deployment("p1", request("t-net", "net", 1.0, None)).unwrap();
    h.wait_for_status(&net.id, DeploymentStatus::Completed).await;
    let net_resource = resource_id(&h.service, &net.id);
    let cluster = h
        .service
        .create_deployment("p1", request("t-cluster", "cluster", 1.0, Some(&net_resource)))
        .unwrap();
    h.wait_for_status(&cluster.id, DeploymentStatus::Completed).await;

    *h.executor.output_prefix.lock().unwrap() = "v2-".to_string();
    h.service.enqueue_refresh("p1").unwrap();
    h.wait_for_empty_queue("p1").await;

    let refreshed: Vec<String> = h
        .executor
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|(command, _, _)| command == "refresh")
        .map(|(_, partition, _)| partition.clone())
        .collect();
    assert_eq!(refreshed, vec!["infrastructure", "infra_config"]);

    for resource in h.service.store().list_resources("p1").unwrap() {
        let id = resource.details["id"].as_str().unwrap_or_default().to_string();
        assert!(id.starts_with("v2-"), "{id}");
    }
    assert!(!h.service.refresh_logs("p1").unwrap().is_empty());
    h.shutdown().await;
}
