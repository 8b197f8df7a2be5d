//! Recording fakes for provider seams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use tideway_control::channel::{Channel, ChannelBroker};
use tideway_control::config::PoolConfig;
use tideway_control::executor::{ExecutionContext, StrategyExecutor};
use tideway_control::locator::InstanceLocator;
use tideway_control::orchestrator::{OrchestratorApi, ServiceDeployment, ServiceState, TaskTemplate};
use tideway_control::process::CommandOutput;
use tideway_control::registry::{ArtifactRegistry, ImageReference};
use tideway_control::store::Parameter;
use tideway_control::traffic::{PoolCapacity, RefreshStatus, TargetHealth, TrafficApi};
use tideway_control::types::{Credential, HostRole, RelayHost};
use tideway_control::{
    ConfigStore, ControlError, ControlResult, DeploymentOutcome, DeploymentStrategy,
    ExecutionStatus, MemoryConfigStore, ParameterKey, TargetHost, TargetResult,
};

use super::{EventLog, REGISTRY};

// =============================================================================
// Config store
// =============================================================================

/// Memory store that logs writes and can be made to fail.
pub struct RecordingStore {
    inner: MemoryConfigStore,
    log: EventLog,
    fail_writes: bool,
}

impl RecordingStore {
    pub fn new(log: EventLog) -> Self {
        Self {
            inner: MemoryConfigStore::new(),
            log,
            fail_writes: false,
        }
    }

    pub fn failing(log: EventLog) -> Self {
        Self {
            fail_writes: true,
            ..Self::new(log)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty().unwrap()
    }
}

#[async_trait]
impl ConfigStore for RecordingStore {
    async fn get(&self, key: &ParameterKey) -> ControlResult<Option<Parameter>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &ParameterKey, value: &str) -> ControlResult<()> {
        if self.fail_writes {
            return Err(ControlError::transient(
                "put parameter",
                key.as_str(),
                "Rate exceeded",
            ));
        }
        self.log.push(format!("put {key}={value}"));
        self.inner.put(key, value).await
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registry with a fixed host that records pushes.
#[derive(Default)]
pub struct StaticRegistry {
    pub pushes: Mutex<Vec<String>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactRegistry for StaticRegistry {
    async fn registry_host(&self) -> ControlResult<String> {
        Ok(REGISTRY.to_owned())
    }

    async fn push(
        &self,
        repository: &str,
        tag: &str,
        local_image: &str,
    ) -> ControlResult<ImageReference> {
        self.pushes.lock().unwrap().push(local_image.to_owned());
        self.reference(repository, tag).await
    }
}

// =============================================================================
// Locator and channels
// =============================================================================

pub fn host(id: &str, address: &str, name: &str) -> TargetHost {
    let role = if name.contains("bastion") {
        HostRole::RelayExcluded
    } else {
        HostRole::Normal
    };
    TargetHost {
        id: id.to_owned(),
        address: address.to_owned(),
        name: Some(name.to_owned()),
        role,
    }
}

/// Locator returning a fixed host list.
pub struct FakeLocator {
    hosts: Vec<TargetHost>,
    pub queries: Mutex<Vec<(String, bool)>>,
}

impl FakeLocator {
    pub fn new(hosts: Vec<TargetHost>) -> Self {
        Self {
            hosts,
            queries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl InstanceLocator for FakeLocator {
    async fn list(&self, environment: &str, via_relay: bool) -> ControlResult<Vec<TargetHost>> {
        self.queries
            .lock()
            .unwrap()
            .push((environment.to_owned(), via_relay));
        Ok(self.hosts.clone())
    }
}

type HostResponder = dyn Fn(&str) -> ControlResult<CommandOutput> + Send + Sync;

/// Broker whose channels answer from a closure keyed by host address.
pub struct FakeBroker {
    responder: Arc<HostResponder>,
    pub connections: Mutex<Vec<(String, Option<String>)>>,
    pub commands: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeBroker {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> ControlResult<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            connections: Mutex::new(Vec::new()),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every host answers with a clean exit.
    pub fn healthy() -> Self {
        Self::new(|address| Ok(CommandOutput::ok(format!("{address} updated"))))
    }

    pub fn connected(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .connections
            .lock()
            .unwrap()
            .iter()
            .map(|(host, _)| host.clone())
            .collect();
        hosts.sort();
        hosts
    }
}

struct FakeChannel {
    address: String,
    responder: Arc<HostResponder>,
    commands: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl Channel for FakeChannel {
    fn target(&self) -> &str {
        &self.address
    }

    async fn run(&self, command: &str) -> ControlResult<CommandOutput> {
        self.commands
            .lock()
            .unwrap()
            .push((self.address.clone(), command.to_owned()));
        (self.responder)(&self.address)
    }
}

#[async_trait]
impl ChannelBroker for FakeBroker {
    async fn connect(
        &self,
        host: &TargetHost,
        _credential: &Credential,
        relay: Option<&RelayHost>,
    ) -> ControlResult<Box<dyn Channel>> {
        self.connections
            .lock()
            .unwrap()
            .push((host.address.clone(), relay.map(ToString::to_string)));
        Ok(Box::new(FakeChannel {
            address: host.address.clone(),
            responder: Arc::clone(&self.responder),
            commands: Arc::clone(&self.commands),
        }))
    }
}

// =============================================================================
// Traffic
// =============================================================================

/// When the fake alarm fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmMode {
    Never,
    Always,
    AfterShift,
    /// Reads fail once the listener has moved.
    UnreadableAfterShift,
}

/// Scripted load balancer and scaling groups.
pub struct FakeTrafficApi {
    listener: Mutex<String>,
    refresh: Mutex<VecDeque<RefreshStatus>>,
    health: TargetHealth,
    alarm: AlarmMode,
    shifted: Mutex<bool>,
    cancel_on_shift: Option<CancellationToken>,
    /// Desired size per scaling group.
    capacity: Mutex<HashMap<String, u32>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeTrafficApi {
    /// Listener on blue; refresh completes after one poll; green fully healthy.
    pub fn new() -> Self {
        Self {
            listener: Mutex::new("arn:tg/blue".to_owned()),
            refresh: Mutex::new(VecDeque::from([
                RefreshStatus::InProgress,
                RefreshStatus::Successful,
            ])),
            health: TargetHealth {
                healthy: 2,
                total: 2,
            },
            alarm: AlarmMode::Never,
            shifted: Mutex::new(false),
            cancel_on_shift: None,
            capacity: Mutex::new(HashMap::from([
                ("prod-blue".to_owned(), 2),
                ("prod-green".to_owned(), 2),
            ])),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Start with `group` scaled to `desired` instances.
    pub fn with_capacity(self, group: &str, desired: u32) -> Self {
        self.capacity.lock().unwrap().insert(group.to_owned(), desired);
        self
    }

    pub fn capacity(&self, group: &str) -> u32 {
        self.capacity.lock().unwrap().get(group).copied().unwrap_or(0)
    }

    pub fn with_alarm(mut self, alarm: AlarmMode) -> Self {
        self.alarm = alarm;
        self
    }

    pub fn with_refresh(self, statuses: Vec<RefreshStatus>) -> Self {
        *self.refresh.lock().unwrap() = statuses.into();
        self
    }

    pub fn with_health(mut self, healthy: usize, total: usize) -> Self {
        self.health = TargetHealth { healthy, total };
        self
    }

    /// Cancel `token` as soon as the listener moves.
    pub fn cancel_on_shift(mut self, token: CancellationToken) -> Self {
        self.cancel_on_shift = Some(token);
        self
    }

    pub fn listener(&self) -> String {
        self.listener.lock().unwrap().clone()
    }

    pub fn calls_starting(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl TrafficApi for FakeTrafficApi {
    async fn listener_target(&self, _listener: &str) -> ControlResult<String> {
        Ok(self.listener())
    }

    async fn shift_listener(&self, _listener: &str, target_group: &str) -> ControlResult<()> {
        self.record(format!("shift {target_group}"));
        *self.listener.lock().unwrap() = target_group.to_owned();
        *self.shifted.lock().unwrap() = true;
        if let Some(token) = &self.cancel_on_shift {
            token.cancel();
        }
        Ok(())
    }

    async fn update_pool_image(
        &self,
        pool: &PoolConfig,
        image: &ImageReference,
        user_data: &str,
    ) -> ControlResult<String> {
        assert!(user_data.starts_with("#!/bin/bash\n"));
        self.record(format!("update {} {image}", pool.launch_template_id));
        Ok("7".to_owned())
    }

    async fn start_refresh(
        &self,
        pool: &PoolConfig,
        min_healthy_percentage: u8,
    ) -> ControlResult<String> {
        self.record(format!(
            "refresh {} min={min_healthy_percentage}",
            pool.auto_scaling_group
        ));
        Ok("refresh-1".to_owned())
    }

    async fn refresh_status(
        &self,
        _pool: &PoolConfig,
        _refresh_id: &str,
    ) -> ControlResult<RefreshStatus> {
        let mut queue = self.refresh.lock().unwrap();
        let status = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().copied()
        };
        Ok(status.unwrap_or(RefreshStatus::InProgress))
    }

    /// An empty pool has no registered targets.
    async fn target_health(&self, target_group: &str) -> ControlResult<TargetHealth> {
        let color = target_group.rsplit('/').next().unwrap_or_default();
        if self.capacity(&format!("prod-{color}")) == 0 {
            return Ok(TargetHealth::default());
        }
        Ok(self.health)
    }

    async fn alarm_firing(&self, alarm: &str) -> ControlResult<bool> {
        let shifted = *self.shifted.lock().unwrap();
        match self.alarm {
            AlarmMode::Never => Ok(false),
            AlarmMode::Always => Ok(true),
            AlarmMode::AfterShift => Ok(shifted),
            AlarmMode::UnreadableAfterShift if shifted => Err(ControlError::transient(
                "describe alarm",
                alarm,
                "Rate exceeded",
            )),
            AlarmMode::UnreadableAfterShift => Ok(false),
        }
    }

    async fn pool_capacity(&self, pool: &PoolConfig) -> ControlResult<PoolCapacity> {
        let desired = self.capacity(&pool.auto_scaling_group);
        Ok(PoolCapacity {
            min: desired,
            desired,
        })
    }

    async fn scale_pool(&self, pool: &PoolConfig, capacity: PoolCapacity) -> ControlResult<()> {
        self.record(format!("scale {} to {}", pool.auto_scaling_group, capacity.desired));
        self.capacity
            .lock()
            .unwrap()
            .insert(pool.auto_scaling_group.clone(), capacity.desired);
        Ok(())
    }

    async fn retire_pool(&self, pool: &PoolConfig) -> ControlResult<()> {
        self.record(format!("retire {}", pool.auto_scaling_group));
        self.scale_pool(pool, PoolCapacity::EMPTY).await
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Container service with in-memory template revisions.
pub struct FakeOrchestratorApi {
    current: Mutex<String>,
    templates: Mutex<HashMap<String, Value>>,
    pub mutations: Mutex<Vec<String>>,
}

impl FakeOrchestratorApi {
    /// Service `web` running revision 4 on `image`.
    pub fn running(image: &str) -> Self {
        let arn = "arn:task-definition/web:4".to_owned();
        let body = serde_json::json!({
            "taskDefinitionArn": arn,
            "family": "web",
            "revision": 4,
            "status": "ACTIVE",
            "networkMode": "awsvpc",
            "containerDefinitions": [{ "name": "app", "image": image, "essential": true }],
            "requiresCompatibilities": ["FARGATE"],
            "cpu": "256",
            "memory": "512"
        });
        Self {
            current: Mutex::new(arn.clone()),
            templates: Mutex::new(HashMap::from([(arn, body)])),
            mutations: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> String {
        self.current.lock().unwrap().clone()
    }

    pub fn template(&self, arn: &str) -> Value {
        self.templates.lock().unwrap()[arn].clone()
    }
}

#[async_trait]
impl OrchestratorApi for FakeOrchestratorApi {
    async fn describe_service(&self, _cluster: &str, _service: &str) -> ControlResult<ServiceState> {
        let current = self.current();
        Ok(ServiceState {
            task_definition: current.clone(),
            desired_count: 2,
            running_count: 2,
            deployments: vec![ServiceDeployment {
                status: "PRIMARY".to_owned(),
                task_definition: current,
                rollout_state: Some("COMPLETED".to_owned()),
                running_count: 2,
                desired_count: 2,
            }],
        })
    }

    async fn describe_template(&self, arn: &str) -> ControlResult<TaskTemplate> {
        let body = self
            .templates
            .lock()
            .unwrap()
            .get(arn)
            .cloned()
            .ok_or_else(|| ControlError::permanent("describe template", arn, "not found"))?;
        Ok(TaskTemplate {
            arn: arn.to_owned(),
            body,
        })
    }

    async fn register_template(&self, body: &Value) -> ControlResult<String> {
        let mut templates = self.templates.lock().unwrap();
        let arn = format!("arn:task-definition/web:{}", templates.len() + 4);
        templates.insert(arn.clone(), body.clone());
        self.mutations.lock().unwrap().push(format!("register {arn}"));
        Ok(arn)
    }

    async fn update_service(
        &self,
        _cluster: &str,
        _service: &str,
        task_definition: &str,
    ) -> ControlResult<()> {
        *self.current.lock().unwrap() = task_definition.to_owned();
        self.mutations
            .lock()
            .unwrap()
            .push(format!("update {task_definition}"));
        Ok(())
    }
}

// =============================================================================
// Executors
// =============================================================================

/// Succeeds immediately with a fixed status and logs each call.
pub struct EchoExecutor {
    strategy: DeploymentStrategy,
    status: ExecutionStatus,
    log: EventLog,
}

impl EchoExecutor {
    pub fn new(strategy: DeploymentStrategy, log: EventLog) -> Self {
        Self {
            strategy,
            status: ExecutionStatus::Succeeded,
            log,
        }
    }

    pub fn submitted(strategy: DeploymentStrategy, log: EventLog) -> Self {
        Self {
            status: ExecutionStatus::Submitted,
            ..Self::new(strategy, log)
        }
    }
}

#[async_trait]
impl StrategyExecutor for EchoExecutor {
    fn strategy(&self) -> DeploymentStrategy {
        self.strategy
    }

    async fn execute(&self, ctx: &ExecutionContext) -> ControlResult<DeploymentOutcome> {
        self.log
            .push(format!("execute {} attempt={}", self.strategy, ctx.attempt));
        Ok(DeploymentOutcome::single(
            self.strategy,
            self.status,
            TargetResult::succeeded(ctx.environment.name.clone(), ctx.image.to_string()),
        ))
    }
}

/// Fails every attempt with the error `make` builds.
pub struct FlakyExecutor {
    strategy: DeploymentStrategy,
    make: fn() -> ControlError,
    pub calls: AtomicU32,
}

impl FlakyExecutor {
    pub fn transient(strategy: DeploymentStrategy) -> Self {
        Self {
            strategy,
            make: || ControlError::transient("ssh connect", "10.0.1.5", "Connection timed out"),
            calls: AtomicU32::new(0),
        }
    }

    pub fn permanent(strategy: DeploymentStrategy) -> Self {
        Self {
            strategy,
            make: || ControlError::permanent("ssh connect", "10.0.1.5", "Permission denied (publickey)"),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StrategyExecutor for FlakyExecutor {
    fn strategy(&self) -> DeploymentStrategy {
        self.strategy
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> ControlResult<DeploymentOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.make)())
    }
}

/// Blocks inside `execute` until released.
pub struct GatedExecutor {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl GatedExecutor {
    pub fn new() -> Self {
        Self {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl StrategyExecutor for GatedExecutor {
    fn strategy(&self) -> DeploymentStrategy {
        DeploymentStrategy::InPlace
    }

    async fn execute(&self, ctx: &ExecutionContext) -> ControlResult<DeploymentOutcome> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(DeploymentOutcome::single(
            DeploymentStrategy::InPlace,
            ExecutionStatus::Succeeded,
            TargetResult::succeeded(ctx.environment.name.clone(), "released"),
        ))
    }
}
