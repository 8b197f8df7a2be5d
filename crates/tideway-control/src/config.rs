//! Configuration for tideway-control.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};
use crate::strategy::DeploymentStrategy;
use crate::types::{Credential, Environment, RelayHost};

/// Top-level configuration for the coordinator.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Project name; the first segment of every config store key.
    #[serde(default = "default_project")]
    pub project: String,

    /// Default provider region.
    #[serde(default = "default_region")]
    pub region: String,

    /// Named provider credentials profile.
    #[serde(default)]
    pub aws_profile: Option<String>,

    /// Allow mutating infrastructure calls. Off by default.
    #[serde(default)]
    pub apply_changes: bool,

    /// Executor retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Shell channel settings.
    #[serde(default)]
    pub ssh: SshConfig,

    /// In-place executor settings.
    #[serde(default)]
    pub in_place: InPlaceConfig,

    /// Health verifier settings.
    #[serde(default)]
    pub verifier: VerifierConfig,

    /// Environments by name.
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `tideway.toml` in the current directory (if present)
    /// 3. Environment variables with `TIDEWAY_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file("tideway.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TIDEWAY_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }

    /// Resolve a named environment.
    pub fn environment(&self, name: &str) -> ControlResult<Environment> {
        let env = self
            .environments
            .get(name)
            .ok_or_else(|| ControlError::UnknownEnvironment(name.to_owned()))?;

        let relay = env
            .relay_host
            .as_deref()
            .and_then(|raw| RelayHost::parse(raw, &self.ssh.relay_user, self.ssh.relay_port));

        let credential = env
            .key_path
            .clone()
            .map(Credential::KeyFile)
            .or_else(|| self.ssh.credential());

        Ok(Environment {
            name: name.to_owned(),
            region: env.region.clone().unwrap_or_else(|| self.region.clone()),
            health_url: env.health_url.clone(),
            default_strategy: env.strategy,
            relay,
            credential,
            config_push: env.config_push.clone(),
            orchestrator: env.orchestrator.clone(),
            blue_green: env.blue_green.clone(),
        })
    }
}

fn default_project() -> String {
    "bluegreen".to_owned()
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            region: default_region(),
            aws_profile: None,
            apply_changes: false,
            retry: RetryConfig::default(),
            ssh: SshConfig::default(),
            in_place: InPlaceConfig::default(),
            verifier: VerifierConfig::default(),
            environments: BTreeMap::new(),
        }
    }
}

/// Permission to mutate infrastructure.
///
/// Every client that writes to a provider checks the gate before doing so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeGate {
    allowed: bool,
}

impl ChangeGate {
    /// Create a gate.
    #[must_use]
    pub const fn new(allowed: bool) -> Self {
        Self { allowed }
    }

    /// A gate that permits changes.
    #[must_use]
    pub const fn open() -> Self {
        Self::new(true)
    }

    /// Whether changes are permitted.
    #[must_use]
    pub const fn allowed(&self) -> bool {
        self.allowed
    }

    /// Fail unless changes are permitted.
    pub fn check(&self, operation: &str) -> ControlResult<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(ControlError::ChangesNotAllowed {
                operation: operation.to_owned(),
            })
        }
    }
}

/// Executor retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total executor attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in seconds.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    /// Upper bound on the delay between retries in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_secs() -> u64 {
    2
}

const fn default_max_delay_secs() -> u64 {
    30
}

impl RetryConfig {
    /// Delay before the first retry.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    /// Upper bound on retry delay.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Shell channel settings.
#[derive(Clone, Deserialize)]
pub struct SshConfig {
    /// Login user on application hosts.
    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// Private key file.
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Inline private key material. Takes precedence over `key_path`.
    #[serde(default)]
    pub private_key: Option<String>,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Per-host command timeout in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Login user on the relay host.
    #[serde(default = "default_ssh_user")]
    pub relay_user: String,

    /// Relay SSH port, unless the relay address names one.
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
}

fn default_ssh_user() -> String {
    "ec2-user".to_owned()
}

const fn default_connect_timeout_secs() -> u64 {
    15
}

const fn default_command_timeout_secs() -> u64 {
    120
}

const fn default_relay_port() -> u16 {
    22
}

impl SshConfig {
    /// The configured credential, inline material first.
    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        self.private_key
            .as_ref()
            .filter(|key| !key.trim().is_empty())
            .map(|key| Credential::KeyMaterial(key.clone()))
            .or_else(|| self.key_path.clone().map(Credential::KeyFile))
    }

    /// Connection timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Per-host command timeout.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("user", &self.user)
            .field("key_path", &self.key_path)
            .field(
                "private_key",
                &self.private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("command_timeout_secs", &self.command_timeout_secs)
            .field("relay_user", &self.relay_user)
            .field("relay_port", &self.relay_port)
            .finish()
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            key_path: None,
            private_key: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            relay_user: default_ssh_user(),
            relay_port: default_relay_port(),
        }
    }
}

/// In-place executor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct InPlaceConfig {
    /// Hosts updated at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Name of the application container.
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// `host:container` port mapping.
    #[serde(default = "default_port_mapping")]
    pub port_mapping: String,

    /// Hosts whose name contains this are relays and never deployed to.
    #[serde(default = "default_relay_name_pattern")]
    pub relay_name_pattern: String,

    /// Instance tag holding the environment name.
    #[serde(default = "default_environment_tag")]
    pub environment_tag: String,
}

const fn default_concurrency() -> usize {
    5
}

fn default_container_name() -> String {
    "bluegreen-app".to_owned()
}

fn default_port_mapping() -> String {
    "8080:8080".to_owned()
}

fn default_relay_name_pattern() -> String {
    "bastion".to_owned()
}

fn default_environment_tag() -> String {
    "Env".to_owned()
}

impl Default for InPlaceConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            container_name: default_container_name(),
            port_mapping: default_port_mapping(),
            relay_name_pattern: default_relay_name_pattern(),
            environment_tag: default_environment_tag(),
        }
    }
}

/// Health verifier settings.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifierConfig {
    /// Health request timeout in seconds.
    #[serde(default = "default_verifier_timeout_secs")]
    pub timeout_secs: u64,

    /// Fail verification when the service does not report a version.
    #[serde(default)]
    pub require_version: bool,
}

const fn default_verifier_timeout_secs() -> u64 {
    10
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_verifier_timeout_secs(),
            require_version: false,
        }
    }
}

/// Per-environment configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    /// Region override.
    #[serde(default)]
    pub region: Option<String>,

    /// Base URL of the public service.
    #[serde(default)]
    pub health_url: String,

    /// Strategy used when a request does not name one.
    #[serde(default)]
    pub strategy: DeploymentStrategy,

    /// Relay host address, optionally with `:port`.
    #[serde(default)]
    pub relay_host: Option<String>,

    /// Key file override for this environment.
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Playbook parameters.
    #[serde(default)]
    pub config_push: Option<ConfigPushConfig>,

    /// Container service parameters.
    #[serde(default)]
    pub orchestrator: Option<OrchestratorConfig>,

    /// Load-balanced pool parameters.
    #[serde(default)]
    pub blue_green: Option<BlueGreenConfig>,
}

/// Playbook parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigPushConfig {
    /// Directory holding the playbooks and inventories.
    #[serde(default = "default_ansible_dir")]
    pub ansible_dir: PathBuf,

    /// Inventory path relative to `ansible_dir`. Defaults to
    /// `inventory/ec2_<env>.aws_ec2.yml`.
    #[serde(default)]
    pub inventory: Option<String>,

    /// Playbook path relative to `ansible_dir`.
    #[serde(default = "default_playbook")]
    pub playbook: String,

    /// Bucket the connection plugin stages files through.
    #[serde(default)]
    pub storage_bucket: String,

    /// Playbook run timeout in seconds.
    #[serde(default = "default_playbook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ansible_dir() -> PathBuf {
    PathBuf::from("ansible")
}

fn default_playbook() -> String {
    "playbooks/deploy.yml".to_owned()
}

const fn default_playbook_timeout_secs() -> u64 {
    900
}

impl ConfigPushConfig {
    /// Inventory path for an environment.
    #[must_use]
    pub fn inventory_for(&self, environment: &str) -> String {
        self.inventory
            .clone()
            .unwrap_or_else(|| format!("inventory/ec2_{environment}.aws_ec2.yml"))
    }
}

/// Container service parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Cluster name.
    #[serde(default)]
    pub cluster: String,

    /// Service name.
    #[serde(default)]
    pub service: String,

    /// Wait for the service to settle before reporting success.
    #[serde(default)]
    pub wait_for_stable: bool,

    /// Upper bound on the settle wait in seconds.
    #[serde(default = "default_stable_timeout_secs")]
    pub stable_timeout_secs: u64,

    /// Poll interval while waiting in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

const fn default_stable_timeout_secs() -> u64 {
    600
}

const fn default_poll_interval_secs() -> u64 {
    15
}

/// One side of a blue/green pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolConfig {
    /// Target group the listener forwards to.
    pub target_group_arn: String,
    /// Scaling group backing the pool.
    pub auto_scaling_group: String,
    /// Launch template the scaling group boots from.
    pub launch_template_id: String,
}

/// Load-balanced pool parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct BlueGreenConfig {
    /// Listener whose default action selects the live pool.
    #[serde(default)]
    pub listener_arn: String,

    /// Blue pool.
    pub blue: PoolConfig,

    /// Green pool.
    pub green: PoolConfig,

    /// Healthy floor kept during the instance refresh, in percent.
    #[serde(default = "default_min_healthy_percentage")]
    pub min_healthy_percentage: u8,

    /// Upper bound on waiting for the new pool in seconds.
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,

    /// Poll interval while waiting in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How long the alarm is watched after the shift, in seconds.
    #[serde(default = "default_shift_window_secs")]
    pub shift_window_secs: u64,

    /// Connection drain time before the old pool is retired, in seconds.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Alarm that aborts or reverts the shift when firing.
    #[serde(default)]
    pub rollback_alarm: Option<String>,

    /// Scale the old pool to zero after the drain.
    #[serde(default)]
    pub terminate_old_pool: bool,
}

const fn default_min_healthy_percentage() -> u8 {
    90
}

const fn default_health_timeout_secs() -> u64 {
    600
}

const fn default_shift_window_secs() -> u64 {
    120
}

const fn default_drain_timeout_secs() -> u64 {
    300
}
