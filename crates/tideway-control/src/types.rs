//! Core types for tideway-control.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{BlueGreenConfig, ConfigPushConfig, OrchestratorConfig};
use crate::error::{ControlError, ControlResult, ErrorClass};
use crate::strategy::DeploymentStrategy;

/// Unique identifier for a deployment run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Create a new deployment ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique deployment ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DeploymentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A request to roll an image tag out to an environment.
///
/// The strategy is kept as the raw name the caller supplied; it is
/// validated before anything is written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Environment name (e.g. "prod").
    pub environment: String,
    /// Image repository name within the registry.
    pub repository: String,
    /// Image tag to deploy.
    pub image_tag: String,
    /// Strategy name.
    pub strategy: String,
}

impl DeploymentRequest {
    /// Create a new deployment request.
    #[must_use]
    pub fn new(
        environment: impl Into<String>,
        repository: impl Into<String>,
        image_tag: impl Into<String>,
        strategy: impl Into<String>,
    ) -> Self {
        Self {
            environment: environment.into(),
            repository: repository.into(),
            image_tag: image_tag.into(),
            strategy: strategy.into(),
        }
    }
}

/// Observable deployment lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployState {
    /// Request accepted, nothing written yet.
    Pending,
    /// Tag and repository recorded in the config store.
    ConfigWritten,
    /// Strategy executor running.
    Executing,
    /// Executor failed transiently and is being retried.
    ExecutingRetry,
    /// Executor finished successfully.
    Executed,
    /// Health verification in progress.
    Verifying,
    /// Deployed and verified.
    Succeeded,
    /// Deployed but verification failed.
    DeployedUnhealthy,
    /// Deployment failed.
    Failed,
}

impl DeployState {
    /// Get the state name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::ConfigWritten => "CONFIG_WRITTEN",
            Self::Executing => "EXECUTING",
            Self::ExecutingRetry => "EXECUTING_RETRY",
            Self::Executed => "EXECUTED",
            Self::Verifying => "VERIFYING",
            Self::Succeeded => "SUCCEEDED",
            Self::DeployedUnhealthy => "DEPLOYED_UNHEALTHY",
            Self::Failed => "FAILED",
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::DeployedUnhealthy | Self::Failed
        )
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Common data carried through every deployment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentData {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// The request being served.
    pub request: DeploymentRequest,
    /// Every state entered so far, in order.
    pub states: Vec<DeployState>,
    /// Executor attempts made.
    pub attempts: u32,
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
    /// When the deployment last changed state.
    pub updated_at: DateTime<Utc>,
    /// Error message if the deployment failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentData {
    /// Create new deployment data for a request.
    #[must_use]
    pub fn new(request: DeploymentRequest) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            request,
            states: vec![DeployState::Pending],
            attempts: 0,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }
}

/// Jump host used to reach hosts without public addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHost {
    /// Hostname or address.
    pub address: String,
    /// SSH port.
    pub port: u16,
    /// Login user on the relay.
    pub user: String,
}

impl RelayHost {
    /// Parse a relay address as operators paste it.
    ///
    /// Line breaks are stripped and a trailing `:port` overrides the
    /// default port. Returns `None` for an empty value.
    #[must_use]
    pub fn parse(raw: &str, user: &str, default_port: u16) -> Option<Self> {
        let cleaned: String = raw.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        let cleaned = cleaned.trim();
        if cleaned.is_empty() {
            return None;
        }

        let (address, port) = match cleaned.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
                Ok(port) => (host, port),
                Err(_) => (cleaned, default_port),
            },
            _ => (cleaned, default_port),
        };

        Some(Self {
            address: address.to_owned(),
            port,
            user: user.to_owned(),
        })
    }
}

impl fmt::Display for RelayHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.address, self.port)
    }
}

/// Key used to open shell channels.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Private key on disk.
    KeyFile(PathBuf),
    /// Private key material supplied inline.
    KeyMaterial(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Self::KeyMaterial(_) => f.write_str("KeyMaterial(<redacted>)"),
        }
    }
}

/// Resolved description of a deployable environment.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Environment name.
    pub name: String,
    /// Provider region for this environment.
    pub region: String,
    /// Base URL of the public service.
    pub health_url: String,
    /// Strategy used when a request does not name one.
    pub default_strategy: DeploymentStrategy,
    /// Jump host, when hosts are only privately addressable.
    pub relay: Option<RelayHost>,
    /// Shell credential.
    pub credential: Option<Credential>,
    /// Playbook parameters.
    pub config_push: Option<ConfigPushConfig>,
    /// Container service parameters.
    pub orchestrator: Option<OrchestratorConfig>,
    /// Load-balanced pool parameters.
    pub blue_green: Option<BlueGreenConfig>,
}

impl Environment {
    /// Check that everything `strategy` needs is present.
    pub fn validate_for(&self, strategy: DeploymentStrategy) -> ControlResult<()> {
        let context = format!("{strategy} deployment to {}", self.name);
        if self.health_url.trim().is_empty() {
            return Err(ControlError::missing(context, "health_url"));
        }
        if strategy.requires_credential() && self.credential.is_none() {
            return Err(ControlError::missing(context, "ssh credential"));
        }

        match strategy {
            DeploymentStrategy::InPlace => Ok(()),
            DeploymentStrategy::ConfigPush => {
                let params = self.config_push_params()?;
                if params.storage_bucket.trim().is_empty() {
                    return Err(ControlError::missing(context, "config_push.storage_bucket"));
                }
                Ok(())
            }
            DeploymentStrategy::Orchestrator => {
                let params = self.orchestrator_params()?;
                if params.cluster.trim().is_empty() {
                    return Err(ControlError::missing(context, "orchestrator.cluster"));
                }
                if params.service.trim().is_empty() {
                    return Err(ControlError::missing(context, "orchestrator.service"));
                }
                Ok(())
            }
            DeploymentStrategy::BlueGreen => {
                let params = self.blue_green_params()?;
                if params.listener_arn.trim().is_empty() {
                    return Err(ControlError::missing(context, "blue_green.listener_arn"));
                }
                for (color, pool) in [("blue", &params.blue), ("green", &params.green)] {
                    if pool.target_group_arn.trim().is_empty()
                        || pool.auto_scaling_group.trim().is_empty()
                        || pool.launch_template_id.trim().is_empty()
                    {
                        return Err(ControlError::missing(
                            context,
                            format!("blue_green.{color}"),
                        ));
                    }
                }
                Ok(())
            }
        }
    }

    /// Playbook parameters, or a configuration error.
    pub fn config_push_params(&self) -> ControlResult<&ConfigPushConfig> {
        self.config_push
            .as_ref()
            .ok_or_else(|| ControlError::missing(self.context("config_push"), "config_push"))
    }

    /// Container service parameters, or a configuration error.
    pub fn orchestrator_params(&self) -> ControlResult<&OrchestratorConfig> {
        self.orchestrator
            .as_ref()
            .ok_or_else(|| ControlError::missing(self.context("orchestrator"), "orchestrator"))
    }

    /// Pool parameters, or a configuration error.
    pub fn blue_green_params(&self) -> ControlResult<&BlueGreenConfig> {
        self.blue_green
            .as_ref()
            .ok_or_else(|| ControlError::missing(self.context("blue_green"), "blue_green"))
    }

    fn context(&self, strategy: &str) -> String {
        format!("{strategy} deployment to {}", self.name)
    }
}

/// Whether a discovered host may be deployed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostRole {
    /// Ordinary application host.
    Normal,
    /// Jump host. Never deployed to.
    RelayExcluded,
}

/// A compute host found by the instance locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHost {
    /// Provider instance identifier.
    pub id: String,
    /// Address used to reach the host.
    pub address: String,
    /// Value of the host's name tag, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Deployability.
    pub role: HostRole,
}

impl TargetHost {
    /// Whether the host may receive a deployment.
    #[must_use]
    pub fn is_deployable(&self) -> bool {
        self.role == HostRole::Normal && !self.address.is_empty()
    }
}

/// Result of updating one target (host, pool, or service).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResult {
    /// Target identifier.
    pub target: String,
    /// Whether the update succeeded.
    pub success: bool,
    /// Diagnostic output.
    pub message: String,
    /// Failure class, set for failed targets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
}

impl TargetResult {
    /// A successful target.
    #[must_use]
    pub fn succeeded(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            success: true,
            message: message.into(),
            error_class: None,
        }
    }

    /// A failed target, classified from the error.
    #[must_use]
    pub fn failed(target: impl Into<String>, error: &ControlError) -> Self {
        Self {
            target: target.into(),
            success: false,
            message: error.to_string(),
            error_class: Some(error.class()),
        }
    }
}

/// Aggregate status of one executor attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every target updated.
    Succeeded,
    /// Change accepted by the provider, rollout continues asynchronously.
    Submitted,
    /// Some targets failed.
    PartiallyFailed,
    /// No target updated.
    Failed,
}

/// Outcome of one executor attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentOutcome {
    /// Strategy that produced the outcome.
    pub strategy: DeploymentStrategy,
    /// Aggregate status.
    pub status: ExecutionStatus,
    /// Per-target results.
    pub targets: Vec<TargetResult>,
}

impl DeploymentOutcome {
    /// Build an outcome from per-target results.
    #[must_use]
    pub fn from_targets(strategy: DeploymentStrategy, targets: Vec<TargetResult>) -> Self {
        let succeeded = targets.iter().filter(|t| t.success).count();
        let status = if targets.is_empty() || succeeded == 0 {
            ExecutionStatus::Failed
        } else if succeeded == targets.len() {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::PartiallyFailed
        };
        Self {
            strategy,
            status,
            targets,
        }
    }

    /// An outcome with a single successful target.
    #[must_use]
    pub fn single(
        strategy: DeploymentStrategy,
        status: ExecutionStatus,
        target: TargetResult,
    ) -> Self {
        Self {
            strategy,
            status,
            targets: vec![target],
        }
    }

    /// Whether the outcome counts as a successful execution.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Succeeded | ExecutionStatus::Submitted
        )
    }

    /// Turn a failed outcome into an error for the retry loop.
    ///
    /// The error is transient only when every failed target failed
    /// transiently.
    #[must_use]
    pub fn to_error(&self, environment: &str) -> ControlError {
        let failed: Vec<&TargetResult> = self.targets.iter().filter(|t| !t.success).collect();
        let summary = failed
            .iter()
            .map(|t| format!("{}: {}", t.target, t.message))
            .collect::<Vec<_>>()
            .join("; ");
        let message = format!(
            "{} of {} targets failed: {summary}",
            failed.len(),
            self.targets.len()
        );
        let all_transient = !failed.is_empty()
            && failed
                .iter()
                .all(|t| t.error_class == Some(ErrorClass::Transient));
        let operation = format!("{} execution", self.strategy);
        if all_transient {
            ControlError::transient(operation, environment, message)
        } else {
            ControlError::permanent(operation, environment, message)
        }
    }
}

/// Result of post-deployment verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// URL probed.
    pub health_url: String,
    /// HTTP status, if a response arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Whether the health endpoint returned success.
    pub healthy: bool,
    /// Version the running service reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_version: Option<String>,
    /// Version recorded in the config store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<String>,
    /// Repository recorded in the config store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Overall verdict.
    pub passed: bool,
    /// Human-readable diagnostic.
    pub message: String,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}
