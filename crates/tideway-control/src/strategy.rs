//! Deployment strategies.
//!
//! A [`DeploymentStrategy`] names how a new image reaches running compute.
//! Each strategy maps to exactly one [`StrategyExecutor`](crate::executor::StrategyExecutor).

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// How a new image is rolled out to an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStrategy {
    /// Replace the running container on each discovered host over a
    /// brokered shell channel.
    ///
    /// Hosts are updated concurrently and results are reported per host.
    /// Hosts matching the relay naming pattern are never touched.
    #[default]
    InPlace,

    /// Run the configuration-management playbook against the environment
    /// inventory. The playbook reads the image tag from the config store.
    ConfigPush,

    /// Register a new task template revision pointing at the image and
    /// force a new rollout of the container service.
    ///
    /// A no-op when the service already runs the target image.
    Orchestrator,

    /// Roll the image into the inactive pool behind the load balancer,
    /// wait for health, then shift the listener.
    ///
    /// An alarm during the shift window reverts the listener.
    BlueGreen,
}

impl DeploymentStrategy {
    /// All strategies, in selection order.
    pub const ALL: [Self; 4] = [
        Self::InPlace,
        Self::ConfigPush,
        Self::Orchestrator,
        Self::BlueGreen,
    ];

    /// Get the strategy name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InPlace => "in_place",
            Self::ConfigPush => "config_push",
            Self::Orchestrator => "orchestrator",
            Self::BlueGreen => "blue_green",
        }
    }

    /// Whether the strategy reaches hosts over a shell channel and so needs
    /// a credential.
    #[must_use]
    pub const fn requires_credential(&self) -> bool {
        matches!(self, Self::InPlace)
    }
}

impl std::fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<DeploymentStrategy> for String {
    fn from(strategy: DeploymentStrategy) -> Self {
        strategy.as_str().to_owned()
    }
}

impl FromStr for DeploymentStrategy {
    type Err = ControlError;

    /// Parse a strategy name. Accepts the canonical names plus the tool
    /// names operators tend to type (`ssh`, `ansible`, `ecs`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalised.as_str() {
            "in_place" | "inplace" | "ssh" | "ssh_script" => Ok(Self::InPlace),
            "config_push" | "ansible" => Ok(Self::ConfigPush),
            "orchestrator" | "ecs" => Ok(Self::Orchestrator),
            "blue_green" | "bluegreen" => Ok(Self::BlueGreen),
            _ => Err(ControlError::UnknownStrategy(s.to_owned())),
        }
    }
}
