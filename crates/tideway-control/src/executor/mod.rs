//! Strategy executors.
//!
//! Each [`DeploymentStrategy`] is carried out by one [`StrategyExecutor`].
//! Executors are retry-safe: running one twice for the same request
//! converges on the same end state. Executors watch the cancellation token
//! themselves so they can stop at a point that leaves traffic on a healthy
//! pool.

mod blue_green;
mod config_push;
mod in_place;
mod orchestrator;

pub use blue_green::BlueGreenExecutor;
pub use config_push::ConfigPushExecutor;
pub use in_place::InPlaceExecutor;
pub use orchestrator::OrchestratorExecutor;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ControlResult;
use crate::registry::ImageReference;
use crate::strategy::DeploymentStrategy;
use crate::types::{DeploymentOutcome, DeploymentRequest, Environment};

/// Everything an executor needs for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Target environment.
    pub environment: Environment,
    /// Request being served.
    pub request: DeploymentRequest,
    /// Image to roll out.
    pub image: ImageReference,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancellation for the whole run.
    pub cancel: CancellationToken,
}

/// Carries out one deployment strategy.
#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    /// Strategy this executor implements.
    fn strategy(&self) -> DeploymentStrategy;

    /// Cap on attempts for this strategy, tighter than the global policy.
    fn max_attempts(&self) -> Option<u32> {
        None
    }

    /// Roll the image out.
    ///
    /// Errors abort the attempt; a returned outcome may still report failed
    /// targets.
    async fn execute(&self, ctx: &ExecutionContext) -> ControlResult<DeploymentOutcome>;
}

/// Executors by strategy.
#[derive(Clone, Default)]
pub struct ExecutorSet {
    executors: HashMap<DeploymentStrategy, Arc<dyn StrategyExecutor>>,
}

impl ExecutorSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any for the same strategy.
    #[must_use]
    pub fn with(mut self, executor: Arc<dyn StrategyExecutor>) -> Self {
        self.executors.insert(executor.strategy(), executor);
        self
    }

    /// Executor for `strategy`.
    #[must_use]
    pub fn get(&self, strategy: DeploymentStrategy) -> Option<Arc<dyn StrategyExecutor>> {
        self.executors.get(&strategy).cloned()
    }
}

impl std::fmt::Debug for ExecutorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.executors.keys()).finish()
    }
}

/// Quote a value for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Container settings for the update script.
#[derive(Debug, Clone, Copy)]
pub struct ContainerSpec<'a> {
    /// Container name.
    pub name: &'a str,
    /// `host:container` port mapping.
    pub port_mapping: &'a str,
}

/// Shell script that replaces the running application container with
/// `image`. Safe to run repeatedly.
#[must_use]
pub fn container_update_script(
    image: &ImageReference,
    container: ContainerSpec<'_>,
    region: &str,
) -> String {
    let name = shell_quote(container.name);
    let reference = shell_quote(&image.to_string());
    [
        "set -e".to_owned(),
        format!(
            "aws ecr get-login-password --region {} | sudo docker login --username AWS --password-stdin {}",
            shell_quote(region),
            shell_quote(&image.registry)
        ),
        format!("sudo docker pull {reference}"),
        format!("sudo docker stop {name} >/dev/null 2>&1 || true"),
        format!("sudo docker rm {name} >/dev/null 2>&1 || true"),
        format!(
            "sudo docker run -d --name {name} -p {} -e APP_VERSION={} --restart unless-stopped {reference}",
            shell_quote(container.port_mapping),
            shell_quote(&image.tag)
        ),
    ]
    .join("; ")
}
