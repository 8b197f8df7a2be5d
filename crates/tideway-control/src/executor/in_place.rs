//! In-place container replacement over shell channels.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::channel::ChannelBroker;
use crate::config::InPlaceConfig;
use crate::error::{ControlError, ControlResult};
use crate::locator::InstanceLocator;
use crate::process::CommandOutput;
use crate::strategy::DeploymentStrategy;
use crate::types::{Credential, DeploymentOutcome, RelayHost, TargetHost, TargetResult};

use super::{container_update_script, ContainerSpec, ExecutionContext, StrategyExecutor};

const STDOUT_TAIL: usize = 500;
const STDERR_TAIL: usize = 800;

/// Updates every application host of an environment concurrently.
pub struct InPlaceExecutor {
    locator: Arc<dyn InstanceLocator>,
    broker: Arc<dyn ChannelBroker>,
    settings: InPlaceConfig,
}

impl InPlaceExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(
        locator: Arc<dyn InstanceLocator>,
        broker: Arc<dyn ChannelBroker>,
        settings: InPlaceConfig,
    ) -> Self {
        Self {
            locator,
            broker,
            settings,
        }
    }

    #[instrument(skip_all, fields(host = %host.address))]
    async fn update_host(
        &self,
        host: TargetHost,
        credential: &Credential,
        relay: Option<&RelayHost>,
        script: &str,
        cancel: &CancellationToken,
    ) -> TargetResult {
        let work = async {
            let channel = self.broker.connect(&host, credential, relay).await?;
            let output = channel.run(script).await?;
            check_remote_output(&host.address, &output)?;
            Ok::<_, ControlError>(output)
        };

        let result = tokio::select! {
            () = cancel.cancelled() => Err(ControlError::cancelled("in-place host update")),
            result = work => result,
        };

        match result {
            Ok(output) => {
                info!("host updated");
                TargetResult::succeeded(host.address, output.stdout_tail(STDOUT_TAIL))
            }
            Err(e) => {
                warn!(error = %e, "host update failed");
                TargetResult::failed(host.address, &e)
            }
        }
    }
}

/// Turn a non-zero remote exit into a classified error.
fn check_remote_output(address: &str, output: &CommandOutput) -> ControlResult<()> {
    if output.success() {
        return Ok(());
    }
    let message = format!(
        "exit {}: {}",
        output.exit_code,
        output.stderr_tail(STDERR_TAIL)
    );
    let lowered = output.stderr.to_ascii_lowercase();
    if lowered.contains("denied")
        || lowered.contains("unauthorized")
        || lowered.contains("manifest unknown")
        || lowered.contains("not found: manifest")
    {
        Err(ControlError::permanent("remote update", address, message))
    } else {
        Err(ControlError::transient("remote update", address, message))
    }
}

#[async_trait]
impl StrategyExecutor for InPlaceExecutor {
    fn strategy(&self) -> DeploymentStrategy {
        DeploymentStrategy::InPlace
    }

    #[instrument(skip_all, fields(environment = %ctx.environment.name, attempt = ctx.attempt))]
    async fn execute(&self, ctx: &ExecutionContext) -> ControlResult<DeploymentOutcome> {
        let environment = &ctx.environment;
        let credential = environment
            .credential
            .as_ref()
            .ok_or_else(|| ControlError::missing("in_place", "ssh credential"))?;
        let relay = environment.relay.as_ref();

        let hosts = self.locator.list(&environment.name, relay.is_some()).await?;
        let found = hosts.len();
        let targets: Vec<TargetHost> = hosts.into_iter().filter(TargetHost::is_deployable).collect();
        info!(found, deployable = targets.len(), "hosts located");

        if targets.is_empty() {
            return Err(ControlError::NoTargets {
                environment: environment.name.clone(),
            });
        }

        let script = container_update_script(
            &ctx.image,
            ContainerSpec {
                name: &self.settings.container_name,
                port_mapping: &self.settings.port_mapping,
            },
            &environment.region,
        );

        let results: Vec<TargetResult> = futures::stream::iter(targets)
            .map(|host| self.update_host(host, credential, relay, &script, &ctx.cancel))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let outcome = DeploymentOutcome::from_targets(DeploymentStrategy::InPlace, results);
        info!(status = ?outcome.status, "in-place update finished");
        Ok(outcome)
    }
}
