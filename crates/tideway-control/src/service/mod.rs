//! Service lifecycle management.
//!
//! Wires the provider-backed clients into a coordinator and runs a single
//! deployment with signal handling: Ctrl+C or SIGTERM cancels the run, and
//! the executors stop at a point that leaves traffic on a healthy pool.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::aws::AwsCli;
use crate::channel::{ChannelBroker, OpenSshBroker};
use crate::config::{ChangeGate, ControlConfig};
use crate::deployment::{DeploymentCoordinator, DeploymentReport};
use crate::error::{ControlError, ControlResult};
use crate::executor::{
    BlueGreenExecutor, ConfigPushExecutor, ExecutorSet, InPlaceExecutor, OrchestratorExecutor,
};
use crate::locator::{Ec2Locator, InstanceLocator};
use crate::orchestrator::EcsApi;
use crate::process::{CommandRunner, SystemRunner};
use crate::registry::{ArtifactRegistry, EcrRegistry};
use crate::store::{ConfigStore, SsmConfigStore};
use crate::traffic::AwsTrafficApi;
use crate::types::DeploymentRequest;
use crate::verifier::HealthVerifier;

/// The control service.
///
/// Owns the configuration and the cancellation token for one process.
pub struct ControlService {
    config: Arc<ControlConfig>,
    cancel: CancellationToken,
}

impl ControlService {
    /// Create a new control service with the given configuration.
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Deploy `request`, pushing `local_image` under the requested tag
    /// first when given.
    pub async fn run_deploy(
        &self,
        request: DeploymentRequest,
        local_image: Option<&str>,
    ) -> ControlResult<DeploymentReport> {
        let environment = self.config.environment(&request.environment)?;
        let aws = self.aws_cli(&environment.region);
        let gate = ChangeGate::new(self.config.apply_changes);
        let registry: Arc<dyn ArtifactRegistry> = Arc::new(EcrRegistry::new(aws.clone(), gate));
        let coordinator = self.build_coordinator(aws, Arc::clone(&registry))?;

        // Nothing is pushed for a request that could never run.
        coordinator.validate(&request)?;

        let watcher = tokio::spawn(shutdown_signal(self.cancel.clone()));

        if let Some(local) = local_image {
            let pushed = tokio::select! {
                () = self.cancel.cancelled() => Err(ControlError::cancelled("image push")),
                pushed = registry.push(&request.repository, &request.image_tag, local) => pushed,
            };
            match pushed {
                Ok(image) => info!(image = %image, "image pushed"),
                Err(e) => {
                    watcher.abort();
                    return Err(e);
                }
            }
        }

        let result = coordinator.deploy(request, self.cancel.clone()).await;
        watcher.abort();

        result
    }

    fn aws_cli(&self, region: &str) -> AwsCli {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
        AwsCli::new(runner, region).with_profile(self.config.aws_profile.clone())
    }

    fn build_coordinator(
        &self,
        aws: AwsCli,
        registry: Arc<dyn ArtifactRegistry>,
    ) -> ControlResult<DeploymentCoordinator> {
        let config = &self.config;
        let gate = ChangeGate::new(config.apply_changes);
        let runner = aws.runner();

        let store: Arc<dyn ConfigStore> = Arc::new(SsmConfigStore::new(aws.clone(), gate));
        let locator: Arc<dyn InstanceLocator> = Arc::new(Ec2Locator::new(
            aws.clone(),
            config.in_place.environment_tag.clone(),
            config.in_place.relay_name_pattern.clone(),
        ));
        let broker: Arc<dyn ChannelBroker> = Arc::new(OpenSshBroker::new(
            Arc::clone(&runner),
            config.ssh.user.clone(),
            config.ssh.connect_timeout(),
            config.ssh.command_timeout(),
        ));

        let executors = ExecutorSet::new()
            .with(Arc::new(InPlaceExecutor::new(
                locator,
                broker,
                config.in_place.clone(),
            )))
            .with(Arc::new(ConfigPushExecutor::new(runner)))
            .with(Arc::new(OrchestratorExecutor::new(Arc::new(EcsApi::new(
                aws.clone(),
                gate,
            )))))
            .with(Arc::new(BlueGreenExecutor::new(
                Arc::new(AwsTrafficApi::new(aws, gate)),
                config.in_place.clone(),
            )));
        info!(region = %config.region, apply_changes = config.apply_changes, "clients configured");

        let verifier = HealthVerifier::new(Arc::clone(&store), &config.verifier)?;

        Ok(DeploymentCoordinator::new(
            Arc::clone(config),
            store,
            registry,
            executors,
            verifier,
        ))
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, cancelling deployment");
            cancel.cancel();
        }
        () = terminate => {
            info!("received SIGTERM, cancelling deployment");
            cancel.cancel();
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
