//! Container service rollout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument};

use crate::config::OrchestratorConfig;
use crate::error::{ControlError, ControlResult};
use crate::orchestrator::OrchestratorApi;
use crate::strategy::DeploymentStrategy;
use crate::types::{DeploymentOutcome, ExecutionStatus, TargetResult};

use super::{ExecutionContext, StrategyExecutor};

/// Registers a template revision for the image and rolls the service
/// onto it.
pub struct OrchestratorExecutor {
    api: Arc<dyn OrchestratorApi>,
}

impl OrchestratorExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(api: Arc<dyn OrchestratorApi>) -> Self {
        Self { api }
    }

    async fn wait_for_stable(
        &self,
        ctx: &ExecutionContext,
        params: &OrchestratorConfig,
        task_definition: &str,
    ) -> ControlResult<()> {
        let limit = Duration::from_secs(params.stable_timeout_secs);
        let interval = Duration::from_secs(params.poll_interval_secs.max(1));
        let deadline = Instant::now() + limit;

        loop {
            let state = self
                .api
                .describe_service(&params.cluster, &params.service)
                .await?;
            if state.rollout_failed(task_definition) {
                return Err(ControlError::permanent(
                    "service rollout",
                    &params.service,
                    format!("rollout of {task_definition} failed"),
                ));
            }
            if state.is_stable_on(task_definition) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ControlError::Timeout {
                    operation: format!("waiting for {} to stabilise", params.service),
                    limit,
                });
            }
            debug!(running = state.running_count, desired = state.desired_count, "waiting for service");

            tokio::select! {
                () = ctx.cancel.cancelled() => return Err(ControlError::cancelled("service rollout wait")),
                () = sleep(interval) => {}
            }
        }
    }
}

#[async_trait]
impl StrategyExecutor for OrchestratorExecutor {
    fn strategy(&self) -> DeploymentStrategy {
        DeploymentStrategy::Orchestrator
    }

    #[instrument(skip_all, fields(environment = %ctx.environment.name, attempt = ctx.attempt))]
    async fn execute(&self, ctx: &ExecutionContext) -> ControlResult<DeploymentOutcome> {
        let params = ctx.environment.orchestrator_params()?;
        let image = ctx.image.to_string();
        let target = format!("{}/{}", params.cluster, params.service);

        let service = self
            .api
            .describe_service(&params.cluster, &params.service)
            .await?;
        let current = self.api.describe_template(&service.task_definition).await?;

        if current.primary_image() == Some(image.as_str()) {
            info!(task_definition = %current.arn, "service already runs the image");
            return Ok(DeploymentOutcome::single(
                DeploymentStrategy::Orchestrator,
                ExecutionStatus::Succeeded,
                TargetResult::succeeded(target, format!("already on {}", current.arn)),
            ));
        }

        if ctx.cancel.is_cancelled() {
            return Err(ControlError::cancelled("service rollout"));
        }

        let body = current.revise(&image)?;
        let revision = self.api.register_template(&body).await?;
        self.api
            .update_service(&params.cluster, &params.service, &revision)
            .await?;
        info!(task_definition = %revision, "service rollout submitted");

        if !params.wait_for_stable {
            return Ok(DeploymentOutcome::single(
                DeploymentStrategy::Orchestrator,
                ExecutionStatus::Submitted,
                TargetResult::succeeded(target, format!("rolling out {revision}")),
            ));
        }

        self.wait_for_stable(ctx, params, &revision).await?;
        info!(task_definition = %revision, "service stable");
        Ok(DeploymentOutcome::single(
            DeploymentStrategy::Orchestrator,
            ExecutionStatus::Succeeded,
            TargetResult::succeeded(target, format!("stable on {revision}")),
        ))
    }
}
