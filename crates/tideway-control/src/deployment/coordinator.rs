//! Deployment coordination.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::{ChangeGate, ControlConfig, RetryConfig};
use crate::error::{ControlError, ControlResult};
use crate::executor::{ExecutionContext, ExecutorSet, StrategyExecutor};
use crate::registry::{validate_repository, validate_tag, ArtifactRegistry};
use crate::state::{Deployment, Executing, FinishedDeployment, Pending};
use crate::store::{ConfigStore, ParameterKey};
use crate::strategy::DeploymentStrategy;
use crate::types::{DeploymentData, DeploymentOutcome, DeploymentRequest, Environment};
use crate::verifier::{HealthVerifier, VerificationKeys};

use super::report::DeploymentReport;

/// Delay before retry number `attempt + 1`: `initial * 2^attempt`, capped.
fn calculate_backoff_delay(attempt: u32, initial_delay: Duration, max_delay: Duration) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt);
    let delay = initial_delay.saturating_mul(multiplier);
    delay.min(max_delay)
}

/// Executor failure together with the last outcome it reported, if any.
type ExecutionFailure = (ControlError, Option<DeploymentOutcome>);

/// Holds an environment for the lifetime of one deploy.
struct EnvironmentLease {
    in_flight: Arc<Mutex<HashSet<String>>>,
    environment: String,
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.environment);
        }
    }
}

/// Runs deployments: record the tag, execute the strategy with retries,
/// then gate the result on health verification.
///
/// At most one deploy per environment runs on a coordinator at a time.
/// Deploys from separate processes are not serialised.
pub struct DeploymentCoordinator {
    config: Arc<ControlConfig>,
    gate: ChangeGate,
    store: Arc<dyn ConfigStore>,
    registry: Arc<dyn ArtifactRegistry>,
    executors: ExecutorSet,
    verifier: HealthVerifier,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl DeploymentCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        config: Arc<ControlConfig>,
        store: Arc<dyn ConfigStore>,
        registry: Arc<dyn ArtifactRegistry>,
        executors: ExecutorSet,
        verifier: HealthVerifier,
    ) -> Self {
        Self {
            gate: ChangeGate::new(config.apply_changes),
            config,
            store,
            registry,
            executors,
            verifier,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Check a request without side effects: environment, strategy and its
    /// parameters, repository, tag, the change gate and whether the
    /// environment is free.
    pub fn validate(&self, request: &DeploymentRequest) -> ControlResult<()> {
        let (environment, _, _) = self.prepare(request)?;
        let in_flight = self
            .in_flight
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        if in_flight.contains(&environment.name) {
            return Err(ControlError::DeploymentInProgress {
                environment: environment.name,
            });
        }
        Ok(())
    }

    fn prepare(
        &self,
        request: &DeploymentRequest,
    ) -> ControlResult<(Environment, DeploymentStrategy, Arc<dyn StrategyExecutor>)> {
        let environment = self.config.environment(&request.environment)?;
        let strategy = resolve_strategy(&request.strategy, &environment)?;
        environment.validate_for(strategy)?;
        let executor = self.executors.get(strategy).ok_or_else(|| {
            ControlError::Config(format!("no executor registered for {strategy}"))
        })?;
        validate_repository(&request.repository)?;
        validate_tag(&request.image_tag)?;
        self.gate.check("deploy")?;
        Ok((environment, strategy, executor))
    }

    /// Deploy an image tag to an environment.
    ///
    /// Returns `Err` only when the deployment never ran: the request was
    /// invalid, changes are disabled, another deploy holds the environment,
    /// or the config store could not be written. Once an executor has been
    /// invoked the result is always a report, whose final state tells
    /// success, failure and unhealthy apart.
    #[instrument(skip_all, fields(environment = %request.environment, tag = %request.image_tag))]
    pub async fn deploy(
        &self,
        request: DeploymentRequest,
        cancel: CancellationToken,
    ) -> ControlResult<DeploymentReport> {
        let started_at = Utc::now();
        let (environment, strategy, executor) = self.prepare(&request)?;

        let _lease = self.lease(&environment.name)?;

        let image = self
            .registry
            .reference(&request.repository, &request.image_tag)
            .await?;

        let pending = Deployment::<Pending>::create(DeploymentData::new(request.clone()));
        let deployment_id = pending.id().clone();
        info!(
            deployment_id = %deployment_id,
            strategy = %strategy,
            image = %image,
            "starting deployment"
        );

        if let Err(e) = self.record_target(&environment.name, &request).await {
            error!(deployment_id = %deployment_id, error = %e, "config store write failed");
            return Err(e);
        }
        let mut executing = pending.config_written().start_executing();

        let ctx = ExecutionContext {
            environment: environment.clone(),
            request: request.clone(),
            image: image.clone(),
            attempt: 1,
            cancel,
        };
        let result = self
            .execute_with_retry(executor.as_ref(), ctx, &mut executing)
            .await;

        let keys = VerificationKeys::for_environment(&self.config.project, &environment.name);
        let verification = self.verifier.verify(&environment.health_url, &keys).await;

        let (finished, outcome, failure): (FinishedDeployment, _, _) = match result {
            Ok(outcome) => {
                let verifying = executing.executed().start_verifying();
                if verification.passed {
                    (verifying.succeed().into(), Some(outcome), None)
                } else {
                    let e = ControlError::VerificationFailed(verification.message.clone());
                    (verifying.unhealthy(e.to_string()).into(), Some(outcome), Some(e))
                }
            }
            Err((e, outcome)) => (executing.fail(e.to_string()).into(), outcome, Some(e)),
        };

        let state = finished.state();
        match &failure {
            None => info!(deployment_id = %deployment_id, "deployment succeeded"),
            Some(e) => error!(
                deployment_id = %deployment_id,
                state = %state,
                class = %e.class(),
                error = %e,
                "deployment did not succeed"
            ),
        }

        let data = finished.into_data();
        Ok(DeploymentReport {
            id: data.id,
            request: data.request,
            strategy,
            image: image.to_string(),
            states: data.states,
            attempts: data.attempts,
            outcome,
            verification: Some(verification),
            error: data.error,
            error_class: failure.as_ref().map(ControlError::class),
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn lease(&self, environment: &str) -> ControlResult<EnvironmentLease> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        if !in_flight.insert(environment.to_owned()) {
            return Err(ControlError::DeploymentInProgress {
                environment: environment.to_owned(),
            });
        }
        Ok(EnvironmentLease {
            in_flight: Arc::clone(&self.in_flight),
            environment: environment.to_owned(),
        })
    }

    /// Write the tag, then the repository. Hosts and the verifier read the
    /// tag, so it must land before any executor runs.
    async fn record_target(&self, environment: &str, request: &DeploymentRequest) -> ControlResult<()> {
        let project = &self.config.project;
        self.store
            .put(&ParameterKey::image_tag(project, environment), &request.image_tag)
            .await?;
        self.store
            .put(&ParameterKey::repository(project, environment), &request.repository)
            .await?;
        info!(project = %project, "config store updated");
        Ok(())
    }

    async fn execute_with_retry(
        &self,
        executor: &dyn StrategyExecutor,
        mut ctx: ExecutionContext,
        executing: &mut Deployment<Executing>,
    ) -> Result<DeploymentOutcome, ExecutionFailure> {
        let retry = &self.config.retry;
        let budget = attempt_budget(retry, executor.max_attempts());
        let mut last_outcome = None;

        loop {
            ctx.attempt = executing.attempts();

            let e = match executor.execute(&ctx).await {
                Ok(outcome) if outcome.is_success() => {
                    info!(attempt = ctx.attempt, status = ?outcome.status, "executor finished");
                    return Ok(outcome);
                }
                Ok(outcome) => {
                    let e = outcome.to_error(&ctx.environment.name);
                    last_outcome = Some(outcome);
                    e
                }
                Err(e) => e,
            };

            if !e.is_retryable() {
                warn!(attempt = ctx.attempt, error = %e, "executor failed permanently");
                return Err((e, last_outcome));
            }
            if ctx.attempt >= budget {
                warn!(attempt = ctx.attempt, error = %e, "retries exhausted");
                return Err((e, last_outcome));
            }

            let delay =
                calculate_backoff_delay(ctx.attempt - 1, retry.base_delay(), retry.max_delay());
            warn!(
                attempt = ctx.attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %e,
                "executor failed transiently, retrying"
            );

            tokio::select! {
                () = ctx.cancel.cancelled() => {
                    return Err((ControlError::cancelled("retry backoff"), last_outcome));
                }
                () = tokio::time::sleep(delay) => {}
            }
            executing.record_retry();
        }
    }
}

/// Named strategy, or the environment's default when none was given.
fn resolve_strategy(name: &str, environment: &Environment) -> ControlResult<DeploymentStrategy> {
    if name.trim().is_empty() {
        Ok(environment.default_strategy)
    } else {
        name.parse()
    }
}

/// Attempts allowed: the global policy, tightened by the executor's cap.
fn attempt_budget(retry: &RetryConfig, executor_cap: Option<u32>) -> u32 {
    executor_cap
        .map_or(retry.max_attempts, |cap| cap.min(retry.max_attempts))
        .max(1)
}
