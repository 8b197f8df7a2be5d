//! Blue/green pool swap behind a load balancer listener.
//!
//! The idle pool is rebuilt on the new image and must pass health checks
//! before the listener moves. The listener only ever points at a pool that
//! was healthy: an alarm or cancellation before the shift leaves it alone,
//! and an alarm during the shift window moves it back. A retired idle pool
//! is scaled back to the live pool's size before its refresh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{BlueGreenConfig, InPlaceConfig};
use crate::error::{ControlError, ControlResult};
use crate::strategy::DeploymentStrategy;
use crate::traffic::{Pool, PoolCapacity, RefreshStatus, TrafficApi};
use crate::types::{DeploymentOutcome, ExecutionStatus, TargetResult};

use super::{container_update_script, ContainerSpec, ExecutionContext, StrategyExecutor};

/// How the post-shift window ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowOutcome {
    Clear,
    AlarmFired,
    /// The alarm could not be read at some point in the window.
    Unconfirmed,
    Cancelled,
}

/// Swaps traffic between two pools.
pub struct BlueGreenExecutor {
    api: Arc<dyn TrafficApi>,
    container: InPlaceConfig,
}

impl BlueGreenExecutor {
    /// Create an executor. `container` names the application container
    /// launched by new pool instances.
    #[must_use]
    pub fn new(api: Arc<dyn TrafficApi>, container: InPlaceConfig) -> Self {
        Self { api, container }
    }

    /// Give a retired idle pool instances again, sized like the live pool.
    async fn restore_capacity(
        &self,
        live: &Pool,
        idle: &Pool,
    ) -> ControlResult<Option<PoolCapacity>> {
        if !self.api.pool_capacity(&idle.config).await?.is_empty() {
            return Ok(None);
        }
        let capacity = self.api.pool_capacity(&live.config).await?;
        if capacity.is_empty() {
            return Err(ControlError::permanent(
                "restore pool capacity",
                &idle.config.auto_scaling_group,
                format!("both pools are empty; {} pool has no size to copy", live.color),
            ));
        }
        self.api.scale_pool(&idle.config, capacity).await?;
        info!(
            pool = %idle.color,
            min = capacity.min,
            desired = capacity.desired,
            "idle pool restored"
        );
        Ok(Some(capacity))
    }

    /// Wait for the idle pool's refresh to finish and its targets to pass
    /// health checks.
    async fn wait_for_pool(
        &self,
        ctx: &ExecutionContext,
        params: &BlueGreenConfig,
        pool: &Pool,
        refresh_id: &str,
    ) -> ControlResult<()> {
        let limit = Duration::from_secs(params.health_timeout_secs);
        let interval = Duration::from_secs(params.poll_interval_secs.max(1));
        let deadline = Instant::now() + limit;

        loop {
            if let Some(alarm) = &params.rollback_alarm {
                if self.api.alarm_firing(alarm).await? {
                    return Err(ControlError::permanent(
                        "pool health wait",
                        alarm,
                        "alarm firing before shift; listener left unchanged",
                    ));
                }
            }

            match self.api.refresh_status(&pool.config, refresh_id).await? {
                RefreshStatus::Successful => {
                    let health = self.api.target_health(&pool.config.target_group_arn).await?;
                    if health.is_fully_healthy() {
                        return Ok(());
                    }
                    debug!(healthy = health.healthy, total = health.total, "targets not yet healthy");
                }
                RefreshStatus::Failed => {
                    return Err(ControlError::permanent(
                        "instance refresh",
                        &pool.config.auto_scaling_group,
                        format!("refresh {refresh_id} did not complete"),
                    ));
                }
                RefreshStatus::InProgress => debug!("refresh in progress"),
            }

            if Instant::now() >= deadline {
                return Err(ControlError::Timeout {
                    operation: format!("waiting for {} pool health", pool.color),
                    limit,
                });
            }

            tokio::select! {
                () = ctx.cancel.cancelled() => {
                    return Err(ControlError::cancelled(format!("{} pool health wait", pool.color)));
                }
                () = sleep(interval) => {}
            }
        }
    }

    /// Watch the rollback alarm for the shift window.
    async fn watch_shift_window(
        &self,
        ctx: &ExecutionContext,
        params: &BlueGreenConfig,
    ) -> ControlResult<WindowOutcome> {
        let Some(alarm) = &params.rollback_alarm else {
            return Ok(WindowOutcome::Clear);
        };
        let interval = Duration::from_secs(params.poll_interval_secs.max(1));
        let deadline = Instant::now() + Duration::from_secs(params.shift_window_secs);

        let mut unread = false;

        loop {
            match self.api.alarm_firing(alarm).await {
                Ok(true) => return Ok(WindowOutcome::AlarmFired),
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "could not read rollback alarm");
                    unread = true;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(if unread {
                    WindowOutcome::Unconfirmed
                } else {
                    WindowOutcome::Clear
                });
            }

            tokio::select! {
                () = ctx.cancel.cancelled() => return Ok(WindowOutcome::Cancelled),
                () = sleep(interval.min(deadline - now)) => {}
            }
        }
    }

    /// Drain and scale down the old pool when configured to.
    async fn retire(&self, ctx: &ExecutionContext, params: &BlueGreenConfig, old: &Pool) -> TargetResult {
        let target = format!("{} pool", old.color);
        if !params.terminate_old_pool {
            return TargetResult::succeeded(target, "retained for rollback");
        }

        tokio::select! {
            () = ctx.cancel.cancelled() => {
                return TargetResult::succeeded(target, "retained: cancelled during drain");
            }
            () = sleep(Duration::from_secs(params.drain_timeout_secs)) => {}
        }

        match self.api.retire_pool(&old.config).await {
            Ok(()) => TargetResult::succeeded(target, "scaled to zero"),
            Err(e) => {
                warn!(error = %e, pool = %old.color, "could not retire old pool");
                TargetResult::succeeded(target, format!("retained: {e}"))
            }
        }
    }
}

#[async_trait]
impl StrategyExecutor for BlueGreenExecutor {
    fn strategy(&self) -> DeploymentStrategy {
        DeploymentStrategy::BlueGreen
    }

    #[instrument(skip_all, fields(environment = %ctx.environment.name, attempt = ctx.attempt))]
    async fn execute(&self, ctx: &ExecutionContext) -> ControlResult<DeploymentOutcome> {
        let params = ctx.environment.blue_green_params()?;
        let listener = params.listener_arn.as_str();

        let live_target = self.api.listener_target(listener).await?;
        let (live, idle) = params.split_pools(&live_target)?;
        info!(live = %live.color, idle = %idle.color, "pools identified");

        if ctx.cancel.is_cancelled() {
            return Err(ControlError::cancelled("blue/green preparation"));
        }

        let user_data = format!(
            "#!/bin/bash\n{}\n",
            container_update_script(
                &ctx.image,
                ContainerSpec {
                    name: &self.container.container_name,
                    port_mapping: &self.container.port_mapping,
                },
                &ctx.environment.region,
            )
        );
        let version = self
            .api
            .update_pool_image(&idle.config, &ctx.image, &user_data)
            .await?;
        let restored = self.restore_capacity(&live, &idle).await?;
        let refresh_id = self
            .api
            .start_refresh(&idle.config, params.min_healthy_percentage)
            .await?;

        if let Err(e) = self.wait_for_pool(ctx, params, &idle, &refresh_id).await {
            warn!(error = %e, live = %live.color, "new pool not promoted");
            return Err(e);
        }

        self.api
            .shift_listener(listener, &idle.config.target_group_arn)
            .await?;
        info!(pool = %idle.color, "traffic shifted");

        let pool_message = match restored {
            Some(capacity) => format!(
                "launch template version {version}, refresh {refresh_id}, restored to {} instances",
                capacity.desired
            ),
            None => format!("launch template version {version}, refresh {refresh_id}"),
        };
        let mut targets = vec![
            TargetResult::succeeded(format!("{} pool", idle.color), pool_message),
            TargetResult::succeeded(listener, format!("forwarding to {} pool", idle.color)),
        ];

        let outcome = self.watch_shift_window(ctx, params).await?;
        match outcome {
            WindowOutcome::Clear => {}
            WindowOutcome::AlarmFired => {
                warn!(pool = %live.color, "alarm fired after shift, reverting");
                return match self
                    .api
                    .shift_listener(listener, &live.config.target_group_arn)
                    .await
                {
                    Ok(()) => Err(ControlError::permanent(
                        "shift window",
                        listener,
                        format!("rollback alarm fired; listener reverted to {} pool", live.color),
                    )),
                    Err(e) => {
                        error!(error = %e, "listener revert failed");
                        Err(ControlError::permanent(
                            "shift window",
                            listener,
                            format!(
                                "rollback alarm fired and revert to {} pool failed: {e}",
                                live.color
                            ),
                        ))
                    }
                };
            }
            WindowOutcome::Unconfirmed | WindowOutcome::Cancelled => {
                let reason = if outcome == WindowOutcome::Cancelled {
                    "cancelled during shift window"
                } else {
                    "rollback alarm unreadable during shift window"
                };
                info!(reason, "keeping old pool");
                targets.push(TargetResult::succeeded(
                    format!("{} pool", live.color),
                    format!("retained: {reason}"),
                ));
                return Ok(DeploymentOutcome {
                    strategy: DeploymentStrategy::BlueGreen,
                    status: ExecutionStatus::Submitted,
                    targets,
                });
            }
        }

        targets.push(self.retire(ctx, params, &live).await);
        Ok(DeploymentOutcome::from_targets(
            DeploymentStrategy::BlueGreen,
            targets,
        ))
    }
}
