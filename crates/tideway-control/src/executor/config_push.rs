//! Configuration-management push.
//!
//! Runs the deployment playbook against the environment's dynamic
//! inventory. The playbook itself reads the image tag from the config
//! store, which the coordinator has already written.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::{ControlError, ControlResult, ErrorClass};
use crate::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::strategy::DeploymentStrategy;
use crate::types::{DeploymentOutcome, ExecutionStatus, TargetResult};

use super::{ExecutionContext, StrategyExecutor};

const PLAYBOOK: &str = "ansible-playbook";
const INVENTORY: &str = "ansible-inventory";
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs the deployment playbook.
pub struct ConfigPushExecutor {
    runner: Arc<dyn CommandRunner>,
}

impl ConfigPushExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn ensure_tool(&self) -> ControlResult<()> {
        let output = self
            .runner
            .run(&CommandSpec::new(PLAYBOOK).arg("--version").timeout(PROBE_TIMEOUT))
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(ControlError::ToolUnavailable {
                tool: PLAYBOOK.to_owned(),
            })
        }
    }

    /// Count inventory hosts. `None` when the inventory tool is missing, in
    /// which case the playbook's own "no hosts matched" check applies.
    async fn inventory_hosts(&self, dir: &Path, inventory: &str) -> ControlResult<Option<usize>> {
        let spec = CommandSpec::new(INVENTORY)
            .args(["-i", inventory, "--list"])
            .current_dir(dir)
            .timeout(PROBE_TIMEOUT);
        let output = match self.runner.run(&spec).await {
            Ok(output) => output,
            Err(ControlError::ToolUnavailable { .. }) => {
                warn!("inventory tool unavailable, skipping host count");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if !output.success() {
            return Err(ControlError::transient(
                "list inventory",
                inventory,
                output.stderr_tail(800),
            ));
        }
        Ok(Some(count_inventory_hosts(&output.stdout)))
    }
}

/// Count the hosts in `ansible-inventory --list` output.
#[must_use]
pub fn count_inventory_hosts(json: &str) -> usize {
    serde_json::from_str::<Value>(json)
        .ok()
        .and_then(|v| {
            v.get("_meta")
                .and_then(|m| m.get("hostvars"))
                .and_then(Value::as_object)
                .map(serde_json::Map::len)
        })
        .unwrap_or(0)
}

/// Parse the `PLAY RECAP` section into per-host results.
#[must_use]
pub fn parse_recap(stdout: &str) -> Vec<TargetResult> {
    stdout
        .lines()
        .skip_while(|line| !line.starts_with("PLAY RECAP"))
        .skip(1)
        .filter_map(|line| {
            let (host, stats) = line.split_once(" : ")?;
            let stat = |name: &str| -> u32 {
                stats
                    .split_whitespace()
                    .find_map(|kv| kv.strip_prefix(name)?.strip_prefix('='))
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0)
            };
            let host = host.trim();
            let failed = stat("failed");
            let unreachable = stat("unreachable");
            if failed == 0 && unreachable == 0 {
                Some(TargetResult::succeeded(host, format!("changed={}", stat("changed"))))
            } else {
                Some(TargetResult {
                    target: host.to_owned(),
                    success: false,
                    message: format!("failed={failed} unreachable={unreachable}"),
                    error_class: Some(ErrorClass::Transient),
                })
            }
        })
        .collect()
}

fn no_hosts_matched(output: &CommandOutput) -> bool {
    let stdout = output.stdout.to_ascii_lowercase();
    let stderr = output.stderr.to_ascii_lowercase();
    stdout.contains("no hosts matched")
        || stderr.contains("no hosts matched")
        || stderr.contains("provided hosts list is empty")
}

#[async_trait]
impl StrategyExecutor for ConfigPushExecutor {
    fn strategy(&self) -> DeploymentStrategy {
        DeploymentStrategy::ConfigPush
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(2)
    }

    #[instrument(skip_all, fields(environment = %ctx.environment.name, attempt = ctx.attempt))]
    async fn execute(&self, ctx: &ExecutionContext) -> ControlResult<DeploymentOutcome> {
        let environment = &ctx.environment;
        let params = environment.config_push_params()?;
        let inventory = params.inventory_for(&environment.name);

        self.ensure_tool().await?;

        if !params.ansible_dir.join(&inventory).is_file() {
            return Err(ControlError::permanent(
                "load inventory",
                params.ansible_dir.join(&inventory).display().to_string(),
                "inventory file not found",
            ));
        }

        if self.inventory_hosts(&params.ansible_dir, &inventory).await? == Some(0) {
            return Err(ControlError::NoTargets {
                environment: environment.name.clone(),
            });
        }

        let spec = CommandSpec::new(PLAYBOOK)
            .args(["-i", inventory.as_str(), params.playbook.as_str()])
            .args(["-e".to_owned(), format!("image_tag={}", ctx.request.image_tag)])
            .args(["-e".to_owned(), format!("env={}", environment.name)])
            .args(["-e".to_owned(), format!("ssm_bucket={}", params.storage_bucket)])
            .args(["-e".to_owned(), format!("ssm_region={}", environment.region)])
            .args(["-e".to_owned(), format!("image={}", ctx.image)])
            .current_dir(&params.ansible_dir)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .env("ANSIBLE_FORCE_COLOR", "0")
            .timeout(Duration::from_secs(params.timeout_secs));

        let run = tokio::select! {
            () = ctx.cancel.cancelled() => return Err(ControlError::cancelled("playbook run")),
            run = self.runner.run(&spec) => run?,
        };

        if no_hosts_matched(&run) {
            return Err(ControlError::NoTargets {
                environment: environment.name.clone(),
            });
        }

        let hosts = parse_recap(&run.stdout);
        if run.success() {
            info!(hosts = hosts.len(), "playbook finished");
            if hosts.is_empty() {
                return Ok(DeploymentOutcome::single(
                    DeploymentStrategy::ConfigPush,
                    ExecutionStatus::Succeeded,
                    TargetResult::succeeded(inventory, run.stdout_tail(500)),
                ));
            }
            return Ok(DeploymentOutcome::from_targets(
                DeploymentStrategy::ConfigPush,
                hosts,
            ));
        }

        warn!(exit_code = run.exit_code, "playbook failed");
        if hosts.is_empty() {
            return Err(ControlError::transient(
                "playbook run",
                inventory,
                format!("exit {}: {}", run.exit_code, run.stderr_tail(800)),
            ));
        }
        Ok(DeploymentOutcome::from_targets(
            DeploymentStrategy::ConfigPush,
            hosts,
        ))
    }
}
