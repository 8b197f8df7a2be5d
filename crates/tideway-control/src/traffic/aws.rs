//! Traffic control over the provider CLI.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument};

use crate::aws::AwsCli;
use crate::config::{ChangeGate, PoolConfig};
use crate::error::{ControlError, ControlResult};
use crate::registry::ImageReference;

use super::{PoolCapacity, RefreshStatus, TargetHealth, TrafficApi};

/// Seconds a replacement instance gets before it counts toward health.
const INSTANCE_WARMUP_SECS: u32 = 60;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeListeners {
    #[serde(default)]
    listeners: Vec<Listener>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Listener {
    #[serde(default)]
    default_actions: Vec<Action>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Action {
    #[serde(rename = "Type")]
    kind: String,
    target_group_arn: Option<String>,
    forward_config: Option<ForwardConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ForwardConfig {
    #[serde(default)]
    target_groups: Vec<WeightedTargetGroup>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WeightedTargetGroup {
    target_group_arn: String,
    #[serde(default)]
    weight: Option<i64>,
}

impl Action {
    /// The target group receiving traffic. For weighted forwards, the
    /// heaviest group.
    fn forward_target(self) -> Option<String> {
        if self.kind != "forward" {
            return None;
        }
        self.target_group_arn.or_else(|| {
            self.forward_config.and_then(|config| {
                config
                    .target_groups
                    .into_iter()
                    .max_by_key(|g| g.weight.unwrap_or(1))
                    .map(|g| g.target_group_arn)
            })
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateVersionResponse {
    launch_template_version: LaunchTemplateVersion,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LaunchTemplateVersion {
    version_number: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StartRefreshResponse {
    instance_refresh_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeRefreshes {
    #[serde(default)]
    instance_refreshes: Vec<InstanceRefresh>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceRefresh {
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTargetHealth {
    #[serde(default)]
    target_health_descriptions: Vec<TargetHealthDescription>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetHealthDescription {
    target_health: TargetHealthState,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetHealthState {
    state: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeAlarms {
    #[serde(default)]
    metric_alarms: Vec<AlarmState>,
    #[serde(default)]
    composite_alarms: Vec<AlarmState>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AlarmState {
    state_value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeGroups {
    #[serde(default)]
    auto_scaling_groups: Vec<GroupSize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GroupSize {
    min_size: u32,
    desired_capacity: u32,
}

/// Listener, scaling group and alarm control through the provider CLI.
#[derive(Debug, Clone)]
pub struct AwsTrafficApi {
    aws: AwsCli,
    gate: ChangeGate,
}

impl AwsTrafficApi {
    /// Create a client. Mutations are refused unless `gate` is open.
    #[must_use]
    pub const fn new(aws: AwsCli, gate: ChangeGate) -> Self {
        Self { aws, gate }
    }
}

#[async_trait]
impl TrafficApi for AwsTrafficApi {
    #[instrument(skip(self))]
    async fn listener_target(&self, listener: &str) -> ControlResult<String> {
        let response: DescribeListeners = self
            .aws
            .json(
                "describe listener",
                listener,
                &["elbv2", "describe-listeners", "--listener-arns", listener],
            )
            .await?;

        response
            .listeners
            .into_iter()
            .flat_map(|l| l.default_actions)
            .find_map(Action::forward_target)
            .ok_or_else(|| {
                ControlError::permanent("describe listener", listener, "no forward action")
            })
    }

    #[instrument(skip(self))]
    async fn shift_listener(&self, listener: &str, target_group: &str) -> ControlResult<()> {
        self.gate.check("shift listener")?;

        let action = format!("Type=forward,TargetGroupArn={target_group}");
        self.aws
            .run(
                "shift listener",
                listener,
                &[
                    "elbv2",
                    "modify-listener",
                    "--listener-arn",
                    listener,
                    "--default-actions",
                    action.as_str(),
                ],
            )
            .await?;

        info!("listener shifted");
        Ok(())
    }

    #[instrument(skip(self, user_data), fields(template = %pool.launch_template_id, image = %image))]
    async fn update_pool_image(
        &self,
        pool: &PoolConfig,
        image: &ImageReference,
        user_data: &str,
    ) -> ControlResult<String> {
        self.gate.check("update launch template")?;

        let data = json!({ "UserData": STANDARD.encode(user_data) }).to_string();
        let description = format!("image:{}", image.tag);
        let response: CreateVersionResponse = self
            .aws
            .json(
                "create launch template version",
                &pool.launch_template_id,
                &[
                    "ec2",
                    "create-launch-template-version",
                    "--launch-template-id",
                    pool.launch_template_id.as_str(),
                    "--source-version",
                    "$Latest",
                    "--version-description",
                    description.as_str(),
                    "--launch-template-data",
                    data.as_str(),
                ],
            )
            .await?;

        let version = response.launch_template_version.version_number.to_string();
        self.aws
            .run(
                "set default launch template version",
                &pool.launch_template_id,
                &[
                    "ec2",
                    "modify-launch-template",
                    "--launch-template-id",
                    pool.launch_template_id.as_str(),
                    "--default-version",
                    version.as_str(),
                ],
            )
            .await?;

        info!(version = %version, "launch template updated");
        Ok(version)
    }

    #[instrument(skip(self), fields(group = %pool.auto_scaling_group))]
    async fn start_refresh(
        &self,
        pool: &PoolConfig,
        min_healthy_percentage: u8,
    ) -> ControlResult<String> {
        self.gate.check("start instance refresh")?;

        let preferences = json!({
            "MinHealthyPercentage": min_healthy_percentage,
            "InstanceWarmup": INSTANCE_WARMUP_SECS,
        })
        .to_string();
        let response: StartRefreshResponse = self
            .aws
            .json(
                "start instance refresh",
                &pool.auto_scaling_group,
                &[
                    "autoscaling",
                    "start-instance-refresh",
                    "--auto-scaling-group-name",
                    pool.auto_scaling_group.as_str(),
                    "--preferences",
                    preferences.as_str(),
                ],
            )
            .await?;

        info!(refresh_id = %response.instance_refresh_id, "instance refresh started");
        Ok(response.instance_refresh_id)
    }

    async fn refresh_status(
        &self,
        pool: &PoolConfig,
        refresh_id: &str,
    ) -> ControlResult<RefreshStatus> {
        let response: DescribeRefreshes = self
            .aws
            .json(
                "describe instance refresh",
                &pool.auto_scaling_group,
                &[
                    "autoscaling",
                    "describe-instance-refreshes",
                    "--auto-scaling-group-name",
                    pool.auto_scaling_group.as_str(),
                    "--instance-refresh-ids",
                    refresh_id,
                ],
            )
            .await?;

        response
            .instance_refreshes
            .first()
            .map(|r| RefreshStatus::from_provider(&r.status))
            .ok_or_else(|| {
                ControlError::permanent("describe instance refresh", refresh_id, "refresh not found")
            })
    }

    async fn target_health(&self, target_group: &str) -> ControlResult<TargetHealth> {
        let response: DescribeTargetHealth = self
            .aws
            .json(
                "describe target health",
                target_group,
                &[
                    "elbv2",
                    "describe-target-health",
                    "--target-group-arn",
                    target_group,
                ],
            )
            .await?;

        let total = response.target_health_descriptions.len();
        let healthy = response
            .target_health_descriptions
            .iter()
            .filter(|d| d.target_health.state == "healthy")
            .count();
        Ok(TargetHealth { healthy, total })
    }

    async fn alarm_firing(&self, alarm: &str) -> ControlResult<bool> {
        let response: DescribeAlarms = self
            .aws
            .json(
                "describe alarm",
                alarm,
                &["cloudwatch", "describe-alarms", "--alarm-names", alarm],
            )
            .await?;

        let state = response
            .metric_alarms
            .into_iter()
            .chain(response.composite_alarms)
            .next()
            .ok_or_else(|| ControlError::permanent("describe alarm", alarm, "alarm not found"))?;
        Ok(state.state_value == "ALARM")
    }

    #[instrument(skip(self), fields(group = %pool.auto_scaling_group))]
    async fn pool_capacity(&self, pool: &PoolConfig) -> ControlResult<PoolCapacity> {
        let response: DescribeGroups = self
            .aws
            .json(
                "describe pool",
                &pool.auto_scaling_group,
                &[
                    "autoscaling",
                    "describe-auto-scaling-groups",
                    "--auto-scaling-group-names",
                    pool.auto_scaling_group.as_str(),
                ],
            )
            .await?;

        response
            .auto_scaling_groups
            .into_iter()
            .next()
            .map(|group| PoolCapacity {
                min: group.min_size,
                desired: group.desired_capacity,
            })
            .ok_or_else(|| {
                ControlError::permanent(
                    "describe pool",
                    &pool.auto_scaling_group,
                    "scaling group not found",
                )
            })
    }

    #[instrument(skip(self, pool), fields(group = %pool.auto_scaling_group))]
    async fn scale_pool(&self, pool: &PoolConfig, capacity: PoolCapacity) -> ControlResult<()> {
        self.gate.check("scale pool")?;

        let min = capacity.min.to_string();
        let desired = capacity.desired.to_string();
        self.aws
            .run(
                "scale pool",
                &pool.auto_scaling_group,
                &[
                    "autoscaling",
                    "update-auto-scaling-group",
                    "--auto-scaling-group-name",
                    pool.auto_scaling_group.as_str(),
                    "--min-size",
                    min.as_str(),
                    "--desired-capacity",
                    desired.as_str(),
                ],
            )
            .await?;

        info!(min = capacity.min, desired = capacity.desired, "pool scaled");
        Ok(())
    }
}
