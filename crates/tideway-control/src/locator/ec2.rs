//! Instance discovery through the compute API.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::aws::AwsCli;
use crate::error::ControlResult;
use crate::types::TargetHost;

use super::{classify_role, select_address, InstanceLocator};

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    private_ip_address: Option<String>,
    public_ip_address: Option<String>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

impl Instance {
    fn name(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == "Name")
            .map(|t| t.value.as_str())
    }
}

/// Locates running instances by environment tag.
#[derive(Debug, Clone)]
pub struct Ec2Locator {
    aws: AwsCli,
    tag_key: String,
    relay_pattern: String,
}

impl Ec2Locator {
    /// Create a locator matching `tag:<tag_key>` and excluding hosts whose
    /// name contains `relay_pattern`.
    #[must_use]
    pub fn new(aws: AwsCli, tag_key: impl Into<String>, relay_pattern: impl Into<String>) -> Self {
        Self {
            aws,
            tag_key: tag_key.into(),
            relay_pattern: relay_pattern.into(),
        }
    }
}

#[async_trait]
impl InstanceLocator for Ec2Locator {
    #[instrument(skip(self))]
    async fn list(&self, environment: &str, via_relay: bool) -> ControlResult<Vec<TargetHost>> {
        let tag_filter = format!("Name=tag:{},Values={environment}", self.tag_key);
        let response: DescribeInstances = self
            .aws
            .json(
                "describe instances",
                environment,
                &[
                    "ec2",
                    "describe-instances",
                    "--filters",
                    tag_filter.as_str(),
                    "Name=instance-state-name,Values=running",
                ],
            )
            .await?;

        let hosts: Vec<TargetHost> = response
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(|instance| {
                let name = instance.name().map(ToOwned::to_owned);
                let role = classify_role(name.as_deref(), &self.relay_pattern);
                let address = select_address(
                    instance.public_ip_address.as_deref(),
                    instance.private_ip_address.as_deref(),
                    via_relay,
                )
                .unwrap_or_default();
                TargetHost {
                    id: instance.instance_id,
                    address,
                    name,
                    role,
                }
            })
            .collect();

        debug!(count = hosts.len(), "instances located");
        Ok(hosts)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::process::{CommandOutput, ScriptedRunner};
    use crate::types::HostRole;

    const RESPONSE: &str = r#"{
        "Reservations": [
            {"Instances": [
                {"InstanceId": "i-web1", "PrivateIpAddress": "10.0.1.5", "PublicIpAddress": "54.1.1.1",
                 "Tags": [{"Key": "Name", "Value": "prod-web-1"}, {"Key": "Env", "Value": "prod"}]},
                {"InstanceId": "i-bastion", "PrivateIpAddress": "10.0.0.4", "PublicIpAddress": "54.0.0.4",
                 "Tags": [{"Key": "Name", "Value": "prod-bastion"}]}
            ]},
            {"Instances": [
                {"InstanceId": "i-web2", "PrivateIpAddress": "10.0.2.6"}
            ]}
        ]
    }"#;

    #[tokio::test]
    async fn lists_hosts_with_roles_and_addresses() {
        let runner = ScriptedRunner::new(|_| Ok(CommandOutput::ok(RESPONSE)));
        let locator = Ec2Locator::new(
            AwsCli::new(Arc::new(runner.clone()), "us-east-1"),
            "Env",
            "bastion",
        );

        let hosts = locator.list("prod", false).await.unwrap();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0].address, "54.1.1.1");
        assert_eq!(hosts[1].role, HostRole::RelayExcluded);
        assert_eq!(hosts[2].address, "10.0.2.6");
        assert_eq!(
            hosts.iter().filter(|h| h.is_deployable()).count(),
            2
        );

        let call = &runner.calls()[0];
        assert!(call.has_arg("Name=tag:Env,Values=prod"));
        assert!(call.has_arg("Name=instance-state-name,Values=running"));
    }

    #[tokio::test]
    async fn relay_mode_uses_private_addresses() {
        let runner = ScriptedRunner::new(|_| Ok(CommandOutput::ok(RESPONSE)));
        let locator = Ec2Locator::new(AwsCli::new(Arc::new(runner), "us-east-1"), "Env", "bastion");

        let hosts = locator.list("prod", true).await.unwrap();
        assert_eq!(hosts[0].address, "10.0.1.5");
    }

    #[tokio::test]
    async fn empty_response_is_empty_list() {
        let runner = ScriptedRunner::new(|_| Ok(CommandOutput::ok(r#"{"Reservations": []}"#)));
        let locator = Ec2Locator::new(AwsCli::new(Arc::new(runner), "us-east-1"), "Env", "bastion");
        assert!(locator.list("dev", false).await.unwrap().is_empty());
    }
}
