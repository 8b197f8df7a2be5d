//! Elastic container service backend.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};

use crate::aws::AwsCli;
use crate::config::ChangeGate;
use crate::error::{ControlError, ControlResult};

use super::{OrchestratorApi, ServiceDeployment, ServiceState, TaskTemplate};

#[derive(Deserialize)]
struct DescribeServices {
    #[serde(default)]
    services: Vec<RawService>,
    #[serde(default)]
    failures: Vec<RawFailure>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawService {
    task_definition: String,
    #[serde(default)]
    desired_count: i64,
    #[serde(default)]
    running_count: i64,
    #[serde(default)]
    deployments: Vec<RawDeployment>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDeployment {
    status: String,
    task_definition: String,
    rollout_state: Option<String>,
    #[serde(default)]
    running_count: i64,
    #[serde(default)]
    desired_count: i64,
}

#[derive(Deserialize)]
struct RawFailure {
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskDefinitionEnvelope {
    task_definition: Value,
}

/// Container service API over the provider CLI.
#[derive(Debug, Clone)]
pub struct EcsApi {
    aws: AwsCli,
    gate: ChangeGate,
}

impl EcsApi {
    /// Create a client. Mutations are refused unless `gate` is open.
    #[must_use]
    pub const fn new(aws: AwsCli, gate: ChangeGate) -> Self {
        Self { aws, gate }
    }
}

#[async_trait]
impl OrchestratorApi for EcsApi {
    #[instrument(skip(self))]
    async fn describe_service(&self, cluster: &str, service: &str) -> ControlResult<ServiceState> {
        let response: DescribeServices = self
            .aws
            .json(
                "describe service",
                service,
                &[
                    "ecs",
                    "describe-services",
                    "--cluster",
                    cluster,
                    "--services",
                    service,
                ],
            )
            .await?;

        let raw = response.services.into_iter().next().ok_or_else(|| {
            let reason = response
                .failures
                .into_iter()
                .find_map(|f| f.reason)
                .unwrap_or_else(|| "not found".to_owned());
            ControlError::permanent("describe service", format!("{cluster}/{service}"), reason)
        })?;

        Ok(ServiceState {
            task_definition: raw.task_definition,
            desired_count: raw.desired_count,
            running_count: raw.running_count,
            deployments: raw
                .deployments
                .into_iter()
                .map(|d| ServiceDeployment {
                    status: d.status,
                    task_definition: d.task_definition,
                    rollout_state: d.rollout_state,
                    running_count: d.running_count,
                    desired_count: d.desired_count,
                })
                .collect(),
        })
    }

    #[instrument(skip(self))]
    async fn describe_template(&self, arn: &str) -> ControlResult<TaskTemplate> {
        let envelope: TaskDefinitionEnvelope = self
            .aws
            .json(
                "describe template",
                arn,
                &["ecs", "describe-task-definition", "--task-definition", arn],
            )
            .await?;

        Ok(TaskTemplate {
            arn: arn.to_owned(),
            body: envelope.task_definition,
        })
    }

    #[instrument(skip_all)]
    async fn register_template(&self, body: &Value) -> ControlResult<String> {
        self.gate.check("register template")?;

        let family = body
            .get("family")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        let input = serde_json::to_string(body)?;

        let envelope: TaskDefinitionEnvelope = self
            .aws
            .json(
                "register template",
                &family,
                &["ecs", "register-task-definition", "--cli-input-json", input.as_str()],
            )
            .await?;

        let arn = envelope
            .task_definition
            .get("taskDefinitionArn")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ControlError::permanent("register template", &family, "response lacks an arn")
            })?
            .to_owned();

        info!(family = %family, arn = %arn, "template revision registered");
        Ok(arn)
    }

    #[instrument(skip(self))]
    async fn update_service(
        &self,
        cluster: &str,
        service: &str,
        task_definition: &str,
    ) -> ControlResult<()> {
        self.gate.check("update service")?;

        self.aws
            .run(
                "update service",
                service,
                &[
                    "ecs",
                    "update-service",
                    "--cluster",
                    cluster,
                    "--service",
                    service,
                    "--task-definition",
                    task_definition,
                    "--force-new-deployment",
                ],
            )
            .await?;

        info!("service rollout started");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::process::{CommandOutput, ScriptedRunner};

    fn api(runner: &ScriptedRunner, gate: ChangeGate) -> EcsApi {
        EcsApi::new(AwsCli::new(Arc::new(runner.clone()), "us-east-1"), gate)
    }

    #[tokio::test]
    async fn describe_service_parses_deployments() {
        let runner = ScriptedRunner::new(|_| {
            Ok(CommandOutput::ok(
                r#"{"services":[{"serviceName":"shop","taskDefinition":"td:5","desiredCount":2,"runningCount":2,
                    "deployments":[{"status":"PRIMARY","taskDefinition":"td:5","rolloutState":"COMPLETED","runningCount":2,"desiredCount":2}]}],
                    "failures":[]}"#,
            ))
        });
        let state = api(&runner, ChangeGate::open())
            .describe_service("prod", "shop")
            .await
            .unwrap();
        assert_eq!(state.task_definition, "td:5");
        assert!(state.is_stable_on("td:5"));
    }

    #[tokio::test]
    async fn missing_service_is_permanent() {
        let runner = ScriptedRunner::new(|_| {
            Ok(CommandOutput::ok(
                r#"{"services":[],"failures":[{"arn":"arn:svc","reason":"MISSING"}]}"#,
            ))
        });
        let err = api(&runner, ChangeGate::open())
            .describe_service("prod", "shop")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("MISSING"));
    }

    #[tokio::test]
    async fn register_returns_new_arn() {
        let runner = ScriptedRunner::new(|_| {
            Ok(CommandOutput::ok(
                r#"{"taskDefinition":{"taskDefinitionArn":"arn:td/shop:6","family":"shop"}}"#,
            ))
        });
        let arn = api(&runner, ChangeGate::open())
            .register_template(&json!({"family": "shop", "containerDefinitions": []}))
            .await
            .unwrap();
        assert_eq!(arn, "arn:td/shop:6");

        let input = runner.calls()[0].arg_after("--cli-input-json").unwrap().to_owned();
        assert!(input.contains(r#""family":"shop""#));
    }

    #[tokio::test]
    async fn mutations_refused_when_changes_disabled() {
        let runner = ScriptedRunner::new(|_| Ok(CommandOutput::ok("{}")));
        let api = api(&runner, ChangeGate::new(false));

        assert!(api.update_service("prod", "shop", "td:6").await.is_err());
        assert!(api.register_template(&json!({"family": "shop"})).await.is_err());
        assert!(runner.calls().is_empty());
    }
}
