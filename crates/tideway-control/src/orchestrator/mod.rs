//! Container service control plane.
//!
//! A service runs tasks from a versioned task template. Rolling a new image
//! means registering a template revision that points at it and forcing the
//! service onto that revision.

mod ecs;

pub use ecs::EcsApi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ControlError, ControlResult};

/// Template fields accepted when registering a revision.
const REGISTRABLE_FIELDS: &[&str] = &[
    "family",
    "containerDefinitions",
    "networkMode",
    "volumes",
    "taskRoleArn",
    "executionRoleArn",
    "cpu",
    "memory",
    "requiresCompatibilities",
    "runtimePlatform",
    "placementConstraints",
];

/// Container fields the provider reports but rejects on registration.
const RUNTIME_CONTAINER_FIELDS: &[&str] =
    &["containerArn", "taskArn", "networkInterfaces", "runtimeId"];

/// One rollout tracked by a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDeployment {
    /// `PRIMARY` or `ACTIVE`.
    pub status: String,
    /// Template revision the rollout runs.
    pub task_definition: String,
    /// Provider rollout state, when reported.
    pub rollout_state: Option<String>,
    /// Running tasks.
    pub running_count: i64,
    /// Desired tasks.
    pub desired_count: i64,
}

/// Current state of a container service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    /// Template revision the service is set to.
    pub task_definition: String,
    /// Desired tasks.
    pub desired_count: i64,
    /// Running tasks.
    pub running_count: i64,
    /// Active rollouts.
    pub deployments: Vec<ServiceDeployment>,
}

impl ServiceState {
    /// Whether a single rollout of `task_definition` has all tasks running.
    #[must_use]
    pub fn is_stable_on(&self, task_definition: &str) -> bool {
        match self.deployments.as_slice() {
            [only] => {
                only.task_definition == task_definition
                    && only.running_count == only.desired_count
            }
            _ => false,
        }
    }

    /// Whether the provider gave up on the rollout of `task_definition`.
    #[must_use]
    pub fn rollout_failed(&self, task_definition: &str) -> bool {
        self.deployments.iter().any(|d| {
            d.task_definition == task_definition && d.rollout_state.as_deref() == Some("FAILED")
        })
    }
}

/// A registered task template revision.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTemplate {
    /// Revision identifier.
    pub arn: String,
    /// Full template body as reported by the provider.
    pub body: Value,
}

impl TaskTemplate {
    /// Image of the first container.
    #[must_use]
    pub fn primary_image(&self) -> Option<&str> {
        self.body
            .get("containerDefinitions")?
            .as_array()?
            .first()?
            .get("image")?
            .as_str()
    }

    /// Build a registrable body identical to this template except that the
    /// first container runs `image`.
    pub fn revise(&self, image: &str) -> ControlResult<Value> {
        let source = self.body.as_object().ok_or_else(|| {
            ControlError::permanent("revise template", &self.arn, "template is not an object")
        })?;

        let mut revised: Map<String, Value> = source
            .iter()
            .filter(|(key, value)| REGISTRABLE_FIELDS.contains(&key.as_str()) && !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let containers = revised
            .get_mut("containerDefinitions")
            .and_then(Value::as_array_mut)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                ControlError::permanent("revise template", &self.arn, "template has no containers")
            })?;

        for container in containers.iter_mut() {
            if let Some(fields) = container.as_object_mut() {
                for field in RUNTIME_CONTAINER_FIELDS {
                    fields.remove(*field);
                }
            }
        }

        if let Some(first) = containers.first_mut().and_then(Value::as_object_mut) {
            first.insert("image".to_owned(), Value::String(image.to_owned()));
        }

        Ok(Value::Object(revised))
    }
}

/// Container service API.
#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    /// Describe a service.
    async fn describe_service(&self, cluster: &str, service: &str) -> ControlResult<ServiceState>;

    /// Fetch a template revision.
    async fn describe_template(&self, arn: &str) -> ControlResult<TaskTemplate>;

    /// Register a new revision; returns its identifier.
    async fn register_template(&self, body: &Value) -> ControlResult<String>;

    /// Point the service at a revision and force a new rollout.
    async fn update_service(
        &self,
        cluster: &str,
        service: &str,
        task_definition: &str,
    ) -> ControlResult<()>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn template() -> TaskTemplate {
        TaskTemplate {
            arn: "arn:aws:ecs:us-east-1:1:task-definition/shop:4".into(),
            body: json!({
                "taskDefinitionArn": "arn:aws:ecs:us-east-1:1:task-definition/shop:4",
                "family": "shop",
                "revision": 4,
                "status": "ACTIVE",
                "networkMode": "awsvpc",
                "cpu": "256",
                "memory": "512",
                "taskRoleArn": null,
                "requiresCompatibilities": ["FARGATE"],
                "registeredAt": "2024-01-01T00:00:00Z",
                "containerDefinitions": [
                    {"name": "app", "image": "repo/shop:old", "containerArn": "arn:c", "runtimeId": "r1"},
                    {"name": "sidecar", "image": "repo/proxy:1", "networkInterfaces": []}
                ]
            }),
        }
    }

    #[test]
    fn primary_image_is_first_container() {
        assert_eq!(template().primary_image(), Some("repo/shop:old"));
    }

    #[test]
    fn revise_keeps_registrable_fields_only() {
        let revised = template().revise("repo/shop:new").unwrap();
        let fields = revised.as_object().unwrap();

        assert!(fields.contains_key("family"));
        assert!(fields.contains_key("cpu"));
        assert!(!fields.contains_key("taskDefinitionArn"));
        assert!(!fields.contains_key("revision"));
        assert!(!fields.contains_key("registeredAt"));
        assert!(!fields.contains_key("taskRoleArn"));

        let containers = revised["containerDefinitions"].as_array().unwrap();
        assert_eq!(containers[0]["image"], "repo/shop:new");
        assert_eq!(containers[1]["image"], "repo/proxy:1");
        assert!(containers[0].get("containerArn").is_none());
        assert!(containers[0].get("runtimeId").is_none());
        assert!(containers[1].get("networkInterfaces").is_none());
    }

    #[test]
    fn revise_without_containers_is_permanent() {
        let empty = TaskTemplate {
            arn: "arn:td".into(),
            body: json!({"family": "shop", "containerDefinitions": []}),
        };
        assert!(!empty.revise("img").unwrap_err().is_retryable());
    }

    #[test]
    fn stability() {
        let mut state = ServiceState {
            task_definition: "td:5".into(),
            desired_count: 2,
            running_count: 2,
            deployments: vec![ServiceDeployment {
                status: "PRIMARY".into(),
                task_definition: "td:5".into(),
                rollout_state: Some("COMPLETED".into()),
                running_count: 2,
                desired_count: 2,
            }],
        };
        assert!(state.is_stable_on("td:5"));
        assert!(!state.is_stable_on("td:4"));

        state.deployments[0].rollout_state = Some("FAILED".into());
        assert!(state.rollout_failed("td:5"));
    }
}
