//! Elastic container registry backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{info, instrument};

use crate::aws::AwsCli;
use crate::config::ChangeGate;
use crate::error::{ControlError, ControlResult};
use crate::process::{CommandRunner, CommandSpec};

use super::{validate_tag, ArtifactRegistry, ImageReference};

const PUSH_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Deserialize)]
struct CallerIdentity {
    #[serde(rename = "Account")]
    account: String,
}

/// Registry addressed as `<account>.dkr.ecr.<region>.amazonaws.com`.
///
/// The account is looked up once per process.
pub struct EcrRegistry {
    aws: AwsCli,
    docker: Arc<dyn CommandRunner>,
    gate: ChangeGate,
    account: OnceCell<String>,
}

impl EcrRegistry {
    /// Create a registry client. Pushes are refused unless `gate` is open.
    #[must_use]
    pub fn new(aws: AwsCli, gate: ChangeGate) -> Self {
        let docker = aws.runner();
        Self {
            aws,
            docker,
            gate,
            account: OnceCell::new(),
        }
    }

    async fn account(&self) -> ControlResult<&str> {
        let account = self
            .account
            .get_or_try_init(|| async {
                let identity: CallerIdentity = self
                    .aws
                    .json("get caller identity", "sts", &["sts", "get-caller-identity"])
                    .await?;
                Ok::<_, ControlError>(identity.account)
            })
            .await?;
        Ok(account.as_str())
    }

    async fn docker(&self, operation: &str, target: &str, spec: CommandSpec) -> ControlResult<()> {
        let output = self.docker.run(&spec).await?;
        if output.success() {
            return Ok(());
        }

        let stderr = output.stderr_tail(800);
        let lowered = stderr.to_ascii_lowercase();
        if lowered.contains("immutable") || lowered.contains("already exists") {
            Err(ControlError::permanent(
                operation,
                target,
                format!("tag already exists in an immutable repository; push a unique tag instead ({stderr})"),
            ))
        } else if lowered.contains("denied")
            || lowered.contains("unauthorized")
            || lowered.contains("no such image")
            || lowered.contains("does not exist")
        {
            Err(ControlError::permanent(operation, target, stderr))
        } else {
            Err(ControlError::transient(operation, target, stderr))
        }
    }
}

impl std::fmt::Debug for EcrRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcrRegistry")
            .field("aws", &self.aws)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ArtifactRegistry for EcrRegistry {
    async fn registry_host(&self) -> ControlResult<String> {
        let account = self.account().await?;
        Ok(format!(
            "{account}.dkr.ecr.{}.amazonaws.com",
            self.aws.region()
        ))
    }

    #[instrument(skip(self), fields(region = %self.aws.region()))]
    async fn push(
        &self,
        repository: &str,
        tag: &str,
        local_image: &str,
    ) -> ControlResult<ImageReference> {
        validate_tag(tag)?;
        self.gate.check("push image")?;

        let image = self.reference(repository, tag).await?;
        let target = image.to_string();

        self.docker(
            "tag image",
            &target,
            CommandSpec::new("docker").args(["tag", local_image, target.as_str()]),
        )
        .await?;

        let password = self
            .aws
            .run(
                "get registry password",
                &image.registry,
                &["ecr", "get-login-password"],
            )
            .await?;

        self.docker(
            "registry login",
            &image.registry,
            CommandSpec::new("docker")
                .args([
                    "login",
                    "--username",
                    "AWS",
                    "--password-stdin",
                    image.registry.as_str(),
                ])
                .stdin(password.trim()),
        )
        .await?;

        self.docker(
            "push image",
            &target,
            CommandSpec::new("docker")
                .args(["push", target.as_str()])
                .timeout(PUSH_TIMEOUT),
        )
        .await?;

        info!(image = %image, "image pushed");
        Ok(image)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::process::{CommandOutput, ScriptedRunner};

    fn registry(runner: &ScriptedRunner, gate: ChangeGate) -> EcrRegistry {
        EcrRegistry::new(AwsCli::new(Arc::new(runner.clone()), "us-east-1"), gate)
    }

    fn happy_runner() -> ScriptedRunner {
        ScriptedRunner::new(|spec| {
            if spec.has_arg("get-caller-identity") {
                Ok(CommandOutput::ok(r#"{"Account":"123456789012","Arn":"arn"}"#))
            } else if spec.has_arg("get-login-password") {
                Ok(CommandOutput::ok("s3cret\n"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        })
    }

    #[tokio::test]
    async fn reference_uses_account_and_region() {
        let runner = happy_runner();
        let registry = registry(&runner, ChangeGate::new(false));

        let image = registry.reference("bluegreen-app", "v7").await.unwrap();
        assert_eq!(
            image.to_string(),
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/bluegreen-app:v7"
        );

        // Account lookup is cached.
        registry.reference("bluegreen-app", "v8").await.unwrap();
        assert_eq!(runner.calls_with("get-caller-identity").len(), 1);
    }

    #[tokio::test]
    async fn push_tags_logs_in_and_pushes() {
        let runner = happy_runner();
        let image = registry(&runner, ChangeGate::open())
            .push("bluegreen-app", "v7", "bluegreen-app:latest")
            .await
            .unwrap();

        let docker: Vec<_> = runner
            .calls()
            .into_iter()
            .filter(|c| c.program == "docker")
            .collect();
        assert_eq!(docker.len(), 3);
        assert_eq!(docker[0].args[0], "tag");
        assert_eq!(docker[1].args[0], "login");
        assert_eq!(docker[1].stdin.as_deref(), Some("s3cret"));
        assert_eq!(docker[2].args, vec!["push".to_owned(), image.to_string()]);
    }

    #[tokio::test]
    async fn immutable_tag_rejection_is_permanent() {
        let runner = ScriptedRunner::new(|spec| {
            if spec.has_arg("get-caller-identity") {
                Ok(CommandOutput::ok(r#"{"Account":"123456789012"}"#))
            } else if spec.has_arg("push") {
                Ok(CommandOutput::failed(
                    1,
                    "tag invalid: The image tag 'v7' already exists in the 'bluegreen-app' repository and cannot be overwritten because the repository is immutable.",
                ))
            } else {
                Ok(CommandOutput::ok(""))
            }
        });

        let err = registry(&runner, ChangeGate::open())
            .push("bluegreen-app", "v7", "bluegreen-app:latest")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("unique tag"));
    }

    #[tokio::test]
    async fn push_refused_when_changes_disabled() {
        let runner = happy_runner();
        let err = registry(&runner, ChangeGate::new(false))
            .push("bluegreen-app", "v7", "bluegreen-app:latest")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::ChangesNotAllowed { .. }));
        assert!(runner.calls().is_empty());
    }
}
