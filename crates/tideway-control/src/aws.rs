//! Thin wrapper over the `aws` command line client.
//!
//! Every provider call goes through [`AwsCli`], which pins region, profile
//! and JSON output, and turns failures into classified [`ControlError`]s.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::process::{CommandOutput, CommandRunner, CommandSpec};

const TRANSIENT_MARKERS: &[&str] = &[
    "throttl",
    "rate exceeded",
    "requestlimitexceeded",
    "toomanyrequests",
    "serviceunavailable",
    "internalerror",
    "internalfailure",
    "could not connect",
    "connection reset",
    "connect timeout",
    "read timeout",
    "timed out",
    "temporarily unavailable",
];

const PERMANENT_MARKERS: &[&str] = &[
    "accessdenied",
    "access denied",
    "unauthorized",
    "not authorized",
    "expiredtoken",
    "invalidclienttokenid",
    "unrecognizedclient",
    "unable to locate credentials",
    "notfound",
    "not found",
    "does not exist",
    "validationexception",
    "invalidparameter",
    "clienterror",
    "tag invalid",
    "immutable",
];

/// Classify a failed provider call from its error output.
///
/// Unknown failures are treated as transient so a flaky call gets another
/// chance within the retry budget.
#[must_use]
pub fn classify_failure(operation: &str, target: &str, stderr: &str) -> ControlError {
    let lowered = stderr.to_ascii_lowercase();
    let message = crate::process::tail(stderr, 800).to_owned();
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        ControlError::transient(operation, target, message)
    } else if PERMANENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        ControlError::permanent(operation, target, message)
    } else {
        ControlError::transient(operation, target, message)
    }
}

/// Provider CLI client bound to a region.
#[derive(Clone)]
pub struct AwsCli {
    runner: Arc<dyn CommandRunner>,
    region: String,
    profile: Option<String>,
    timeout: Duration,
}

impl AwsCli {
    /// Create a client for `region`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, region: impl Into<String>) -> Self {
        Self {
            runner,
            region: region.into(),
            profile: None,
            timeout: Duration::from_secs(60),
        }
    }

    /// Use a named credentials profile.
    #[must_use]
    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile.filter(|p| !p.trim().is_empty());
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Region calls are made in.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The runner calls go through.
    #[must_use]
    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    fn spec(&self, args: &[&str]) -> CommandSpec {
        let mut spec = CommandSpec::new("aws")
            .args(args.iter().copied())
            .args(["--region", self.region.as_str(), "--output", "json"])
            .timeout(self.timeout);
        if let Some(profile) = &self.profile {
            spec = spec.args(["--profile", profile.as_str()]);
        }
        spec
    }

    /// Run a call and return its raw output, whatever the exit code.
    pub async fn exec(&self, args: &[&str]) -> ControlResult<CommandOutput> {
        let spec = self.spec(args);
        debug!(args = ?spec.args, "aws call");
        self.runner.run(&spec).await
    }

    /// Run a call and return stdout, classifying a non-zero exit.
    pub async fn run(&self, operation: &str, target: &str, args: &[&str]) -> ControlResult<String> {
        let output = self.exec(args).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify_failure(operation, target, &output.stderr))
        }
    }

    /// Run a call and parse its JSON output.
    pub async fn json<T: DeserializeOwned>(
        &self,
        operation: &str,
        target: &str,
        args: &[&str],
    ) -> ControlResult<T> {
        let stdout = self.run(operation, target, args).await?;
        serde_json::from_str(&stdout).map_err(|e| {
            ControlError::permanent(operation, target, format!("unexpected response: {e}"))
        })
    }
}

impl std::fmt::Debug for AwsCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCli")
            .field("region", &self.region)
            .field("profile", &self.profile)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
