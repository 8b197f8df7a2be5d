//! What a deployment run produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ErrorClass};
use crate::strategy::DeploymentStrategy;
use crate::types::{
    DeployState, DeploymentId, DeploymentOutcome, DeploymentRequest, VerificationResult,
};

/// Full record of one coordinator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentReport {
    /// Deployment identifier.
    pub id: DeploymentId,
    /// The request served.
    pub request: DeploymentRequest,
    /// Strategy that ran.
    pub strategy: DeploymentStrategy,
    /// Image rolled out.
    pub image: String,
    /// Every state entered, in order.
    pub states: Vec<DeployState>,
    /// Executor attempts made.
    pub attempts: u32,
    /// Outcome of the last executor attempt that returned one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DeploymentOutcome>,
    /// Result of the verification gate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    /// Why the deployment did not succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Class of `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state.
    pub finished_at: DateTime<Utc>,
}

impl DeploymentReport {
    /// Final state of the run.
    #[must_use]
    pub fn state(&self) -> DeployState {
        self.states.last().copied().unwrap_or(DeployState::Pending)
    }

    /// Whether the run was deployed and verified.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state() == DeployState::Succeeded
    }

    /// Condense the report for the caller.
    #[must_use]
    pub fn summary(&self) -> DeploymentSummary {
        let status = match self.state() {
            DeployState::Succeeded => SummaryStatus::Succeeded,
            DeployState::DeployedUnhealthy => SummaryStatus::DeployedUnhealthy,
            _ => SummaryStatus::Failed,
        };
        let diagnostic = match (&self.error, &self.verification) {
            (Some(error), _) => error.clone(),
            (None, Some(verification)) => verification.message.clone(),
            (None, None) => String::new(),
        };
        DeploymentSummary {
            status,
            diagnostic,
            deployment_id: Some(self.id.clone()),
            error_class: self.error_class,
        }
    }
}

/// Terminal status reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SummaryStatus {
    /// Deployed and verified.
    Succeeded,
    /// Deployed but the verification gate failed.
    DeployedUnhealthy,
    /// Ran and failed.
    Failed,
    /// Rejected before any side effect.
    NeverRan,
}

impl SummaryStatus {
    /// Process exit code for this status.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Succeeded => 0,
            Self::DeployedUnhealthy => 2,
            Self::Failed | Self::NeverRan => 1,
        }
    }
}

/// Single structured result for the external orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    /// Terminal status.
    pub status: SummaryStatus,
    /// Human-readable diagnostic.
    pub diagnostic: String,
    /// Deployment identifier, absent when the run never started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<DeploymentId>,
    /// Class of the failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
}

impl DeploymentSummary {
    /// Summary for a request rejected before anything ran.
    #[must_use]
    pub fn never_ran(error: &ControlError) -> Self {
        Self {
            status: SummaryStatus::NeverRan,
            diagnostic: error.to_string(),
            deployment_id: None,
            error_class: Some(error.class()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn report(states: Vec<DeployState>, error: Option<&str>) -> DeploymentReport {
        let now = Utc::now();
        DeploymentReport {
            id: DeploymentId::new("01HQZX"),
            request: DeploymentRequest::new("prod", "bluegreen-app", "v2", "in_place"),
            strategy: DeploymentStrategy::InPlace,
            image: "registry/bluegreen-app:v2".into(),
            states,
            attempts: 1,
            outcome: None,
            verification: None,
            error: error.map(str::to_owned),
            error_class: None,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn summary_distinguishes_unhealthy_from_failed() {
        let unhealthy = report(
            vec![DeployState::Verifying, DeployState::DeployedUnhealthy],
            Some("serving version v1, expected v2"),
        );
        assert_eq!(unhealthy.summary().status, SummaryStatus::DeployedUnhealthy);
        assert_eq!(unhealthy.summary().diagnostic, "serving version v1, expected v2");

        let failed = report(vec![DeployState::Executing, DeployState::Failed], Some("boom"));
        assert_eq!(failed.summary().status, SummaryStatus::Failed);
        assert!(!failed.succeeded());
    }

    #[test]
    fn summary_serialises_screaming_status() {
        let json = serde_json::to_value(
            report(vec![DeployState::Verifying, DeployState::Succeeded], None).summary(),
        )
        .unwrap();
        assert_eq!(json["status"], "SUCCEEDED");
        assert_eq!(json["deployment_id"], "01HQZX");
    }

    #[test]
    fn never_ran_keeps_the_configuration_class() {
        let summary = DeploymentSummary::never_ran(&ControlError::UnknownStrategy("rolling".into()));
        assert_eq!(summary.status, SummaryStatus::NeverRan);
        assert_eq!(summary.error_class, Some(ErrorClass::Configuration));
        assert_eq!(summary.status.exit_code(), 1);
        assert!(summary.diagnostic.contains("rolling"));
    }
}
