//! Error types for tideway-control.
//!
//! Every failure carries an [`ErrorClass`]. The coordinator only retries
//! [`ErrorClass::Transient`] failures; everything else is terminal for the
//! current run.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad or missing input. Surfaced before any side effect.
    Configuration,
    /// Throttling, timeouts, dropped connections. Safe to retry.
    Transient,
    /// Authorisation, missing resources, unrecoverable tool failures.
    Permanent,
    /// The deployment ran but the service did not pass its checks.
    Verification,
}

impl ErrorClass {
    /// Get the class name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Verification => "verification",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur while coordinating a deployment.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Strategy name did not match any known executor.
    #[error("unknown deployment strategy: {0}")]
    UnknownStrategy(String),

    /// Environment is not configured.
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    /// A parameter the selected strategy needs is absent.
    #[error("missing required parameter `{parameter}` for {context}")]
    MissingParameter {
        /// What needed the parameter (strategy or environment).
        context: String,
        /// Parameter name.
        parameter: String,
    },

    /// Configuration could not be loaded or is malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A mutating operation was attempted while changes are disabled.
    #[error("{operation} refused: set apply_changes = true to allow infrastructure changes")]
    ChangesNotAllowed {
        /// The refused operation.
        operation: String,
    },

    /// Another deployment holds the environment.
    #[error("deployment already in progress for environment {environment}")]
    DeploymentInProgress {
        /// Environment name.
        environment: String,
    },

    /// Infrastructure failure that may succeed on retry.
    #[error("{operation} failed for {target}: {message}")]
    TransientInfra {
        /// Operation that failed.
        operation: String,
        /// Resource the operation addressed.
        target: String,
        /// Provider message.
        message: String,
    },

    /// An operation exceeded its time limit.
    #[error("{operation} timed out after {}s", limit.as_secs())]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// The limit that was exceeded.
        limit: Duration,
    },

    /// Infrastructure failure that will not succeed on retry.
    #[error("{operation} failed for {target}: {message}")]
    PermanentInfra {
        /// Operation that failed.
        operation: String,
        /// Resource the operation addressed.
        target: String,
        /// Provider message.
        message: String,
    },

    /// Discovery produced nothing to deploy to.
    #[error("no deployable targets found for environment {environment}")]
    NoTargets {
        /// Environment name.
        environment: String,
    },

    /// An external program the strategy shells out to is not installed.
    #[error("required tool not available: {tool}")]
    ToolUnavailable {
        /// Program name.
        tool: String,
    },

    /// The run was cancelled.
    #[error("cancelled during {stage}")]
    Cancelled {
        /// Stage that observed the cancellation.
        stage: String,
    },

    /// Post-deployment verification failed.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a transient infrastructure error.
    #[must_use]
    pub fn transient(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::TransientInfra {
            operation: operation.into(),
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a permanent infrastructure error.
    #[must_use]
    pub fn permanent(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::PermanentInfra {
            operation: operation.into(),
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a missing parameter error.
    #[must_use]
    pub fn missing(context: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self::MissingParameter {
            context: context.into(),
            parameter: parameter.into(),
        }
    }

    /// Create a cancellation error.
    #[must_use]
    pub fn cancelled(stage: impl Into<String>) -> Self {
        Self::Cancelled {
            stage: stage.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownStrategy(_)
            | Self::UnknownEnvironment(_)
            | Self::MissingParameter { .. }
            | Self::Config(_)
            | Self::ChangesNotAllowed { .. }
            | Self::DeploymentInProgress { .. } => ErrorClass::Configuration,
            Self::TransientInfra { .. } | Self::Timeout { .. } => ErrorClass::Transient,
            Self::PermanentInfra { .. }
            | Self::NoTargets { .. }
            | Self::ToolUnavailable { .. }
            | Self::Cancelled { .. }
            | Self::Internal(_) => ErrorClass::Permanent,
            Self::VerificationFailed(_) => ErrorClass::Verification,
        }
    }

    /// Whether the coordinator may retry after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }
}

impl From<reqwest::Error> for ControlError {
    fn from(e: reqwest::Error) -> Self {
        let target = e
            .url()
            .map_or_else(|| "unknown url".to_owned(), ToString::to_string);
        if e.is_timeout() || e.is_connect() {
            Self::transient("http request", target, e.to_string())
        } else {
            Self::permanent("http request", target, e.to_string())
        }
    }
}

impl From<figment::Error> for ControlError {
    fn from(e: figment::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("malformed provider response: {e}"))
    }
}
