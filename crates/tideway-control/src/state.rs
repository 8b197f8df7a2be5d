//! Typestate pattern for the deployment lifecycle.
//!
//! Deployment states are encoded in the type system, so an out-of-order
//! transition (verifying before executing, say) does not compile. Every
//! transition also appends the new state to [`DeploymentData::states`],
//! which becomes the state trail of the final report.
//!
//! # Example
//!
//! ```ignore
//! let pending = Deployment::<Pending>::create(data);
//! let mut executing = pending.config_written().start_executing();
//! executing.record_retry();
//! let verifying = executing.executed().start_verifying();
//! let done = verifying.succeed();
//! // done.start_executing() would not compile - invalid transition
//! ```

use std::marker::PhantomData;

use crate::types::{DeployState, DeploymentData, DeploymentId};

// =============================================================================
// State marker types (zero-sized)
// =============================================================================

/// Marker trait for deployment states.
pub trait DeploymentState: private::Sealed + Send + Sync {
    /// Get the observable state.
    fn observable() -> DeployState;
}

mod private {
    pub trait Sealed {}
}

/// Request accepted, nothing written yet.
#[derive(Debug, Clone, Copy)]
pub struct Pending;

/// Tag and repository recorded in the config store.
#[derive(Debug, Clone, Copy)]
pub struct ConfigWritten;

/// Strategy executor running (possibly on a retry).
#[derive(Debug, Clone, Copy)]
pub struct Executing;

/// Executor finished successfully.
#[derive(Debug, Clone, Copy)]
pub struct Executed;

/// Health verification in progress.
#[derive(Debug, Clone, Copy)]
pub struct Verifying;

/// Deployed and verified.
#[derive(Debug, Clone, Copy)]
pub struct Succeeded;

/// Deployed but not verified healthy.
#[derive(Debug, Clone, Copy)]
pub struct DeployedUnhealthy;

/// Deployment failed.
#[derive(Debug, Clone, Copy)]
pub struct Failed;

impl private::Sealed for Pending {}
impl private::Sealed for ConfigWritten {}
impl private::Sealed for Executing {}
impl private::Sealed for Executed {}
impl private::Sealed for Verifying {}
impl private::Sealed for Succeeded {}
impl private::Sealed for DeployedUnhealthy {}
impl private::Sealed for Failed {}

macro_rules! observable_state {
    ($($marker:ident => $state:ident),* $(,)?) => {
        $(
            impl DeploymentState for $marker {
                fn observable() -> DeployState {
                    DeployState::$state
                }
            }
        )*
    };
}

observable_state! {
    Pending => Pending,
    ConfigWritten => ConfigWritten,
    Executing => Executing,
    Executed => Executed,
    Verifying => Verifying,
    Succeeded => Succeeded,
    DeployedUnhealthy => DeployedUnhealthy,
    Failed => Failed,
}

// =============================================================================
// Deployment struct parameterised by state
// =============================================================================

/// A deployment in a specific state.
///
/// The state parameter `S` determines which transitions are available.
#[derive(Debug)]
pub struct Deployment<S: DeploymentState> {
    data: DeploymentData,
    _state: PhantomData<S>,
}

impl<S: DeploymentState> Deployment<S> {
    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        &self.data
    }

    /// Get the deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.data.id
    }

    /// Get the current observable state.
    #[must_use]
    pub fn state(&self) -> DeployState {
        S::observable()
    }

    /// Convert into the underlying data (consuming the deployment).
    #[must_use]
    pub fn into_data(self) -> DeploymentData {
        self.data
    }

    fn transition<T: DeploymentState>(self) -> Deployment<T> {
        self.transition_with(|_| {})
    }

    fn transition_with<T: DeploymentState>(
        mut self,
        f: impl FnOnce(&mut DeploymentData),
    ) -> Deployment<T> {
        f(&mut self.data);
        self.data.states.push(T::observable());
        self.data.updated_at = chrono::Utc::now();
        Deployment {
            data: self.data,
            _state: PhantomData,
        }
    }
}

// =============================================================================
// State transitions
// =============================================================================

impl Deployment<Pending> {
    /// Create a new deployment in the pending state.
    #[must_use]
    pub const fn create(data: DeploymentData) -> Self {
        Self {
            data,
            _state: PhantomData,
        }
    }

    /// Record that the config store now holds the requested tag.
    #[must_use]
    pub fn config_written(self) -> Deployment<ConfigWritten> {
        self.transition()
    }
}

impl Deployment<ConfigWritten> {
    /// Hand over to the strategy executor.
    #[must_use]
    pub fn start_executing(self) -> Deployment<Executing> {
        self.transition_with(|data| data.attempts = 1)
    }
}

impl Deployment<Executing> {
    /// Record a transient failure followed by another attempt.
    ///
    /// The deployment stays in [`Executing`]; the trail shows the retry.
    pub fn record_retry(&mut self) {
        self.data.states.push(DeployState::ExecutingRetry);
        self.data.attempts += 1;
        self.data.updated_at = chrono::Utc::now();
    }

    /// Number of executor attempts so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.data.attempts
    }

    /// The executor finished successfully.
    #[must_use]
    pub fn executed(self) -> Deployment<Executed> {
        self.transition()
    }

    /// The executor failed and retries are exhausted or not allowed.
    #[must_use]
    pub fn fail(self, error: String) -> Deployment<Failed> {
        self.transition_with(|data| data.error = Some(error))
    }
}

impl Deployment<Executed> {
    /// Start post-deployment verification.
    #[must_use]
    pub fn start_verifying(self) -> Deployment<Verifying> {
        self.transition()
    }
}

impl Deployment<Verifying> {
    /// Verification passed.
    #[must_use]
    pub fn succeed(self) -> Deployment<Succeeded> {
        self.transition()
    }

    /// Verification failed after a successful execution.
    #[must_use]
    pub fn unhealthy(self, reason: String) -> Deployment<DeployedUnhealthy> {
        self.transition_with(|data| data.error = Some(reason))
    }
}

// =============================================================================
// Terminal deployments
// =============================================================================

/// A deployment that reached a terminal state.
#[derive(Debug)]
pub enum FinishedDeployment {
    /// Deployed and verified.
    Succeeded(Deployment<Succeeded>),
    /// Deployed but not verified healthy.
    DeployedUnhealthy(Deployment<DeployedUnhealthy>),
    /// Deployment failed.
    Failed(Deployment<Failed>),
}

impl FinishedDeployment {
    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        match self {
            Self::Succeeded(d) => d.data(),
            Self::DeployedUnhealthy(d) => d.data(),
            Self::Failed(d) => d.data(),
        }
    }

    /// Get the terminal state.
    #[must_use]
    pub const fn state(&self) -> DeployState {
        match self {
            Self::Succeeded(_) => DeployState::Succeeded,
            Self::DeployedUnhealthy(_) => DeployState::DeployedUnhealthy,
            Self::Failed(_) => DeployState::Failed,
        }
    }

    /// Convert into the underlying data.
    #[must_use]
    pub fn into_data(self) -> DeploymentData {
        match self {
            Self::Succeeded(d) => d.into_data(),
            Self::DeployedUnhealthy(d) => d.into_data(),
            Self::Failed(d) => d.into_data(),
        }
    }
}

impl From<Deployment<Succeeded>> for FinishedDeployment {
    fn from(d: Deployment<Succeeded>) -> Self {
        Self::Succeeded(d)
    }
}

impl From<Deployment<DeployedUnhealthy>> for FinishedDeployment {
    fn from(d: Deployment<DeployedUnhealthy>) -> Self {
        Self::DeployedUnhealthy(d)
    }
}

impl From<Deployment<Failed>> for FinishedDeployment {
    fn from(d: Deployment<Failed>) -> Self {
        Self::Failed(d)
    }
}
