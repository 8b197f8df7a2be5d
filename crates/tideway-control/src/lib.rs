//! Tideway deployment coordinator
//!
//! This crate takes a built container image and a target environment,
//! rolls the image out with one of four strategies, and only declares the
//! rollout complete once an independent health check confirms the
//! environment serves the intended version.
//!
//! # Architecture
//!
//! - **Coordination**: [`DeploymentCoordinator`] records the tag in the
//!   config store, runs the strategy with bounded retries, then verifies
//! - **Strategies**: in-place container replacement over shell channels,
//!   configuration-management push, container service rollout, and
//!   blue/green pool swap behind a load balancer
//! - **Provider seams**: config store, image registry, instance locator,
//!   channel broker, orchestrator and traffic APIs are traits with
//!   CLI-backed implementations
//! - **Verification**: [`HealthVerifier`] probes `<url>/health` and compares
//!   the reported version against the config store
//!
//! # State Machine
//!
//! Deployments follow a strict state machine enforced at compile time using
//! the typestate pattern:
//!
//! ```text
//! Pending ──▶ ConfigWritten ──▶ Executing ──▶ Executed ──▶ Verifying ──▶ Succeeded
//!                                │     ▲                       │
//!                                │     │ retry                 ▼
//!                                ▼     │                DeployedUnhealthy
//!                              Failed ─┘
//! ```
//!
//! Invalid state transitions are caught at compile time, not runtime.
//!
//! # Example
//!
//! ```ignore
//! use tideway_control::{Deployment, Pending, DeploymentData, DeploymentRequest};
//!
//! let request = DeploymentRequest::new("prod", "bluegreen-app", "v1.4.0", "in_place");
//! let pending = Deployment::<Pending>::create(DeploymentData::new(request));
//!
//! let executing = pending.config_written().start_executing();
//! let succeeded = executing.executed().start_verifying().succeed();
//!
//! // This would not compile:
//! // let invalid = succeeded.start_executing(); // Error!
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod aws;
pub mod channel;
pub mod config;
pub mod deployment;
pub mod error;
pub mod executor;
pub mod locator;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod service;
pub mod state;
pub mod store;
pub mod strategy;
pub mod traffic;
pub mod types;
pub mod verifier;

// Re-export commonly used types at the crate root
pub use config::{ChangeGate, ControlConfig};
pub use deployment::{DeploymentCoordinator, DeploymentReport, DeploymentSummary, SummaryStatus};
pub use error::{ControlError, ControlResult, ErrorClass};
pub use executor::{ExecutionContext, ExecutorSet, StrategyExecutor};
pub use service::ControlService;
pub use state::{
    ConfigWritten, DeployedUnhealthy, Deployment, DeploymentState, Executed, Executing, Failed,
    FinishedDeployment, Pending, Succeeded, Verifying,
};
pub use store::{ConfigStore, MemoryConfigStore, ParameterKey};
pub use strategy::DeploymentStrategy;
pub use types::{
    DeployState, DeploymentData, DeploymentId, DeploymentOutcome, DeploymentRequest, Environment,
    ExecutionStatus, TargetHost, TargetResult, VerificationResult,
};
pub use verifier::{HealthVerifier, VerificationKeys};
