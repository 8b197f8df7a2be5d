//! Deployment coordination and reporting.
//!
//! The coordinator records the requested tag in the config store, runs the
//! selected strategy executor with bounded retries, and gates the result on
//! health verification.

mod coordinator;
mod report;

pub use coordinator::DeploymentCoordinator;
pub use report::{DeploymentReport, DeploymentSummary, SummaryStatus};
