//! Configuration parameter stores.
//!
//! The config store is the single source of truth for which image an
//! environment should run. Keys follow `/<project>/<environment>/<name>`.
//! The parameter store backend is used in production; an in-memory
//! implementation is provided for testing.

mod memory;
mod ssm;

pub use memory::MemoryConfigStore;
pub use ssm::SsmConfigStore;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ControlResult;

/// Parameter holding the deployed image tag.
pub const IMAGE_TAG_PARAM: &str = "image_tag";

/// Parameter holding the image repository name.
pub const REPOSITORY_PARAM: &str = "ecr_repo_name";

/// Hierarchical parameter name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterKey(String);

impl ParameterKey {
    /// Build `/<project>/<environment>/<name>`.
    #[must_use]
    pub fn new(project: &str, environment: &str, name: &str) -> Self {
        Self(format!("/{project}/{environment}/{name}"))
    }

    /// Key of the image tag for an environment.
    #[must_use]
    pub fn image_tag(project: &str, environment: &str) -> Self {
        Self::new(project, environment, IMAGE_TAG_PARAM)
    }

    /// Key of the repository name for an environment.
    #[must_use]
    pub fn repository(project: &str, environment: &str) -> Self {
        Self::new(project, environment, REPOSITORY_PARAM)
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A parameter as read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Full key.
    pub key: ParameterKey,
    /// Stored value.
    pub value: String,
    /// Store-assigned version, when the backend tracks one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// When the value was last written, when the backend reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// When this copy was read.
    pub read_at: DateTime<Utc>,
}

/// Backend for configuration parameters.
///
/// `put` overwrites. Writes to a single key are atomic; there is no
/// cross-key transaction, so callers order their writes.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read a parameter.
    ///
    /// Returns `None` if the parameter does not exist.
    async fn get(&self, key: &ParameterKey) -> ControlResult<Option<Parameter>>;

    /// Write a parameter, replacing any existing value.
    async fn put(&self, key: &ParameterKey, value: &str) -> ControlResult<()>;
}
