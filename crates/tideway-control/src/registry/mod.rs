//! Container image registry.
//!
//! Resolves fully qualified image references and publishes locally built
//! images under a tag.

mod ecr;

pub use ecr::EcrRegistry;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

/// Fully qualified image reference: `<registry>/<repository>:<tag>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    /// Registry host.
    pub registry: String,
    /// Repository within the registry.
    pub repository: String,
    /// Tag.
    pub tag: String,
}

impl ImageReference {
    /// Create a reference.
    #[must_use]
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

/// Check a tag against the registry tag grammar.
///
/// Tags are 1 to 128 characters of `[A-Za-z0-9_.-]` and may not start
/// with `.` or `-`.
pub fn validate_tag(tag: &str) -> ControlResult<()> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        && !tag.starts_with(['.', '-']);
    if valid {
        Ok(())
    } else {
        Err(ControlError::Config(format!("invalid image tag: {tag:?}")))
    }
}

/// Check a repository name against the registry naming rules.
///
/// Names are 2 to 256 characters of slash-separated components, each made
/// of lowercase alphanumerics joined by single `.`, `_` or `-`.
pub fn validate_repository(name: &str) -> ControlResult<()> {
    let component_ok = |component: &str| {
        !component.is_empty()
            && component
                .split(['.', '_', '-'])
                .all(|part| {
                    !part.is_empty()
                        && part
                            .chars()
                            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                })
    };
    let valid = (2..=256).contains(&name.len()) && name.split('/').all(component_ok);
    if valid {
        Ok(())
    } else if name.trim().is_empty() {
        Err(ControlError::missing("deploy", "image repository"))
    } else {
        Err(ControlError::Config(format!("invalid image repository: {name:?}")))
    }
}

/// Build a unique tag from a timestamp and a commit SHA: `YYYYmmddHHMM<sha7>`.
#[must_use]
pub fn timestamped_tag(at: DateTime<Utc>, commit_sha: &str) -> String {
    let short: String = commit_sha.chars().take(7).collect();
    format!("{}{short}", at.format("%Y%m%d%H%M"))
}

/// An image registry.
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Registry host images are addressed under.
    async fn registry_host(&self) -> ControlResult<String>;

    /// Fully qualified reference for `repository:tag`. Does not check that
    /// the image exists.
    async fn reference(&self, repository: &str, tag: &str) -> ControlResult<ImageReference> {
        validate_repository(repository)?;
        validate_tag(tag)?;
        Ok(ImageReference::new(self.registry_host().await?, repository, tag))
    }

    /// Tag a local image and push it.
    ///
    /// Pushing an existing tag to an immutable repository is a permanent
    /// error.
    async fn push(
        &self,
        repository: &str,
        tag: &str,
        local_image: &str,
    ) -> ControlResult<ImageReference>;
}
