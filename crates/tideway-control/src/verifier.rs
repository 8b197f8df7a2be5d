//! Post-deployment health verification.
//!
//! The verifier probes the environment's health endpoint once and cross-checks
//! the version it reports against the config store. It never retries and
//! never returns an error: every failure mode becomes a failed
//! [`VerificationResult`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::config::VerifierConfig;
use crate::error::{ControlError, ControlResult};
use crate::store::{ConfigStore, ParameterKey};
use crate::types::VerificationResult;

/// Response header carrying the running version.
pub const VERSION_HEADER: &str = "x-app-version";

/// Config store keys the verifier reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationKeys {
    /// Key of the expected image tag.
    pub version: ParameterKey,
    /// Key of the repository name.
    pub repository: ParameterKey,
}

impl VerificationKeys {
    /// Keys for an environment of a project.
    #[must_use]
    pub fn for_environment(project: &str, environment: &str) -> Self {
        Self {
            version: ParameterKey::image_tag(project, environment),
            repository: ParameterKey::repository(project, environment),
        }
    }
}

/// What the endpoint said.
struct Probe {
    status_code: Option<u16>,
    healthy: bool,
    version: Option<String>,
    detail: String,
}

/// Checks that an environment serves the version the config store records.
pub struct HealthVerifier {
    client: Client,
    store: Arc<dyn ConfigStore>,
    require_version: bool,
}

impl HealthVerifier {
    /// Create a verifier reading expected values from `store`.
    pub fn new(store: Arc<dyn ConfigStore>, config: &VerifierConfig) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ControlError::Config(format!("http client: {e}")))?;

        Ok(Self {
            client,
            store,
            require_version: config.require_version,
        })
    }

    /// Probe `health_url` and compare against the stored values.
    #[instrument(skip_all, fields(url = %health_url))]
    pub async fn verify(&self, health_url: &str, keys: &VerificationKeys) -> VerificationResult {
        let url = health_endpoint(health_url);
        let probe = self.probe(&url).await;

        let (expected_version, version_error) = self.read(&keys.version).await;
        let (repository, _) = self.read(&keys.repository).await;

        let (passed, message) = match (&expected_version, &probe.version) {
            _ if !probe.healthy => (false, probe.detail.clone()),
            (None, _) => (
                false,
                version_error.unwrap_or_else(|| format!("{} has no value", keys.version)),
            ),
            (Some(expected), Some(observed)) if observed != expected => (
                false,
                format!("serving version {observed}, expected {expected}"),
            ),
            (Some(expected), Some(_)) => (true, format!("healthy on {expected}")),
            (Some(_), None) if self.require_version => {
                (false, "endpoint did not report a version".to_owned())
            }
            (Some(expected), None) => (
                true,
                format!("healthy; version unreported, expected {expected}"),
            ),
        };

        if passed {
            info!(%message, "verification passed");
        } else {
            warn!(%message, "verification failed");
        }

        VerificationResult {
            health_url: url,
            status_code: probe.status_code,
            healthy: probe.healthy,
            observed_version: probe.version,
            expected_version,
            repository,
            passed,
            message,
            checked_at: Utc::now(),
        }
    }

    async fn probe(&self, url: &str) -> Probe {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                return Probe {
                    status_code: None,
                    healthy: false,
                    version: None,
                    detail: format!("health request failed: {e}"),
                };
            }
        };

        let status = response.status();
        let header_version = version_from_headers(response.headers());
        let body = response.text().await.unwrap_or_default();
        let version = header_version.or_else(|| version_from_body(&body));

        Probe {
            status_code: Some(status.as_u16()),
            healthy: status.is_success(),
            version,
            detail: format!("health endpoint returned {status}"),
        }
    }

    /// Read a key, returning the value or a diagnostic.
    async fn read(&self, key: &ParameterKey) -> (Option<String>, Option<String>) {
        match self.store.get(key).await {
            Ok(parameter) => (parameter.map(|p| p.value), None),
            Err(e) => {
                warn!(%key, error = %e, "could not read config store");
                (None, Some(format!("could not read {key}: {e}")))
            }
        }
    }
}

/// `<url>/health`, unless `url` already names the health path.
#[must_use]
pub fn health_endpoint(url: &str) -> String {
    let base = url.trim_end_matches('/');
    if base.ends_with("/health") {
        base.to_owned()
    } else {
        format!("{base}/health")
    }
}

fn version_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn version_from_body(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    json.get("version")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_path_is_appended_once() {
        assert_eq!(health_endpoint("http://app.example.com"), "http://app.example.com/health");
        assert_eq!(health_endpoint("http://app.example.com/"), "http://app.example.com/health");
        assert_eq!(
            health_endpoint("http://app.example.com/health"),
            "http://app.example.com/health"
        );
    }

    #[test]
    fn body_version_is_optional() {
        assert_eq!(
            version_from_body(r#"{"status":"ok","version":"v1.4.0"}"#).as_deref(),
            Some("v1.4.0")
        );
        assert_eq!(version_from_body(r#"{"status":"ok"}"#), None);
        assert_eq!(version_from_body("OK"), None);
        assert_eq!(version_from_body(r#"{"version":"  "}"#), None);
    }

    #[test]
    fn keys_follow_parameter_layout() {
        let keys = VerificationKeys::for_environment("bluegreen", "prod");
        assert_eq!(keys.version.as_str(), "/bluegreen/prod/image_tag");
        assert_eq!(keys.repository.as_str(), "/bluegreen/prod/ecr_repo_name");
    }
}
