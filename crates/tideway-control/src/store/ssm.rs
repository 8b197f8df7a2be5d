//! Parameter store backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::aws::{classify_failure, AwsCli};
use crate::config::ChangeGate;
use crate::error::{ControlError, ControlResult};

use super::{ConfigStore, Parameter, ParameterKey};

#[derive(Deserialize)]
struct GetParameterResponse {
    #[serde(rename = "Parameter")]
    parameter: RawParameter,
}

#[derive(Deserialize)]
struct RawParameter {
    #[serde(rename = "Value")]
    value: String,
    #[serde(rename = "Version")]
    version: Option<i64>,
    #[serde(rename = "LastModifiedDate")]
    last_modified: Option<serde_json::Value>,
}

/// Config store backed by the provider's parameter store.
#[derive(Debug, Clone)]
pub struct SsmConfigStore {
    aws: AwsCli,
    gate: ChangeGate,
}

impl SsmConfigStore {
    /// Create a store. Writes are refused unless `gate` is open.
    #[must_use]
    pub const fn new(aws: AwsCli, gate: ChangeGate) -> Self {
        Self { aws, gate }
    }
}

/// The CLI prints timestamps either as RFC 3339 strings or as epoch seconds.
fn parse_timestamp(raw: &serde_json::Value) -> Option<DateTime<Utc>> {
    match raw {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n.as_f64().and_then(|secs| {
            #[allow(clippy::as_conversions)]
            let whole = secs.trunc() as i64;
            DateTime::from_timestamp(whole, 0)
        }),
        _ => None,
    }
}

#[async_trait]
impl ConfigStore for SsmConfigStore {
    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &ParameterKey) -> ControlResult<Option<Parameter>> {
        let output = self
            .aws
            .exec(&[
                "ssm",
                "get-parameter",
                "--name",
                key.as_str(),
                "--with-decryption",
            ])
            .await?;

        if !output.success() {
            if output.stderr.contains("ParameterNotFound") {
                debug!("parameter not found");
                return Ok(None);
            }
            return Err(classify_failure("get parameter", key.as_str(), &output.stderr));
        }

        let response: GetParameterResponse = serde_json::from_str(&output.stdout).map_err(|e| {
            ControlError::permanent("get parameter", key.as_str(), format!("unexpected response: {e}"))
        })?;

        Ok(Some(Parameter {
            key: key.clone(),
            value: response.parameter.value,
            version: response.parameter.version,
            last_modified: response
                .parameter
                .last_modified
                .as_ref()
                .and_then(parse_timestamp),
            read_at: Utc::now(),
        }))
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn put(&self, key: &ParameterKey, value: &str) -> ControlResult<()> {
        self.gate.check("put parameter")?;

        self.aws
            .run(
                "put parameter",
                key.as_str(),
                &[
                    "ssm",
                    "put-parameter",
                    "--name",
                    key.as_str(),
                    "--value",
                    value,
                    "--type",
                    "String",
                    "--overwrite",
                ],
            )
            .await?;

        info!(value = %value, "parameter written");
        Ok(())
    }
}
