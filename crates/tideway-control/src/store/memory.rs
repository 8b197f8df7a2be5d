//! In-memory config store for testing.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ControlError, ControlResult};

use super::{ConfigStore, Parameter, ParameterKey};

/// In-memory config store for testing.
///
/// This implementation is not suitable for production use as data is lost
/// when the process exits.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    parameters: RwLock<HashMap<String, Parameter>>,
}

impl MemoryConfigStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored parameters.
    pub fn len(&self) -> ControlResult<usize> {
        Ok(self
            .parameters
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?
            .len())
    }

    /// Whether the store holds no parameters.
    pub fn is_empty(&self) -> ControlResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, key: &ParameterKey) -> ControlResult<Option<Parameter>> {
        let parameters = self
            .parameters
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(parameters.get(key.as_str()).map(|stored| Parameter {
            read_at: Utc::now(),
            ..stored.clone()
        }))
    }

    async fn put(&self, key: &ParameterKey, value: &str) -> ControlResult<()> {
        let mut parameters = self
            .parameters
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let version = parameters
            .get(key.as_str())
            .and_then(|p| p.version)
            .unwrap_or(0)
            + 1;

        let now = Utc::now();
        parameters.insert(
            key.as_str().to_owned(),
            Parameter {
                key: key.clone(),
                value: value.to_owned(),
                version: Some(version),
                last_modified: Some(now),
                read_at: now,
            },
        );

        Ok(())
    }
}
