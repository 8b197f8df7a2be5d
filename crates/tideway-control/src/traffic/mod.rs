//! Load balancer, scaling group and alarm control for blue/green pools.

mod aws;

pub use aws::AwsTrafficApi;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{BlueGreenConfig, PoolConfig};
use crate::error::{ControlError, ControlResult};
use crate::registry::ImageReference;

/// Which side of the pair a pool is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolColor {
    /// Blue pool.
    Blue,
    /// Green pool.
    Green,
}

impl PoolColor {
    /// Get the color name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }

    /// The other pool.
    #[must_use]
    pub const fn other(&self) -> Self {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }
}

impl fmt::Display for PoolColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A pool together with its color.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    /// Which side this is.
    pub color: PoolColor,
    /// Resources backing the pool.
    pub config: PoolConfig,
}

impl BlueGreenConfig {
    /// The pool of the given color.
    #[must_use]
    pub fn pool(&self, color: PoolColor) -> Pool {
        let config = match color {
            PoolColor::Blue => self.blue.clone(),
            PoolColor::Green => self.green.clone(),
        };
        Pool { color, config }
    }

    /// Split into `(live, idle)` given the target group the listener
    /// forwards to.
    pub fn split_pools(&self, live_target_group: &str) -> ControlResult<(Pool, Pool)> {
        let live = if live_target_group == self.blue.target_group_arn {
            PoolColor::Blue
        } else if live_target_group == self.green.target_group_arn {
            PoolColor::Green
        } else {
            return Err(ControlError::permanent(
                "identify live pool",
                &self.listener_arn,
                format!("listener forwards to {live_target_group}, which is neither pool"),
            ));
        };
        Ok((self.pool(live), self.pool(live.other())))
    }
}

/// Instance refresh progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    /// Queued or running.
    InProgress,
    /// All instances replaced.
    Successful,
    /// Refresh failed or was cancelled.
    Failed,
}

impl RefreshStatus {
    /// Map a provider status string.
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status {
            "Successful" => Self::Successful,
            "Failed" | "Cancelled" | "Cancelling" | "RollbackSuccessful" | "RollbackFailed" => {
                Self::Failed
            }
            _ => Self::InProgress,
        }
    }
}

/// Health of the targets registered with a target group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetHealth {
    /// Targets reporting healthy.
    pub healthy: usize,
    /// All registered targets.
    pub total: usize,
}

impl TargetHealth {
    /// At least one target and all of them healthy.
    #[must_use]
    pub const fn is_fully_healthy(&self) -> bool {
        self.total > 0 && self.healthy == self.total
    }
}

/// Size of a pool's scaling group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolCapacity {
    /// Minimum instance count.
    pub min: u32,
    /// Desired instance count.
    pub desired: u32,
}

impl PoolCapacity {
    /// No instances.
    pub const EMPTY: Self = Self { min: 0, desired: 0 };

    /// Whether the pool runs no instances.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.desired == 0
    }
}

/// Traffic and pool control API.
#[async_trait]
pub trait TrafficApi: Send + Sync {
    /// Target group the listener currently forwards to.
    async fn listener_target(&self, listener: &str) -> ControlResult<String>;

    /// Forward all listener traffic to `target_group`.
    async fn shift_listener(&self, listener: &str, target_group: &str) -> ControlResult<()>;

    /// Make the pool boot `image` with `user_data`; returns the new launch
    /// template version.
    async fn update_pool_image(
        &self,
        pool: &PoolConfig,
        image: &ImageReference,
        user_data: &str,
    ) -> ControlResult<String>;

    /// Start replacing the pool's instances; returns the refresh id.
    async fn start_refresh(&self, pool: &PoolConfig, min_healthy_percentage: u8)
        -> ControlResult<String>;

    /// Progress of a refresh.
    async fn refresh_status(&self, pool: &PoolConfig, refresh_id: &str)
        -> ControlResult<RefreshStatus>;

    /// Health of a target group.
    async fn target_health(&self, target_group: &str) -> ControlResult<TargetHealth>;

    /// Whether an alarm is currently firing.
    async fn alarm_firing(&self, alarm: &str) -> ControlResult<bool>;

    /// Current size of a pool.
    async fn pool_capacity(&self, pool: &PoolConfig) -> ControlResult<PoolCapacity>;

    /// Set a pool's minimum and desired size.
    async fn scale_pool(&self, pool: &PoolConfig, capacity: PoolCapacity) -> ControlResult<()>;

    /// Scale a pool to zero.
    async fn retire_pool(&self, pool: &PoolConfig) -> ControlResult<()> {
        self.scale_pool(pool, PoolCapacity::EMPTY).await
    }
}
