//! Redis inter-step buffer service client.
//!
//! Redis streams are created lazily by the broker on first write, so the lifecycle
//! operations here only resolve credentials and log; the data-plane reader/writer for
//! Redis plugs in at the same construction sites as JetStream.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Redis connection config, sourced from the pod environment.
#[derive(Clone, Debug, Deserialize)]
pub struct RedisConfig {
    /// The URL of the Redis server.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// The URL of the Redis Sentinel.
    #[serde(default)]
    pub redis_sentinel_url: Option<String>,
    /// The Sentinel master name.
    #[serde(default)]
    pub sentinel_master: Option<String>,
    /// The Redis user.
    #[serde(default)]
    pub redis_user: Option<String>,
    /// The Redis password.
    #[serde(default)]
    pub redis_password: Option<String>,
    /// The Sentinel password.
    #[serde(default)]
    pub redis_sentinel_password: Option<String>,
}

/// Redis buffer provisioning.
pub struct RedisLifecycle {
    config: RedisConfig,
}

impl RedisLifecycle {
    /// Resolve credentials from the environment.
    pub fn from_env() -> Result<Self> {
        let config: RedisConfig = envy::prefixed("RILL_ISBSVC_")
            .from_env()
            .context("error building Redis client config from env")?;
        Ok(Self { config })
    }

    /// Redis streams are created on first write; nothing to provision up front.
    pub fn create_buffers(&self, buffers: &[String]) -> Result<()> {
        for buffer in buffers {
            tracing::info!(buffer = %buffer, url = ?self.config.redis_url, "redis streams are created lazily by the broker, nothing to do");
        }
        Ok(())
    }

    /// Stream deletion is handled by broker-side retention; nothing to tear down.
    pub fn delete_buffers(&self, buffers: &[String]) -> Result<()> {
        for buffer in buffers {
            tracing::info!(buffer = %buffer, "redis streams expire with broker retention, nothing to do");
        }
        Ok(())
    }

    /// Lazily-created streams have no configuration to check ahead of traffic.
    pub fn validate_buffers(&self, _buffers: &[String]) -> Result<()> {
        Ok(())
    }
}
