//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The Kubernetes namespace this controller operates in.
    pub namespace: String,
    /// The Rill image used for spawned jobs and daemon pods.
    pub image: String,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the
    /// application config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::prefixed("RILL_").from_env().context("error building config from env")
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> Self {
        Self {
            namespace: "test-ns".into(),
            image: "test-image".into(),
        }
    }
}
