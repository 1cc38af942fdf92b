//! InterStepBufferService CRD.
//!
//! The pipeline controller reads this object to decide whether a pipeline's broker is
//! ready, and to resolve broker connection details for lifecycle jobs and processors.
//! It never writes it; the ISBSvc has its own reconciler.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{set_condition, StatusCondition, CONDITION_CONFIGURED, CONDITION_DEPLOYED};

pub type InterStepBufferService = InterStepBufferServiceCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the InterStepBufferService resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "InterStepBufferServiceCRD",
    status = "IsbSvcStatus",
    group = "rill.rs",
    version = "v1alpha1",
    kind = "InterStepBufferService",
    namespaced,
    derive = "PartialEq",
    shortname = "isbsvc",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IsbSvcSpec {
    /// A JetStream-backed buffer service.
    #[serde(default)]
    pub jetstream: Option<JetStreamBufferService>,
    /// A Redis-backed buffer service.
    #[serde(default)]
    pub redis: Option<RedisBufferService>,
}

/// JetStream connection config.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JetStreamBufferService {
    /// The URL of the NATS cluster.
    pub url: String,
    /// The JetStream server version to deploy.
    #[serde(default)]
    pub version: Option<String>,
}

/// Redis connection config.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RedisBufferService {
    /// The URL of the Redis server.
    #[serde(default)]
    pub url: Option<String>,
    /// The URL of the Redis Sentinel.
    #[serde(default)]
    pub sentinel_url: Option<String>,
    /// The Sentinel master name.
    #[serde(default)]
    pub master_name: Option<String>,
    /// The Redis user.
    #[serde(default)]
    pub user: Option<String>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IsbSvcStatus {
    /// The current lifecycle phase of the service.
    #[serde(default)]
    pub phase: Option<String>,
    /// Status conditions of the service.
    #[serde(default)]
    pub conditions: Vec<StatusCondition>,
}

impl IsbSvcStatus {
    /// Mark the service configuration as accepted.
    pub fn mark_configured(&mut self) {
        set_condition(&mut self.conditions, StatusCondition::new(CONDITION_CONFIGURED, true, None));
    }

    /// Mark the service sub-resources as deployed.
    pub fn mark_deployed(&mut self) {
        set_condition(&mut self.conditions, StatusCondition::new(CONDITION_DEPLOYED, true, None));
    }

    /// Check if the service is both configured and deployed.
    pub fn is_healthy(&self) -> bool {
        let configured = self.conditions.iter().any(|c| c.r#type == CONDITION_CONFIGURED && c.is_true());
        let deployed = self.conditions.iter().any(|c| c.r#type == CONDITION_DEPLOYED && c.is_true());
        configured && deployed
    }
}

impl InterStepBufferServiceCRD {
    /// Check if this service reports itself configured and deployed.
    pub fn is_healthy(&self) -> bool {
        self.status.as_ref().map(IsbSvcStatus::is_healthy).unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn healthy_requires_configured_and_deployed() {
        let mut status = IsbSvcStatus::default();
        assert!(!status.is_healthy());
        status.mark_configured();
        assert!(!status.is_healthy());
        status.mark_deployed();
        assert!(status.is_healthy());
        // Marking twice must not duplicate conditions.
        status.mark_deployed();
        assert_eq!(status.conditions.len(), 2);
    }
}
