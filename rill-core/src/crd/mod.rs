//! Rill CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/reference/kubectl/jsonpath/

mod isbsvc;
mod pipeline;
mod vertex;

use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use isbsvc::{InterStepBufferService, IsbSvcSpec, IsbSvcStatus, JetStreamBufferService, RedisBufferService};
pub use pipeline::{
    AbstractVertex, Edge, EdgeLimits, Function, GeneratorSource, LogSink, Pipeline, PipelineLimits, PipelinePhase, PipelineSpec, PipelineStatus, Sink,
    Source, Udf, VertexLimits,
};
pub use vertex::{Vertex, VertexSpec, VertexStatus, VertexType};

/// The condition type recorded once an object's configuration has been accepted.
pub const CONDITION_CONFIGURED: &str = "Configured";
/// The condition type recorded once an object's sub-resources have been deployed.
pub const CONDITION_DEPLOYED: &str = "Deployed";

/// A minimal status condition carried by Rill CRD status objects.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    /// The condition type.
    #[serde(rename = "type")]
    pub r#type: String,
    /// The condition status, `True` or `False`.
    pub status: String,
    /// An optional human readable message.
    #[serde(default)]
    pub message: Option<String>,
}

impl StatusCondition {
    /// Construct a new condition of the given type and truthiness.
    pub fn new(r#type: &str, status: bool, message: Option<String>) -> Self {
        Self {
            r#type: r#type.into(),
            status: if status { "True".into() } else { "False".into() },
            message,
        }
    }

    /// Check if this condition is `True`.
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Upsert the given condition into a conditions list, replacing any condition of the same type.
pub(crate) fn set_condition(conditions: &mut Vec<StatusCondition>, condition: StatusCondition) {
    match conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        Some(old) => *old = condition,
        None => conditions.push(condition),
    }
}

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for Pipeline {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for Vertex {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for InterStepBufferService {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}
