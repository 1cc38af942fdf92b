//! Pipeline CRD.
//!
//! The code here is used to generate the actual CRD used in K8s.

use std::collections::BTreeSet;

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{set_condition, RequiredMetadata, StatusCondition, CONDITION_DEPLOYED};
use crate::names;

pub type Pipeline = PipelineCRD; // Mostly to resolve a Rust Analyzer issue.

lazy_static::lazy_static! {
    /// The regex used to validate RFC 1123 label names going into K8s.
    static ref NAME_1123_LABEL_RE: Regex = Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("error initializing NAME_1123_LABEL_RE regex");
}

/// Max length of a RFC 1123 label name allowed.
const NAME_1123_LABEL_LEN: usize = 63;
/// Error message for a RFC 1123 label name.
const NAME_1123_LABEL_MSG: &str =
    "must be a RFC 1123 label consisting of lower case alphanumeric characters or '-', and must start and end with an alphanumeric character";

/// CRD spec for the Pipeline resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "PipelineCRD",
    status = "PipelineStatus",
    group = "rill.rs",
    version = "v1alpha1",
    kind = "Pipeline",
    namespaced,
    derive = "PartialEq",
    shortname = "pl",
    printcolumn = r#"{"name":"ISB Service","type":"string","jsonPath":".spec.interStepBufferServiceName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// The vertices of this pipeline's processing graph.
    pub vertices: Vec<AbstractVertex>,
    /// The edges connecting the vertices, each backed by one inter-step buffer.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Pipeline-wide limits, inherited by vertices and edges which do not set their own.
    #[serde(default)]
    pub limits: Option<PipelineLimits>,
    /// The name of the InterStepBufferService backing this pipeline's buffers.
    ///
    /// Defaults to `default` when not set.
    #[serde(default)]
    pub inter_step_buffer_service_name: Option<String>,
}

/// The definition of a single pipeline vertex.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AbstractVertex {
    /// The name of this vertex, which is unique per pipeline.
    pub name: String,
    /// Marks this vertex as a source, with its config.
    #[serde(default)]
    pub source: Option<Source>,
    /// Marks this vertex as a user-defined function, with its config.
    #[serde(default)]
    pub udf: Option<Udf>,
    /// Marks this vertex as a sink, with its config.
    #[serde(default)]
    pub sink: Option<Sink>,
    /// The number of processor pods to run for this vertex.
    #[serde(default)]
    pub replicas: Option<i32>,
    /// Vertex-level limits, overriding pipeline-level limits field by field.
    #[serde(default)]
    pub limits: Option<VertexLimits>,
}

/// Source vertex configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// A built-in data generator source.
    #[serde(default)]
    pub generator: Option<GeneratorSource>,
}

/// A built-in source which synthesizes messages at a fixed rate.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorSource {
    /// Requests per unit of time.
    #[serde(default)]
    pub rpu: Option<u64>,
    /// The unit of time in seconds over which `rpu` messages are generated.
    #[serde(default)]
    pub duration_seconds: Option<u64>,
    /// The payload size in bytes of generated messages.
    #[serde(default)]
    pub msg_size: Option<u32>,
}

/// User-defined function vertex configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Udf {
    /// A built-in function to apply, instead of a user supplied container.
    #[serde(default)]
    pub builtin: Option<Function>,
}

/// A named built-in function with its arguments.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    /// The name of the built-in function.
    pub name: String,
    /// Arguments handed to the function.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Sink vertex configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Sink {
    /// A built-in sink which writes payloads to the pod log.
    #[serde(default)]
    pub log: Option<LogSink>,
}

/// A built-in sink which writes payloads to the pod log.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct LogSink {}

/// A directed edge between two vertices, backed by one buffer.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// The name of the upstream vertex.
    pub from: String,
    /// The name of the downstream vertex.
    pub to: String,
    /// Edge-level limits, overriding pipeline-level limits field by field.
    #[serde(default)]
    pub limits: Option<EdgeLimits>,
}

/// Pipeline-wide limits.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineLimits {
    /// The max number of messages a processor pulls per read.
    #[serde(default)]
    pub read_batch_size: Option<u64>,
    /// The max seconds a processor waits for a read batch to fill.
    #[serde(default)]
    pub read_timeout_seconds: Option<u64>,
    /// The max number of messages a buffer retains before backpressure.
    #[serde(default)]
    pub buffer_max_length: Option<u64>,
    /// The percentage of buffer capacity at which writers are throttled.
    #[serde(default)]
    pub buffer_usage_limit: Option<u32>,
}

/// Vertex-level limits.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VertexLimits {
    /// The max number of messages a processor pulls per read.
    #[serde(default)]
    pub read_batch_size: Option<u64>,
    /// The max seconds a processor waits for a read batch to fill.
    #[serde(default)]
    pub read_timeout_seconds: Option<u64>,
}

/// Edge-level limits.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EdgeLimits {
    /// The max number of messages the edge's buffer retains before backpressure.
    #[serde(default)]
    pub buffer_max_length: Option<u64>,
    /// The percentage of buffer capacity at which writers are throttled.
    #[serde(default)]
    pub buffer_usage_limit: Option<u32>,
}

/// The lifecycle phase of a Pipeline.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum PipelinePhase {
    Pending,
    Waiting,
    Deploying,
    Running,
    Deleting,
    Failed,
}

impl Default for PipelinePhase {
    fn default() -> Self {
        Self::Pending
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    /// The current lifecycle phase of the pipeline.
    #[serde(default)]
    pub phase: PipelinePhase,
    /// Status conditions of the pipeline.
    #[serde(default)]
    pub conditions: Vec<StatusCondition>,
    /// The generation of the spec most recently acted upon by the controller.
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl PipelineStatus {
    /// Mark the pipeline as waiting on its inter-step buffer service.
    pub fn mark_waiting(&mut self, message: &str) {
        self.phase = PipelinePhase::Waiting;
        set_condition(&mut self.conditions, StatusCondition::new(CONDITION_DEPLOYED, false, Some(message.into())));
    }

    /// Mark the pipeline as having its sub-resources under deployment.
    pub fn mark_deploying(&mut self) {
        self.phase = PipelinePhase::Deploying;
    }

    /// Mark the pipeline as fully deployed and running.
    pub fn mark_deployed(&mut self) {
        self.phase = PipelinePhase::Running;
        set_condition(&mut self.conditions, StatusCondition::new(CONDITION_DEPLOYED, true, None));
    }

    /// Mark the pipeline as undergoing deletion.
    pub fn mark_deleting(&mut self) {
        self.phase = PipelinePhase::Deleting;
    }

    /// Check if the `Deployed` condition is `True`.
    pub fn is_deployed(&self) -> bool {
        self.conditions.iter().any(|c| c.r#type == CONDITION_DEPLOYED && c.is_true())
    }
}

impl PipelineCRD {
    /// The name of the ISBSvc this pipeline references, defaulting when unset.
    pub fn isbsvc_name(&self) -> &str {
        self.spec.inter_step_buffer_service_name.as_deref().unwrap_or(names::DEFAULT_ISBSVC_NAME)
    }

    /// Find the declared vertex of the given name.
    pub fn find_vertex(&self, name: &str) -> Option<&AbstractVertex> {
        self.spec.vertices.iter().find(|v| v.name == name)
    }

    /// The edges pointing into the given vertex.
    pub fn edges_into(&self, vertex: &str) -> Vec<&Edge> {
        self.spec.edges.iter().filter(|e| e.to == vertex).collect()
    }

    /// The edges pointing out of the given vertex.
    pub fn edges_out_of(&self, vertex: &str) -> Vec<&Edge> {
        self.spec.edges.iter().filter(|e| e.from == vertex).collect()
    }

    /// The names of all buffers backing this pipeline's edges.
    pub fn all_buffers(&self) -> Vec<String> {
        self.spec
            .edges
            .iter()
            .map(|e| names::buffer_name(self.name(), &e.from, &e.to))
            .collect()
    }

    /// Validate this object, ensuring that it conforms to application requirements.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Validate vertex name basics, role exclusivity, and build graph nodes.
        use petgraph::{graphmap::GraphMap, Directed};
        let mut graph = GraphMap::<_, (), Directed>::new();
        let mut seen = BTreeSet::new();
        let mut sources = 0usize;
        for vertex in self.spec.vertices.iter() {
            if !NAME_1123_LABEL_RE.is_match(vertex.name.as_str()) {
                errors.push(format!("vertex '{}' of pipeline {} {}", vertex.name.as_str(), self.name(), NAME_1123_LABEL_MSG));
            }
            if vertex.name.len() > NAME_1123_LABEL_LEN {
                errors.push(format!(
                    "vertex name '{}' of pipeline {} may not exceed {} characters",
                    vertex.name.as_str(),
                    self.name(),
                    NAME_1123_LABEL_LEN,
                ));
            }
            if !seen.insert(vertex.name.as_str()) {
                errors.push(format!("vertex '{}' of pipeline {} is declared more than once", vertex.name, self.name()));
            }
            let roles = [vertex.source.is_some(), vertex.udf.is_some(), vertex.sink.is_some()];
            if roles.iter().filter(|set| **set).count() != 1 {
                errors.push(format!(
                    "vertex '{}' of pipeline {} must be exactly one of source, udf or sink",
                    vertex.name,
                    self.name()
                ));
            }
            if vertex.source.is_some() {
                sources += 1;
            }
            graph.add_node(vertex.name.as_str());
        }
        if sources != 1 {
            errors.push(format!("pipeline {} must declare exactly one source vertex, found {}", self.name(), sources));
        }

        // Validate graph edges & ensure the graph is acyclic.
        for edge in self.spec.edges.iter() {
            for endpoint in [edge.from.as_str(), edge.to.as_str()] {
                if !graph.contains_node(endpoint) {
                    errors.push(format!(
                        "edge '{}' -> '{}' of pipeline {} refers to vertex '{}' which is not declared",
                        edge.from,
                        edge.to,
                        self.name(),
                        endpoint
                    ));
                }
            }
            graph.add_edge(edge.from.as_str(), edge.to.as_str(), ());
        }
        if let Err(cycle_err) = petgraph::algo::toposort(&graph, None) {
            errors.push(format!(
                "vertex '{}' of pipeline {} creates a cycle and pipelines must be acyclic",
                cycle_err.node_id(),
                self.name()
            ));
        }

        // Sources take no inbound edges, sinks emit no outbound edges.
        for vertex in self.spec.vertices.iter() {
            if vertex.source.is_some() && !self.edges_into(&vertex.name).is_empty() {
                errors.push(format!("source vertex '{}' of pipeline {} may not have inbound edges", vertex.name, self.name()));
            }
            if vertex.sink.is_some() && !self.edges_out_of(&vertex.name).is_empty() {
                errors.push(format!("sink vertex '{}' of pipeline {} may not have outbound edges", vertex.name, self.name()));
            }
        }
        if self.spec.vertices.len() > 1 && self.spec.edges.is_empty() {
            errors.push(format!("pipeline {} declares multiple vertices but no edges", self.name()));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
