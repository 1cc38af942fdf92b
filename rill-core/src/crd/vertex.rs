//! Vertex CRD.
//!
//! Vertices are derived resources: the pipeline controller materialises one per
//! declared pipeline vertex, and each backs a set of processor pods.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::pipeline::AbstractVertex;
use crate::names;

pub type Vertex = VertexCRD; // Mostly to resolve a Rust Analyzer issue.

/// The processor role of a vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexType {
    Source,
    Udf,
    Sink,
}

impl std::fmt::Display for VertexType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Udf => write!(f, "udf"),
            Self::Sink => write!(f, "sink"),
        }
    }
}

/// CRD spec for the Vertex resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "VertexCRD",
    status = "VertexStatus",
    group = "rill.rs",
    version = "v1alpha1",
    kind = "Vertex",
    namespaced,
    derive = "PartialEq",
    shortname = "vtx",
    printcolumn = r#"{"name":"Pipeline","type":"string","jsonPath":".spec.pipelineName"}"#,
    printcolumn = r#"{"name":"Replicas","type":"number","jsonPath":".spec.replicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VertexSpec {
    /// The name of the owning pipeline.
    pub pipeline_name: String,
    /// The names of upstream vertices feeding this vertex.
    #[serde(default)]
    pub from_vertices: Vec<String>,
    /// The names of downstream vertices fed by this vertex.
    #[serde(default)]
    pub to_vertices: Vec<String>,
    /// The declared vertex body, with merged limits and resolved replicas.
    #[serde(flatten)]
    pub vertex: AbstractVertex,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct VertexStatus {}

impl VertexSpec {
    /// The processor role of this vertex, if exactly one is declared.
    pub fn vertex_type(&self) -> Option<VertexType> {
        match (&self.vertex.source, &self.vertex.udf, &self.vertex.sink) {
            (Some(_), None, None) => Some(VertexType::Source),
            (None, Some(_), None) => Some(VertexType::Udf),
            (None, None, Some(_)) => Some(VertexType::Sink),
            _ => None,
        }
    }

    /// The names of the buffers this vertex reads from.
    pub fn from_buffers(&self) -> Vec<String> {
        self.from_vertices
            .iter()
            .map(|from| names::buffer_name(&self.pipeline_name, from, &self.vertex.name))
            .collect()
    }

    /// The names of the buffers this vertex writes to.
    pub fn to_buffers(&self) -> Vec<String> {
        self.to_vertices
            .iter()
            .map(|to| names::buffer_name(&self.pipeline_name, &self.vertex.name, to))
            .collect()
    }
}

impl VertexCRD {
    /// The number of replicas to run, defaulting to one.
    pub fn replicas(&self) -> i32 {
        self.spec.vertex.replicas.unwrap_or(1).max(0)
    }

    /// The object name expected for this vertex, `<pipeline>-<vertex>`.
    pub fn expected_object_name(&self) -> String {
        names::vertex_object_name(&self.spec.pipeline_name, &self.spec.vertex.name)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::RequiredMetadata;

    fn vertex_spec() -> VertexSpec {
        VertexSpec {
            pipeline_name: "test-pl".into(),
            from_vertices: vec!["input".into()],
            to_vertices: vec!["output".into()],
            vertex: AbstractVertex {
                name: "cat".into(),
                udf: Some(Default::default()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn buffer_names_are_derived_from_neighbours() {
        let spec = vertex_spec();
        assert_eq!(spec.from_buffers(), vec!["test-pl.input-cat".to_string()]);
        assert_eq!(spec.to_buffers(), vec!["test-pl.cat-output".to_string()]);
        assert_eq!(spec.vertex_type(), Some(VertexType::Udf));
    }

    #[test]
    fn vertex_round_trips_through_json() {
        let vertex = Vertex::new("test-pl-cat", vertex_spec());
        let encoded = serde_json::to_string(&vertex).expect("error encoding vertex");
        let decoded: Vertex = serde_json::from_str(&encoded).expect("error decoding vertex");
        assert_eq!(vertex.spec, decoded.spec);
        assert_eq!(RequiredMetadata::name(&decoded), "test-pl-cat");
    }
}
