//! Desired-state builders for the pipeline reconciler.
//!
//! Everything in this module is a pure transformation from a Pipeline spec to the
//! objects the reconciler submits to the K8s API; the same input always produces the
//! same output.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use serde::Serialize;

use crate::config::Config;
use rill_core::crd::{Edge, EdgeLimits, InterStepBufferService, Pipeline, PipelineLimits, RequiredMetadata, Vertex, VertexLimits, VertexSpec};
use rill_core::names;

/// The port the daemon server listens on.
const DAEMON_PORT: i32 = 9090;
/// The pod container name of a daemon server.
const CONTAINER_NAME_DAEMON: &str = "daemon";
/// The pod container name of a buffer lifecycle job.
const CONTAINER_NAME_ISBSVC: &str = "isbsvc";

/// Set the canonical labels on an object controlled by Rill.
pub(crate) fn set_canonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert("app".into(), names::LABEL_APP.into());
    labels.insert(names::LABEL_CONTROLLED_BY.into(), "rill-controller".into());
}

/// Hash the serialized form of the given spec.
pub fn spec_hash<T: Serialize>(spec: &T) -> String {
    let encoded = serde_json::to_string(spec).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    encoded.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// An owner reference pointing at the given pipeline.
fn pipeline_owner_reference(pipeline: &Pipeline) -> OwnerReference {
    OwnerReference {
        api_version: Pipeline::api_version(&()).to_string(),
        kind: Pipeline::kind(&()).to_string(),
        name: pipeline.name().to_string(),
        uid: pipeline.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Merge pipeline-level limits into vertex-level limits.
///
/// Per-field precedence: vertex value, then pipeline value, then unset. Unset fields
/// fall back to runtime defaults downstream.
pub fn copy_vertex_limits(pipeline: Option<&PipelineLimits>, vertex: Option<&VertexLimits>) -> Option<VertexLimits> {
    match (pipeline, vertex) {
        (None, vertex) => vertex.cloned(),
        (Some(pipeline), vertex) => Some(VertexLimits {
            read_batch_size: vertex.and_then(|v| v.read_batch_size).or(pipeline.read_batch_size),
            read_timeout_seconds: vertex.and_then(|v| v.read_timeout_seconds).or(pipeline.read_timeout_seconds),
        }),
    }
}

/// Merge pipeline-level limits into every edge, with the same per-field precedence.
pub fn copy_edge_limits(pipeline: Option<&PipelineLimits>, edges: &[Edge]) -> Vec<Edge> {
    edges
        .iter()
        .map(|edge| {
            let limits = match (pipeline, edge.limits.as_ref()) {
                (None, limits) => limits.cloned(),
                (Some(pipeline), limits) => Some(EdgeLimits {
                    buffer_max_length: limits.and_then(|l| l.buffer_max_length).or(pipeline.buffer_max_length),
                    buffer_usage_limit: limits.and_then(|l| l.buffer_usage_limit).or(pipeline.buffer_usage_limit),
                }),
            };
            Edge {
                from: edge.from.clone(),
                to: edge.to.clone(),
                limits,
            }
        })
        .collect()
}

/// Build the desired Vertex objects of the given pipeline, keyed by object name.
pub fn build_vertices(pipeline: &Pipeline) -> HashMap<String, Vertex> {
    let mut result = HashMap::new();
    for declared in pipeline.spec.vertices.iter() {
        let object_name = names::vertex_object_name(pipeline.name(), &declared.name);
        let mut body = declared.clone();
        body.replicas = Some(declared.replicas.unwrap_or(1));
        body.limits = copy_vertex_limits(pipeline.spec.limits.as_ref(), declared.limits.as_ref());
        let spec = VertexSpec {
            pipeline_name: pipeline.name().to_string(),
            from_vertices: pipeline.edges_into(&declared.name).iter().map(|edge| edge.from.clone()).collect(),
            to_vertices: pipeline.edges_out_of(&declared.name).iter().map(|edge| edge.to.clone()).collect(),
            vertex: body,
        };
        let hash = spec_hash(&spec);

        let mut vertex = Vertex::new(&object_name, spec);
        vertex.metadata.namespace = Some(pipeline.namespace().to_string());
        let labels = vertex.meta_mut().labels.get_or_insert_with(Default::default);
        set_canonical_labels(labels);
        labels.insert(names::LABEL_PIPELINE_NAME.into(), pipeline.name().into());
        labels.insert(names::LABEL_VERTEX_NAME.into(), declared.name.clone());
        vertex
            .meta_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(names::ANNOTATION_SPEC_HASH.into(), hash);
        vertex.meta_mut().owner_references = Some(vec![pipeline_owner_reference(pipeline)]);
        result.insert(object_name, vertex);
    }
    result
}

/// Decide whether an existing Vertex must be updated to match the desired one.
///
/// True iff the prior object is absent, the finalizer sets differ, or the spec hash
/// annotation differs. Status changes never trigger an update.
pub fn needs_update(existing: Option<&Vertex>, desired: &Vertex) -> bool {
    let existing = match existing {
        Some(existing) => existing,
        None => return true,
    };
    if existing.meta().finalizers != desired.meta().finalizers {
        return true;
    }
    let existing_hash = existing.meta().annotations.as_ref().and_then(|anns| anns.get(names::ANNOTATION_SPEC_HASH));
    let desired_hash = desired.meta().annotations.as_ref().and_then(|anns| anns.get(names::ANNOTATION_SPEC_HASH));
    existing_hash != desired_hash || desired_hash.is_none()
}

/// Build the daemon Deployment of the given pipeline.
pub fn build_daemon_deployment(config: &Config, pipeline: &Pipeline) -> Deployment {
    let mut deployment = Deployment::default();
    let labels = deployment.meta_mut().labels.get_or_insert_with(Default::default);
    set_canonical_labels(labels);
    labels.insert(names::LABEL_PIPELINE_NAME.into(), pipeline.name().into());
    labels.insert("rill.rs/component".into(), "daemon".into());
    let labels = labels.clone(); // Used below.
    deployment.meta_mut().namespace = Some(pipeline.namespace().to_string());
    deployment.meta_mut().name = Some(names::daemon_deployment_name(pipeline.name()));
    deployment.meta_mut().owner_references = Some(vec![pipeline_owner_reference(pipeline)]);

    deployment.spec = Some(DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: CONTAINER_NAME_DAEMON.into(),
                    image: Some(config.image.clone()),
                    image_pull_policy: Some("IfNotPresent".into()),
                    args: Some(vec!["daemon-server".into()]),
                    ports: Some(vec![ContainerPort {
                        name: Some("metrics".into()),
                        container_port: DAEMON_PORT,
                        protocol: Some("TCP".into()),
                        ..Default::default()
                    }]),
                    env: Some(vec![
                        EnvVar {
                            name: "RUST_LOG".into(),
                            value: Some("info".into()),
                            ..Default::default()
                        },
                        EnvVar {
                            name: names::ENV_PIPELINE_NAME.into(),
                            value: Some(pipeline.name().into()),
                            ..Default::default()
                        },
                        EnvVar {
                            name: names::ENV_NAMESPACE.into(),
                            value_from: Some(EnvVarSource {
                                field_ref: Some(ObjectFieldSelector {
                                    field_path: "metadata.namespace".into(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    });

    deployment
}

/// Build the daemon ClusterIP Service of the given pipeline.
pub fn build_daemon_service(pipeline: &Pipeline) -> Service {
    let mut service = Service::default();
    let labels = service.meta_mut().labels.get_or_insert_with(Default::default);
    set_canonical_labels(labels);
    labels.insert(names::LABEL_PIPELINE_NAME.into(), pipeline.name().into());
    labels.insert("rill.rs/component".into(), "daemon".into());
    let selector = labels.clone();
    service.meta_mut().namespace = Some(pipeline.namespace().to_string());
    service.meta_mut().name = Some(names::daemon_service_name(pipeline.name()));
    service.meta_mut().owner_references = Some(vec![pipeline_owner_reference(pipeline)]);

    let spec = service.spec.get_or_insert_with(Default::default);
    spec.type_ = Some("ClusterIP".into());
    spec.selector = Some(selector);
    spec.ports = Some(vec![ServicePort {
        name: Some("metrics".into()),
        port: DAEMON_PORT,
        protocol: Some("TCP".into()),
        target_port: Some(IntOrString::Int(DAEMON_PORT)),
        ..Default::default()
    }]);

    service
}

/// Build a one-shot Job running a buffer lifecycle subcommand over all pipeline buffers.
fn build_isb_job(config: &Config, pipeline: &Pipeline, isbsvc: &InterStepBufferService, job_name: String, subcommand: &str) -> Job {
    let isbsvc_type = if isbsvc.spec.jetstream.is_some() { "jetstream" } else { "redis" };
    let buffers = pipeline.all_buffers().join(",");
    let redis = isbsvc.spec.redis.clone().unwrap_or_default();

    let env = vec![
        EnvVar {
            name: names::ENV_PIPELINE_NAME.into(),
            value: Some(pipeline.name().into()),
            ..Default::default()
        },
        EnvVar {
            name: names::ENV_ISBSVC_JETSTREAM_URL.into(),
            value: isbsvc.spec.jetstream.as_ref().map(|js| js.url.clone()),
            ..Default::default()
        },
        EnvVar {
            name: names::ENV_ISBSVC_REDIS_URL.into(),
            value: redis.url.clone(),
            ..Default::default()
        },
        EnvVar {
            name: names::ENV_ISBSVC_REDIS_SENTINEL_URL.into(),
            value: redis.sentinel_url.clone(),
            ..Default::default()
        },
        EnvVar {
            name: names::ENV_ISBSVC_SENTINEL_MASTER.into(),
            value: redis.master_name.clone(),
            ..Default::default()
        },
        EnvVar {
            name: names::ENV_ISBSVC_REDIS_USER.into(),
            value: redis.user.clone(),
            ..Default::default()
        },
        EnvVar {
            name: names::ENV_ISBSVC_REDIS_PASSWORD.into(),
            ..Default::default()
        },
        EnvVar {
            name: names::ENV_ISBSVC_REDIS_SENTINEL_PASSWORD.into(),
            ..Default::default()
        },
    ];

    let mut job = Job::default();
    let labels = job.meta_mut().labels.get_or_insert_with(Default::default);
    set_canonical_labels(labels);
    labels.insert(names::LABEL_PIPELINE_NAME.into(), pipeline.name().into());
    job.meta_mut().namespace = Some(pipeline.namespace().to_string());
    job.meta_mut().name = Some(job_name);

    job.spec = Some(JobSpec {
        backoff_limit: Some(20),
        ttl_seconds_after_finished: Some(1800),
        template: PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                restart_policy: Some("OnFailure".into()),
                containers: vec![Container {
                    name: CONTAINER_NAME_ISBSVC.into(),
                    image: Some(config.image.clone()),
                    image_pull_policy: Some("IfNotPresent".into()),
                    args: Some(vec![subcommand.into(), format!("--isbsvc-type={}", isbsvc_type), format!("--buffers={}", buffers)]),
                    env: Some(env),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    });

    job
}

/// Build the buffer-create Job of the given pipeline, owned by the Pipeline.
///
/// Edge limits are merged before provisioning; the largest merged buffer length wins
/// so no buffer ends up under-provisioned.
pub fn build_buffer_create_job(config: &Config, pipeline: &Pipeline, isbsvc: &InterStepBufferService) -> Job {
    let name = names::buffer_create_job_name(pipeline.name(), &spec_hash(&pipeline.spec));
    let mut job = build_isb_job(config, pipeline, isbsvc, name, "isbsvc-buffer-create");
    let edges = copy_edge_limits(pipeline.spec.limits.as_ref(), &pipeline.spec.edges);
    let max_length = edges
        .iter()
        .filter_map(|edge| edge.limits.as_ref().and_then(|limits| limits.buffer_max_length))
        .max();
    if let Some(max_length) = max_length {
        if let Some(args) = job
            .spec
            .as_mut()
            .and_then(|spec| spec.template.spec.as_mut())
            .and_then(|pod| pod.containers.first_mut())
            .and_then(|container| container.args.as_mut())
        {
            args.push(format!("--buffer-max-length={}", max_length));
        }
    }
    job.meta_mut().owner_references = Some(vec![pipeline_owner_reference(pipeline)]);
    job
}

/// Build the buffer-cleanup Job of a pipeline under deletion, if one is needed.
///
/// Cleanup only makes sense while the ISBSvc is present and healthy; without it
/// there is no broker to delete buffers from, and cleanup is a no-op. The Job carries
/// no ownerReferences: K8s garbage collection must not reap it when the Pipeline
/// object disappears.
pub fn cleanup_job_for(config: &Config, pipeline: &Pipeline, isbsvc: Option<&InterStepBufferService>) -> Option<Job> {
    let isbsvc = isbsvc.filter(|isbsvc| isbsvc.is_healthy())?;
    let name = names::buffer_cleanup_job_name(pipeline.name(), &spec_hash(&pipeline.spec));
    Some(build_isb_job(config, pipeline, isbsvc, name, "isbsvc-buffer-delete"))
}
