use super::builder::*;
use crate::config::Config;
use rill_core::crd::{
    AbstractVertex, Edge, EdgeLimits, Function, GeneratorSource, InterStepBufferService, IsbSvcSpec, IsbSvcStatus, JetStreamBufferService, LogSink, Pipeline,
    PipelineLimits, PipelineSpec, RedisBufferService, RequiredMetadata, Sink, Source, Udf, VertexLimits,
};
use rill_core::names;

fn test_pipeline() -> Pipeline {
    let mut pipeline = Pipeline::new(
        "test-pl",
        PipelineSpec {
            vertices: vec![
                AbstractVertex {
                    name: "input".into(),
                    source: Some(Source {
                        generator: Some(GeneratorSource {
                            rpu: Some(5),
                            duration_seconds: Some(1),
                            msg_size: None,
                        }),
                    }),
                    ..Default::default()
                },
                AbstractVertex {
                    name: "cat".into(),
                    udf: Some(Udf {
                        builtin: Some(Function {
                            name: "cat".into(),
                            args: vec![],
                        }),
                    }),
                    ..Default::default()
                },
                AbstractVertex {
                    name: "output".into(),
                    sink: Some(Sink { log: Some(LogSink {}) }),
                    ..Default::default()
                },
            ],
            edges: vec![
                Edge {
                    from: "input".into(),
                    to: "cat".into(),
                    limits: None,
                },
                Edge {
                    from: "cat".into(),
                    to: "output".into(),
                    limits: None,
                },
            ],
            limits: None,
            inter_step_buffer_service_name: None,
        },
    );
    pipeline.metadata.namespace = Some("test-ns".into());
    pipeline.metadata.uid = Some("test-uid".into());
    pipeline
}

fn test_isbsvc(healthy: bool) -> InterStepBufferService {
    let mut isbsvc = InterStepBufferService::new(
        names::DEFAULT_ISBSVC_NAME,
        IsbSvcSpec {
            jetstream: Some(JetStreamBufferService {
                url: "nats://isbsvc:4222".into(),
                version: None,
            }),
            redis: Some(RedisBufferService {
                url: Some("redis://isbsvc:6379".into()),
                sentinel_url: Some("redis://sentinel:26379".into()),
                master_name: Some("mymaster".into()),
                user: Some("test-user".into()),
            }),
        },
    );
    isbsvc.metadata.namespace = Some("test-ns".into());
    if healthy {
        let mut status = IsbSvcStatus::default();
        status.mark_configured();
        status.mark_deployed();
        isbsvc.status = Some(status);
    }
    isbsvc
}

#[test]
fn build_vertices_produces_one_vertex_per_declared_vertex() {
    let pipeline = test_pipeline();
    let vertices = build_vertices(&pipeline);
    assert_eq!(vertices.len(), 3);
    for declared in pipeline.spec.vertices.iter() {
        let key = format!("{}-{}", pipeline.name(), declared.name);
        assert!(vertices.contains_key(&key), "expected key {:?} in built vertex set", key);
    }

    let cat = &vertices["test-pl-cat"];
    assert_eq!(cat.spec.pipeline_name, "test-pl");
    assert_eq!(cat.spec.vertex.replicas, Some(1));
    assert_eq!(cat.spec.from_vertices, vec!["input".to_string()]);
    assert_eq!(cat.spec.to_vertices, vec!["output".to_string()]);
    let labels = cat.metadata.labels.as_ref().expect("expected labels on built vertex");
    assert_eq!(labels.get(names::LABEL_PIPELINE_NAME).map(String::as_str), Some("test-pl"));
    let owners = cat.metadata.owner_references.as_ref().expect("expected owner references on built vertex");
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, "Pipeline");
    assert_eq!(owners[0].name, "test-pl");

    let input = &vertices["test-pl-input"];
    assert!(input.spec.from_vertices.is_empty(), "source vertex must have no inbound edges");
    let output = &vertices["test-pl-output"];
    assert!(output.spec.to_vertices.is_empty(), "sink vertex must have no outbound edges");
}

#[test]
fn build_vertices_is_deterministic() {
    let pipeline = test_pipeline();
    let a = build_vertices(&pipeline);
    let b = build_vertices(&pipeline);
    assert_eq!(a.len(), b.len());
    for (key, vertex) in a.iter() {
        let other = b.get(key).expect("expected both outputs to hold the same keys");
        let left = serde_json::to_string(vertex).expect("error encoding vertex");
        let right = serde_json::to_string(other).expect("error encoding vertex");
        assert_eq!(left, right, "two builds of vertex {:?} differ", key);
    }
}

#[test]
fn copy_vertex_limits_applies_field_precedence() {
    // No limits anywhere: merged stays unset.
    assert_eq!(copy_vertex_limits(None, None), None);

    // Pipeline limits only: both fields inherited.
    let pipeline_limits = PipelineLimits {
        read_batch_size: Some(1),
        read_timeout_seconds: Some(2),
        ..Default::default()
    };
    let merged = copy_vertex_limits(Some(&pipeline_limits), None).expect("expected merged limits");
    assert_eq!(merged.read_batch_size, Some(1));
    assert_eq!(merged.read_timeout_seconds, Some(2));

    // Vertex overrides win field by field.
    let vertex_limits = VertexLimits {
        read_batch_size: Some(2),
        read_timeout_seconds: Some(3),
    };
    let merged = copy_vertex_limits(Some(&pipeline_limits), Some(&vertex_limits)).expect("expected merged limits");
    assert_eq!(merged.read_batch_size, Some(2));
    assert_eq!(merged.read_timeout_seconds, Some(3));

    // A partial vertex override only masks its own field.
    let vertex_limits = VertexLimits {
        read_batch_size: None,
        read_timeout_seconds: Some(3),
    };
    let merged = copy_vertex_limits(Some(&pipeline_limits), Some(&vertex_limits)).expect("expected merged limits");
    assert_eq!(merged.read_batch_size, Some(1));
    assert_eq!(merged.read_timeout_seconds, Some(3));
}

#[test]
fn copy_edge_limits_applies_field_precedence() {
    let edges = vec![Edge {
        from: "in".into(),
        to: "out".into(),
        limits: None,
    }];

    let result = copy_edge_limits(None, &edges);
    assert!(result[0].limits.is_none());

    let pipeline_limits = PipelineLimits {
        buffer_max_length: Some(1000),
        buffer_usage_limit: Some(80),
        ..Default::default()
    };
    let result = copy_edge_limits(Some(&pipeline_limits), &edges);
    let limits = result[0].limits.as_ref().expect("expected merged edge limits");
    assert_eq!(limits.buffer_max_length, Some(1000));
    assert_eq!(limits.buffer_usage_limit, Some(80));

    let edges = vec![Edge {
        from: "in".into(),
        to: "out".into(),
        limits: Some(EdgeLimits {
            buffer_max_length: Some(2000),
            buffer_usage_limit: None,
        }),
    }];
    let result = copy_edge_limits(Some(&pipeline_limits), &edges);
    let limits = result[0].limits.as_ref().expect("expected merged edge limits");
    assert_eq!(limits.buffer_max_length, Some(2000));
    assert_eq!(limits.buffer_usage_limit, Some(80));
}

#[test]
fn needs_update_detects_absence_spec_and_finalizer_changes() {
    let pipeline = test_pipeline();
    let vertices = build_vertices(&pipeline);
    let vertex = &vertices["test-pl-cat"];

    assert!(needs_update(None, vertex), "a missing prior object always needs an update");
    assert!(!needs_update(Some(vertex), &vertex.clone()), "an identical object must not trigger an update");

    let mut with_finalizer = vertex.clone();
    with_finalizer.metadata.finalizers = Some(vec!["rill.rs/testing".into()]);
    assert!(needs_update(Some(vertex), &with_finalizer), "a changed finalizer set must trigger an update");

    let mut changed = test_pipeline();
    changed.spec.vertices[1].replicas = Some(3);
    let changed_vertices = build_vertices(&changed);
    assert!(
        needs_update(Some(vertex), &changed_vertices["test-pl-cat"]),
        "a changed spec hash must trigger an update"
    );

    // Status-only changes never trigger an update.
    let mut with_status = vertex.clone();
    with_status.status = Some(Default::default());
    assert!(!needs_update(Some(vertex), &with_status), "a status change must not trigger an update");
}

#[test]
fn daemon_builders_derive_names_from_the_pipeline() {
    let config = Config::new_test();
    let pipeline = test_pipeline();

    let deployment = build_daemon_deployment(&config, &pipeline);
    assert_eq!(deployment.metadata.name.as_deref(), Some("test-pl-daemon"));
    assert_eq!(deployment.metadata.namespace.as_deref(), Some("test-ns"));
    let spec = deployment.spec.as_ref().expect("expected deployment spec");
    assert_eq!(spec.replicas, Some(1));
    let containers = &spec.template.spec.as_ref().expect("expected pod spec").containers;
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].image.as_deref(), Some("test-image"));
    assert_eq!(containers[0].args.as_ref().expect("expected args")[0], "daemon-server");

    let service = build_daemon_service(&pipeline);
    assert_eq!(service.metadata.name.as_deref(), Some("test-pl-daemon-svc"));
    let spec = service.spec.as_ref().expect("expected service spec");
    assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
    let selector = spec.selector.as_ref().expect("expected service selector");
    assert_eq!(selector.get(names::LABEL_PIPELINE_NAME).map(String::as_str), Some("test-pl"));
}

#[test]
fn buffer_create_job_carries_isbsvc_credentials_and_an_owner() {
    let config = Config::new_test();
    let pipeline = test_pipeline();
    let isbsvc = test_isbsvc(true);

    let job = build_buffer_create_job(&config, &pipeline, &isbsvc);
    let name = job.metadata.name.as_deref().expect("expected job name");
    assert!(name.starts_with("test-pl-buffer-create-"), "unexpected job name {:?}", name);
    let owners = job.metadata.owner_references.as_ref().expect("expected owner references on create job");
    assert_eq!(owners.len(), 1);

    let pod = job
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .expect("expected job pod spec");
    assert_eq!(pod.containers.len(), 1);
    let args = pod.containers[0].args.as_ref().expect("expected container args");
    assert!(!args.is_empty());
    assert_eq!(args[0], "isbsvc-buffer-create");
    assert!(args.iter().any(|arg| arg == "--isbsvc-type=jetstream"), "missing isbsvc type arg in {:?}", args);
    assert!(
        args.iter().any(|arg| arg.contains("test-pl.input-cat") && arg.contains("test-pl.cat-output")),
        "missing buffers arg in {:?}",
        args
    );

    let env_names: Vec<&str> = pod.containers[0]
        .env
        .as_ref()
        .expect("expected container env")
        .iter()
        .map(|env| env.name.as_str())
        .collect();
    for expected in [
        names::ENV_PIPELINE_NAME,
        names::ENV_ISBSVC_JETSTREAM_URL,
        names::ENV_ISBSVC_REDIS_URL,
        names::ENV_ISBSVC_REDIS_SENTINEL_URL,
        names::ENV_ISBSVC_SENTINEL_MASTER,
        names::ENV_ISBSVC_REDIS_USER,
        names::ENV_ISBSVC_REDIS_PASSWORD,
        names::ENV_ISBSVC_REDIS_SENTINEL_PASSWORD,
    ] {
        assert!(env_names.contains(&expected), "missing env var {} in {:?}", expected, env_names);
    }
}

#[test]
fn buffer_create_job_propagates_merged_edge_limits() {
    let config = Config::new_test();
    let isbsvc = test_isbsvc(true);

    let mut pipeline = test_pipeline();
    let job = build_buffer_create_job(&config, &pipeline, &isbsvc);
    let args = job
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod| pod.containers[0].args.clone().unwrap_or_default())
        .expect("expected job args");
    assert!(
        !args.iter().any(|arg| arg.starts_with("--buffer-max-length=")),
        "no limits set, so no length arg expected: {:?}",
        args
    );

    pipeline.spec.limits = Some(PipelineLimits {
        buffer_max_length: Some(1000),
        ..Default::default()
    });
    pipeline.spec.edges[1].limits = Some(EdgeLimits {
        buffer_max_length: Some(2000),
        buffer_usage_limit: None,
    });
    let job = build_buffer_create_job(&config, &pipeline, &isbsvc);
    let args = job
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod| pod.containers[0].args.clone().unwrap_or_default())
        .expect("expected job args");
    assert!(
        args.iter().any(|arg| arg == "--buffer-max-length=2000"),
        "the largest merged edge limit must win: {:?}",
        args
    );
}

#[test]
fn cleanup_without_isbsvc_is_a_no_op() {
    let config = Config::new_test();
    let pipeline = test_pipeline();
    assert!(cleanup_job_for(&config, &pipeline, None).is_none());
    let unhealthy = test_isbsvc(false);
    assert!(cleanup_job_for(&config, &pipeline, Some(&unhealthy)).is_none());
}

#[test]
fn cleanup_with_isbsvc_builds_an_unowned_job() {
    let config = Config::new_test();
    let pipeline = test_pipeline();
    let isbsvc = test_isbsvc(true);

    let job = cleanup_job_for(&config, &pipeline, Some(&isbsvc)).expect("expected a cleanup job");
    let name = job.metadata.name.as_deref().expect("expected job name");
    assert!(name.contains("cleanup"), "cleanup job name {:?} must contain 'cleanup'", name);
    assert!(
        job.metadata.owner_references.as_ref().map(Vec::len).unwrap_or(0) == 0,
        "cleanup jobs must not be owned by the pipeline"
    );
    let args = job
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod| pod.containers[0].args.clone().unwrap_or_default())
        .expect("expected job args");
    assert_eq!(args[0], "isbsvc-buffer-delete");
}

#[test]
fn spec_hashes_are_stable_and_input_sensitive() {
    let pipeline = test_pipeline();
    assert_eq!(spec_hash(&pipeline.spec), spec_hash(&pipeline.spec));
    let mut changed = test_pipeline();
    changed.spec.vertices[0].replicas = Some(2);
    assert_ne!(spec_hash(&pipeline.spec), spec_hash(&changed.spec));
}
