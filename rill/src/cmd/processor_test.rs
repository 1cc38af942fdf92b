use crate::cmd::processor::{decode_vertex, parse_processor_type, parse_replica, ProcessorSetup};
use rill_core::crd::{AbstractVertex, Udf, Vertex, VertexSpec, VertexType};
use rill_core::names;

fn encoded_vertex() -> String {
    let vertex = Vertex::new(
        "test-pl-cat",
        VertexSpec {
            pipeline_name: "test-pl".into(),
            from_vertices: vec!["input".into()],
            to_vertices: vec!["output".into()],
            vertex: AbstractVertex {
                name: "cat".into(),
                replicas: Some(1),
                udf: Some(Udf { builtin: None }),
                ..Default::default()
            },
        },
    );
    base64::encode(serde_json::to_vec(&vertex).expect("error encoding vertex"))
}

#[test]
fn vertex_decoding() {
    let err = decode_vertex("xxxxx").expect_err("garbage must fail to decode");
    assert!(
        err.to_string().contains("failed to decode vertex string"),
        "unexpected error message {:?}",
        err.to_string()
    );

    let vertex = decode_vertex(&encoded_vertex()).expect("a valid vertex must decode");
    assert_eq!(vertex.spec.pipeline_name, "test-pl");
    assert_eq!(vertex.spec.vertex.name, "cat");
    assert_eq!(vertex.spec.from_buffers(), vec!["test-pl.input-cat".to_string()]);
    assert_eq!(vertex.spec.to_buffers(), vec!["test-pl.cat-output".to_string()]);
}

#[test]
fn replica_parsing() {
    let err = parse_replica("$$$").expect_err("a non-numeric replica must be rejected");
    assert!(err.to_string().contains("invalid replica"), "unexpected error message {:?}", err.to_string());
    assert_eq!(parse_replica("2").expect("a numeric replica must parse"), 2);
    assert_eq!(parse_replica("0").expect("replica zero must parse"), 0);
    assert!(parse_replica("-1").is_err(), "negative replicas must be rejected");
}

#[test]
fn processor_type_parsing() {
    assert_eq!(parse_processor_type("source").expect("source must parse"), VertexType::Source);
    assert_eq!(parse_processor_type("udf").expect("udf must parse"), VertexType::Udf);
    assert_eq!(parse_processor_type("sink").expect("sink must parse"), VertexType::Sink);
    let err = parse_processor_type("nonono").expect_err("an unknown type must be rejected");
    assert!(
        err.to_string().contains("unrecognized processor type"),
        "unexpected error message {:?}",
        err.to_string()
    );
}

/// Walks the environment checks of the processor entrypoint in order. This is a
/// single test so the env var mutations do not race across the test harness.
#[test]
fn setup_validates_the_environment_in_order() {
    std::env::remove_var(names::ENV_VERTEX_OBJECT);
    std::env::remove_var(names::ENV_POD);
    std::env::remove_var(names::ENV_REPLICA);

    let err = ProcessorSetup::from_env("udf").expect_err("a bare env must be rejected");
    assert!(err.to_string().contains(names::ENV_VERTEX_OBJECT), "unexpected error message {:?}", err.to_string());

    std::env::set_var(names::ENV_VERTEX_OBJECT, "xxxxx");
    let err = ProcessorSetup::from_env("udf").expect_err("garbage vertex must be rejected");
    assert!(
        err.to_string().contains("failed to decode vertex string"),
        "unexpected error message {:?}",
        err.to_string()
    );

    std::env::set_var(names::ENV_VERTEX_OBJECT, encoded_vertex());
    let err = ProcessorSetup::from_env("udf").expect_err("a missing pod must be rejected");
    assert!(err.to_string().contains(names::ENV_POD), "unexpected error message {:?}", err.to_string());

    std::env::set_var(names::ENV_POD, "test-pl-cat-0");
    let err = ProcessorSetup::from_env("udf").expect_err("a missing replica must be rejected");
    assert!(err.to_string().contains(names::ENV_REPLICA), "unexpected error message {:?}", err.to_string());

    std::env::set_var(names::ENV_REPLICA, "$$$");
    let err = ProcessorSetup::from_env("udf").expect_err("an invalid replica must be rejected");
    assert!(err.to_string().contains("invalid replica"), "unexpected error message {:?}", err.to_string());

    std::env::set_var(names::ENV_REPLICA, "2");
    let err = ProcessorSetup::from_env("nonono").expect_err("an unknown processor type must be rejected");
    assert!(
        err.to_string().contains("unrecognized processor type"),
        "unexpected error message {:?}",
        err.to_string()
    );

    let setup = ProcessorSetup::from_env("udf").expect("a fully populated env must validate");
    assert_eq!(setup.pod, "test-pl-cat-0");
    assert_eq!(setup.replica, 2);
    assert_eq!(setup.processor_type, VertexType::Udf);
    assert_eq!(setup.vertex.spec.vertex.name, "cat");

    std::env::remove_var(names::ENV_VERTEX_OBJECT);
    std::env::remove_var(names::ENV_POD);
    std::env::remove_var(names::ENV_REPLICA);
}
