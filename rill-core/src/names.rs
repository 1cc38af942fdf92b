//! Environment variable names, canonical labels and derived resource names.
//!
//! Every name derived from a Pipeline lives here so that the controller, the
//! lifecycle Jobs and the processors all agree byte-for-byte.

/// The name of the pipeline a command or processor is acting on behalf of.
pub const ENV_PIPELINE_NAME: &str = "RILL_PIPELINE_NAME";
/// The base64-encoded JSON Vertex object handed to a processor pod.
pub const ENV_VERTEX_OBJECT: &str = "RILL_VERTEX_OBJECT";
/// The name of the pod a processor is running in.
pub const ENV_POD: &str = "RILL_POD";
/// The replica index of a processor pod.
pub const ENV_REPLICA: &str = "RILL_REPLICA";
/// The Rill image used for spawned pods and jobs.
pub const ENV_IMAGE: &str = "RILL_IMAGE";
/// The Kubernetes namespace the controller operates in.
pub const ENV_NAMESPACE: &str = "RILL_NAMESPACE";

// Inter-step buffer service credentials, passed through to lifecycle jobs and processors.
pub const ENV_ISBSVC_JETSTREAM_URL: &str = "RILL_ISBSVC_JETSTREAM_URL";
pub const ENV_ISBSVC_JETSTREAM_USER: &str = "RILL_ISBSVC_JETSTREAM_USER";
pub const ENV_ISBSVC_JETSTREAM_PASSWORD: &str = "RILL_ISBSVC_JETSTREAM_PASSWORD";
pub const ENV_ISBSVC_REDIS_URL: &str = "RILL_ISBSVC_REDIS_URL";
pub const ENV_ISBSVC_REDIS_SENTINEL_URL: &str = "RILL_ISBSVC_REDIS_SENTINEL_URL";
pub const ENV_ISBSVC_SENTINEL_MASTER: &str = "RILL_ISBSVC_SENTINEL_MASTER";
pub const ENV_ISBSVC_REDIS_USER: &str = "RILL_ISBSVC_REDIS_USER";
pub const ENV_ISBSVC_REDIS_PASSWORD: &str = "RILL_ISBSVC_REDIS_PASSWORD";
pub const ENV_ISBSVC_REDIS_SENTINEL_PASSWORD: &str = "RILL_ISBSVC_REDIS_SENTINEL_PASSWORD";

/// The canonical `app` label value for all objects controlled by Rill.
pub const LABEL_APP: &str = "rill";
/// The canonical label identifying the controller owning an object.
pub const LABEL_CONTROLLED_BY: &str = "rill.rs/controlled-by";
/// The canonical label carrying the pipeline name on derived objects.
pub const LABEL_PIPELINE_NAME: &str = "rill.rs/pipeline-name";
/// The canonical label carrying the vertex name on derived objects.
pub const LABEL_VERTEX_NAME: &str = "rill.rs/vertex-name";
/// The annotation carrying the hash of the spec which produced a derived object.
pub const ANNOTATION_SPEC_HASH: &str = "rill.rs/spec-hash";

/// The finalizer placed on Pipelines so buffers are cleaned up before deletion.
pub const FINALIZER_PIPELINE: &str = "pipeline-controller.rill.rs";
/// The ISBSvc name used when a pipeline does not reference one explicitly.
pub const DEFAULT_ISBSVC_NAME: &str = "default";

/// The read batch size used when neither the pipeline nor the vertex sets one.
pub const DEFAULT_READ_BATCH_SIZE: u64 = 100;
/// The read timeout in seconds used when neither the pipeline nor the vertex sets one.
pub const DEFAULT_READ_TIMEOUT_SECONDS: u64 = 1;
/// The buffer length used when neither the pipeline nor the edge sets one.
pub const DEFAULT_BUFFER_MAX_LENGTH: u64 = 30000;
/// The buffer usage limit (percent) used when neither the pipeline nor the edge sets one.
pub const DEFAULT_BUFFER_USAGE_LIMIT: u32 = 80;

/// The name of the buffer backing the edge `from -> to` of the given pipeline.
pub fn buffer_name(pipeline: &str, from: &str, to: &str) -> String {
    format!("{}.{}-{}", pipeline, from, to)
}

/// The JetStream stream name of a buffer.
///
/// NATS stream names may not contain `.`, so the buffer name's pipeline separator is
/// replaced; the subject keeps the buffer name verbatim.
pub fn jet_stream_name(buffer: &str) -> String {
    buffer.replace('.', "-")
}

/// The name of the Vertex object derived for the given pipeline vertex.
pub fn vertex_object_name(pipeline: &str, vertex: &str) -> String {
    format!("{}-{}", pipeline, vertex)
}

/// The name of a pipeline's daemon Deployment.
pub fn daemon_deployment_name(pipeline: &str) -> String {
    format!("{}-daemon", pipeline)
}

/// The name of a pipeline's daemon Service.
pub fn daemon_service_name(pipeline: &str) -> String {
    format!("{}-daemon-svc", pipeline)
}

/// The name of the one-shot Job which creates a pipeline's buffers.
pub fn buffer_create_job_name(pipeline: &str, hash: &str) -> String {
    format!("{}-buffer-create-{}", pipeline, hash)
}

/// The name of the one-shot Job which deletes a pipeline's buffers on teardown.
pub fn buffer_cleanup_job_name(pipeline: &str, hash: &str) -> String {
    format!("{}-buffer-cleanup-{}", pipeline, hash)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn buffer_names_are_derived_from_pipeline_and_edge() {
        assert_eq!(buffer_name("test-pl", "in", "out"), "test-pl.in-out");
        assert_eq!(jet_stream_name("test-pl.in-out"), "test-pl-in-out");
    }

    #[test]
    fn derived_resource_names() {
        assert_eq!(vertex_object_name("test-pl", "cat"), "test-pl-cat");
        assert_eq!(daemon_deployment_name("test-pl"), "test-pl-daemon");
        assert_eq!(daemon_service_name("test-pl"), "test-pl-daemon-svc");
        assert!(buffer_create_job_name("test-pl", "abc").starts_with("test-pl-buffer-create-"));
        assert!(buffer_cleanup_job_name("test-pl", "abc").contains("cleanup"));
    }
}
