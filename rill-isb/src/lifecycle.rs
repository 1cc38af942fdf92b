//! Inter-step buffer lifecycle operations.
//!
//! Pipelines own the lifecycle of their buffers through three idempotent operations:
//! buffers are created by a one-shot Job before a pipeline serves traffic, validated
//! lazily, and deleted by a cleanup Job when the pipeline is removed.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use async_nats::jetstream::{self, consumer, stream};

use crate::jetstream::ClientConfig;
use crate::redis::RedisLifecycle;
use rill_core::names;
use rill_core::AppError;

/// The broker flavor backing an inter-step buffer service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsbSvcType {
    Redis,
    JetStream,
}

impl FromStr for IsbSvcType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redis" => Ok(Self::Redis),
            "jetstream" => Ok(Self::JetStream),
            other => Err(AppError::UnsupportedIsbSvcType(other.to_string())),
        }
    }
}

impl std::fmt::Display for IsbSvcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redis => write!(f, "redis"),
            Self::JetStream => write!(f, "jetstream"),
        }
    }
}

/// Options applied when provisioning buffers.
#[derive(Clone, Debug)]
pub struct BufferCreateOptions {
    /// The max number of messages a buffer retains before rejecting writes.
    pub buffer_max_length: u64,
    /// The broker-side ack wait after which unacked messages are redelivered.
    pub ack_wait: Duration,
}

impl Default for BufferCreateOptions {
    fn default() -> Self {
        Self {
            buffer_max_length: names::DEFAULT_BUFFER_MAX_LENGTH,
            ack_wait: Duration::from_secs(60),
        }
    }
}

/// Validate common lifecycle inputs and resolve the service type.
///
/// Buffer names are derived from the pipeline name, so the pipeline name must be
/// present in the environment before any broker work starts.
fn resolve_inputs(isbsvc_type: &str, buffers: &[String], pipeline_name: Option<String>) -> Result<(IsbSvcType, String), AppError> {
    if buffers.is_empty() {
        return Err(AppError::EmptyBufferList);
    }
    let pipeline_name = pipeline_name.ok_or(AppError::MissingEnv(names::ENV_PIPELINE_NAME))?;
    let isbsvc_type = isbsvc_type.parse()?;
    Ok((isbsvc_type, pipeline_name))
}

/// Create the given buffers. Idempotent: already-existing buffers are not an error.
pub async fn create_buffers(isbsvc_type: &str, buffers: &[String], pipeline_name: Option<String>, opts: BufferCreateOptions) -> Result<()> {
    let (isbsvc_type, pipeline_name) = resolve_inputs(isbsvc_type, buffers, pipeline_name)?;
    tracing::info!(pipeline = %pipeline_name, %isbsvc_type, count = buffers.len(), "creating inter-step buffers");
    match isbsvc_type {
        IsbSvcType::JetStream => JetStreamLifecycle::from_env().await?.create_buffers(buffers, &opts).await,
        IsbSvcType::Redis => RedisLifecycle::from_env()?.create_buffers(buffers),
    }
}

/// Delete the given buffers. Idempotent: missing buffers are not an error.
pub async fn delete_buffers(isbsvc_type: &str, buffers: &[String], pipeline_name: Option<String>) -> Result<()> {
    let (isbsvc_type, pipeline_name) = resolve_inputs(isbsvc_type, buffers, pipeline_name)?;
    tracing::info!(pipeline = %pipeline_name, %isbsvc_type, count = buffers.len(), "deleting inter-step buffers");
    match isbsvc_type {
        IsbSvcType::JetStream => JetStreamLifecycle::from_env().await?.delete_buffers(buffers).await,
        IsbSvcType::Redis => RedisLifecycle::from_env()?.delete_buffers(buffers),
    }
}

/// Check that the given buffers exist with their expected configuration.
pub async fn validate_buffers(isbsvc_type: &str, buffers: &[String], pipeline_name: Option<String>) -> Result<()> {
    let (isbsvc_type, pipeline_name) = resolve_inputs(isbsvc_type, buffers, pipeline_name)?;
    tracing::info!(pipeline = %pipeline_name, %isbsvc_type, count = buffers.len(), "validating inter-step buffers");
    match isbsvc_type {
        IsbSvcType::JetStream => JetStreamLifecycle::from_env().await?.validate_buffers(buffers).await,
        IsbSvcType::Redis => RedisLifecycle::from_env()?.validate_buffers(buffers),
    }
}

/// JetStream buffer provisioning.
pub struct JetStreamLifecycle {
    context: jetstream::Context,
}

impl JetStreamLifecycle {
    /// Connect using credentials from the environment.
    pub async fn from_env() -> Result<Self> {
        let client = ClientConfig::from_env()?.connect().await?;
        Ok(Self {
            context: jetstream::new(client),
        })
    }

    /// Create one stream + durable pull consumer per buffer.
    pub async fn create_buffers(&self, buffers: &[String], opts: &BufferCreateOptions) -> Result<()> {
        for buffer in buffers {
            let stream_name = names::jet_stream_name(buffer);
            let stream = self
                .context
                .get_or_create_stream(stream::Config {
                    name: stream_name.clone(),
                    subjects: vec![buffer.clone()],
                    retention: stream::RetentionPolicy::Limits,
                    discard: stream::DiscardPolicy::New,
                    max_messages: opts.buffer_max_length as i64,
                    ..Default::default()
                })
                .await
                .with_context(|| format!("error creating stream for buffer {:?}", buffer))?;
            stream
                .create_consumer(consumer::pull::Config {
                    durable_name: Some(stream_name.clone()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ack_wait: opts.ack_wait,
                    max_ack_pending: opts.buffer_max_length as i64,
                    ..Default::default()
                })
                .await
                .with_context(|| format!("error creating durable consumer for buffer {:?}", buffer))?;
            tracing::info!(buffer = %buffer, stream = %stream_name, "created inter-step buffer");
        }
        Ok(())
    }

    /// Delete the stream backing each buffer.
    pub async fn delete_buffers(&self, buffers: &[String]) -> Result<()> {
        for buffer in buffers {
            let stream_name = names::jet_stream_name(buffer);
            match self.context.delete_stream(&stream_name).await {
                Ok(_) => tracing::info!(buffer = %buffer, stream = %stream_name, "deleted inter-step buffer"),
                // An already-deleted buffer is not an error.
                Err(err) if err.to_string().contains("stream not found") => {
                    tracing::debug!(buffer = %buffer, "buffer already deleted, no-op");
                }
                Err(err) => return Err(err).with_context(|| format!("error deleting stream for buffer {:?}", buffer)),
            }
        }
        Ok(())
    }

    /// Check that each buffer's stream exists and carries the buffer subject.
    pub async fn validate_buffers(&self, buffers: &[String]) -> Result<()> {
        for buffer in buffers {
            let stream_name = names::jet_stream_name(buffer);
            let mut stream = self.context.get_stream(&stream_name).await.map_err(|err| AppError::BufferInvalid {
                buffer: buffer.clone(),
                reason: format!("stream {:?} not found: {}", stream_name, err),
            })?;
            let info = stream
                .info()
                .await
                .with_context(|| format!("error fetching stream info for buffer {:?}", buffer))?;
            if !info.config.subjects.iter().any(|subject| subject == buffer) {
                return Err(AppError::BufferInvalid {
                    buffer: buffer.clone(),
                    reason: format!("stream subjects {:?} do not include the buffer subject", info.config.subjects),
                }
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn buffers(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn empty_buffer_list_is_rejected_first() {
        let err = resolve_inputs("jetstream", &[], None).expect_err("expected empty buffer list error");
        assert_eq!(err.to_string(), "buffer list should not be empty");
    }

    #[test]
    fn missing_pipeline_env_names_the_variable() {
        let err = resolve_inputs("jetstream", &buffers(&["b1"]), None).expect_err("expected missing env error");
        assert!(
            err.to_string().contains(names::ENV_PIPELINE_NAME),
            "error {:?} does not name {}",
            err.to_string(),
            names::ENV_PIPELINE_NAME
        );
    }

    #[test]
    fn unsupported_service_type_is_rejected() {
        let err = resolve_inputs("nonono", &buffers(&["b1"]), Some("test-pl".into())).expect_err("expected unsupported type error");
        assert!(
            err.to_string().contains("unsupported isb service type"),
            "unexpected error message {:?}",
            err.to_string()
        );
    }

    #[test]
    fn valid_inputs_resolve() {
        let (isbsvc_type, pipeline) = resolve_inputs("jetstream", &buffers(&["test-pl.in-out"]), Some("test-pl".into())).expect("expected inputs to resolve");
        assert_eq!(isbsvc_type, IsbSvcType::JetStream);
        assert_eq!(pipeline, "test-pl");
        let (isbsvc_type, _) = resolve_inputs("redis", &buffers(&["test-pl.in-out"]), Some("test-pl".into())).expect("expected inputs to resolve");
        assert_eq!(isbsvc_type, IsbSvcType::Redis);
    }
}
