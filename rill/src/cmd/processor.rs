//! The vertex processor entrypoint.
//!
//! Every vertex pod runs this command. It validates its environment, decodes its
//! Vertex object, wires a buffer reader and writers against the inter-step buffer
//! service, and drives the forwarder until shutdown.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio_stream::wrappers::SignalStream;
use tokio_stream::StreamMap;

use crate::forwarder::Forwarder;
use crate::sink::LogWriter;
use crate::source::GeneratorReader;
use crate::udf::Builtin;
use rill_core::crd::{Vertex, VertexType};
use rill_core::names;
use rill_core::AppError;
use rill_isb::jetstream::{ClientConfig, JetStreamReader, JetStreamWriter, ReadOptions};
use rill_isb::lifecycle::IsbSvcType;
use rill_isb::{BufferReader, BufferWriter};

/// Run a vertex processor.
#[derive(StructOpt)]
pub struct Processor {
    /// The processor type of this vertex, one of source, udf or sink.
    #[structopt(long = "type")]
    processor_type: String,
    /// The type of the inter-step buffer service backing this pipeline.
    #[structopt(long = "isbsvc-type", default_value = "jetstream")]
    isbsvc_type: String,
}

impl Processor {
    pub async fn run(&self) -> Result<()> {
        run_processor(&self.processor_type, &self.isbsvc_type, None).await
    }
}

/// Everything a processor needs from its environment, validated up front.
#[derive(Debug)]
pub(crate) struct ProcessorSetup {
    pub vertex: Vertex,
    pub pod: String,
    pub replica: u32,
    pub processor_type: VertexType,
}

impl ProcessorSetup {
    /// Validate the runtime environment and decode the Vertex object.
    pub(crate) fn from_env(processor_type: &str) -> Result<Self, AppError> {
        let encoded = std::env::var(names::ENV_VERTEX_OBJECT).map_err(|_| AppError::MissingEnv(names::ENV_VERTEX_OBJECT))?;
        let vertex = decode_vertex(&encoded)?;
        let pod = std::env::var(names::ENV_POD).map_err(|_| AppError::MissingEnv(names::ENV_POD))?;
        let replica_raw = std::env::var(names::ENV_REPLICA).map_err(|_| AppError::MissingEnv(names::ENV_REPLICA))?;
        let replica = parse_replica(&replica_raw)?;
        let processor_type = parse_processor_type(processor_type)?;
        Ok(Self {
            vertex,
            pod,
            replica,
            processor_type,
        })
    }
}

/// Decode a base64-encoded JSON Vertex object.
pub(crate) fn decode_vertex(encoded: &str) -> Result<Vertex, AppError> {
    let bytes = base64::decode(encoded).map_err(|err| AppError::DecodeFailed(err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| AppError::DecodeFailed(err.to_string()))
}

/// Parse the replica index of this pod.
pub(crate) fn parse_replica(raw: &str) -> Result<u32, AppError> {
    raw.parse().map_err(|_| AppError::InvalidReplica(raw.to_string()))
}

/// Parse the processor type flag.
pub(crate) fn parse_processor_type(raw: &str) -> Result<VertexType, AppError> {
    match raw {
        "source" => Ok(VertexType::Source),
        "udf" => Ok(VertexType::Udf),
        "sink" => Ok(VertexType::Sink),
        other => Err(AppError::UnrecognizedProcessorType(other.to_string())),
    }
}

/// Validate the environment and run the forwarder until shutdown.
///
/// `function_override` replaces the vertex's configured built-in function; it is how
/// the `builtin-udf` command injects the function it resolved from its own flags.
pub(crate) async fn run_processor(processor_type: &str, isbsvc_type: &str, function_override: Option<Builtin>) -> Result<()> {
    let setup = ProcessorSetup::from_env(processor_type)?;
    crate::install_metrics_recorder()?;
    let spec = &setup.vertex.spec;
    tracing::info!(
        vertex = %spec.vertex.name,
        pipeline = %spec.pipeline_name,
        pod = %setup.pod,
        replica = setup.replica,
        r#type = %setup.processor_type,
        "starting the Rill processor",
    );

    let isbsvc_type: IsbSvcType = isbsvc_type.parse()?;
    if isbsvc_type != IsbSvcType::JetStream {
        anyhow::bail!("the {} data plane is not wired into this build, use the jetstream inter-step buffer service", isbsvc_type);
    }

    // One broker connection per pod, shared by the reader, writers and heartbeats.
    let client = ClientConfig::from_env()?.connect().await?;

    let limits = spec.vertex.limits.clone().unwrap_or_default();
    let batch_size = limits.read_batch_size.unwrap_or(names::DEFAULT_READ_BATCH_SIZE) as usize;
    let read_timeout = Duration::from_secs(limits.read_timeout_seconds.unwrap_or(names::DEFAULT_READ_TIMEOUT_SECONDS));

    // Reader: sources synthesize their own input, everything else pulls its single
    // inbound buffer.
    let reader: Box<dyn BufferReader> = match setup.processor_type {
        VertexType::Source => {
            let generator = spec.vertex.source.as_ref().and_then(|source| source.generator.clone()).unwrap_or_default();
            Box::new(GeneratorReader::new(spec.vertex.name.clone(), generator))
        }
        VertexType::Udf | VertexType::Sink => {
            let buffer = spec
                .from_buffers()
                .into_iter()
                .next()
                .context("vertex has no inbound buffer to read from")?;
            let opts = ReadOptions { read_timeout };
            Box::new(JetStreamReader::new(client.clone(), buffer.clone(), &buffer, opts).await?)
        }
    };

    // Writers: one per outbound buffer; sinks terminate into their built-in sink.
    let mut writers: Vec<Box<dyn BufferWriter>> = Vec::new();
    for buffer in spec.to_buffers() {
        writers.push(Box::new(JetStreamWriter::new(client.clone(), buffer.clone(), &buffer).await?));
    }
    if matches!(setup.processor_type, VertexType::Sink) {
        writers.push(Box::new(LogWriter::new(spec.vertex.name.clone())));
    }

    // The transform applied between read and write.
    let function = match (setup.processor_type, function_override) {
        (_, Some(function)) => function,
        (VertexType::Udf, None) => {
            let builtin = spec
                .vertex
                .udf
                .as_ref()
                .and_then(|udf| udf.builtin.as_ref())
                .context("udf vertex has no builtin function configured")?;
            crate::udf::resolve(&builtin.name, &builtin.args)?
        }
        _ => Builtin::Cat,
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    let forwarder_handle = Forwarder::new(spec.vertex.name.clone(), reader, writers, function, batch_size, shutdown_tx.clone()).spawn();

    let mut signals = StreamMap::new();
    signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
    signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        Some((_, sig)) = signals.next() => {
            tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
            let _res = shutdown_tx.send(());
        }
        _ = shutdown_rx.recv() => (),
    }

    forwarder_handle
        .await
        .context("error joining forwarder handle")
        .and_then(|res| res)?;
    tracing::info!("the Rill processor has shut down");
    Ok(())
}
