//! The Rill CLI.

mod cmd;
mod forwarder;
#[cfg(test)]
mod forwarder_test;
mod sink;
mod source;
mod udf;

use std::mem::MaybeUninit;
use std::sync::Once;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use structopt::StructOpt;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use rill_core::names;

/// The Rill CLI.
#[derive(StructOpt)]
#[structopt(name = "rill")]
pub struct Rill {
    #[structopt(subcommand)]
    action: RillSubcommands,
    /// Enable debug logging.
    #[structopt(short)]
    verbose: bool,
}

impl Rill {
    pub async fn run(self) -> Result<()> {
        // Initialize logging based on CLI config.
        let fmt_layer = fmt::layer().with_target(true);
        let filter_layer;
        let level_filter;
        if self.verbose {
            filter_layer = EnvFilter::new("debug");
            level_filter = LevelFilter::DEBUG;
        } else {
            filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            level_filter = LevelFilter::INFO;
        }
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(level_filter)
            .init();

        match &self.action {
            RillSubcommands::Controller(inner) => inner.run().await,
            RillSubcommands::Processor(inner) => inner.run().await,
            RillSubcommands::IsbsvcBufferCreate(inner) => inner.run().await,
            RillSubcommands::IsbsvcBufferDelete(inner) => inner.run().await,
            RillSubcommands::IsbsvcBufferValidate(inner) => inner.run().await,
            RillSubcommands::BuiltinUdf(inner) => inner.run().await,
            RillSubcommands::DaemonServer(inner) => inner.run().await,
        }
    }
}

#[derive(StructOpt)]
pub enum RillSubcommands {
    /// Run the pipeline controller manager.
    #[structopt(name = "controller")]
    Controller(cmd::controller::Controller),
    /// Run a vertex processor.
    #[structopt(name = "processor")]
    Processor(cmd::processor::Processor),
    /// Create the inter-step buffers of a pipeline.
    #[structopt(name = "isbsvc-buffer-create")]
    IsbsvcBufferCreate(cmd::isbsvc::BufferCreate),
    /// Delete the inter-step buffers of a pipeline.
    #[structopt(name = "isbsvc-buffer-delete")]
    IsbsvcBufferDelete(cmd::isbsvc::BufferDelete),
    /// Validate the inter-step buffers of a pipeline.
    #[structopt(name = "isbsvc-buffer-validate")]
    IsbsvcBufferValidate(cmd::isbsvc::BufferValidate),
    /// Run a built-in user-defined function as a udf processor.
    #[structopt(name = "builtin-udf")]
    BuiltinUdf(cmd::udf::BuiltinUdf),
    /// Serve the pipeline daemon endpoints.
    #[structopt(name = "daemon-server")]
    DaemonServer(cmd::daemon::DaemonServer),
}

/// Get a handle to the metrics recorder, initializing it as needed.
pub(crate) fn get_metrics_recorder() -> &'static PrometheusRecorder {
    static mut RECORDER: MaybeUninit<PrometheusRecorder> = MaybeUninit::uninit();
    static ONCE: Once = Once::new();
    unsafe {
        ONCE.call_once(|| {
            let mut builder = PrometheusBuilder::new();
            if let Ok(pipeline) = std::env::var(names::ENV_PIPELINE_NAME) {
                builder = builder.add_global_label("pipeline", pipeline);
            }
            if let Ok(pod) = std::env::var(names::ENV_POD) {
                builder = builder.add_global_label("pod", pod);
            }
            RECORDER.write(builder.build());
        });
        RECORDER.assume_init_ref()
    }
}

/// Install the Prometheus metrics recorder for a long-running command.
pub(crate) fn install_metrics_recorder() -> Result<()> {
    metrics::set_recorder(get_metrics_recorder()).context("error setting prometheus metrics recorder")?;
    rill_core::prom::register_proc_metrics();
    Ok(())
}
