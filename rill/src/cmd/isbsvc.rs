//! Inter-step buffer lifecycle commands.
//!
//! These run as one-shot Jobs created by the pipeline controller; buffer names are
//! derived from the pipeline name carried in the environment.

use anyhow::Result;
use structopt::StructOpt;

use rill_core::names;
use rill_isb::lifecycle;

fn pipeline_name_from_env() -> Option<String> {
    std::env::var(names::ENV_PIPELINE_NAME).ok()
}

/// Create the inter-step buffers of a pipeline.
#[derive(StructOpt)]
pub struct BufferCreate {
    /// The type of the inter-step buffer service.
    #[structopt(long = "isbsvc-type")]
    isbsvc_type: String,
    /// Comma-separated buffer names.
    #[structopt(long, use_delimiter = true)]
    buffers: Vec<String>,
    /// The max number of messages each buffer retains before backpressure.
    #[structopt(long = "buffer-max-length")]
    buffer_max_length: Option<u64>,
}

impl BufferCreate {
    pub async fn run(&self) -> Result<()> {
        let mut opts = lifecycle::BufferCreateOptions::default();
        if let Some(buffer_max_length) = self.buffer_max_length {
            opts.buffer_max_length = buffer_max_length;
        }
        lifecycle::create_buffers(&self.isbsvc_type, &self.buffers, pipeline_name_from_env(), opts).await
    }
}

/// Delete the inter-step buffers of a pipeline.
#[derive(StructOpt)]
pub struct BufferDelete {
    /// The type of the inter-step buffer service.
    #[structopt(long = "isbsvc-type")]
    isbsvc_type: String,
    /// Comma-separated buffer names.
    #[structopt(long, use_delimiter = true)]
    buffers: Vec<String>,
}

impl BufferDelete {
    pub async fn run(&self) -> Result<()> {
        lifecycle::delete_buffers(&self.isbsvc_type, &self.buffers, pipeline_name_from_env()).await
    }
}

/// Validate the inter-step buffers of a pipeline.
#[derive(StructOpt)]
pub struct BufferValidate {
    /// The type of the inter-step buffer service.
    #[structopt(long = "isbsvc-type")]
    isbsvc_type: String,
    /// Comma-separated buffer names.
    #[structopt(long, use_delimiter = true)]
    buffers: Vec<String>,
}

impl BufferValidate {
    pub async fn run(&self) -> Result<()> {
        lifecycle::validate_buffers(&self.isbsvc_type, &self.buffers, pipeline_name_from_env()).await
    }
}
