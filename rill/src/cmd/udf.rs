//! Run a built-in user-defined function as a udf processor.

use anyhow::Result;
use structopt::StructOpt;

use crate::cmd::processor::run_processor;

/// Run a built-in user-defined function as a udf processor.
#[derive(StructOpt)]
pub struct BuiltinUdf {
    /// The name of the built-in function to run.
    #[structopt(long, default_value = "")]
    name: String,
    /// Comma-separated arguments handed to the function.
    #[structopt(long, use_delimiter = true)]
    args: Vec<String>,
    /// The type of the inter-step buffer service backing this pipeline.
    #[structopt(long = "isbsvc-type", default_value = "jetstream")]
    isbsvc_type: String,
}

impl BuiltinUdf {
    pub async fn run(&self) -> Result<()> {
        // Resolve before touching the environment so a bad name fails fast.
        let function = crate::udf::resolve(&self.name, &self.args)?;
        tracing::info!(name = %self.name, "resolved built-in function");
        run_processor("udf", &self.isbsvc_type, Some(function)).await
    }
}
