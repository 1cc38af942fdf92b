//! The Rill CLI.

use anyhow::Result;
use structopt::StructOpt;

use rill::Rill;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Rill::from_args();
    cli.run().await
}
