//! Run the pipeline controller manager.

use std::sync::Arc;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tokio::sync::broadcast;

use rill_controller::{App, Config};

/// Run the pipeline controller manager.
#[derive(StructOpt)]
pub struct Controller {}

impl Controller {
    pub async fn run(&self) -> Result<()> {
        crate::install_metrics_recorder()?;
        let config = Arc::new(Config::new()?);
        tracing::info!(namespace = %config.namespace, image = %config.image, "starting the Rill controller");

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut sampler_shutdown = shutdown_tx.subscribe();
        let sampler = rill_core::prom::spawn_proc_metrics_sampler(async move {
            let _res = sampler_shutdown.recv().await;
        });

        let res = App::new(config, shutdown_tx.clone())
            .await?
            .spawn()
            .await
            .context("error joining controller app handle")
            .and_then(|res| res);
        let _res = shutdown_tx.send(());
        if let Err(err) = sampler.await {
            tracing::error!(error = ?err, "error joining metrics sampler task");
        }
        res
    }
}
