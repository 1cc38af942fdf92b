//! The pipeline daemon server.
//!
//! A per-pipeline Deployment runs this command to expose runtime metadata: the
//! Prometheus scrape endpoint and a health check, behind the pipeline's ClusterIP
//! Service.

use anyhow::{Context, Result};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::{extract::Extension, routing::get, AddExtensionLayer, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio_stream::wrappers::SignalStream;
use tokio_stream::StreamMap;

/// Serve the pipeline daemon endpoints.
#[derive(StructOpt)]
pub struct DaemonServer {
    /// The port to serve the daemon endpoints on.
    #[structopt(long, default_value = "9090")]
    port: u16,
}

impl DaemonServer {
    pub async fn run(&self) -> Result<()> {
        crate::install_metrics_recorder()?;
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let mut sampler_shutdown = shutdown_tx.subscribe();
        let sampler = rill_core::prom::spawn_proc_metrics_sampler(async move {
            let _res = sampler_shutdown.recv().await;
        });

        // Relay process signals into the shutdown channel.
        let signal_shutdown_tx = shutdown_tx.clone();
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
        tokio::spawn(async move {
            if let Some((_, sig)) = signals.next().await {
                tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                let _res = signal_shutdown_tx.send(());
            }
        });

        let state = crate::get_metrics_recorder().handle();
        let app = Router::new()
            .route("/metrics", get(prometheus_scrape))
            .route("/healthz", get(healthz))
            .layer(AddExtensionLayer::new(state));
        let mut shutdown = shutdown_tx.subscribe();
        let server = axum::Server::bind(&([0, 0, 0, 0], self.port).into())
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move {
                let _res = shutdown.recv().await;
            });
        tracing::info!("daemon server is listening at 0.0.0.0:{}", self.port);
        let res = server.await.context("daemon server error");

        let _res = shutdown_tx.send(());
        if let Err(err) = sampler.await {
            tracing::error!(error = ?err, "error joining metrics sampler task");
        }
        res
    }
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(Extension(state): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}

/// Handle health checks.
async fn healthz() -> StatusCode {
    StatusCode::OK
}
