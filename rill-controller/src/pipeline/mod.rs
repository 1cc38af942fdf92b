//! Pipeline reconciliation.
//!
//! The controller watches Pipeline CRs and drives every change through an idempotent
//! `reconcile` pass: resolve the referenced ISBSvc, materialise the desired Vertex
//! set, the daemon Deployment/Service and the buffer-create Job, and surface the
//! result on the Pipeline status. Deletion is gated by a finalizer so buffers are
//! cleaned up before the object goes away.

pub mod builder;
#[cfg(test)]
mod builder_test;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use kube::Resource;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use rill_core::crd::{InterStepBufferService, Pipeline, PipelineStatus, RequiredMetadata, Vertex};
use rill_core::names;

/// The field manager used for server-side apply.
const MANAGER: &str = "rill-controller";
/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The delay before a failed or waiting pipeline is reconciled again.
const REQUEUE_DELAY: Duration = Duration::from_secs(10);

type PipelineEventResult = std::result::Result<Event<Pipeline>, WatcherError>;

/// The controller driving Pipeline reconciliation.
pub struct PipelineController {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel of pipeline names to be reconciled again after a delay.
    requeue_tx: mpsc::Sender<String>,
    /// A channel of pipeline names to be reconciled again after a delay.
    requeue_rx: ReceiverStream<String>,
}

impl PipelineController {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        let (requeue_tx, requeue_rx) = mpsc::channel(1000);
        Self {
            client,
            config,
            shutdown_tx,
            requeue_tx,
            requeue_rx: ReceiverStream::new(requeue_rx),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let pipelines: Api<Pipeline> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let stream = watcher(pipelines.clone(), ListParams::default());
        tokio::pin!(stream);

        tracing::info!("pipeline controller initialized");
        let mut shutdown = BroadcastStream::new(self.shutdown_tx.subscribe());
        loop {
            tokio::select! {
                Some(event_res) = stream.next() => self.handle_pipeline_event(event_res).await,
                Some(name) = self.requeue_rx.next() => self.handle_requeue(&pipelines, name).await,
                _ = shutdown.next() => break,
            }
        }

        tracing::debug!("pipeline controller shutdown");
        Ok(())
    }

    /// Handle watcher events coming from K8s.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_pipeline_event(&mut self, res: PipelineEventResult) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from k8s watch stream");
                tokio::time::sleep(REQUEUE_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(pipeline) => self.reconcile_and_requeue_on_error(pipeline).await,
            // Deletion is fully handled while the finalizer is being removed.
            Event::Deleted(pipeline) => tracing::debug!(name = %pipeline.name(), "pipeline deleted"),
            Event::Restarted(pipelines) => {
                tracing::debug!(len = pipelines.len(), "pipeline watch stream restarted");
                for pipeline in pipelines {
                    self.reconcile_and_requeue_on_error(pipeline).await;
                }
            }
        }
    }

    /// Re-fetch a requeued pipeline and run it through reconciliation again.
    #[tracing::instrument(level = "debug", skip(self, api, name))]
    async fn handle_requeue(&mut self, api: &Api<Pipeline>, name: String) {
        let fetch_res = timeout(API_TIMEOUT, api.get(&name)).await;
        match fetch_res {
            Ok(Ok(pipeline)) => self.reconcile_and_requeue_on_error(pipeline).await,
            // Already gone: deletion has completed, nothing left to do.
            Ok(Err(kube::Error::Api(api_err))) if api_err.code == 404 => (),
            Ok(Err(err)) => {
                tracing::error!(error = ?err, %name, "error fetching requeued pipeline");
                self.spawn_requeue(name);
            }
            Err(_) => {
                tracing::error!(%name, "timeout fetching requeued pipeline");
                self.spawn_requeue(name);
            }
        }
    }

    async fn reconcile_and_requeue_on_error(&self, pipeline: Pipeline) {
        let name = pipeline.name().to_string();
        match self.reconcile(pipeline).await {
            Ok(ReconcileOutcome::Done) => (),
            Ok(ReconcileOutcome::Requeue) => self.spawn_requeue(name),
            Err(err) => {
                // Transient failures (conflicts, timeouts) resolve on a later pass.
                tracing::error!(error = ?err, pipeline = %name, "error reconciling pipeline");
                self.spawn_requeue(name);
            }
        }
    }

    /// Schedule the named pipeline for another reconciliation pass after a delay.
    fn spawn_requeue(&self, name: String) {
        let requeue_tx = self.requeue_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REQUEUE_DELAY).await;
            let _res = requeue_tx.send(name).await;
        });
    }
}

/// The outcome of a clean reconciliation pass.
enum ReconcileOutcome {
    Done,
    Requeue,
}

//////////////////////////////////////////////////////////////////////////////
// Reconciliation ////////////////////////////////////////////////////////////
impl PipelineController {
    /// Reconcile the given pipeline into its derived sub-resources.
    #[tracing::instrument(level = "debug", skip(self, pipeline), fields(pipeline = %pipeline.name()))]
    async fn reconcile(&self, pipeline: Pipeline) -> Result<ReconcileOutcome> {
        // Deletion: run cleanup behind the finalizer, then release the object.
        if pipeline.meta().deletion_timestamp.is_some() {
            if has_finalizer(&pipeline) {
                let mut status = pipeline.status.clone().unwrap_or_default();
                status.mark_deleting();
                let _res = self.patch_status(&pipeline, status).await;
                self.cleanup_buffers(&pipeline).await?;
                self.remove_finalizer(&pipeline).await?;
            }
            return Ok(ReconcileOutcome::Done);
        }
        if !has_finalizer(&pipeline) {
            // The finalizer patch produces a fresh watch event which drives the
            // remaining reconciliation steps.
            self.add_finalizer(&pipeline).await?;
            return Ok(ReconcileOutcome::Done);
        }

        // A spec which fails validation stays failed until it is changed; there is
        // no point requeueing it.
        if let Err(errors) = pipeline.validate() {
            tracing::error!(pipeline = %pipeline.name(), ?errors, "pipeline spec failed validation");
            let mut status = pipeline.status.clone().unwrap_or_default();
            status.phase = rill_core::crd::PipelinePhase::Failed;
            self.patch_status(&pipeline, status).await?;
            return Ok(ReconcileOutcome::Done);
        }

        // Gate on the inter-step buffer service: no downstream mutation happens
        // until it reports Configured and Deployed.
        let isbsvc = self.fetch_isbsvc(pipeline.isbsvc_name()).await?;
        let isbsvc = match isbsvc {
            Some(isbsvc) if isbsvc.is_healthy() => isbsvc,
            Some(_) => {
                let mut status = pipeline.status.clone().unwrap_or_default();
                status.mark_waiting(&format!("isbsvc {:?} is not ready", pipeline.isbsvc_name()));
                self.patch_status(&pipeline, status).await?;
                return Ok(ReconcileOutcome::Requeue);
            }
            None => {
                let mut status = pipeline.status.clone().unwrap_or_default();
                status.mark_waiting(&format!("isbsvc {:?} not found", pipeline.isbsvc_name()));
                self.patch_status(&pipeline, status).await?;
                return Ok(ReconcileOutcome::Requeue);
            }
        };

        let mut status = pipeline.status.clone().unwrap_or_default();
        status.mark_deploying();
        self.patch_status(&pipeline, status.clone()).await?;

        let desired = builder::build_vertices(&pipeline);
        self.reconcile_vertices(&pipeline, desired).await?;
        self.reconcile_daemon(&pipeline).await?;
        self.reconcile_buffer_create_job(&pipeline, &isbsvc).await?;

        status.mark_deployed();
        status.observed_generation = pipeline.meta().generation;
        self.patch_status(&pipeline, status).await?;
        Ok(ReconcileOutcome::Done)
    }

    /// Create, update or delete Vertex objects to match the desired set.
    #[tracing::instrument(level = "debug", skip(self, pipeline, desired))]
    async fn reconcile_vertices(&self, pipeline: &Pipeline, desired: HashMap<String, Vertex>) -> Result<()> {
        let api: Api<Vertex> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let params = ListParams::default().labels(&format!("{}={}", names::LABEL_PIPELINE_NAME, pipeline.name()));
        let existing = timeout(API_TIMEOUT, api.list(&params))
            .await
            .context("timeout while listing vertices")?
            .context("error listing vertices")?;
        let mut existing: HashMap<String, Vertex> = existing
            .items
            .into_iter()
            .filter_map(|vertex| vertex.meta().name.clone().map(|name| (name, vertex)))
            .collect();

        for (name, vertex) in desired {
            let old = existing.remove(&name);
            if !builder::needs_update(old.as_ref(), &vertex) {
                continue;
            }
            self.apply_object(&api, &name, &vertex).await?;
            tracing::debug!(vertex = %name, "applied vertex for pipeline");
        }

        // Anything left in the existing set is no longer declared by the pipeline.
        for (name, _orphan) in existing {
            self.delete_object(&api, &name).await?;
            tracing::debug!(vertex = %name, "deleted orphaned vertex");
        }
        Ok(())
    }

    /// Create or update the daemon Deployment and its ClusterIP Service.
    #[tracing::instrument(level = "debug", skip(self, pipeline))]
    async fn reconcile_daemon(&self, pipeline: &Pipeline) -> Result<()> {
        let deployment = builder::build_daemon_deployment(&self.config, pipeline);
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.config.namespace);
        self.apply_object(&api, &names::daemon_deployment_name(pipeline.name()), &deployment).await?;

        let service = builder::build_daemon_service(pipeline);
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.config.namespace);
        self.apply_object(&api, &names::daemon_service_name(pipeline.name()), &service).await?;
        Ok(())
    }

    /// Launch the one-shot buffer-create Job unless it already exists for the
    /// current spec hash.
    #[tracing::instrument(level = "debug", skip(self, pipeline, isbsvc))]
    async fn reconcile_buffer_create_job(&self, pipeline: &Pipeline, isbsvc: &InterStepBufferService) -> Result<()> {
        let job = builder::build_buffer_create_job(&self.config, pipeline, isbsvc);
        let name = job.meta().name.clone().unwrap_or_default();
        let api: Api<Job> = Api::namespaced(self.client.clone(), &self.config.namespace);
        if self.object_exists(&api, &name).await? {
            return Ok(());
        }
        timeout(API_TIMEOUT, api.create(&PostParams::default(), &job))
            .await
            .context("timeout while creating buffer-create job")?
            .context("error creating buffer-create job")?;
        tracing::info!(job = %name, pipeline = %pipeline.name(), "created buffer-create job");
        Ok(())
    }

    /// Submit the buffer-cleanup Job for a pipeline under deletion.
    ///
    /// Without a healthy ISBSvc there is no broker left to clean, so no Job is
    /// created and the finalizer is released immediately.
    #[tracing::instrument(level = "debug", skip(self, pipeline))]
    async fn cleanup_buffers(&self, pipeline: &Pipeline) -> Result<()> {
        let isbsvc = self.fetch_isbsvc(pipeline.isbsvc_name()).await?;
        let job = match builder::cleanup_job_for(&self.config, pipeline, isbsvc.as_ref()) {
            Some(job) => job,
            None => {
                tracing::debug!(pipeline = %pipeline.name(), "isbsvc is gone, skipping buffer cleanup");
                return Ok(());
            }
        };
        let name = job.meta().name.clone().unwrap_or_default();
        let api: Api<Job> = Api::namespaced(self.client.clone(), &self.config.namespace);
        if self.object_exists(&api, &name).await? {
            return Ok(());
        }
        timeout(API_TIMEOUT, api.create(&PostParams::default(), &job))
            .await
            .context("timeout while creating buffer-cleanup job")?
            .context("error creating buffer-cleanup job")?;
        tracing::info!(job = %name, pipeline = %pipeline.name(), "created buffer-cleanup job");
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// K8s API Methods ///////////////////////////////////////////////////////////
impl PipelineController {
    /// Fetch the ISBSvc of the given name, treating 404 as absence.
    async fn fetch_isbsvc(&self, name: &str) -> Result<Option<InterStepBufferService>> {
        let api: Api<InterStepBufferService> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let res = timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching isbsvc")?;
        match res {
            Ok(isbsvc) => Ok(Some(isbsvc)),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(None),
            Err(err) => Err(err).context("error fetching isbsvc"),
        }
    }

    /// Create or update the given object in K8s using Server-Side Apply.
    async fn apply_object<K>(&self, api: &Api<K>, name: &str, object: &K) -> Result<K>
    where
        K: Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let mut params = PatchParams::apply(MANAGER);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date object info.
        timeout(API_TIMEOUT, api.patch(name, &params, &Patch::Apply(object)))
            .await
            .context("timeout while applying object")?
            .context("error applying object")
    }

    /// Delete the named object, treating 404 as success.
    async fn delete_object<K>(&self, api: &Api<K>, name: &str) -> Result<()>
    where
        K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let res = timeout(API_TIMEOUT, api.delete(name, &Default::default()))
            .await
            .context("timeout while deleting object")?;
        match res {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(err) => Err(err).context("error deleting object"),
        }
    }

    /// Check if the named object exists.
    async fn object_exists<K>(&self, api: &Api<K>, name: &str) -> Result<bool>
    where
        K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let res = timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching object")?;
        match res {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(false),
            Err(err) => Err(err).context("error fetching object"),
        }
    }

    /// Patch the status of the given pipeline.
    async fn patch_status(&self, pipeline: &Pipeline, status: PipelineStatus) -> Result<()> {
        let api: Api<Pipeline> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let patch = serde_json::json!({ "status": status });
        timeout(API_TIMEOUT, api.patch_status(pipeline.name(), &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while updating pipeline status")?
            .context("error updating pipeline status")?;
        Ok(())
    }

    /// Add the buffer-cleanup finalizer to the given pipeline.
    async fn add_finalizer(&self, pipeline: &Pipeline) -> Result<()> {
        let mut finalizers = pipeline.meta().finalizers.clone().unwrap_or_default();
        finalizers.push(names::FINALIZER_PIPELINE.into());
        self.patch_finalizers(pipeline, finalizers).await
    }

    /// Remove the buffer-cleanup finalizer from the given pipeline, releasing it for deletion.
    async fn remove_finalizer(&self, pipeline: &Pipeline) -> Result<()> {
        let mut finalizers = pipeline.meta().finalizers.clone().unwrap_or_default();
        finalizers.retain(|finalizer| finalizer != names::FINALIZER_PIPELINE);
        self.patch_finalizers(pipeline, finalizers).await
    }

    async fn patch_finalizers(&self, pipeline: &Pipeline, finalizers: Vec<String>) -> Result<()> {
        let api: Api<Pipeline> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        timeout(API_TIMEOUT, api.patch(pipeline.name(), &PatchParams::default(), &Patch::Merge(&patch)))
            .await
            .context("timeout while patching pipeline finalizers")?
            .context("error patching pipeline finalizers")?;
        Ok(())
    }
}

/// Check if the given pipeline carries the buffer-cleanup finalizer.
fn has_finalizer(pipeline: &Pipeline) -> bool {
    pipeline
        .meta()
        .finalizers
        .as_ref()
        .map(|finalizers| finalizers.iter().any(|finalizer| finalizer == names::FINALIZER_PIPELINE))
        .unwrap_or(false)
}
