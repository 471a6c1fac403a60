//! Runs one job end to end.
//!
//! Sequence: partition -> fill the queue -> start the reporter and one
//! worker per node -> wait for the queue to drain -> one stop marker per
//! node -> join every worker -> exit event to the reporter -> composite.

use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tilefarm_core::compositor::{composite_dir, CompositeReport};
use tilefarm_core::config::RenderConfig;
use tilefarm_core::region::{partition, Region};
use tilefarm_events::{ProgressReporter, ProgressState, StatusView};
use tilefarm_remote::Connector;

use crate::error::PipelineError;
use crate::hook::HookSource;
use crate::job::Job;
use crate::queue::WorkQueue;
use crate::stager::{HttpLookup, Mirror, MirrorLookup};
use crate::worker::{NodeReport, NodeState, NodeWorker};

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Regions the image was split into.
    pub total: usize,
    /// Completion events the reporter consumed.
    pub completed: usize,
    pub nodes: Vec<NodeReport>,
    #[serde(skip)]
    pub composite: Option<CompositeReport>,
    pub composite_error: Option<String>,
}

impl RunSummary {
    pub fn failed_regions(&self) -> Vec<Region> {
        self.nodes.iter().flat_map(|n| n.failed.iter().copied()).collect()
    }

    /// Every region rendered and composited into the final image.
    pub fn is_success(&self) -> bool {
        let composited = self.composite.as_ref().is_some_and(|c| c.layers == self.total);
        composited && self.completed == self.total && self.failed_regions().is_empty()
    }

    pub fn log(&self) {
        for node in &self.nodes {
            tracing::info!(
                node = %node.node,
                state = %node.state,
                rendered = node.rendered,
                failed = node.failed.len(),
                error = node.error.as_deref().unwrap_or(""),
                "Node summary",
            );
        }
        if self.is_success() {
            tracing::info!(completed = self.completed, total = self.total, "Render succeeded");
        } else {
            tracing::error!(
                completed = self.completed,
                total = self.total,
                failed_regions = self.failed_regions().len(),
                composite_error = self.composite_error.as_deref().unwrap_or(""),
                "Render failed",
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    config: RenderConfig,
    connector: Arc<dyn Connector>,
    lookup: Arc<dyn MirrorLookup>,
}

impl Coordinator {
    pub fn new(config: RenderConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            lookup: Arc::new(HttpLookup::new()),
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn MirrorLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    /// Render `scene` across every configured node and write `output`.
    ///
    /// Only setup failures (invalid configuration, unreadable scene) are
    /// returned as errors; node and region failures land in the summary.
    /// If every node is abandoned while regions remain, this never returns.
    pub async fn run<V>(
        &self,
        scene: &Path,
        output: &Path,
        hook: &HookSource,
        view: V,
    ) -> Result<RunSummary, PipelineError>
    where
        V: StatusView + 'static,
    {
        self.config.validate().map_err(PipelineError::Config)?;
        let regions = partition(self.config.region).map_err(PipelineError::Config)?;
        let total = regions.len();
        let job = Arc::new(Job::prepare(scene, output, hook, self.config.clone())?);

        tracing::info!(
            scene = %job.scene.display(),
            regions = total,
            nodes = self.config.nodes.len(),
            artifacts = %job.artifact_dir.display(),
            "Starting render",
        );

        let queue = Arc::new(WorkQueue::new());
        for region in &regions {
            queue.put(*region).await;
        }

        let mirror = self
            .config
            .web
            .clone()
            .map(|web| Arc::new(Mirror::new(web, Arc::clone(&self.lookup))));

        let (status, reporter) = ProgressReporter::spawn(total, view);

        let handles: Vec<_> = self
            .config
            .nodes
            .iter()
            .map(|node| {
                let worker = NodeWorker::new(
                    node.clone(),
                    Arc::clone(&job),
                    Arc::clone(&self.connector),
                    Arc::clone(&queue),
                    status.clone(),
                    mirror.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        queue.join().await;
        tracing::info!("Queue drained, stopping workers");
        for _ in &self.config.nodes {
            queue.stop().await;
        }

        let nodes: Vec<NodeReport> = join_all(handles)
            .await
            .into_iter()
            .zip(&self.config.nodes)
            .map(|(joined, node)| {
                joined.unwrap_or_else(|e| {
                    tracing::error!(node = %node, error = %e, "Node worker task panicked");
                    NodeReport {
                        node: node.clone(),
                        state: NodeState::Failed,
                        rendered: 0,
                        failed: Vec::new(),
                        error: Some(e.to_string()),
                    }
                })
            })
            .collect();

        status.exit().await;
        let progress = reporter.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Status reporter task failed");
            ProgressState::new(total)
        });

        let (composite, composite_error) = match self.composite(&job, regions).await {
            Ok(report) => (Some(report), None),
            Err(e) => {
                tracing::error!(error = %e, "Compositing failed");
                (None, Some(e.to_string()))
            }
        };

        Ok(RunSummary {
            total,
            completed: progress.completed,
            nodes,
            composite,
            composite_error,
        })
    }

    async fn composite(&self, job: &Job, regions: Vec<Region>) -> Result<CompositeReport, PipelineError> {
        let (dir, stem, output) = (job.artifact_dir.clone(), job.stem.clone(), job.output.clone());
        let cleanup = self.config.cleanup;
        tokio::task::spawn_blocking(move || composite_dir(&dir, &stem, &regions, &output, cleanup))
            .await
            .map_err(|e| PipelineError::staging(&job.output, format!("composite task failed: {e}")))?
            .map_err(PipelineError::from)
    }
}
