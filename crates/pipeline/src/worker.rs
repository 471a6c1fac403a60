//! Per-node lifecycle: connect, provision, stage, render until stopped.
//!
//! ```text
//! Disconnected -> Connecting -> Provisioning -> Staging -> Rendering -> Draining -> Done
//!                      \______________\______________\
//!                                                     -> Failed
//! ```
//!
//! The local node skips straight from `Disconnected` to `Rendering` and
//! renders against the local filesystem.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tilefarm_core::naming::artifact_name;
use tilefarm_core::region::Region;
use tilefarm_core::types::is_local_node;
use tilefarm_events::StatusSender;
use tilefarm_remote::{Connector, NodeSession};

use crate::error::PipelineError;
use crate::job::{file_name, Job, TEXTURE_DIR};
use crate::provision::{remote_renderer, Provisioner};
use crate::queue::{Dequeued, WorkQueue};
use crate::render::RenderCommand;
use crate::stager::{FileStager, Mirror, StageOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Disconnected,
    Connecting,
    Provisioning,
    Staging,
    Rendering,
    Draining,
    Done,
    /// Abandoned after a connection, provisioning or staging failure.
    Failed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Provisioning => "provisioning",
            Self::Staging => "staging",
            Self::Rendering => "rendering",
            Self::Draining => "draining",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Final account of one node's run.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node: String,
    pub state: NodeState,
    /// Regions whose artifact reached the local artifact directory.
    pub rendered: usize,
    pub failed: Vec<Region>,
    /// Why the node was abandoned, for `Failed`.
    pub error: Option<String>,
}

/// Exit status `ssh` reports when the connection itself failed.
const SSH_CONNECTION_LOST: i32 = 255;

/// Scope of a failure inside the render loop.
#[derive(Debug)]
enum RegionError {
    /// Only this region is lost; the node carries on.
    Region(PipelineError),
    /// The session is unusable; the node is abandoned.
    Node(PipelineError),
}

/// Paths a node renders with, as seen by that node.
#[derive(Debug, Clone)]
struct Workspace {
    renderer: String,
    scene: String,
    hook: String,
    job_dir: String,
    /// Whether artifacts must be copied back from the node.
    remote: bool,
}

pub struct NodeWorker {
    node: String,
    job: Arc<Job>,
    connector: Arc<dyn Connector>,
    queue: Arc<WorkQueue<Region>>,
    status: StatusSender,
    mirror: Option<Arc<Mirror>>,
    state: NodeState,
    rendered: usize,
    failed: Vec<Region>,
}

impl NodeWorker {
    pub fn new(
        node: impl Into<String>,
        job: Arc<Job>,
        connector: Arc<dyn Connector>,
        queue: Arc<WorkQueue<Region>>,
        status: StatusSender,
        mirror: Option<Arc<Mirror>>,
    ) -> Self {
        Self {
            node: node.into(),
            job,
            connector,
            queue,
            status,
            mirror,
            state: NodeState::Disconnected,
            rendered: 0,
            failed: Vec::new(),
        }
    }

    /// Drive the node to a terminal state.
    ///
    /// Errors never escape: an abandoned node ends in [`NodeState::Failed`]
    /// and leaves its share of the queue to the others.
    pub async fn run(mut self) -> NodeReport {
        let error = match self.drive().await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(node = %self.node, state = %self.state, error = %e, "Node abandoned");
                self.status.report(&self.node, format!("failed: {e}")).await;
                self.state = NodeState::Failed;
                Some(e.to_string())
            }
        };

        NodeReport {
            node: self.node,
            state: self.state,
            rendered: self.rendered,
            failed: self.failed,
            error,
        }
    }

    async fn drive(&mut self) -> Result<(), PipelineError> {
        let local = is_local_node(&self.node);
        if !local {
            self.transition(NodeState::Connecting).await;
        }
        let session = self
            .connector
            .connect(&self.node)
            .await
            .map_err(|source| PipelineError::Connection {
                node: self.node.clone(),
                source,
            })?;

        let result = self.serve(&session, local).await;
        session.close().await;
        result
    }

    async fn serve(&mut self, session: &Arc<dyn NodeSession>, local: bool) -> Result<(), PipelineError> {
        let workspace = if local {
            Workspace {
                renderer: self.job.config.renderer.clone(),
                scene: self.job.scene.display().to_string(),
                hook: self.job.hook.display().to_string(),
                job_dir: self.job.artifact_dir.display().to_string(),
                remote: false,
            }
        } else {
            self.transition(NodeState::Provisioning).await;
            let config = &self.job.config;
            Provisioner::new(config.workdir.clone(), config.url.clone(), config.packages.clone())
                .ensure(session.as_ref(), &self.status)
                .await?;

            self.transition(NodeState::Staging).await;
            self.stage(session).await?
        };

        self.transition(NodeState::Rendering).await;
        self.render_loop(session.as_ref(), &workspace).await?;

        self.transition(NodeState::Draining).await;
        self.transition(NodeState::Done).await;
        Ok(())
    }

    /// Mirror the scene, its textures and the hook into the job directory.
    async fn stage(&self, session: &Arc<dyn NodeSession>) -> Result<Workspace, PipelineError> {
        let job = &self.job;
        let job_dir = job.remote_job_dir();
        let stager = FileStager::new(Arc::clone(session), job.config.overwrite)
            .with_mirror(self.mirror.clone());

        stager.make_dirs(&[job_dir.clone()]).await?;

        let scene = format!("{job_dir}/{}", file_name(&job.scene)?);
        let outcome = stager.copy(&job.scene, &scene).await?;
        self.report_staged(&scene, outcome).await;

        if let Some(textures) = job.texture_dir() {
            let remote = format!("{job_dir}/{TEXTURE_DIR}");
            let outcomes = stager.copy_tree(&textures, &remote).await?;
            let sent = outcomes.iter().filter(|o| **o != StageOutcome::Skipped).count();
            self.status
                .report(&self.node, format!("staged {remote}: {sent} of {} files sent", outcomes.len()))
                .await;
        }

        let hook = format!("{job_dir}/{}", file_name(&job.hook)?);
        let outcome = stager.copy(&job.hook, &hook).await?;
        self.report_staged(&hook, outcome).await;

        Ok(Workspace {
            renderer: remote_renderer(&job.config.workdir),
            scene,
            hook,
            job_dir,
            remote: true,
        })
    }

    async fn report_staged(&self, path: &str, outcome: StageOutcome) {
        let verb = match outcome {
            StageOutcome::Skipped => "up to date",
            StageOutcome::Mirrored => "fetched from mirror",
            StageOutcome::Uploaded => "uploaded",
        };
        self.status.report(&self.node, format!("staged {path}: {verb}")).await;
    }

    /// Render regions until a stop marker arrives.
    ///
    /// A failed region is recorded and still acked so the queue drains. A
    /// lost session hands the region back to the queue and abandons the node.
    async fn render_loop(&mut self, session: &dyn NodeSession, workspace: &Workspace) -> Result<(), PipelineError> {
        loop {
            let region = match self.queue.get().await {
                Dequeued::Item(region) => region,
                Dequeued::Stop => return Ok(()),
            };

            match self.render_region(session, workspace, region).await {
                Ok(artifact) => {
                    self.rendered += 1;
                    self.status.completed(&self.node, &artifact).await;
                }
                Err(RegionError::Region(e)) => {
                    tracing::warn!(node = %self.node, %region, error = %e, "Region failed");
                    self.failed.push(region);
                    self.status
                        .report(&self.node, format!("region {region} failed: {e}"))
                        .await;
                }
                Err(RegionError::Node(e)) => {
                    if let Err(err) = self.queue.requeue(region).await {
                        tracing::error!(node = %self.node, error = %err, "Queue requeue rejected");
                    }
                    return Err(e);
                }
            }

            if let Err(e) = self.queue.ack().await {
                tracing::error!(node = %self.node, error = %e, "Queue ack rejected");
            }
        }
    }

    /// Render one region and bring its artifact into the artifact directory.
    async fn render_region(
        &self,
        session: &dyn NodeSession,
        workspace: &Workspace,
        region: Region,
    ) -> Result<String, RegionError> {
        let command = RenderCommand {
            renderer: workspace.renderer.clone(),
            scene: workspace.scene.clone(),
            hook: workspace.hook.clone(),
            job_dir: workspace.job_dir.clone(),
            stem: self.job.stem.clone(),
            region,
        };
        self.status
            .report(&self.node, command.preview(self.job.config.verbose))
            .await;

        let output = session
            .exec(&command.command_line())
            .await
            .map_err(|e| RegionError::Node(e.into()))?;
        if !output.success() {
            let err = PipelineError::Command {
                node: self.node.clone(),
                exit_code: output.exit_code,
                detail: output.summary(),
            };
            return Err(if workspace.remote && output.exit_code == SSH_CONNECTION_LOST {
                RegionError::Node(err)
            } else {
                RegionError::Region(err)
            });
        }
        tracing::debug!(node = %self.node, %region, duration_ms = output.duration_ms, "Region rendered");

        let artifact = artifact_name(&self.job.stem, &region);
        let local = self.job.artifact_dir.join(&artifact);
        if workspace.remote {
            session
                .download(&command.artifact_path(), &local)
                .await
                .map_err(|e| RegionError::Region(e.into()))?;
        }
        if !local.is_file() {
            return Err(RegionError::Region(PipelineError::Command {
                node: self.node.clone(),
                exit_code: output.exit_code,
                detail: format!("renderer wrote no artifact at {}", local.display()),
            }));
        }
        Ok(artifact)
    }

    async fn transition(&mut self, next: NodeState) {
        tracing::debug!(node = %self.node, from = %self.state, to = %next, "Node state change");
        self.state = next;
        self.status.report(&self.node, next.to_string()).await;
    }
}
