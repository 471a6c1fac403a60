//! Idempotent installation of the renderer on a remote node.
//!
//! Layout under the node's working directory:
//!
//! ```text
//! <workdir>/blender/          unpacked renderer distribution
//! <workdir>/blender/blender   renderer executable
//! <workdir>/.blender-partial/ unpack target, moved into place last
//! ```
//!
//! The install directory only appears once unpacking succeeded, so an
//! interrupted install is retried on the next run.

use tilefarm_events::StatusSender;
use tilefarm_remote::{shell, NodeSession};

use crate::error::PipelineError;

/// Directory under the working directory holding the distribution.
pub const RENDERER_DIR: &str = "blender";

/// Renderer executable on a provisioned node.
pub fn remote_renderer(workdir: &str) -> String {
    format!("{workdir}/{RENDERER_DIR}/blender")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The renderer executable already existed.
    Present,
    Installed,
}

/// One shell command of the install sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionStep {
    pub name: &'static str,
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct Provisioner {
    workdir: String,
    url: Option<String>,
    packages: Vec<String>,
}

impl Provisioner {
    pub fn new(workdir: impl Into<String>, url: Option<String>, packages: Vec<String>) -> Self {
        Self {
            workdir: workdir.into(),
            url,
            packages,
        }
    }

    fn install_dir(&self) -> String {
        format!("{}/{RENDERER_DIR}", self.workdir)
    }

    fn partial_dir(&self) -> String {
        format!("{}/.{RENDERER_DIR}-partial", self.workdir)
    }

    /// Commands that install the renderer from `url`, in order.
    pub fn plan(&self, url: &str) -> Vec<ProvisionStep> {
        let install_q = shell::quote(&self.install_dir());
        let partial_q = shell::quote(&self.partial_dir());
        let archive = format!("{}/{}", self.workdir, archive_name(url));
        let (archive_q, url_q) = (shell::quote(&archive), shell::quote(url));

        let mut steps = vec![ProvisionStep {
            name: "create directories",
            command: format!("rm -rf {partial_q} && mkdir -p {partial_q}"),
        }];

        if !self.packages.is_empty() {
            steps.push(ProvisionStep {
                name: "install packages",
                command: format!(
                    "sudo DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
                    shell::join(&self.packages)
                ),
            });
        }

        steps.push(ProvisionStep {
            name: "download",
            command: format!(
                "if command -v wget >/dev/null 2>&1; then wget -q -O {archive_q} {url_q}; \
                 else curl -fsSL -o {archive_q} {url_q}; fi"
            ),
        });
        steps.push(ProvisionStep {
            name: "unpack",
            command: format!("tar -xf {archive_q} -C {partial_q} --strip-components=1"),
        });
        steps.push(ProvisionStep {
            name: "install",
            command: format!("rm -rf {install_q} && mv {partial_q} {install_q}"),
        });
        steps.push(ProvisionStep {
            name: "remove archive",
            command: format!("rm -f {archive_q}"),
        });
        steps
    }

    /// Install the renderer unless its executable is present.
    ///
    /// Any step exiting non-zero aborts with [`PipelineError::Provisioning`].
    pub async fn ensure(
        &self,
        session: &dyn NodeSession,
        status: &StatusSender,
    ) -> Result<ProvisionOutcome, PipelineError> {
        let node = session.node();
        let check = session
            .exec(&format!("test -x {}", shell::quote(&remote_renderer(&self.workdir))))
            .await?;
        if check.success() {
            return Ok(ProvisionOutcome::Present);
        }

        let url = self.url.as_deref().ok_or_else(|| PipelineError::Provisioning {
            node: node.to_string(),
            step: "download".to_string(),
            exit_code: -1,
            detail: "no renderer distributable URL configured".to_string(),
        })?;

        for step in self.plan(url) {
            status.report(node, format!("provisioning: {}", step.name)).await;
            let output = session.exec(&step.command).await?;
            if !output.success() {
                return Err(PipelineError::Provisioning {
                    node: node.to_string(),
                    step: step.name.to_string(),
                    exit_code: output.exit_code,
                    detail: output.summary(),
                });
            }
            tracing::debug!(node, step = step.name, duration_ms = output.duration_ms, "Provisioning step done");
        }
        Ok(ProvisionOutcome::Installed)
    }
}

/// File name the distributable is saved under (`.../blender-4.1.tar.xz?x=1` -> `blender-4.1.tar.xz`).
fn archive_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.trim_end_matches('/').rsplit('/').next() {
        Some(name) if !name.is_empty() && !name.contains(':') => name,
        _ => "renderer.tar",
    }
}
