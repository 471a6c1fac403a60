//! Session for the coordinator's own machine.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::instrument;

use crate::session::{CommandOutput, Connector, NodeSession, SessionError};
use crate::subprocess::run_command;

/// Runs commands with the local `sh` and copies files on the local disk.
#[derive(Debug, Clone)]
pub struct LocalSession {
    node: String,
}

impl LocalSession {
    pub fn new(node: impl Into<String>) -> Self {
        Self { node: node.into() }
    }
}

#[async_trait]
impl NodeSession for LocalSession {
    fn node(&self) -> &str {
        &self.node
    }

    #[instrument(skip(self), fields(node = %self.node))]
    async fn exec(&self, command: &str) -> Result<CommandOutput, SessionError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run_command(&mut cmd, "sh").await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), SessionError> {
        copy_file(&self.node, local, Path::new(remote)).await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), SessionError> {
        copy_file(&self.node, Path::new(remote), local).await
    }
}

async fn copy_file(node: &str, from: &Path, to: &Path) -> Result<(), SessionError> {
    let transfer_err = |reason: String| SessionError::Transfer {
        node: node.to_string(),
        path: from.display().to_string(),
        reason,
    };

    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| transfer_err(e.to_string()))?;
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| transfer_err(e.to_string()))?;
    Ok(())
}

/// Hands out [`LocalSession`]s; connecting never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalConnector;

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, node: &str) -> Result<Arc<dyn NodeSession>, SessionError> {
        Ok(Arc::new(LocalSession::new(node)))
    }
}
