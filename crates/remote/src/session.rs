//! The node session capability and its result types.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

/// Captured result of one command run on a node.
///
/// A non-zero `exit_code` is not an error at this layer; callers decide
/// per command whether it is fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code (`-1` if killed by a signal).
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Output of a command that exited with `exit_code` and printed `stdout`.
    pub fn with_exit(exit_code: i32, stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code,
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty line of stderr (or stdout), for short error messages.
    pub fn summary(&self) -> String {
        [&self.stderr, &self.stdout]
            .iter()
            .flat_map(|s| s.lines().rev())
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("no output")
            .to_string()
    }
}

/// Failures of the session transport itself.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session could not be established or authenticated.
    #[error("Failed to connect to {node}: {reason}")]
    Connect { node: String, reason: String },

    /// The local helper process (`ssh`, `scp`, `sh`) could not be started.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A file copy to or from the node failed.
    #[error("Transfer of {path} on {node} failed: {reason}")]
    Transfer {
        node: String,
        path: String,
        reason: String,
    },
}

/// An open session to one render node.
#[async_trait]
pub trait NodeSession: Send + Sync {
    /// Identity of the node this session talks to.
    fn node(&self) -> &str;

    /// Run `command` through the node's shell.
    async fn exec(&self, command: &str) -> Result<CommandOutput, SessionError>;

    /// Copy a local file to `remote`, preserving its modification time.
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), SessionError>;

    /// Copy `remote` from the node into the local file `local`.
    async fn download(&self, remote: &str, local: &Path) -> Result<(), SessionError>;

    /// Release the session. Errors are logged, never returned.
    async fn close(&self) {}
}

/// Opens sessions to nodes by identity.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, node: &str) -> Result<Arc<dyn NodeSession>, SessionError>;
}
