//! SSH sessions through the system OpenSSH client.
//!
//! Every session owns a control socket (`ControlMaster=auto`), so the
//! connect check pays the key exchange once and every later `ssh`/`scp`
//! invocation reuses that authenticated connection. The optional jump host
//! is passed as `-J` to both programs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::session::{CommandOutput, Connector, NodeSession, SessionError};
use crate::subprocess::run_command;

/// Seconds the control master stays up after its last client exits.
const CONTROL_PERSIST_SECS: u32 = 120;

/// Seconds to wait for the TCP connection during the connect check.
const CONNECT_TIMEOUT_SECS: u32 = 15;

// ---------------------------------------------------------------------------
// SshOptions
// ---------------------------------------------------------------------------

/// Connection options shared by every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    /// Private key passed with `-i`.
    pub key: Option<PathBuf>,
    /// Jump host passed with `-J`.
    pub proxy: Option<String>,
    /// Directory holding the control sockets.
    pub control_dir: PathBuf,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            key: None,
            proxy: None,
            control_dir: std::env::temp_dir(),
        }
    }
}

impl SshOptions {
    /// Options common to `ssh` and `scp` (both accept `-o`, `-i`, `-J`).
    pub fn common_args(&self) -> Vec<String> {
        let control_path = self.control_dir.join("tilefarm-%C");
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            "-o".to_string(),
            format!("ControlPersist={CONTROL_PERSIST_SECS}"),
        ];
        if let Some(key) = &self.key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        if let Some(proxy) = &self.proxy {
            args.push("-J".to_string());
            args.push(proxy.clone());
        }
        args
    }

    /// Argument vector for `ssh` running `command` on `host`.
    pub fn ssh_args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = self.common_args();
        args.push(host.to_string());
        args.push(command.to_string());
        args
    }

    /// Argument vector for `scp` copying `from` to `to`.
    ///
    /// `-p` keeps the source modification time so staleness checks on the
    /// destination compare like with like.
    pub fn scp_args(&self, from: &str, to: &str) -> Vec<String> {
        let mut args = vec!["-q".to_string(), "-p".to_string()];
        args.extend(self.common_args());
        args.push(from.to_string());
        args.push(to.to_string());
        args
    }
}

// ---------------------------------------------------------------------------
// SshSession
// ---------------------------------------------------------------------------

/// An authenticated session to one remote node.
#[derive(Debug, Clone)]
pub struct SshSession {
    host: String,
    options: SshOptions,
}

impl SshSession {
    /// Open the control connection to `host` and verify authentication.
    pub async fn connect(host: &str, options: SshOptions) -> Result<Self, SessionError> {
        let session = Self {
            host: host.to_string(),
            options,
        };

        tracing::debug!(host, proxy = ?session.options.proxy, "Opening SSH session");
        let check = session.exec("true").await?;
        if !check.success() {
            return Err(SessionError::Connect {
                node: host.to_string(),
                reason: check.summary(),
            });
        }
        tracing::info!(host, "SSH session established");
        Ok(session)
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}:{}", self.host, path)
    }

    async fn scp(&self, from: &str, to: &str, path: &str) -> Result<(), SessionError> {
        let mut cmd = Command::new("scp");
        cmd.args(self.options.scp_args(from, to));
        let output = run_command(&mut cmd, "scp").await?;
        if output.success() {
            Ok(())
        } else {
            Err(SessionError::Transfer {
                node: self.host.clone(),
                path: path.to_string(),
                reason: output.summary(),
            })
        }
    }
}

#[async_trait]
impl NodeSession for SshSession {
    fn node(&self) -> &str {
        &self.host
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, SessionError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.options.ssh_args(&self.host, command));
        run_command(&mut cmd, "ssh").await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), SessionError> {
        let from = local.display().to_string();
        self.scp(&from, &self.remote_spec(remote), remote).await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), SessionError> {
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SessionError::Transfer {
                    node: self.host.clone(),
                    path: remote.to_string(),
                    reason: e.to_string(),
                })?;
        }
        let to = local.display().to_string();
        self.scp(&self.remote_spec(remote), &to, remote).await
    }

    async fn close(&self) {
        let mut args = self.options.common_args();
        args.extend(["-O".to_string(), "exit".to_string(), self.host.clone()]);
        let mut cmd = Command::new("ssh");
        cmd.args(args);
        match run_command(&mut cmd, "ssh").await {
            Ok(output) if output.success() => {
                tracing::debug!(host = %self.host, "SSH control connection closed");
            }
            Ok(output) => {
                tracing::debug!(host = %self.host, reason = %output.summary(), "No control connection to close");
            }
            Err(e) => {
                tracing::warn!(host = %self.host, error = %e, "Failed to close SSH session");
            }
        }
    }
}

/// Opens [`SshSession`]s with shared options.
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    options: SshOptions,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, node: &str) -> Result<Arc<dyn NodeSession>, SessionError> {
        let session = SshSession::connect(node, self.options.clone()).await?;
        Ok(Arc::new(session))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
