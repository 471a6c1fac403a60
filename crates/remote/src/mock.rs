//! Scripted test doubles for [`NodeSession`] and [`Connector`].
//!
//! [`MockSession`] records every command and transfer, answers commands
//! from canned responses matched by prefix, and keeps an in-memory table
//! of remote files so `stat` checks see what earlier uploads wrote.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;

use crate::session::{CommandOutput, Connector, NodeSession, SessionError};
use crate::shell::unquote;

/// Size and modification time (epoch seconds) of a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockFile {
    pub size: u64,
    pub mtime: i64,
}

type DownloadHook = Box<dyn Fn(&str, &Path) -> std::io::Result<()> + Send + Sync>;

/// In-memory stand-in for a node session.
pub struct MockSession {
    node: String,
    responses: Mutex<Vec<(String, CommandOutput)>>,
    creations: Mutex<Vec<(String, String, MockFile)>>,
    exec_errors: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, MockFile>>,
    commands: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(PathBuf, String)>>,
    downloads: Mutex<Vec<(String, PathBuf)>>,
    download_hook: Option<DownloadHook>,
    fail_uploads: AtomicBool,
    closed: AtomicBool,
}

impl MockSession {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            responses: Mutex::new(Vec::new()),
            creations: Mutex::new(Vec::new()),
            exec_errors: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            downloads: Mutex::new(Vec::new()),
            download_hook: None,
            fail_uploads: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Answer every command starting with `prefix` with `output`.
    ///
    /// Earlier registrations win over later ones.
    pub fn respond(self, prefix: &str, output: CommandOutput) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push((prefix.to_string(), output));
        self
    }

    /// Make every command starting with `prefix` fail in the transport
    /// (as a dropped connection does) instead of returning output.
    pub fn exec_error(self, prefix: &str) -> Self {
        self.exec_errors.lock().unwrap().push(prefix.to_string());
        self
    }

    /// Record `path` on the node whenever a command starting with `prefix`
    /// succeeds, as a fetch or render command would leave it.
    pub fn creates_file(self, prefix: &str, path: &str, size: u64, mtime: i64) -> Self {
        self.creations.lock().unwrap().push((
            prefix.to_string(),
            path.to_string(),
            MockFile { size, mtime },
        ));
        self
    }

    /// Pretend `path` already exists on the node.
    pub fn with_file(self, path: &str, size: u64, mtime: i64) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), MockFile { size, mtime });
        self
    }

    /// Produce the local file for each download (default: an empty file).
    pub fn with_download_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &Path) -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.download_hook = Some(Box::new(hook));
        self
    }

    /// Make every subsequent upload fail.
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Commands that start with `prefix`.
    pub fn commands_starting_with(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn downloads(&self) -> Vec<(String, PathBuf)> {
        self.downloads.lock().unwrap().clone()
    }

    pub fn file(&self, path: &str) -> Option<MockFile> {
        self.files.lock().unwrap().get(path).copied()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Emulate `stat -c '%s %Y' <path>` against the file table.
    fn stat(&self, command: &str) -> CommandOutput {
        let path = command.rsplit(' ').next().map(unquote).unwrap_or_default();
        match self.files.lock().unwrap().get(&path) {
            Some(f) => CommandOutput::with_exit(0, format!("{} {}\n", f.size, f.mtime)),
            None => CommandOutput {
                stderr: format!("stat: cannot statx '{path}': No such file or directory"),
                exit_code: 1,
                ..CommandOutput::default()
            },
        }
    }
}

#[async_trait]
impl NodeSession for MockSession {
    fn node(&self) -> &str {
        &self.node
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, SessionError> {
        self.commands.lock().unwrap().push(command.to_string());

        let broken = self
            .exec_errors
            .lock()
            .unwrap()
            .iter()
            .any(|prefix| command.starts_with(prefix.as_str()));
        if broken {
            return Err(SessionError::Spawn {
                program: "ssh".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset by peer"),
            });
        }

        let canned = self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone());
        let output = match canned {
            Some(output) => output,
            None if command.starts_with("stat ") => return Ok(self.stat(command)),
            None => CommandOutput::default(),
        };

        if output.success() {
            let created: Vec<(String, MockFile)> = self
                .creations
                .lock()
                .unwrap()
                .iter()
                .filter(|(prefix, _, _)| command.starts_with(prefix.as_str()))
                .map(|(_, path, file)| (path.clone(), *file))
                .collect();
            self.files.lock().unwrap().extend(created);
        }
        Ok(output)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), SessionError> {
        self.uploads
            .lock()
            .unwrap()
            .push((local.to_path_buf(), remote.to_string()));

        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(SessionError::Transfer {
                node: self.node.clone(),
                path: remote.to_string(),
                reason: "upload refused by mock".to_string(),
            });
        }

        let meta = std::fs::metadata(local).map_err(|e| SessionError::Transfer {
            node: self.node.clone(),
            path: local.display().to_string(),
            reason: e.to_string(),
        })?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64);
        self.files.lock().unwrap().insert(
            remote.to_string(),
            MockFile {
                size: meta.len(),
                mtime,
            },
        );
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), SessionError> {
        self.downloads
            .lock()
            .unwrap()
            .push((remote.to_string(), local.to_path_buf()));

        let result = match &self.download_hook {
            Some(hook) => hook(remote, local),
            None => std::fs::write(local, b""),
        };
        result.map_err(|e| SessionError::Transfer {
            node: self.node.clone(),
            path: remote.to_string(),
            reason: e.to_string(),
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector handing out pre-built [`MockSession`]s.
#[derive(Default)]
pub struct MockConnector {
    sessions: HashMap<String, Arc<MockSession>>,
    unreachable: HashSet<String>,
    attempts: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `session` for its node.
    pub fn with_session(mut self, session: Arc<MockSession>) -> Self {
        self.sessions.insert(session.node().to_string(), session);
        self
    }

    /// Refuse connections to `node`.
    pub fn with_unreachable(mut self, node: &str) -> Self {
        self.unreachable.insert(node.to_string());
        self
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, node: &str) -> Result<Arc<dyn NodeSession>, SessionError> {
        self.attempts.lock().unwrap().push(node.to_string());
        if self.unreachable.contains(node) {
            return Err(SessionError::Connect {
                node: node.to_string(),
                reason: "Permission denied (publickey)".to_string(),
            });
        }
        match self.sessions.get(node) {
            Some(session) => Ok(Arc::clone(session) as Arc<dyn NodeSession>),
            None => Err(SessionError::Connect {
                node: node.to_string(),
                reason: "no route to host".to_string(),
            }),
        }
    }
}
