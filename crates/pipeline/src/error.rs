use tilefarm_core::error::CoreError;
use tilefarm_remote::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The node could not be reached; it is abandoned for this run.
    #[error("Connection to {node} failed: {source}")]
    Connection {
        node: String,
        #[source]
        source: SessionError,
    },

    /// A provisioning step exited non-zero.
    #[error("Provisioning {node} failed at `{step}` (exit {exit_code}): {detail}")]
    Provisioning {
        node: String,
        step: String,
        exit_code: i32,
        detail: String,
    },

    /// A remote or local command exited non-zero.
    #[error("Command on {node} failed (exit {exit_code}): {detail}")]
    Command {
        node: String,
        exit_code: i32,
        detail: String,
    },

    /// The session transport failed while running a command or copying a file.
    #[error(transparent)]
    Transfer(#[from] SessionError),

    /// Local preparation of files to stage failed.
    #[error("Staging {path} failed: {reason}")]
    Staging { path: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(#[source] CoreError),

    /// Building the final image failed.
    #[error("Compositing failed: {0}")]
    Composite(#[from] CoreError),
}

impl PipelineError {
    pub fn staging(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        Self::Staging {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }
}
