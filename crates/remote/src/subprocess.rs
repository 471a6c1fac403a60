//! Shared child-process handling for the session implementations.
//!
//! Provides [`run_command`]: spawn a prepared [`tokio::process::Command`],
//! capture stdout and stderr, and wait for it to exit. There is no timeout;
//! a stalled command only ever blocks the node that issued it.

use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::session::{CommandOutput, SessionError};

/// Maximum stdout or stderr size captured per stream (10 MiB).
///
/// Renderers can be extremely chatty; anything past the cap is discarded.
const MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;

/// Spawn `cmd`, capture its output, and wait for it to exit.
///
/// `program` only labels spawn errors.
pub async fn run_command(cmd: &mut Command, program: &str) -> Result<CommandOutput, SessionError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();

    let mut child = cmd.spawn().map_err(|source| SessionError::Spawn {
        program: program.to_string(),
        source,
    })?;

    // Drain both pipes concurrently so a full stderr buffer cannot block
    // the child while we are still reading stdout.
    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    let status = child.wait().await.map_err(|source| SessionError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
        exit_code: status.code().unwrap_or(-1),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Read an entire output stream, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let mut limited = h.take(MAX_OUTPUT_BYTES);
        let _ = limited.read_to_end(&mut buf).await;
        // Keep draining past the cap so the child never blocks on a full pipe.
        let _ = tokio::io::copy(&mut limited.into_inner(), &mut tokio::io::sink()).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let output = run_command(&mut cmd, "sh").await.unwrap();
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let mut cmd = Command::new("tilefarm-definitely-not-installed");
        assert_matches!(
            run_command(&mut cmd, "tilefarm-definitely-not-installed").await,
            Err(SessionError::Spawn { .. })
        );
    }
}
