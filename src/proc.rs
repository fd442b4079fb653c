//! Bounded subprocess execution.
//!
//! Every external CLI call in the relay funnels through [`run_command`]: a
//! single-shot spawn with captured output and a wall-clock timeout that
//! force-kills the child on expiry. There is no queueing or admission
//! control; concurrency is bounded only by the OS.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::RelayError;

/// Captured output of a finished child process.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Spawn `program args…`, wait up to `timeout`, and capture both streams.
///
/// On expiry the child is killed before the error is returned; a stuck CLI
/// can never pin the calling request indefinitely.
pub async fn run_command(
    program: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<ExecOutput, RelayError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            RelayError::ExecutableNotFound(program.display().to_string())
        } else {
            RelayError::Io(err)
        }
    })?;

    let command_line = display_command(program, args);
    debug!(command = %command_line, "spawned child");

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        }),
        Ok(Err(err)) => Err(RelayError::Io(err)),
        // kill_on_drop reaps the child once the future is dropped here.
        Err(_) => Err(RelayError::ProcessTimeout {
            command: command_line,
            timeout_secs: timeout.as_secs(),
        }),
    }
}

/// Convenience wrapper failing on non-zero exit with stderr attached.
pub async fn run_checked(
    program: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<ExecOutput, RelayError> {
    let output = run_command(program, args, timeout).await?;
    if output.success() {
        Ok(output)
    } else {
        let diagnostic = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_owned()
        } else {
            output.stderr.trim().to_owned()
        };
        Err(RelayError::ProcessFailed {
            command: display_command(program, args),
            exit_code: output.exit_code,
            stderr: diagnostic,
        })
    }
}

/// Line-forward one child pipe into a channel on a detached task. Used to
/// merge a child's stdout and stderr into a single feed; an undrained pipe
/// fills up and blocks the child, so every piped stream must go through
/// here. The task ends when the pipe closes or the receiver is gone.
pub(crate) fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

fn display_command(program: &Path, args: &[&str]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}
