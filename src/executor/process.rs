//! External command runner shared by the executors

use std::collections::BTreeMap;
use std::process::Stdio;

use tokio::io::BufReader;
use tokio::process::Command;
use tracing::debug;

use super::LogSink;
use crate::error::{LifecycleError, Result};
use crate::protocol::read_line_lossy;

/// Run a command to completion, streaming stdout and stderr lines into `log`.
///
/// Succeeds iff the process exits with code 0; otherwise fails with the
/// captured stderr text (or the exit status when stderr was empty). The
/// process is not killed if the caller stops awaiting.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    log: &LogSink,
) -> Result<()> {
    debug!(program = %program, args = ?args, "Running installer command");

    let mut child = Command::new(program)
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            LifecycleError::InstallationExecutionFailure(format!("Failed to spawn {}: {}", program, e))
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let forward_stdout = async {
        if let Some(stdout) = stdout {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            while let Ok(Some(line)) = read_line_lossy(&mut reader, &mut buf).await {
                log.line(line);
            }
        }
    };

    let capture_stderr = async {
        let mut captured = Vec::new();
        if let Some(stderr) = stderr {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            while let Ok(Some(line)) = read_line_lossy(&mut reader, &mut buf).await {
                log.line(line.clone());
                captured.push(line);
            }
        }
        captured
    };

    let ((), captured, status) = tokio::join!(forward_stdout, capture_stderr, child.wait());
    let status = status?;

    if status.success() {
        return Ok(());
    }

    let stderr_text = captured.join("\n");
    let message = if stderr_text.trim().is_empty() {
        format!("{} exited with {}", program, status)
    } else {
        stderr_text
    };
    Err(LifecycleError::InstallationExecutionFailure(message))
}
