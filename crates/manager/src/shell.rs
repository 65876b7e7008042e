//! Shell command execution shared by hooks and DNS responders.

use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::trace;

#[derive(Debug)]
pub(crate) enum ShellError {
    Spawn(std::io::Error),
    Timeout,
}

/// Run `command` through `sh -c` with extra environment variables.
///
/// The child is killed if it outlives `timeout`.
pub(crate) async fn run_shell(
    command: &str,
    envs: &[(&str, String)],
    timeout: Duration,
) -> Result<Output, ShellError> {
    trace!(command = %command, "Running shell command");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result.map_err(ShellError::Spawn),
        Err(_) => Err(ShellError::Timeout),
    }
}

/// Last few hundred bytes of stderr, for error messages
pub(crate) fn stderr_tail(output: &Output) -> String {
    const LIMIT: usize = 512;
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if trimmed.len() <= LIMIT {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - LIMIT;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}
