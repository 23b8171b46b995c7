use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("`{0}` timed out")]
    Timeout(String),
    #[error("Failed to execute `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{cmd}` exited with {status}: {stderr}")]
    Failed {
        cmd: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("Non-UTF8 output from `{0}`")]
    NonUtf8(String),
}

/// Run a command with arguments and a timeout, returning stdout as a String.
///
/// The child is killed if the timeout fires.
pub async fn run_command(cmd: &str, args: &[&str], timeout: Duration) -> Result<String, CommandError> {
    let output = tokio::time::timeout(
        timeout,
        tokio::process::Command::new(cmd)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| CommandError::Timeout(cmd.to_string()))?
    .map_err(|source| CommandError::Spawn {
        cmd: cmd.to_string(),
        source,
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CommandError::Failed {
            cmd: cmd.to_string(),
            status: output.status,
            stderr: stderr.trim().to_string(),
        });
    }

    let stdout = String::from_utf8(output.stdout).map_err(|_| CommandError::NonUtf8(cmd.to_string()))?;
    Ok(stdout.trim().to_string())
}

/// Check if a binary exists in PATH. Returns the full path if found.
/// Anything containing a path separator is checked as-is.
pub fn which(binary: &str) -> Option<PathBuf> {
    if binary.contains(std::path::MAIN_SEPARATOR) {
        let path = Path::new(binary);
        return path.is_file().then(|| path.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(binary))
            .find(|p| p.is_file())
    })
}
