//! The capability set the engines use to talk to the host: process spawning
//! with a wall-clock bound, path stat, glob expansion, sysfs control-file
//! writes and retry sleeps. The engines hold a `&dyn System` so tests can
//! substitute a scripted implementation; there is no process-wide state.

use std::{path::Path, process::Stdio, time::Duration};

use async_trait::async_trait;
use snafu::ResultExt;

use crate::error::{Error, GlobPattern};

/// Captured output of a successfully exited external process.
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Host interface used by the attach and detach engines.
#[async_trait]
pub trait System: Send + Sync {
    /// Run an external command. A non-zero exit maps to
    /// [`Error::ExternalExit`], an exceeded `wait` budget to
    /// [`Error::Timeout`].
    async fn run(
        &self,
        command: &str,
        args: &[String],
        wait: Option<Duration>,
    ) -> Result<CommandOutput, Error>;

    /// stat(2) a path.
    fn stat(&self, path: &Path) -> Result<(), std::io::Error>;

    /// Expand a glob pattern into matching paths.
    fn glob(&self, pattern: &str) -> Result<Vec<String>, Error>;

    /// Write `content` to `path`, truncating. Used for the SCSI control
    /// files under `/sys/class/scsi_device`.
    fn write_file(&self, path: &Path, content: &str) -> Result<(), std::io::Error>;

    /// Sleep between retry attempts.
    async fn sleep(&self, duration: Duration);
}

/// Production implementation backed by the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostSystem;

#[async_trait]
impl System for HostSystem {
    async fn run(
        &self,
        command: &str,
        args: &[String],
        wait: Option<Duration>,
    ) -> Result<CommandOutput, Error> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match wait {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| Error::Timeout {
                    command: command.to_string(),
                })??,
            None => cmd.output().await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        match output.status.code() {
            Some(0) => Ok(CommandOutput { stdout, stderr }),
            code => Err(Error::ExternalExit {
                command: command.to_string(),
                code: code.unwrap_or(-1),
                stdout,
                stderr,
            }),
        }
    }

    fn stat(&self, path: &Path) -> Result<(), std::io::Error> {
        std::fs::metadata(path).map(drop)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<String>, Error> {
        let entries = glob::glob(pattern).context(GlobPattern { pattern })?;
        Ok(entries
            .filter_map(Result::ok)
            .map(|path| path.display().to_string())
            .collect())
    }

    fn write_file(&self, path: &Path, content: &str) -> Result<(), std::io::Error> {
        use std::{io::Write, os::unix::fs::OpenOptionsExt};
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .mode(0o200)
            .open(path)?;
        file.write_all(content.as_bytes())
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
