//! Attaching to a target VM with `jcmd`.
//!
//! A [`VmSession`] is the pooled per-VM handle: it remembers the target pid
//! and runs diagnostic commands against it. [`HelperConnector`] creates
//! sessions for the [`ConnectionPool`](crate::pool::ConnectionPool) after
//! checking that the process is actually there.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::HelperConfig;
use crate::pool::Connector;

/// Captured result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Diagnostic access to one running VM.
#[derive(Debug)]
pub struct VmSession {
    pid: u32,
    jcmd: PathBuf,
    timeout: Duration,
}

impl VmSession {
    pub(crate) fn new(pid: u32, config: &HelperConfig) -> Self {
        Self {
            pid,
            jcmd: config.jcmd.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Run `jcmd <pid> <args...>` and capture its output.
    ///
    /// The tool is killed if it outlives the configured timeout.
    #[instrument(skip(self), fields(pid = self.pid, jcmd = %self.jcmd.display()))]
    pub async fn run(&self, args: &[&str]) -> Result<ToolOutput> {
        let mut child = Command::new(&self.jcmd)
            .arg(self.pid.to_string())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.jcmd.display()))?;

        // Pipes are taken out so `child` stays available for kill-on-timeout.
        let mut child_stdout = child.stdout.take().context("Failed to open stdout")?;
        let mut child_stderr = child.stderr.take().context("Failed to open stderr")?;

        let read_all = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (r1, r2) = tokio::join!(
                child_stdout.read_to_end(&mut stdout_buf),
                child_stderr.read_to_end(&mut stderr_buf),
            );
            r1.context("Failed to read stdout")?;
            r2.context("Failed to read stderr")?;
            Ok::<_, anyhow::Error>((stdout_buf, stderr_buf))
        };

        let (stdout_buf, stderr_buf) =
            if let Ok(result) = tokio::time::timeout(self.timeout, read_all).await {
                result?
            } else {
                let _ = child.kill().await;
                anyhow::bail!("{} timed out after {}s", self.jcmd.display(), self.timeout.as_secs());
            };

        let status = child.wait().await.context("Failed to wait for process")?;

        let output = ToolOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        };
        debug!(exit_code = output.exit_code, "Helper tool finished");
        Ok(output)
    }
}

/// Creates [`VmSession`]s keyed by pid.
#[derive(Debug, Clone)]
pub struct HelperConnector {
    config: HelperConfig,
}

impl HelperConnector {
    pub const fn new(config: HelperConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for HelperConnector {
    type Key = u32;
    type Connection = VmSession;

    async fn connect(&self, pid: &u32) -> Result<VmSession> {
        if !process_exists(*pid) {
            anyhow::bail!("no process with pid {pid}");
        }
        debug!(pid, "Attached to VM");
        Ok(VmSession::new(*pid, &self.config))
    }

    async fn disconnect(&self, pid: &u32, _session: Arc<VmSession>) {
        debug!(pid, "Detached from VM");
    }
}

/// Whether a process with `pid` is running (possibly as another user).
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

/// Liveness is left to the helper tool itself on this platform.
#[cfg(not(unix))]
pub const fn process_exists(_pid: u32) -> bool {
    true
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn config(jcmd: &str, timeout_seconds: u64) -> HelperConfig {
        HelperConfig {
            jcmd: jcmd.into(),
            timeout_seconds,
            ..HelperConfig::default()
        }
    }

    #[tokio::test]
    async fn run_passes_pid_then_arguments() {
        let session = VmSession::new(4242, &config("echo", 5));
        let output = session.run(&["GC.run"]).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "4242 GC.run");
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit() {
        let session = VmSession::new(4242, &config("false", 5));
        let output = session.run(&[]).await.unwrap();
        assert!(!output.success());
    }

    #[tokio::test]
    async fn run_kills_tool_on_timeout() {
        // `sleep 30` outlives the one second budget.
        let session = VmSession::new(30, &config("sleep", 1));
        let err = session.run(&[]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn run_missing_tool_fails() {
        let session = VmSession::new(4242, &config("/nonexistent/jcmd", 5));
        let err = session.run(&["VM.version"]).await.unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn connector_requires_a_live_process() {
        let connector = HelperConnector::new(config("echo", 5));

        let own = std::process::id();
        let session = connector.connect(&own).await.unwrap();
        assert_eq!(session.pid(), own);

        // Above any kernel pid_max.
        let absent = u32::try_from(i32::MAX).unwrap();
        assert!(connector.connect(&absent).await.is_err());
    }
}
