//! Built-in receivers.
//!
//! All VM-targeting receivers read the target from the `vm-pid` parameter.
//! Pids 0 and 1 are never targeted: signalling them would hit a process
//! group or init.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::helper::{HelperConnector, ToolOutput};
use crate::pool::ConnectionPool;
use crate::protocol::{Receiver, Request, Response, ResponseType};

/// Parameter naming the target VM.
pub const VM_PID: &str = "vm-pid";

pub type VmPool = ConnectionPool<HelperConnector>;

/// Read and validate the target pid, or produce the `ERROR` to send back.
fn target_pid(request: &Request) -> Result<u32, Response> {
    let raw = request
        .parameter(VM_PID)
        .ok_or_else(|| Response::error(format!("missing '{VM_PID}' parameter")))?;
    let pid: u32 = raw
        .trim()
        .parse()
        .map_err(|_| Response::error(format!("invalid pid '{raw}'")))?;
    if pid < 2 {
        return Err(Response::error(format!("refusing to target pid {pid}")));
    }
    Ok(pid)
}

/// Answers `OK` with the agent version.
pub struct PingReceiver;

#[async_trait]
impl Receiver for PingReceiver {
    fn name(&self) -> &str {
        "PingReceiver"
    }

    async fn receive(&self, _request: &Request) -> Result<Response> {
        Ok(Response::ok().with_message(env!("CARGO_PKG_VERSION")))
    }
}

/// Sends SIGTERM to the target VM.
pub struct KillVmReceiver;

#[async_trait]
impl Receiver for KillVmReceiver {
    fn name(&self) -> &str {
        "KillVmReceiver"
    }

    async fn receive(&self, request: &Request) -> Result<Response> {
        let pid = match target_pid(request) {
            Ok(pid) => pid,
            Err(response) => return Ok(response),
        };
        info!(pid, "Terminating VM");
        terminate(pid)
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<Response> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return Ok(Response::error(format!("invalid pid '{pid}'")));
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => Ok(Response::ok().with_message(format!("sent SIGTERM to {pid}"))),
        Err(Errno::ESRCH) => Ok(Response::new(ResponseType::Nok).with_message(format!("no process with pid {pid}"))),
        Err(Errno::EPERM) => {
            Ok(Response::new(ResponseType::AuthFailed).with_message(format!("not permitted to signal {pid}")))
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to signal {pid}"))),
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> Result<Response> {
    Ok(Response::new(ResponseType::Noop).with_message("terminating VMs is not supported on this platform"))
}

/// Triggers a full garbage collection in the target VM.
pub struct GcReceiver {
    pool: Arc<VmPool>,
}

impl GcReceiver {
    pub const fn new(pool: Arc<VmPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Receiver for GcReceiver {
    fn name(&self) -> &str {
        "GcReceiver"
    }

    async fn receive(&self, request: &Request) -> Result<Response> {
        let pid = match target_pid(request) {
            Ok(pid) => pid,
            Err(response) => return Ok(response),
        };
        let Some(output) = run_tool(&self.pool, pid, &["GC.run"]).await? else {
            return Ok(not_attached(pid));
        };
        Ok(tool_response(&output, None))
    }
}

/// Writes a heap dump of the target VM into the configured directory.
pub struct HeapDumpReceiver {
    pool: Arc<VmPool>,
    dump_dir: PathBuf,
}

impl HeapDumpReceiver {
    pub const fn new(pool: Arc<VmPool>, dump_dir: PathBuf) -> Self {
        Self { pool, dump_dir }
    }

    fn dump_path(&self, pid: u32) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.dump_dir.join(format!("heapdump-{pid}-{stamp}.hprof"))
    }
}

#[async_trait]
impl Receiver for HeapDumpReceiver {
    fn name(&self) -> &str {
        "HeapDumpReceiver"
    }

    async fn receive(&self, request: &Request) -> Result<Response> {
        let pid = match target_pid(request) {
            Ok(pid) => pid,
            Err(response) => return Ok(response),
        };
        let path = self.dump_path(pid);
        let file = path.to_string_lossy().into_owned();
        let Some(output) = run_tool(&self.pool, pid, &["GC.heap_dump", file.as_str()]).await? else {
            return Ok(not_attached(pid));
        };
        Ok(tool_response(&output, Some(&path)))
    }
}

/// Run a tool against `pid` through the pool. `None` if the VM is not there.
async fn run_tool(pool: &VmPool, pid: u32, args: &[&str]) -> Result<Option<ToolOutput>> {
    let session = match pool.acquire(&pid).await {
        Ok(session) => session,
        Err(e) => {
            warn!(pid, error = %e, "Cannot attach to VM");
            return Ok(None);
        }
    };
    let result = session.run(args).await;
    drop(session);
    if let Err(e) = pool.release(&pid).await {
        warn!(pid, error = %e, "Pool release failed");
    }
    result.map(Some)
}

fn not_attached(pid: u32) -> Response {
    Response::new(ResponseType::Nok).with_message(format!("no VM with pid {pid}"))
}

fn tool_response(output: &ToolOutput, artifact: Option<&Path>) -> Response {
    if output.success() {
        match artifact {
            Some(path) => Response::ok().with_message(path.display().to_string()),
            None => Response::ok().with_message(output.stdout.trim()),
        }
    } else {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim()
        } else {
            output.stderr.trim()
        };
        Response::new(ResponseType::Nok).with_message(format!("exit code {}: {detail}", output.exit_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HelperConfig;
    use crate::endpoint::EndpointName;

    fn request(receiver: &str, pid: Option<&str>) -> Request {
        let request = Request::new(EndpointName::new("agent").unwrap(), receiver, "run");
        match pid {
            Some(pid) => request.with_parameter(VM_PID, pid),
            None => request,
        }
    }

    fn pool(jcmd: &str) -> Arc<VmPool> {
        Arc::new(ConnectionPool::new(HelperConnector::new(HelperConfig {
            jcmd: jcmd.into(),
            timeout_seconds: 5,
            ..HelperConfig::default()
        })))
    }

    #[tokio::test]
    async fn bad_pids_are_errors() {
        for pid in [None, Some("abc"), Some("-5"), Some("0"), Some("1")] {
            let response = KillVmReceiver.receive(&request("KillVmReceiver", pid)).await.unwrap();
            assert_eq!(response.response_type(), ResponseType::Error, "pid {pid:?}");
        }
    }

    #[tokio::test]
    async fn ping_answers_ok() {
        let response = PingReceiver.receive(&request("PingReceiver", None)).await.unwrap();
        assert_eq!(response.response_type(), ResponseType::Ok);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_terminates_the_target() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap().to_string();

        let response = KillVmReceiver
            .receive(&request("KillVmReceiver", Some(&pid)))
            .await
            .unwrap();
        assert_eq!(response.response_type(), ResponseType::Ok);

        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(15));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_of_missing_process_is_nok() {
        let absent = i32::MAX.to_string();
        let response = KillVmReceiver
            .receive(&request("KillVmReceiver", Some(&absent)))
            .await
            .unwrap();
        assert_eq!(response.response_type(), ResponseType::Nok);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn gc_runs_jcmd_against_the_vm() {
        let pool = pool("echo");
        let pid = std::process::id();

        let response = GcReceiver::new(Arc::clone(&pool))
            .receive(&request("GcReceiver", Some(&pid.to_string())))
            .await
            .unwrap();
        assert_eq!(response.response_type(), ResponseType::Ok);
        assert_eq!(response.message(), Some(format!("{pid} GC.run").as_str()));

        // Session is released after the call.
        assert!(pool.is_empty().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn gc_of_missing_vm_is_nok() {
        let response = GcReceiver::new(pool("echo"))
            .receive(&request("GcReceiver", Some(&i32::MAX.to_string())))
            .await
            .unwrap();
        assert_eq!(response.response_type(), ResponseType::Nok);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_tool_is_nok() {
        let response = GcReceiver::new(pool("false"))
            .receive(&request("GcReceiver", Some(&std::process::id().to_string())))
            .await
            .unwrap();
        assert_eq!(response.response_type(), ResponseType::Nok);
        assert!(response.message().unwrap().starts_with("exit code 1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_tool_is_an_exception_at_dispatch() {
        let receiver = GcReceiver::new(pool("/nonexistent/jcmd"));
        let result = receiver
            .receive(&request("GcReceiver", Some(&std::process::id().to_string())))
            .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn heap_dump_reports_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid = std::process::id();
        let receiver = HeapDumpReceiver::new(pool("echo"), dir.path().to_path_buf());

        let response = receiver
            .receive(&request("HeapDumpReceiver", Some(&pid.to_string())))
            .await
            .unwrap();
        assert_eq!(response.response_type(), ResponseType::Ok);
        let path = PathBuf::from(response.message().unwrap());
        assert!(path.starts_with(dir.path()));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&format!("heapdump-{pid}-")));
    }
}
