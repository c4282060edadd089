//! Command execution for deskbox-server.
//!
//! Every process runs in its own process group so a timeout can take down
//! the whole tree. Output is captured by reader tasks into shared buffers,
//! which keeps partial output available after a kill.

use crate::protocol::{ExecResult, Interpreter, RpcFailure};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Maximum captured bytes per stream (1 MB).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

const TRUNCATED_MARKER: &[u8] = b"\n... [output truncated]";

/// How long reader tasks may keep draining after the process is gone.
/// Background grandchildren can hold the pipes open indefinitely.
const READER_GRACE: Duration = Duration::from_secs(2);

type Buffer = Arc<Mutex<Vec<u8>>>;

/// Build the command for a `run_command` request.
///
/// # Errors
/// Returns `INVALID_PARAMS` if a module name is not a dotted identifier.
pub fn build_command(
    interpreter: Interpreter,
    code: &str,
    modules: &[String],
    python: &str,
) -> Result<Command, RpcFailure> {
    match interpreter {
        Interpreter::Shell => {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", code]);
            Ok(cmd)
        }
        Interpreter::Python => {
            let mut script = String::new();
            for module in modules {
                if !is_module_name(module) {
                    return Err(RpcFailure::invalid_params(format!(
                        "invalid module name: {module:?}"
                    )));
                }
                script.push_str("import ");
                script.push_str(module);
                script.push('\n');
            }
            script.push_str(code);

            let mut cmd = Command::new(python);
            cmd.args(["-c", &script]);
            Ok(cmd)
        }
    }
}

/// `a`, `a.b`, `_x.y2`; no empty segments.
fn is_module_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

/// Run a command to completion or until `timeout` expires.
///
/// On timeout the whole process group receives `SIGKILL` and the result
/// carries whatever output was captured, with `timed_out` set and no exit
/// code.
///
/// # Errors
/// Returns an error if the process cannot be spawned.
pub async fn run_process(mut cmd: Command, timeout: Duration) -> std::io::Result<ExecResult> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = cmd.spawn()?;
    let pid = child.id();
    debug!(pid = ?pid, timeout_ms = timeout.as_millis() as u64, "process spawned");

    let stdout_buf: Buffer = Arc::default();
    let stderr_buf: Buffer = Arc::default();
    let readers = [
        child
            .stdout
            .take()
            .map(|s| spawn_reader(s, stdout_buf.clone())),
        child
            .stderr
            .take()
            .map(|s| spawn_reader(s, stderr_buf.clone())),
    ];

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (status.code(), false),
        Ok(Err(e)) => {
            warn!(error = %e, "failed to wait for process");
            kill_group(&mut child).await;
            (None, false)
        }
        Err(_) => {
            warn!(pid = ?pid, "process timed out, killing process group");
            kill_group(&mut child).await;
            (None, true)
        }
    };

    for reader in readers.into_iter().flatten() {
        drain(reader).await;
    }

    let stdout = take(&stdout_buf);
    let stderr = take(&stderr_buf);
    let duration_ms = started.elapsed().as_millis() as u64;
    debug!(
        exit_code = ?exit_code,
        timed_out,
        stdout_len = stdout.len(),
        stderr_len = stderr.len(),
        duration_ms,
        "process completed"
    );
    trace!(stdout = %String::from_utf8_lossy(&stdout), stderr = %String::from_utf8_lossy(&stderr), "process output");

    Ok(ExecResult {
        exit_code,
        stdout,
        stderr,
        duration_ms,
        timed_out,
    })
}

/// Spawn a process that outlives the request, returning its pid.
///
/// The child is reaped in the background.
///
/// # Errors
/// Returns an error if the process cannot be spawned.
pub fn spawn_detached(mut cmd: Command) -> std::io::Result<u32> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id().unwrap_or_default();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!(pid, status = %status, "detached process exited"),
            Err(e) => warn!(pid, error = %e, "failed to reap detached process"),
        }
    });
    Ok(pid)
}

/// Send a signal to a process group. `ESRCH` counts as success.
pub fn signal_group(pid: u32, signal: i32) -> std::io::Result<()> {
    let Ok(pid) = i32::try_from(pid) else {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

async fn kill_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = signal_group(pid, libc::SIGKILL) {
            warn!(pid, error = %e, "SIGKILL to process group failed");
        }
    }
    let _ = child.kill().await;
}

fn spawn_reader<R>(mut stream: R, buf: Buffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        let mut truncated = false;
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    // Keep draining past the cap so the writer never blocks.
                    if truncated {
                        continue;
                    }
                    let Ok(mut out) = buf.lock() else { break };
                    let room = MAX_OUTPUT_SIZE.saturating_sub(out.len());
                    if n > room {
                        out.extend_from_slice(&chunk[..room]);
                        out.extend_from_slice(TRUNCATED_MARKER);
                        truncated = true;
                    } else {
                        out.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

async fn drain(reader: JoinHandle<()>) {
    let abort = reader.abort_handle();
    if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
        debug!("output pipe still held open, abandoning reader");
        abort.abort();
    }
}

fn take(buf: &Buffer) -> Vec<u8> {
    buf.lock().map(|mut b| std::mem::take(&mut *b)).unwrap_or_default()
}
