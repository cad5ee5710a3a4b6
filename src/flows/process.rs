use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How long to keep draining pipes once the child is gone. Background
/// processes that inherited the pipes can keep them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Pause between SIGTERM and SIGKILL when tearing down a timed-out run.
const TERM_GRACE: Duration = Duration::from_millis(500);

const SPAWN_RETRIES: u32 = 5;

#[derive(Debug)]
pub enum ProcessOutcome {
    /// The child ran and exited. `code` is `None` when it was killed by a
    /// signal, in which case `signal` carries the number where known.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// No process was created, or it could not be waited on.
    LaunchFailed(String),
    TimedOut {
        after: Duration,
        stdout: String,
        stderr: String,
    },
}

/// Spawns a flow executable and waits for it, capturing both output streams.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub async fn launch(&self, executable: &Path, args: &[String]) -> ProcessOutcome {
        if let Err(msg) = check_executable(executable) {
            return ProcessOutcome::LaunchFailed(msg);
        }

        let mut cmd = Command::new(executable);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can take down everything it started.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match spawn(&mut cmd).await {
            Ok(child) => child,
            Err(e) => {
                return ProcessOutcome::LaunchFailed(format!(
                    "failed to start process {}: {e}",
                    executable.display()
                ));
            }
        };
        let pid = child.id();
        tracing::debug!(executable = %executable.display(), pid = ?pid, "Spawned flow process");

        let stdout = Drain::spawn(child.stdout.take());
        let stderr = Drain::spawn(child.stderr.take());

        let waited = match self.timeout {
            Some(limit) => timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };

        match waited {
            Some(Ok(status)) => {
                let (stdout, stderr) = tokio::join!(stdout.finish(), stderr.finish());
                ProcessOutcome::Exited {
                    code: status.code(),
                    signal: exit_signal(&status),
                    stdout,
                    stderr,
                }
            }
            Some(Err(e)) => {
                let _ = child.kill().await;
                stdout.abort();
                stderr.abort();
                ProcessOutcome::LaunchFailed(format!("failed to wait for process: {e}"))
            }
            None => {
                let after = self.timeout.unwrap_or_default();
                tracing::warn!(
                    executable = %executable.display(),
                    "flow process timed out after {after:?}, killing"
                );
                if let Some(pid) = pid {
                    kill_process_group(pid).await;
                }
                let _ = child.kill().await;
                let (stdout, stderr) = tokio::join!(stdout.finish(), stderr.finish());
                ProcessOutcome::TimedOut {
                    after,
                    stdout,
                    stderr,
                }
            }
        }
    }
}

/// Spawn, retrying briefly while the executable is still open for writing
/// elsewhere (ETXTBSY), as happens right after it was installed.
async fn spawn(cmd: &mut Command) -> std::io::Result<Child> {
    const ETXTBSY: i32 = 26;
    let mut attempt = 0;
    loop {
        match cmd.spawn() {
            Err(e) if e.raw_os_error() == Some(ETXTBSY) && attempt < SPAWN_RETRIES => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
            }
            result => return result,
        }
    }
}

fn check_executable(path: &Path) -> Result<(), String> {
    let metadata = std::fs::metadata(path)
        .map_err(|_| format!("binary file not found: {}", path.display()))?;
    if !metadata.is_file() {
        return Err(format!("binary path is not a file: {}", path.display()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(format!("binary file is not executable: {}", path.display()));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
async fn kill_process_group(pid: u32) {
    let group = format!("-{pid}");
    let _ = Command::new("kill").args(["-TERM", "--", &group]).status().await;
    tokio::time::sleep(TERM_GRACE).await;
    let _ = Command::new("kill").args(["-KILL", "--", &group]).status().await;
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: u32) {}

/// Background reader for one output pipe. Keeps whatever it has read when
/// told to stop.
struct Drain {
    task: JoinHandle<Vec<u8>>,
    stop: oneshot::Sender<()>,
}

impl Drain {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let Some(mut pipe) = pipe else {
                return buf;
            };
            let mut chunk = [0u8; 8192];
            loop {
                tokio::select! {
                    read = pipe.read(&mut chunk) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    },
                    _ = &mut stopped => break,
                }
            }
            buf
        });
        Self { task, stop }
    }

    /// Waits up to `DRAIN_GRACE` for the pipe to close, then stops reading.
    async fn finish(self) -> String {
        let Self { mut task, stop } = self;
        let bytes = match timeout(DRAIN_GRACE, &mut task).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => {
                let _ = stop.send(());
                task.await.unwrap_or_default()
            }
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn abort(self) {
        self.task.abort();
    }
}
