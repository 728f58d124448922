use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::parser::{self, ToolEvent};

/// Lines of recent subprocess output retained for failure context.
pub const OUTPUT_TAIL_LINES: usize = 1024;

/// What to run and how long to let it live.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// File the tool must have produced for exit 0 to count as success.
    pub expected_output: Option<PathBuf>,
    pub timeout: Duration,
}

/// Events delivered to the caller while the subprocess runs.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// The child process started; carries the OS pid (= its process group).
    Spawned { os_pid: u32 },
    Line(ToolEvent),
}

struct MonitorInner {
    os_pid: Mutex<Option<u32>>,
    tail: Mutex<VecDeque<String>>,
    last_progress: Mutex<Instant>,
}

/// Shared view of a running subprocess: pid, rolling output tail, and the
/// timestamp of the last recognized progress line. Cheap to clone.
#[derive(Clone)]
pub struct RunMonitor {
    inner: Arc<MonitorInner>,
}

impl RunMonitor {
    pub fn new() -> RunMonitor {
        RunMonitor {
            inner: Arc::new(MonitorInner {
                os_pid: Mutex::new(None),
                tail: Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)),
                last_progress: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn os_pid(&self) -> Option<u32> {
        *self.inner.os_pid.lock().unwrap()
    }

    /// Monotonic timestamp of the last recognized progress event.
    pub fn progress_timestamp(&self) -> Instant {
        *self.inner.last_progress.lock().unwrap()
    }

    /// Snapshot of the most recent output lines.
    pub fn output_tail(&self) -> Vec<String> {
        self.inner.tail.lock().unwrap().iter().cloned().collect()
    }

    fn set_pid(&self, pid: u32) {
        *self.inner.os_pid.lock().unwrap() = Some(pid);
        *self.inner.last_progress.lock().unwrap() = Instant::now();
    }

    fn push_line(&self, line: &str) {
        let mut tail = self.inner.tail.lock().unwrap();
        if tail.len() >= OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }

    fn touch_progress(&self) {
        *self.inner.last_progress.lock().unwrap() = Instant::now();
    }
}

impl Default for RunMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Failure context handed to the classifier and the audit log.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub output_tail: Vec<String>,
    pub args: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RunFailure {
    #[error("process exited with code {code}")]
    Exit { code: i32, context: FailureContext },
    #[error("process timed out after {timeout:?}")]
    Timeout {
        timeout: Duration,
        context: FailureContext,
    },
    #[error("tool exited 0 but expected output is missing: {path:?}")]
    MissingOutput {
        path: PathBuf,
        context: FailureContext,
    },
    #[error("failed to drive subprocess: {message}")]
    Port {
        message: String,
        context: FailureContext,
    },
}

impl RunFailure {
    pub fn context(&self) -> &FailureContext {
        match self {
            RunFailure::Exit { context, .. }
            | RunFailure::Timeout { context, .. }
            | RunFailure::MissingOutput { context, .. }
            | RunFailure::Port { context, .. } => context,
        }
    }

    /// Bounded JSON snapshot of the failure context for the audit log.
    pub fn context_json(&self) -> String {
        const TAIL_LINES: usize = 50;
        let context = self.context();
        let skip = context.output_tail.len().saturating_sub(TAIL_LINES);
        let tail = &context.output_tail[skip..];
        serde_json::json!({
            "args": context.args,
            "output_tail": tail,
        })
        .to_string()
    }
}

/// Launch the external tool in its own OS process group, stream its merged
/// stdout/stderr line-by-line through the parser, and supervise it until
/// exit or timeout.
///
/// Success requires exit code 0 *and* the expected output file present on
/// disk; some tools exit 0 on an early abort.
pub async fn run(
    spec: &RunSpec,
    monitor: &RunMonitor,
    mut on_event: impl FnMut(RunEvent) + Send,
) -> Result<(), RunFailure> {
    let failure_context = |monitor: &RunMonitor| FailureContext {
        output_tail: monitor.output_tail(),
        args: spec.args.clone(),
    };

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| RunFailure::Port {
        message: format!("failed to spawn {}: {}", spec.program, e),
        context: failure_context(monitor),
    })?;

    let os_pid = child.id().ok_or_else(|| RunFailure::Port {
        message: "child exited before a pid could be read".to_string(),
        context: failure_context(monitor),
    })?;
    monitor.set_pid(os_pid);
    on_event(RunEvent::Spawned { os_pid });
    debug!("spawned {} (pid {})", spec.program, os_pid);

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    spawn_line_pump(stdout, line_tx.clone());
    spawn_line_pump(stderr, line_tx);

    let supervise = async {
        while let Some(line) = line_rx.recv().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            monitor.push_line(line);
            if let Some(event) = parser::parse_line(line) {
                monitor.touch_progress();
                on_event(RunEvent::Line(event));
            }
        }
        child.wait().await
    };

    let status = match tokio::time::timeout(spec.timeout, supervise).await {
        Err(_) => {
            warn!(
                "{} exceeded its {}s timeout, killing process group {}",
                spec.program,
                spec.timeout.as_secs(),
                os_pid
            );
            kill(os_pid);
            return Err(RunFailure::Timeout {
                timeout: spec.timeout,
                context: failure_context(monitor),
            });
        }
        Ok(Err(e)) => {
            return Err(RunFailure::Port {
                message: format!("failed waiting on child: {}", e),
                context: failure_context(monitor),
            });
        }
        Ok(Ok(status)) => status,
    };

    if !status.success() {
        return Err(RunFailure::Exit {
            code: exit_code(&status),
            context: failure_context(monitor),
        });
    }

    if let Some(expected) = &spec.expected_output {
        if !expected.exists() {
            return Err(RunFailure::MissingOutput {
                path: expected.clone(),
                context: failure_context(monitor),
            });
        }
    }

    Ok(())
}

fn spawn_line_pump<R>(reader: R, tx: mpsc::Sender<String>)
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

/// Derive a shell-convention exit code, folding a terminating signal into
/// `128 + signo` (SIGKILL becomes 137, SIGTERM 143).
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Terminate a whole process group. Asynchronous in effect: the caller does
/// not wait for the group to die; the supervising `run` future observes the
/// exit through `wait`.
#[cfg(unix)]
pub fn kill(os_pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(os_pid as i32), Signal::SIGKILL) {
        warn!("failed to kill process group {}: {}", os_pid, e);
    }
}

#[cfg(not(unix))]
pub fn kill(os_pid: u32) {
    warn!("process-group kill not supported on this platform (pid {})", os_pid);
}
