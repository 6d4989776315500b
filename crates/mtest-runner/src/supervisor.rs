//! Child-process supervision: launch, watchdog, tree kill, termination cause.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mtest_core::{CommandTemplate, TerminationCause};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::interrupt::InterruptSignal;
use crate::process_tree::{capture_stack, kill_tree};

/// Where a child's standard input comes from.
#[derive(Debug, Clone, Default)]
pub enum StdinSource {
    #[default]
    Null,
    /// Written by a background task, then closed.
    Text(String),
    File(PathBuf),
    /// Left open for the caller; see [`ProcessHandle::take_stdin`].
    Pipe,
}

/// Where a child's output stream goes.
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    #[default]
    Null,
    /// Left open for the caller.
    Pipe,
    /// Truncated, then appended to.
    File(PathBuf),
    /// Appended to.
    Append(PathBuf),
}

impl OutputSink {
    pub fn path(&self) -> Option<&Path> {
        match self {
            OutputSink::File(p) | OutputSink::Append(p) => Some(p),
            OutputSink::Null | OutputSink::Pipe => None,
        }
    }

    fn to_stdio(&self) -> std::io::Result<Stdio> {
        Ok(match self {
            OutputSink::Null => Stdio::null(),
            OutputSink::Pipe => Stdio::piped(),
            // Append mode so watchdog notes and the child's own writes
            // never overwrite each other.
            OutputSink::File(p) => {
                std::fs::File::create(p)?;
                Stdio::from(open_append(p)?)
            }
            OutputSink::Append(p) => Stdio::from(open_append(p)?),
        })
    }
}

fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

/// Append `text` to the file at `path`.
pub fn append_text(path: &Path, text: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut f = open_append(path)?;
    f.write_all(text.as_bytes())
}

/// Everything needed to start one supervised process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Variables added to the inherited environment.
    pub env: Vec<(String, String)>,
    pub stdin: StdinSource,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
    /// Zero disables the watchdog.
    pub timeout: Duration,
    /// Make the child a process-group leader so the whole tree can be
    /// signalled at once.
    pub process_group: bool,
    /// Try to capture a stack trace before a timeout kill.
    pub stack_trace: bool,
    /// Raised on user interrupt; waiting on the child races against it.
    pub interrupt: InterruptSignal,
}

impl LaunchSpec {
    pub fn new<I, S>(argv: I) -> RunnerResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv.next().ok_or(RunnerError::EmptyCommand)?;
        Ok(LaunchSpec {
            program,
            args: argv.collect(),
            cwd: None,
            env: Vec::new(),
            stdin: StdinSource::Null,
            stdout: OutputSink::Null,
            stderr: OutputSink::Null,
            timeout: Duration::ZERO,
            process_group: true,
            stack_trace: true,
            interrupt: InterruptSignal::none(),
        })
    }

    pub fn from_template(template: &CommandTemplate) -> RunnerResult<Self> {
        Self::new(template.args.iter().cloned())
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, source: StdinSource) -> Self {
        self.stdin = source;
        self
    }

    pub fn stdout(mut self, sink: OutputSink) -> Self {
        self.stdout = sink;
        self
    }

    pub fn stderr(mut self, sink: OutputSink) -> Self {
        self.stderr = sink;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn process_group(mut self, on: bool) -> Self {
        self.process_group = on;
        self
    }

    pub fn stack_trace(mut self, on: bool) -> Self {
        self.stack_trace = on;
        self
    }

    pub fn interrupt(mut self, signal: InterruptSignal) -> Self {
        self.interrupt = signal;
        self
    }

    /// argv joined by spaces, for logs and timeout markers.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// argv in the `"a" "b"` form used for prompt lines.
    pub fn quoted(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join("\" \"")
    }
}

/// Launches processes under a watchdog.
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Spawn the process described by `spec` and arm its watchdog.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(spec: LaunchSpec) -> RunnerResult<ProcessHandle> {
        let command = spec.display();
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(spec.stdout.to_stdio()?)
            .stderr(spec.stderr.to_stdio()?)
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        match &spec.stdin {
            StdinSource::Null => {
                cmd.stdin(Stdio::null());
            }
            StdinSource::File(path) => {
                cmd.stdin(Stdio::from(std::fs::File::open(path)?));
            }
            StdinSource::Text(_) | StdinSource::Pipe => {
                cmd.stdin(Stdio::piped());
            }
        }
        #[cfg(unix)]
        {
            if spec.process_group {
                cmd.process_group(0);
            }
        }

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            command: command.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(pid = ?pid, command = %command, timeout_secs = spec.timeout.as_secs(), "spawned");

        let feeder = match &spec.stdin {
            StdinSource::Text(text) => child.stdin.take().map(|mut stdin| {
                let text = text.clone();
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(text.as_bytes()).await {
                        debug!(error = %e, "child closed stdin early");
                    }
                })
            }),
            _ => None,
        };

        let killed = Arc::new(AtomicBool::new(false));
        let err_sink = spec.stderr.path().map(Path::to_path_buf);
        let watchdog = match pid {
            Some(pid) if !spec.timeout.is_zero() => Some(arm_watchdog(Watchdog {
                pid,
                timeout: spec.timeout,
                group: spec.process_group,
                command: command.clone(),
                err_sink: err_sink.clone(),
                stack_trace: spec.stack_trace,
                killed: killed.clone(),
            })),
            _ => None,
        };

        Ok(ProcessHandle {
            child,
            pid,
            command,
            process_group: spec.process_group,
            killed,
            watchdog,
            feeder,
            err_sink,
            interrupt: spec.interrupt,
            reaped: false,
        })
    }

    /// Launch and wait.
    pub async fn run(spec: LaunchSpec) -> RunnerResult<TerminationCause> {
        Self::launch(spec)?.wait().await
    }
}

struct Watchdog {
    pid: u32,
    timeout: Duration,
    group: bool,
    command: String,
    err_sink: Option<PathBuf>,
    stack_trace: bool,
    killed: Arc<AtomicBool>,
}

fn arm_watchdog(w: Watchdog) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(w.timeout).await;
        mtest_core::emit_process_timeout(&w.command, Some(w.pid), w.timeout.as_secs());

        let trace = if w.stack_trace {
            capture_stack(w.pid).await
        } else {
            None
        };
        if let Some(path) = &w.err_sink {
            let mut note = format!("\n!Mtimeout: Timeout: {}\n", w.command);
            if let Some(trace) = trace {
                note.push_str(&format!("\n{trace}\n"));
            }
            if let Err(e) = append_text(path, &note) {
                warn!(path = %path.display(), error = %e, "cannot write timeout marker");
            }
        }

        w.killed.store(true, Ordering::SeqCst);
        if let Err(e) = kill_tree(w.pid, w.group) {
            warn!(pid = w.pid, error = %e, "kill after timeout failed");
        }
    })
}

/// A running child owned by the caller that launched it.
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    command: String,
    process_group: bool,
    killed: Arc<AtomicBool>,
    watchdog: Option<JoinHandle<()>>,
    feeder: Option<JoinHandle<()>>,
    err_sink: Option<PathBuf>,
    interrupt: InterruptSignal,
    reaped: bool,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Force-kill the whole tree. The eventual cause will be `Timeout`.
    pub fn kill(&self) -> std::io::Result<()> {
        if self.killed.swap(true, Ordering::SeqCst) {
            debug!(command = %self.command, "already killed");
        }
        match self.pid {
            Some(pid) => kill_tree(pid, self.process_group),
            None => Ok(()),
        }
    }

    /// Wait for the child to exit and report why it did.
    ///
    /// A user interrupt while waiting, or one raised earlier, kills the
    /// tree, reaps the child and returns [`RunnerError::Interrupted`].
    pub async fn wait(mut self) -> RunnerResult<TerminationCause> {
        let interrupt = self.interrupt.clone();
        let status = tokio::select! {
            biased;
            _ = interrupt.raised() => {
                warn!(command = %self.command, "interrupted; killing process tree");
                self.disarm();
                if let Err(e) = self.kill() {
                    warn!(error = %e, "kill on interrupt failed");
                }
                let _ = self.child.wait().await;
                self.reaped = true;
                return Err(RunnerError::Interrupted);
            }
            status = self.child.wait() => status,
        };
        self.reaped = true;
        self.disarm();
        let status = status?;

        let cause = TerminationCause::from_exit_status(status, self.is_killed());
        debug!(pid = ?self.pid, command = %self.command, cause = %cause, "exited");
        if let (Some(note), Some(path)) = (cause.annotation(), &self.err_sink) {
            if let Err(e) = append_text(path, &format!("\n{note}\n")) {
                warn!(path = %path.display(), error = %e, "cannot annotate error stream");
            }
        }
        Ok(cause)
    }

    fn disarm(&mut self) {
        if let Some(w) = self.watchdog.take() {
            w.abort();
        }
        if let Some(f) = self.feeder.take() {
            f.abort();
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.disarm();
        if !self.reaped {
            if let Err(e) = self.kill() {
                debug!(error = %e, "kill on drop failed");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use mtest_core::SignalKind;

    #[tokio::test]
    async fn test_normal_exit() {
        let spec = LaunchSpec::new(["true"]).unwrap();
        let cause = ProcessSupervisor::run(spec).await.unwrap();
        assert_eq!(cause, TerminationCause::Normal);
    }

    #[tokio::test]
    async fn test_error_exit() {
        let spec = LaunchSpec::new(["sh", "-c", "exit 3"]).unwrap();
        let cause = ProcessSupervisor::run(spec).await.unwrap();
        assert_eq!(cause, TerminationCause::ExitError(3));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            LaunchSpec::new(empty),
            Err(RunnerError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let spec = LaunchSpec::new(["/nonexistent/program"]).unwrap();
        assert!(matches!(
            ProcessSupervisor::launch(spec),
            Err(RunnerError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_crash_is_annotated() {
        let dir = tempfile::tempdir().unwrap();
        let err = dir.path().join("t.err");
        let spec = LaunchSpec::new(["sh", "-c", "kill -SEGV $$"])
            .unwrap()
            .stderr(OutputSink::File(err.clone()));
        let cause = ProcessSupervisor::run(spec).await.unwrap();
        assert_eq!(cause, TerminationCause::Signal(SignalKind::Segv));
        let text = std::fs::read_to_string(&err).unwrap();
        assert!(text.contains("Segmentation fault"));
    }

    #[tokio::test]
    async fn test_text_stdin_and_file_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("t.out");
        let spec = LaunchSpec::new(["cat"])
            .unwrap()
            .stdin(StdinSource::Text("hello\n".into()))
            .stdout(OutputSink::File(out.clone()));
        assert!(ProcessSupervisor::run(spec).await.unwrap().is_normal());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_append_keeps_existing_text() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("t.out");
        std::fs::write(&out, "header\n").unwrap();
        let spec = LaunchSpec::new(["echo", "body"])
            .unwrap()
            .stdout(OutputSink::Append(out.clone()));
        ProcessSupervisor::run(spec).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "header\nbody\n");
    }

    #[tokio::test]
    async fn test_timeout_writes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let err = dir.path().join("t.err");
        let spec = LaunchSpec::new(["sleep", "30"])
            .unwrap()
            .stderr(OutputSink::File(err.clone()))
            .timeout(Duration::from_millis(300))
            .stack_trace(false);
        let cause = ProcessSupervisor::run(spec).await.unwrap();
        assert_eq!(cause, TerminationCause::Timeout);
        let text = std::fs::read_to_string(&err).unwrap();
        assert!(text.contains("!Mtimeout: Timeout: sleep 30"));
    }

    #[tokio::test]
    async fn test_explicit_kill_reports_timeout() {
        let spec = LaunchSpec::new(["sleep", "30"]).unwrap();
        let handle = ProcessSupervisor::launch(spec).unwrap();
        handle.kill().unwrap();
        assert!(handle.is_killed());
        assert_eq!(handle.wait().await.unwrap(), TerminationCause::Timeout);
    }

    #[tokio::test]
    async fn test_watchdog_cancelled_on_normal_exit() {
        let spec = LaunchSpec::new(["true"])
            .unwrap()
            .timeout(Duration::from_millis(200));
        let handle = ProcessSupervisor::launch(spec).unwrap();
        let killed = handle.killed.clone();
        assert_eq!(handle.wait().await.unwrap(), TerminationCause::Normal);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("t.out");
        let spec = LaunchSpec::new(["sh", "-c", "echo $MAPIPORT"])
            .unwrap()
            .env("MAPIPORT", "31234")
            .stdout(OutputSink::File(out.clone()));
        ProcessSupervisor::run(spec).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "31234\n");
    }

    #[test]
    fn test_display_forms() {
        let spec = LaunchSpec::new(["mclient", "-lsql"]).unwrap().arg("x.sql");
        assert_eq!(spec.display(), "mclient -lsql x.sql");
        assert_eq!(spec.quoted(), "mclient\" \"-lsql\" \"x.sql");
    }
}
