//! Server startup, readiness, liveness and shutdown.
//!
//! ```text
//! Starting -> AwaitingReadySentinel -> ProbingPort -> Ready
//!     \______________ any failure ______________/-> Failed
//! ```
//!
//! A failed start is retried exactly once after the configured cooldown;
//! sockets left in TIME_WAIT by a previous run are the usual culprit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mtest_core::{
    emit_server_ready, emit_server_start_failed, MtestError, ServerBanner, ServerConfig,
    TerminationCause,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::interrupt::InterruptSignal;
use crate::supervisor::{
    append_text, LaunchSpec, OutputSink, ProcessHandle, ProcessSupervisor, StdinSource,
};

/// Start attempts before giving up: the first one plus a single retry.
const START_ATTEMPTS: u32 = 2;

/// How long to keep collecting server output after it exited.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    AwaitingReadySentinel,
    ProbingPort,
    Ready,
    Failed,
}

/// Where the server's streams are collected.
#[derive(Debug, Clone)]
pub struct ServerLogs {
    pub out: PathBuf,
    pub err: PathBuf,
}

/// Drives one server through startup.
pub struct ServerLifecycle<'a> {
    config: &'a ServerConfig,
    process_group: bool,
    interrupt: InterruptSignal,
    state: ServerState,
}

impl<'a> ServerLifecycle<'a> {
    pub fn new(config: &'a ServerConfig, process_group: bool) -> Self {
        Self {
            config,
            process_group,
            interrupt: InterruptSignal::none(),
            state: ServerState::Starting,
        }
    }

    /// Abort startup, killing the server, when `signal` is raised.
    pub fn with_interrupt(mut self, signal: InterruptSignal) -> Self {
        self.interrupt = signal;
        self
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    fn transition(&mut self, next: ServerState) {
        debug!(from = ?self.state, to = ?next, "server state");
        self.state = next;
    }

    /// Start the server on `port` and wait until it is ready.
    ///
    /// `budget` is the server's whole-lifetime timeout; the sentinel wait is
    /// bounded by the same deadline. After a failed first attempt the
    /// cooldown elapses and one more attempt is made; a second failure is
    /// [`RunnerError::ServerUnavailable`].
    pub async fn start(
        &mut self,
        port: u16,
        budget: Duration,
        cwd: &Path,
        logs: &ServerLogs,
    ) -> RunnerResult<RunningServer> {
        let mut last_error = String::new();
        for attempt in 1..=START_ATTEMPTS {
            if attempt > 1 {
                let cooldown = self.config.restart_cooldown();
                warn!(
                    port,
                    cooldown_secs = cooldown.as_secs(),
                    "server start failed; retrying after cooldown"
                );
                wait_or_interrupt(cooldown, &self.interrupt).await?;
            }
            self.transition(ServerState::Starting);
            match self.try_start(port, budget, cwd, logs, attempt).await {
                Ok(server) => {
                    self.transition(ServerState::Ready);
                    emit_server_ready(port, server.pid(), attempt);
                    return Ok(server);
                }
                Err(e) if e.is_interrupt() => {
                    self.transition(ServerState::Failed);
                    return Err(e);
                }
                Err(e) => {
                    self.transition(ServerState::Failed);
                    let reason = match e {
                        RunnerError::ServerStart(reason) => reason,
                        other => other.to_string(),
                    };
                    emit_server_start_failed(port, attempt, &reason);
                    let note = format!("\n\n! Server not ready; {reason} !\n\n");
                    if let Err(io) = append_text(&logs.err, &note) {
                        warn!(error = %io, "cannot annotate server error log");
                    }
                    last_error = reason;
                }
            }
        }
        Err(RunnerError::ServerUnavailable {
            attempts: START_ATTEMPTS,
            reason: last_error,
        })
    }

    async fn try_start(
        &mut self,
        port: u16,
        budget: Duration,
        cwd: &Path,
        logs: &ServerLogs,
        attempt: u32,
    ) -> RunnerResult<RunningServer> {
        let spec = LaunchSpec::new(self.config.argv(port))?
            .cwd(cwd)
            .stdin(StdinSource::Pipe)
            .stdout(OutputSink::Pipe)
            .stderr(OutputSink::Append(logs.err.clone()))
            .timeout(budget)
            .process_group(self.process_group)
            .interrupt(self.interrupt.clone());
        let mut handle = ProcessSupervisor::launch(spec)?;
        let interrupt = self.interrupt.clone();
        let mut stdin = handle.take_stdin();
        let stdout = handle.take_stdout();

        if let (Some(input), false) = (stdin.as_mut(), self.config.ready_input.is_empty()) {
            if let Err(e) = write_and_flush(input, &self.config.ready_input).await {
                debug!(error = %e, "server closed stdin before readiness input");
            }
        }

        self.transition(ServerState::AwaitingReadySentinel);
        let Some(stdout) = stdout else {
            let reason = "server stdout is not captured".to_string();
            return Err(abandon(handle, reason, &interrupt).await);
        };
        let mut lines = BufReader::new(stdout).lines();
        let deadline = (!budget.is_zero()).then(|| Instant::now() + budget);
        let sentinel = tokio::select! {
            biased;
            _ = interrupt.raised() => Err("interrupted".to_string()),
            seen = await_sentinel(&mut lines, &self.config.sentinel, &logs.out, deadline) => seen,
        };
        if let Err(reason) = sentinel {
            return Err(abandon(handle, reason, &interrupt).await);
        }
        let drain = spawn_drain(lines, logs.out.clone());

        if self.config.liveness_attempts > 0 {
            self.transition(ServerState::ProbingPort);
            let probe = liveness_probe(
                "localhost",
                port,
                self.config.liveness_attempts,
                self.config.liveness_interval(),
            );
            let alive = tokio::select! {
                biased;
                _ = interrupt.raised() => Err("interrupted".to_string()),
                alive = probe => alive.map_err(|e| format!("liveness probe on port {port} failed: {e}")),
            };
            if let Err(reason) = alive {
                drain.abort();
                return Err(abandon(handle, reason, &interrupt).await);
            }
        }

        debug!(port, attempt, pid = ?handle.pid(), "server ready");
        Ok(RunningServer {
            handle,
            stdin,
            drain: Some(drain),
            port,
            quit_command: self.config.quit_command.clone(),
        })
    }
}

/// Why the sentinel wait ended without the sentinel.
type SentinelFailure = String;

async fn await_sentinel(
    lines: &mut tokio::io::Lines<BufReader<ChildStdout>>,
    sentinel: &str,
    log: &Path,
    deadline: Option<Instant>,
) -> Result<(), SentinelFailure> {
    loop {
        let next = match deadline {
            Some(at) => match tokio::time::timeout_at(at, lines.next_line()).await {
                Ok(line) => line,
                Err(_) => return Err("readiness sentinel not seen before the deadline".into()),
            },
            None => lines.next_line().await,
        };
        match next {
            Ok(Some(line)) => {
                if let Err(e) = append_text(log, &format!("{line}\n")) {
                    warn!(error = %e, "cannot copy server output");
                }
                if line.starts_with(sentinel) {
                    return Ok(());
                }
            }
            Ok(None) => return Err("server output ended before the readiness sentinel".into()),
            Err(e) => return Err(format!("cannot read server output: {e}")),
        }
    }
}

/// Kill a server that failed to come up, reap it and build the error.
///
/// Reports [`RunnerError::Interrupted`] instead when the user interrupted.
async fn abandon(
    handle: ProcessHandle,
    reason: String,
    interrupt: &InterruptSignal,
) -> RunnerError {
    if let Err(e) = handle.kill() {
        debug!(error = %e, "kill of failed server");
    }
    let waited = handle.wait().await;
    if interrupt.is_raised() {
        return RunnerError::Interrupted;
    }
    match waited {
        Ok(cause) => RunnerError::ServerStart(format!("{reason} (server {cause})")),
        Err(RunnerError::Interrupted) => RunnerError::Interrupted,
        Err(e) => RunnerError::ServerStart(format!("{reason} ({e})")),
    }
}

fn spawn_drain(
    mut lines: tokio::io::Lines<BufReader<ChildStdout>>,
    log: PathBuf,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            if let Err(e) = append_text(&log, &format!("{line}\n")) {
                warn!(error = %e, "cannot copy server output");
                break;
            }
        }
    })
}

async fn write_and_flush(stdin: &mut ChildStdin, text: &str) -> std::io::Result<()> {
    stdin.write_all(text.as_bytes()).await?;
    stdin.flush().await
}

async fn wait_or_interrupt(delay: Duration, interrupt: &InterruptSignal) -> RunnerResult<()> {
    tokio::select! {
        biased;
        _ = interrupt.raised() => Err(RunnerError::Interrupted),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Connect to `host:port` and read the server's first protocol block.
///
/// A block starts with a little-endian `u16` whose upper fifteen bits are
/// the payload length. Connection refusals are retried `attempts` times,
/// `interval` apart.
pub async fn liveness_probe(
    host: &str,
    port: u16,
    attempts: u32,
    interval: Duration,
) -> std::io::Result<()> {
    let mut last = std::io::Error::new(std::io::ErrorKind::Other, "no liveness attempt made");
    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(interval).await;
        }
        match read_handshake(host, port, interval.max(Duration::from_secs(1))).await {
            Ok(len) => {
                debug!(port, attempt, handshake_len = len, "liveness probe answered");
                return Ok(());
            }
            Err(e) => {
                debug!(port, attempt, error = %e, "liveness probe failed");
                last = e;
            }
        }
    }
    Err(last)
}

async fn read_handshake(host: &str, port: u16, io_timeout: Duration) -> std::io::Result<usize> {
    let timed_out = || std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out");
    let mut stream = tokio::time::timeout(io_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| timed_out())??;
    let mut header = [0u8; 2];
    tokio::time::timeout(io_timeout, stream.read_exact(&mut header))
        .await
        .map_err(|_| timed_out())??;
    let len = usize::from(u16::from_le_bytes(header) >> 1);
    let mut payload = vec![0u8; len];
    tokio::time::timeout(io_timeout, stream.read_exact(&mut payload))
        .await
        .map_err(|_| timed_out())??;
    Ok(len)
}

/// A server that passed its readiness checks.
pub struct RunningServer {
    handle: ProcessHandle,
    stdin: Option<ChildStdin>,
    drain: Option<JoinHandle<()>>,
    port: u16,
    quit_command: String,
}

impl RunningServer {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    /// Ask the server to quit, collect its remaining output and wait for it.
    ///
    /// The server is waited on even when the quit command cannot be
    /// written, so its termination cause is always captured.
    pub async fn shutdown(mut self) -> RunnerResult<TerminationCause> {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = write_and_flush(&mut stdin, &self.quit_command).await {
                warn!(port = self.port, error = %e, "cannot send quit command");
            }
        }
        self.finish().await
    }

    /// Kill the server tree and wait for it.
    pub async fn kill(mut self) -> RunnerResult<TerminationCause> {
        self.stdin.take();
        if let Err(e) = self.handle.kill() {
            warn!(port = self.port, error = %e, "cannot kill server");
        }
        self.finish().await
    }

    async fn finish(self) -> RunnerResult<TerminationCause> {
        let RunningServer { handle, drain, .. } = self;
        let cause = handle.wait().await;
        if let Some(mut drain) = drain {
            if tokio::time::timeout(DRAIN_GRACE, &mut drain).await.is_err() {
                debug!("server output still open after exit; abandoning drain");
                drain.abort();
            }
        }
        cause
    }
}

/// Run the server once to learn what it was built with.
///
/// The server gets `probe_input` on stdin and is expected to print its
/// startup banner and module list, then quit on its own.
pub async fn probe_platform(
    config: &ServerConfig,
    port: u16,
    timeout: Duration,
    process_group: bool,
    interrupt: &InterruptSignal,
) -> RunnerResult<ServerBanner> {
    let spec = LaunchSpec::new(config.argv(port))?
        .stdin(StdinSource::Text(config.probe_input.clone()))
        .stdout(OutputSink::Pipe)
        .timeout(timeout)
        .process_group(process_group)
        .stack_trace(false)
        .interrupt(interrupt.clone());
    let mut handle = ProcessSupervisor::launch(spec)?;
    let mut text = String::new();
    if let Some(mut stdout) = handle.take_stdout() {
        tokio::select! {
            biased;
            // wait() below sees the interrupt and kills the tree
            _ = interrupt.raised() => {}
            read = stdout.read_to_string(&mut text) => {
                if let Err(e) = read {
                    debug!(error = %e, "platform probe output truncated");
                }
            }
        }
    }
    let cause = handle.wait().await?;
    if !cause.is_normal() {
        debug!(cause = %cause, "platform probe server did not exit cleanly");
    }
    ServerBanner::parse(&text)
        .map_err(MtestError::from)
        .map_err(RunnerError::from)
}
