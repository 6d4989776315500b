//! Ctrl-C at each wait point of a run.
//!
//! SIGINT is delivered to the whole process, so every scenario runs in turn
//! inside one test, each with a freshly installed signal.

#![cfg(unix)]

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mtest_core::{
    CommandTemplate, PlatformDescriptor, RunConfig, ServerBanner, ServerConfig, TerminationCause,
};
use mtest_runner::{
    is_alive, DiffRequest, DiffTool, InterruptSignal, LaunchSpec, ProcessSupervisor,
    RunnerError, RunnerResult, ServerLifecycle, ServerLogs, ServerState, TestRunner,
};
use nix::sys::signal::{raise, Signal};

const CHAIN: &str = r#"#!/bin/sh
depth=$1
if [ "$depth" -gt 0 ]; then
    "$0" $((depth - 1)) "$2" &
    wait
else
    echo $$ > "$2"
    exec sleep 60
fi
"#;

/// Interrupts are answered well within this, whatever the timeouts say.
const PROMPT: Duration = Duration::from_secs(5);

struct NoDiffs;

#[async_trait]
impl DiffTool for NoDiffs {
    async fn compare(&self, request: &DiffRequest) -> RunnerResult<TerminationCause> {
        std::fs::write(&request.html, "<!--NoDiffs-->\n")?;
        Ok(TerminationCause::Normal)
    }
}

fn server(script: &str) -> ServerConfig {
    ServerConfig {
        command: CommandTemplate::new(["sh", "-c", script, "fake-server"]),
        ready_input: String::new(),
        quit_command: "quit\n".into(),
        restart_cooldown_secs: 0,
        liveness_attempts: 0,
        ..ServerConfig::default()
    }
}

fn logs(dir: &Path) -> ServerLogs {
    ServerLogs {
        out: dir.join("t.server.out"),
        err: dir.join("t.server.err"),
    }
}

fn closed_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

fn raise_after(delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        raise(Signal::SIGINT).unwrap();
    });
}

/// Install a fresh signal, run `work` with it, send SIGINT shortly after,
/// and return what `work` produced together with how long it took.
async fn interrupted<F, Fut, T>(work: F) -> (T, Duration)
where
    F: FnOnce(InterruptSignal) -> Fut,
    Fut: Future<Output = T>,
{
    let signal = InterruptSignal::install().unwrap();
    let started = Instant::now();
    raise_after(Duration::from_millis(300));
    let out = tokio::time::timeout(PROMPT * 2, work(signal))
        .await
        .expect("interrupt was not noticed");
    (out, started.elapsed())
}

async fn child_wait(dir: &Path) {
    let chain = dir.join("chain.sh");
    std::fs::write(&chain, CHAIN).unwrap();
    std::fs::set_permissions(&chain, std::fs::Permissions::from_mode(0o755)).unwrap();
    let leaf_file = dir.join("leaf.pid");

    let (chain, leaf_file) = (&chain, &leaf_file);
    let (result, took) = interrupted(|signal| async move {
        let spec = LaunchSpec::new([
            chain.display().to_string(),
            "3".to_string(),
            leaf_file.display().to_string(),
        ])
        .unwrap()
        .timeout(Duration::from_secs(60))
        .stack_trace(false)
        .interrupt(signal);
        ProcessSupervisor::run(spec).await
    })
    .await;
    assert!(matches!(result, Err(RunnerError::Interrupted)), "{result:?}");
    assert!(took < PROMPT);

    if let Ok(text) = std::fs::read_to_string(leaf_file) {
        let leaf: u32 = text.trim().parse().unwrap();
        let start = Instant::now();
        while is_alive(leaf) {
            assert!(start.elapsed() < PROMPT, "leaf {leaf} outlived the interrupt");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn sentinel_wait(dir: &Path) {
    let config = server("echo booting; exec sleep 60");
    let logs = logs(dir);
    let (config, logs) = (&config, &logs);
    let ((result, state), took) = interrupted(|signal| async move {
        let mut lifecycle = ServerLifecycle::new(config, true).with_interrupt(signal);
        let result = lifecycle
            .start(closed_port(), Duration::from_secs(60), dir, logs)
            .await;
        (result.map(|_| ()), lifecycle.state())
    })
    .await;
    assert!(matches!(result, Err(RunnerError::Interrupted)), "{result:?}");
    assert_eq!(state, ServerState::Failed);
    assert!(took < PROMPT);
}

async fn liveness_wait(dir: &Path) {
    let mut config = server("echo Ready.; exec sleep 60");
    config.liveness_attempts = 10_000;
    config.liveness_interval_ms = 50;
    let logs = logs(dir);
    let (config, logs) = (&config, &logs);
    let (result, took) = interrupted(|signal| async move {
        let mut lifecycle = ServerLifecycle::new(config, true).with_interrupt(signal);
        lifecycle
            .start(closed_port(), Duration::from_secs(60), dir, logs)
            .await
            .map(|_| ())
    })
    .await;
    assert!(matches!(result, Err(RunnerError::Interrupted)), "{result:?}");
    assert!(took < PROMPT);
}

async fn restart_cooldown(dir: &Path) {
    let mut config = server("exit 1");
    config.restart_cooldown_secs = 60;
    let logs = logs(dir);
    let (config, logs) = (&config, &logs);
    let (result, took) = interrupted(|signal| async move {
        let mut lifecycle = ServerLifecycle::new(config, true).with_interrupt(signal);
        lifecycle
            .start(closed_port(), Duration::from_secs(60), dir, logs)
            .await
            .map(|_| ())
    })
    .await;
    assert!(matches!(result, Err(RunnerError::Interrupted)), "{result:?}");
    assert!(took < PROMPT);
}

/// Once raised, later launches and tests stop at once.
async fn raised_earlier(dir: &Path) {
    let (signal, _) = interrupted(|signal| async move {
        signal.raised().await;
        signal
    })
    .await;
    assert!(signal.is_raised());

    let spec = LaunchSpec::new(["sleep", "60"])
        .unwrap()
        .interrupt(signal.clone());
    let started = Instant::now();
    let result = ProcessSupervisor::run(spec).await;
    assert!(matches!(result, Err(RunnerError::Interrupted)), "{result:?}");
    assert!(started.elapsed() < PROMPT);

    std::fs::write(dir.join("q.sql"), "select 1;\n").unwrap();
    let mut config = RunConfig {
        hostname: Some("localhost".into()),
        server: server("echo Ready.; while read l; do [ \"$l\" = quit ] && exit 0; done"),
        ..RunConfig::default()
    };
    config.ports.port = closed_port();
    let mut runner = TestRunner::new(
        config,
        PlatformDescriptor::default(),
        &ServerBanner::default(),
        Box::new(NoDiffs),
    )
    .with_interrupt(signal);
    let mut seen = 0;
    let result = runner
        .run_directory(dir, &["q".to_string()], &mut |_| seen += 1)
        .await;
    assert!(matches!(result, Err(RunnerError::Interrupted)), "{result:?}");
    assert_eq!(seen, 0);
    assert!(runner.finish().records.is_empty());
}

#[tokio::test]
async fn test_interrupt_stops_every_wait_point() {
    let dir = tempfile::tempdir().unwrap();
    child_wait(dir.path()).await;
    sentinel_wait(dir.path()).await;
    liveness_wait(dir.path()).await;
    restart_cooldown(dir.path()).await;
    raised_earlier(dir.path()).await;
}
