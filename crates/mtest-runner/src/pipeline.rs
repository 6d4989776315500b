//! Sequential test execution.
//!
//! One test at a time: preconditions, port lease, server start, client
//! step, server shutdown, socket check, diffs, classification. A failing
//! test never stops the run; only a fatal condition or a user interrupt
//! does.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use mtest_core::{
    emit_run_summary, emit_test_finished, emit_test_skipped, emit_test_started, test_span,
    DiffVerdict, HostIdentity, PlatformDescriptor, PortDiscovery, PreconditionContext,
    ProcessOutcome, RunConfig, RunSummary, ServerBanner, Severity, SkipReason,
    StableOutputResolver, Stream, StreamVerdicts, TerminationCause, TestRecord,
};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::diff::{run_diff, starting_accuracy, CommandDiffTool, DiffRequest, DiffTool};
use crate::error::{RunnerError, RunnerResult};
use crate::interrupt::InterruptSignal;
use crate::port::{PortAllocator, PortAssignment, PortLease};
use crate::server::{probe_platform, ServerLifecycle, ServerLogs};
use crate::supervisor::{append_text, LaunchSpec, OutputSink, ProcessSupervisor};
use crate::testcase::{TestCase, TimeoutBudget};

/// Service name used in socket-check messages.
const SERVICE: &str = "MAPI";

/// How one test ended up.
enum Execution {
    Skipped(SkipReason),
    Finished(StreamVerdicts),
}

/// Runs tests one after another and accumulates the run summary.
pub struct TestRunner {
    run_id: Uuid,
    config: RunConfig,
    resolver: StableOutputResolver,
    allocator: PortAllocator,
    diff: Box<dyn DiffTool>,
    interrupt: InterruptSignal,
    modules: Vec<String>,
    threads: Option<u32>,
    /// Tests that passed so far, for `.reqtests`.
    passed: BTreeSet<String>,
    summary: RunSummary,
}

impl TestRunner {
    pub fn new(
        config: RunConfig,
        platform: PlatformDescriptor,
        banner: &ServerBanner,
        diff: Box<dyn DiffTool>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            resolver: StableOutputResolver::new(platform),
            allocator: PortAllocator::from_config(&config),
            diff,
            interrupt: InterruptSignal::none(),
            modules: banner.modules.clone(),
            threads: banner.threads.or(config.server.threads),
            passed: BTreeSet::new(),
            summary: RunSummary::new(config.display_cap),
            config,
        }
    }

    /// Stop the run, killing whatever is running, once `signal` is raised.
    pub fn with_interrupt(mut self, signal: InterruptSignal) -> Self {
        self.interrupt = signal;
        self
    }

    /// Prepare a run: listen for Ctrl-C, pick the server port, probe the
    /// server once for its platform and modules, and wire up the configured
    /// diff tool.
    pub async fn bootstrap(mut config: RunConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid run configuration")?;
        let interrupt = InterruptSignal::install().context("cannot listen for interrupts")?;

        if config.ports.discovery == PortDiscovery::Random {
            let allocator = PortAllocator::from_config(&config);
            let (port, host) = allocator.allocate();
            if port == 0 {
                return Err(anyhow::Error::new(RunnerError::PortExhausted {
                    low: config.ports.low,
                    high: config.ports.high,
                    attempts: config.ports.attempts,
                })
                .context("cannot pick a server port"));
            }
            info!(port, host = %host, "using random server port");
            let old = config.ports.port;
            config.rewrite_port(old, port);
        }

        let banner = probe_platform(
            &config.server,
            config.ports.port,
            config.timeout(),
            config.process_groups,
            &interrupt,
        )
        .await
        .context("cannot probe the server platform")?;
        let platform = PlatformDescriptor::new(HostIdentity::detect(), &banner);
        info!(
            system = %platform.system,
            release = %platform.system_release,
            bits = platform.bits,
            oids = platform.oid_width,
            modules = ?banner.modules,
            "platform probed"
        );

        let diff = Box::new(
            CommandDiffTool::new(config.diff.clone(), config.timeout(), config.process_groups)
                .with_interrupt(interrupt.clone()),
        );
        Ok(Self::new(config, platform, &banner, diff).with_interrupt(interrupt))
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Close the run and hand back its summary.
    pub fn finish(self) -> RunSummary {
        let s = &self.summary;
        emit_run_summary(s.total(), s.failed(), s.skipped(), s.worst());
        self.summary
    }

    /// Run `tests` from `dir` in order, calling `on_record` after each.
    ///
    /// Returns the worst severity of this call's tests. Stops early only on
    /// a fatal condition or an interrupt.
    pub async fn run_directory(
        &mut self,
        dir: &Path,
        tests: &[String],
        on_record: &mut dyn FnMut(&TestRecord),
    ) -> RunnerResult<Severity> {
        info!(
            run_id = %self.run_id,
            dir = %dir_label(dir),
            tests = tests.len(),
            "running directory"
        );
        let mut severities = Vec::with_capacity(tests.len());
        for name in tests {
            let record = self.run_test(dir, name).await?;
            on_record(&record);
            severities.push(record.severity());
        }
        Ok(Severity::aggregate(severities))
    }

    fn check_interrupt(&self) -> RunnerResult<()> {
        if self.interrupt.is_raised() {
            return Err(RunnerError::Interrupted);
        }
        Ok(())
    }

    /// Run one test and add it to the summary.
    ///
    /// Errors that concern only this test are recorded as ERROR; only
    /// fatal conditions and interrupts are returned.
    pub async fn run_test(&mut self, dir: &Path, name: &str) -> RunnerResult<TestRecord> {
        self.check_interrupt()?;
        let started = Instant::now();
        let label = dir_label(dir);
        let span = test_span(&label, name);
        let execution = self.execute(dir, &label, name).instrument(span).await;

        let (verdicts, reason) = match execution {
            Ok(Execution::Finished(verdicts)) => (verdicts, None),
            Ok(Execution::Skipped(reason)) => {
                emit_test_skipped(&label, name, &reason);
                (StreamVerdicts::SKIPPED, Some(reason.to_string()))
            }
            Err(e) if e.is_fatal() || e.is_interrupt() => return Err(e),
            Err(e) => {
                warn!(dir = %label, test = %name, error = %e, "test could not be run");
                let failed = StreamVerdicts {
                    out: Severity::Error,
                    err: Severity::Error,
                };
                (failed, Some(e.to_string()))
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if verdicts.combined() == Severity::Ok {
            self.passed.insert(name.to_string());
        }
        if verdicts != StreamVerdicts::SKIPPED {
            emit_test_finished(&label, name, verdicts.out, verdicts.err, elapsed_ms);
        }
        let record = TestRecord {
            dir: label,
            name: name.to_string(),
            verdicts,
            elapsed_ms,
            reason,
        };
        self.summary.record(record.clone());
        Ok(record)
    }

    async fn execute(&mut self, dir: &Path, label: &str, name: &str) -> RunnerResult<Execution> {
        let Some(case) = TestCase::detect(dir, name)? else {
            return Ok(Execution::Skipped(SkipReason::SourceMissing));
        };
        emit_test_started(label, name, case.kind.as_str());

        let ctx = PreconditionContext {
            config: &self.config,
            modules: &self.modules,
            threads: self.threads,
            passed: &self.passed,
        };
        if let Some(reason) = ctx.check(dir, name, case.requirements())? {
            return Ok(Execution::Skipped(reason));
        }

        let mut notes = String::new();
        let lease = if case.needs_server() {
            let port = self.config.ports.port;
            match self
                .allocator
                .check_and_maybe_reassign(SERVICE, port, &mut self.config)
            {
                PortAssignment::Available(lease) => Some(lease),
                PortAssignment::Reassigned { lease, message, .. } => {
                    notes.push_str(&message);
                    Some(lease)
                }
                PortAssignment::Unavailable { message } => {
                    warn!(port, message = %message.trim(), "no usable port");
                    return Ok(Execution::Skipped(SkipReason::PortBusy(port)));
                }
            }
        } else {
            None
        };
        let port = self.config.ports.port;

        let stable_out = self.resolver.resolve(dir, name, Stream::Out)?;
        let stable_err = self.resolver.resolve(dir, name, Stream::Err)?;
        let budget = TimeoutBudget::for_case(self.config.timeout_secs, &case)?;

        let out = case.file(".test.out");
        let err = case.file(".test.err");
        std::fs::write(
            &out,
            format!("stdout of test '{name}` in directory '{label}` itself:\n\n"),
        )?;
        std::fs::write(
            &err,
            format!("stderr of test '{name}` in directory '{label}` itself:\n\n{notes}"),
        )?;

        self.check_interrupt()?;
        let client = case
            .client_spec(&self.config, port)?
            .timeout(budget.client)
            .interrupt(self.interrupt.clone());
        let (client_cause, server_cause) = match lease {
            Some(lease) => {
                let (client, server) = self
                    .run_with_server(&case, client, port, budget, lease)
                    .await?;
                (client, Some(server))
            }
            None => {
                let text = prompt(&client.quoted());
                append_text(&out, &text)?;
                append_text(&err, &text)?;
                let client = client
                    .stdout(OutputSink::Append(out.clone()))
                    .stderr(OutputSink::Append(err.clone()));
                (ProcessSupervisor::run(client).await?, None)
            }
        };

        let mut socket = Severity::Ok;
        if case.needs_server() {
            if let Some(message) = self.allocator.check_released(SERVICE, port) {
                append_text(&err, &message)?;
                socket = Severity::Socket;
            }
        }

        let done = prompt("Done.");
        append_text(&out, &done)?;
        append_text(&err, &done)?;

        let mut outcome = ProcessOutcome::merge(Some(client_cause), server_cause)?;
        if case.kind.is_opaque() {
            let texts = [read_lossy(&out)?, read_lossy(&err)?];
            outcome = outcome.refine_from_output(texts.iter().map(String::as_str));
        }

        self.check_interrupt()?;
        let mut verdicts = [DiffVerdict::MajorDiff; 2];
        for (slot, (stream, stable, actual)) in verdicts.iter_mut().zip([
            (Stream::Out, &stable_out, &out),
            (Stream::Err, &stable_err, &err),
        ]) {
            let accuracy = starting_accuracy(
                self.config.accuracy,
                stable.force_exact(),
                outcome.is_clean(),
                file_len(&stable.path),
                file_len(actual),
            );
            let request = DiffRequest {
                stable: stable.path.clone(),
                actual: actual.clone(),
                html: case.file(&format!(".{stream}.diff.html")),
                title: format!("{name}.{stream}"),
                accuracy,
                context: self.config.diff_context,
                ignore: self.config.diff_ignore.clone(),
                fuzzy: true,
            };
            *slot = run_diff(self.diff.as_ref(), request).await?;
        }

        Ok(Execution::Finished(StreamVerdicts::classify(
            outcome,
            socket,
            verdicts[0],
            verdicts[1],
        )))
    }

    /// Start the server, run the client against it, shut the server down,
    /// and append both sides' output to the test files.
    async fn run_with_server(
        &self,
        case: &TestCase,
        client: LaunchSpec,
        port: u16,
        budget: TimeoutBudget,
        lease: PortLease,
    ) -> RunnerResult<(TerminationCause, TerminationCause)> {
        let logs = ServerLogs {
            out: case.file(".server.out"),
            err: case.file(".server.err"),
        };
        let client_out = case.file(".client.out");
        let client_err = case.file(".client.err");

        let text = prompt(&self.config.server.argv(port).join("\" \""));
        std::fs::write(&logs.out, &text)?;
        std::fs::write(&logs.err, &text)?;

        lease.release();
        let mut lifecycle = ServerLifecycle::new(&self.config.server, self.config.process_groups)
            .with_interrupt(self.interrupt.clone());
        let server = lifecycle
            .start(port, budget.server, &case.dir, &logs)
            .await?;

        let text = prompt(&client.quoted());
        std::fs::write(&client_out, &text)?;
        std::fs::write(&client_err, &text)?;
        let client = client
            .stdout(OutputSink::Append(client_out.clone()))
            .stderr(OutputSink::Append(client_err.clone()));
        let client_cause = ProcessSupervisor::run(client).await;
        let server_cause = match &client_cause {
            Err(e) if e.is_interrupt() => server.kill().await,
            _ => server.shutdown().await,
        };
        let client_cause = client_cause?;
        let server_cause = server_cause?;

        for (target, parts) in [
            (case.file(".test.out"), [&logs.out, &client_out]),
            (case.file(".test.err"), [&logs.err, &client_err]),
        ] {
            for part in parts {
                append_text(&target, &read_lossy(part)?)?;
            }
        }
        Ok((client_cause, server_cause))
    }
}

/// Timestamped command prompt written before each step's output.
fn prompt(quoted: &str) -> String {
    let p = format!("\n# {} >  ", chrono::Local::now().format("%H:%M:%S"));
    format!("{p}{p}\"{quoted}\"{p}\n\n")
}

/// Directory as given by the caller. Test directories commonly share a
/// basename, so the whole path is kept.
fn dir_label(dir: &Path) -> String {
    dir.display().to_string()
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map_or(0, |m| m.len())
}

fn read_lossy(path: &Path) -> std::io::Result<String> {
    Ok(String::from_utf8_lossy(&std::fs::read(path)?).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct AlwaysSame;

    #[async_trait]
    impl DiffTool for AlwaysSame {
        async fn compare(&self, request: &DiffRequest) -> RunnerResult<TerminationCause> {
            std::fs::write(&request.html, "<!--NoDiffs-->\n")?;
            Ok(TerminationCause::Normal)
        }
    }

    fn runner() -> TestRunner {
        let banner = ServerBanner {
            bits: 64,
            oid_width: 64,
            modules: vec!["sql".into(), "mal".into()],
            ..ServerBanner::default()
        };
        TestRunner::new(
            RunConfig::default(),
            PlatformDescriptor::default(),
            &banner,
            Box::new(AlwaysSame),
        )
    }

    #[test]
    fn test_prompt_format() {
        let p = prompt("mclient\" \"-lsql");
        assert!(p.starts_with("\n# "));
        assert!(p.contains(" >  \"mclient\" \"-lsql\"\n# "));
        assert!(p.ends_with(" >  \n\n"));
    }

    #[test]
    fn test_dir_label_keeps_parent() {
        assert_eq!(dir_label(Path::new("sql/Tests")), "sql/Tests");
        assert_ne!(
            dir_label(Path::new("gdk/Tests")),
            dir_label(Path::new("sql/Tests"))
        );
    }

    #[tokio::test]
    async fn test_missing_source_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = runner();
        let record = r.run_test(dir.path(), "ghost").await.unwrap();
        assert_eq!(record.severity(), Severity::Skip);
        assert_eq!(record.reason.as_deref(), Some("as source file not found."));
        assert_eq!(r.summary().total(), 1);
        assert_eq!(r.summary().failed(), 0);
    }

    #[tokio::test]
    async fn test_unmet_module_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t.py"), "print(1)\n").unwrap();
        std::fs::write(dir.path().join("t.modules"), "geom\n").unwrap();
        let mut r = runner();
        let record = r.run_test(dir.path(), "t").await.unwrap();
        assert_eq!(record.severity(), Severity::Skip);
        assert!(record.reason.unwrap().contains("geom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_passes_and_unlocks_dependent() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        for name in ["first", "second"] {
            let script = dir.path().join(format!("{name}.sh"));
            std::fs::write(&script, "#!/bin/sh\necho hello\n").unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        std::fs::write(dir.path().join("second.reqtests"), "first\n").unwrap();

        let mut r = runner();
        let mut seen = Vec::new();
        let worst = r
            .run_directory(
                dir.path(),
                &["first".to_string(), "second".to_string()],
                &mut |rec| seen.push(rec.severity()),
            )
            .await
            .unwrap();
        assert_eq!(seen, vec![Severity::Ok, Severity::Ok]);
        assert_eq!(worst, Severity::Ok);

        let out = std::fs::read_to_string(dir.path().join("first.test.out")).unwrap();
        assert!(out.starts_with("stdout of test 'first` in directory '"));
        assert!(out.contains("hello\n"));
        assert!(out.contains("\"Done.\""));
        // a missing reference is synthesized empty
        assert!(dir.path().join("first.stable.out").exists());
        assert_eq!(r.finish().exit_code(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_signature_in_script_output() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("t.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'Segmentation fault' >&2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut r = runner();
        let record = r.run_test(dir.path(), "t").await.unwrap();
        assert_eq!(record.verdicts.err, Severity::Segv);
        assert_eq!(record.verdicts.out, Severity::Ok);
        assert_eq!(r.summary().failed(), 1);
    }
}
