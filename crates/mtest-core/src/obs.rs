//! Structured lifecycle events of a test run.
//!
//! - `test_span` tagging everything logged while one test runs
//! - `emit_*` functions for the events worth correlating across a run
//!
//! Events are emitted at `info!` unless they report trouble.

use tracing::{info, warn};

use crate::severity::Severity;

/// The span of one test, for instrumenting a future with.
pub fn test_span(dir: &str, test: &str) -> tracing::Span {
    tracing::info_span!("mtest.test", dir = %dir, test = %test)
}

pub fn emit_test_started(dir: &str, test: &str, kind: &str) {
    info!(event = "test.started", dir = %dir, test = %test, kind = %kind);
}

pub fn emit_test_finished(dir: &str, test: &str, out: Severity, err: Severity, elapsed_ms: u64) {
    info!(
        event = "test.finished",
        dir = %dir,
        test = %test,
        out = %out,
        err = %err,
        elapsed_ms = elapsed_ms,
    );
}

pub fn emit_test_skipped(dir: &str, test: &str, reason: &dyn std::fmt::Display) {
    info!(event = "test.skipped", dir = %dir, test = %test, reason = %reason);
}

/// Server answered its readiness sentinel and liveness probe.
pub fn emit_server_ready(port: u16, pid: Option<u32>, attempt: u32) {
    info!(event = "server.ready", port = port, pid = ?pid, attempt = attempt);
}

pub fn emit_server_start_failed(port: u16, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(event = "server.start_failed", port = port, attempt = attempt, error = %error);
}

/// The watchdog killed a process tree.
pub fn emit_process_timeout(command: &str, pid: Option<u32>, timeout_secs: u64) {
    warn!(
        event = "process.timeout",
        command = %command,
        pid = ?pid,
        timeout_secs = timeout_secs,
    );
}

pub fn emit_port_reassigned(service: &str, old: u16, new: u16) {
    warn!(event = "port.reassigned", service = %service, old = old, new = new);
}

pub fn emit_run_summary(total: usize, failed: usize, skipped: usize, worst: Severity) {
    info!(
        event = "run.summary",
        total = total,
        failed = failed,
        skipped = skipped,
        worst = %worst,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_carries_test_fields() {
        let span = test_span("dir", "test");
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "mtest.test");
            assert!(meta.fields().field("test").is_some());
        }
    }
}
