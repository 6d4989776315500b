//! Driving the external diff tool and reading its verdict.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use mtest_core::{CommandTemplate, DiffVerdict, TerminationCause, MAJOR_DIFFS_MARKER};
use tracing::{debug, warn};

use crate::error::RunnerResult;
use crate::interrupt::InterruptSignal;
use crate::supervisor::{append_text, LaunchSpec, OutputSink, ProcessSupervisor};

/// Accuracy value meaning "exact comparison, no fuzzy matching at all".
pub const EXACT: i32 = -1;

/// One invocation of the diff tool.
#[derive(Debug, Clone)]
pub struct DiffRequest {
    pub stable: PathBuf,
    pub actual: PathBuf,
    /// Report file; its last line carries the verdict marker.
    pub html: PathBuf,
    pub title: String,
    pub accuracy: i32,
    pub context: u32,
    pub ignore: String,
    /// Pass `-d` (allow fuzzy word-level matching).
    pub fuzzy: bool,
}

impl DiffRequest {
    /// Tool arguments, appended to the configured command.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            format!("-I{}", self.ignore),
            format!("-C{}", self.context),
            format!("-A{}", self.accuracy),
        ];
        if self.fuzzy {
            args.push("-d".to_string());
        }
        args.push(format!("-t{}", self.title));
        args.push(self.stable.display().to_string());
        args.push(self.actual.display().to_string());
        args.push(self.html.display().to_string());
        args
    }
}

/// Compares a produced output with its reference.
#[async_trait]
pub trait DiffTool: Send + Sync {
    /// Run one comparison, writing the report to `request.html`.
    async fn compare(&self, request: &DiffRequest) -> RunnerResult<TerminationCause>;
}

/// Runs a configured diff executable under the supervisor.
#[derive(Debug, Clone)]
pub struct CommandDiffTool {
    template: CommandTemplate,
    timeout: Duration,
    process_group: bool,
    interrupt: InterruptSignal,
}

impl CommandDiffTool {
    pub fn new(template: CommandTemplate, timeout: Duration, process_group: bool) -> Self {
        Self {
            template,
            timeout,
            process_group,
            interrupt: InterruptSignal::none(),
        }
    }

    pub fn with_interrupt(mut self, signal: InterruptSignal) -> Self {
        self.interrupt = signal;
        self
    }
}

#[async_trait]
impl DiffTool for CommandDiffTool {
    async fn compare(&self, request: &DiffRequest) -> RunnerResult<TerminationCause> {
        let spec = LaunchSpec::from_template(&self.template.with_args(request.args()))?
            .stdout(OutputSink::Null)
            .stderr(OutputSink::Null)
            .timeout(self.timeout)
            .process_group(self.process_group)
            .stack_trace(false)
            .interrupt(self.interrupt.clone());
        ProcessSupervisor::run(spec).await
    }
}

/// Accuracy the first diff run starts with.
///
/// Comparison is exact when the reference was synthesized, when the
/// process side of the test was not clean, or when the produced output is
/// less than half or more than one and a half times the reference size.
pub fn starting_accuracy(
    configured: i32,
    synthesized: bool,
    clean: bool,
    stable_len: u64,
    actual_len: u64,
) -> i32 {
    let out_of_proportion =
        actual_len.saturating_mul(2) < stable_len || actual_len.saturating_mul(2) > stable_len.saturating_mul(3);
    if synthesized || !clean || out_of_proportion {
        EXACT
    } else {
        configured
    }
}

/// Compare `actual` with `stable` and return the verdict.
///
/// Starts at `request.accuracy`. The report is pre-seeded with the
/// major-difference marker so a tool that dies before writing anything
/// still yields MajorDiff. A run the watchdog killed is repeated with one
/// less accuracy until accuracy drops below zero.
pub async fn run_diff(
    tool: &dyn DiffTool,
    mut request: DiffRequest,
) -> RunnerResult<DiffVerdict> {
    let mut accuracy = request.accuracy;
    loop {
        if accuracy == EXACT {
            accuracy = 0;
            request.fuzzy = false;
        } else {
            request.fuzzy = true;
        }
        request.accuracy = accuracy;
        std::fs::write(&request.html, format!("{MAJOR_DIFFS_MARKER}\n"))?;

        let cause = tool.compare(&request).await?;
        debug!(
            stable = %request.stable.display(),
            accuracy,
            cause = %cause,
            "diff finished"
        );
        accuracy -= 1;
        if cause != TerminationCause::Timeout || accuracy < 0 {
            break;
        }
        warn!(title = %request.title, accuracy, "diff tool timed out; retrying with lower accuracy");
    }
    read_verdict(&request.html)
}

/// Verdict recorded on the last line of a diff report.
///
/// An unrecognized last line is logged and the major-difference marker is
/// appended so the report agrees with the verdict.
pub fn read_verdict(html: &Path) -> RunnerResult<DiffVerdict> {
    let report = std::fs::read_to_string(html)?;
    match DiffVerdict::from_report(&report) {
        Some(verdict) => Ok(verdict),
        None => {
            let last = report.lines().last().unwrap_or_default();
            warn!(report = %html.display(), last_line = %last, "unrecognized diff verdict; assuming major differences");
            append_text(html, &format!("\n{MAJOR_DIFFS_MARKER}\n"))?;
            Ok(DiffVerdict::MajorDiff)
        }
    }
}
