//! Reduction of diff verdicts and process outcomes to per-stream severities.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::outcome::ProcessOutcome;
use crate::severity::Severity;

/// Marker the diff tool writes when outputs are identical.
pub const NO_DIFFS_MARKER: &str = "<!--NoDiffs-->";
/// Marker the diff tool writes for cosmetic differences.
pub const MINOR_DIFFS_MARKER: &str = "<!--MinorDiffs-->";
/// Marker the diff tool writes for significant differences.
pub const MAJOR_DIFFS_MARKER: &str = "<!--MajorDiffs-->";

/// Which captured stream a reference or verdict belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Out,
    Err,
}

impl Stream {
    pub const BOTH: [Stream; 2] = [Stream::Out, Stream::Err];

    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Out => "out",
            Stream::Err => "err",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-state verdict of the external diff tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiffVerdict {
    NoDiff,
    MinorDiff,
    MajorDiff,
}

impl DiffVerdict {
    /// Parse the last line of a diff report.
    ///
    /// Returns `None` when the line carries no recognized marker; callers
    /// treat that as [`DiffVerdict::MajorDiff`].
    pub fn from_marker_line(line: &str) -> Option<Self> {
        if line.starts_with(NO_DIFFS_MARKER) {
            Some(DiffVerdict::NoDiff)
        } else if line.starts_with(MINOR_DIFFS_MARKER) {
            Some(DiffVerdict::MinorDiff)
        } else if line.starts_with(MAJOR_DIFFS_MARKER) {
            Some(DiffVerdict::MajorDiff)
        } else {
            None
        }
    }

    /// Verdict of a whole report: its last line decides. An empty report
    /// is a major difference.
    pub fn from_report(report: &str) -> Option<Self> {
        match report.lines().last() {
            Some(line) => Self::from_marker_line(line),
            None => Some(DiffVerdict::MajorDiff),
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            DiffVerdict::NoDiff => Severity::Ok,
            DiffVerdict::MinorDiff => Severity::Warn,
            DiffVerdict::MajorDiff => Severity::Error,
        }
    }
}

/// Severity of one stream.
///
/// On the error stream a process fault (socket, timeout, abort, recursion,
/// crash) replaces whatever the diff said: it is a refinement of a major
/// difference and is never reported as minor or OK. The output stream
/// carries the diff verdict alone.
pub fn classify(stream: Stream, outcome: Severity, verdict: DiffVerdict) -> Severity {
    match stream {
        Stream::Err if outcome.is_process_fault() => outcome,
        _ => verdict.severity(),
    }
}

/// Classified result of one test: one severity per stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamVerdicts {
    pub out: Severity,
    pub err: Severity,
}

impl StreamVerdicts {
    pub const SKIPPED: StreamVerdicts = StreamVerdicts {
        out: Severity::Skip,
        err: Severity::Skip,
    };

    /// Classify both streams of a test.
    ///
    /// `outcome` is the process outcome, `socket_check` the result of the
    /// post-run port release check; the worse of the two is what the error
    /// stream sees.
    pub fn classify(
        outcome: ProcessOutcome,
        socket_check: Severity,
        out: DiffVerdict,
        err: DiffVerdict,
    ) -> Self {
        let process = outcome.severity().max(socket_check);
        StreamVerdicts {
            out: classify(Stream::Out, process, out),
            err: classify(Stream::Err, process, err),
        }
    }

    /// Worst of the two streams.
    pub fn combined(self) -> Severity {
        Severity::aggregate([self.out, self.err])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_parsing() {
        assert_eq!(
            DiffVerdict::from_marker_line("<!--NoDiffs-->"),
            Some(DiffVerdict::NoDiff)
        );
        assert_eq!(
            DiffVerdict::from_marker_line("<!--MinorDiffs--> trailing"),
            Some(DiffVerdict::MinorDiff)
        );
        assert_eq!(
            DiffVerdict::from_marker_line("<!--MajorDiffs-->"),
            Some(DiffVerdict::MajorDiff)
        );
        assert_eq!(DiffVerdict::from_marker_line("</html>"), None);
    }

    #[test]
    fn test_report_uses_last_line() {
        let report = "<html>\n<!--NoDiffs-->\n<body/>\n<!--MinorDiffs-->\n";
        assert_eq!(DiffVerdict::from_report(report), Some(DiffVerdict::MinorDiff));
        assert_eq!(DiffVerdict::from_report(""), Some(DiffVerdict::MajorDiff));
        assert_eq!(DiffVerdict::from_report("<html>\n</html>\n"), None);
    }

    #[test]
    fn test_crash_dominates_minor_diff_on_err_stream() {
        let v = StreamVerdicts::classify(
            ProcessOutcome::Segfault,
            Severity::Ok,
            DiffVerdict::MinorDiff,
            DiffVerdict::MinorDiff,
        );
        assert_eq!(v.err, Severity::Segv);
        assert_eq!(v.out, Severity::Warn);
        assert_eq!(v.combined(), Severity::Segv);
    }

    #[test]
    fn test_fault_never_downgraded_to_ok() {
        assert_eq!(
            classify(Stream::Err, Severity::Timeout, DiffVerdict::NoDiff),
            Severity::Timeout
        );
        assert_eq!(
            classify(Stream::Err, Severity::Socket, DiffVerdict::MajorDiff),
            Severity::Socket
        );
    }

    #[test]
    fn test_error_exit_leaves_diff_in_charge() {
        let v = StreamVerdicts::classify(
            ProcessOutcome::Error,
            Severity::Ok,
            DiffVerdict::NoDiff,
            DiffVerdict::MinorDiff,
        );
        assert_eq!(v.out, Severity::Ok);
        assert_eq!(v.err, Severity::Warn);
    }

    #[test]
    fn test_socket_check_reaches_err_stream() {
        let v = StreamVerdicts::classify(
            ProcessOutcome::Clean,
            Severity::Socket,
            DiffVerdict::NoDiff,
            DiffVerdict::NoDiff,
        );
        assert_eq!(v.err, Severity::Socket);
        assert_eq!(v.out, Severity::Ok);
    }

    #[test]
    fn test_skipped_combined() {
        assert_eq!(StreamVerdicts::SKIPPED.combined(), Severity::Skip);
    }
}
