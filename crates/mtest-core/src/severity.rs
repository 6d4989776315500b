//! Ordered outcome classification for a test stream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a test stream, in ascending order of badness.
///
/// The derived `Ord` is the contract: aggregation is always `max()`, and
/// because `Skip` is the minimum it only survives aggregation when every
/// input was skipped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Precondition unmet; not a failure.
    Skip,
    /// Output matches the reference.
    Ok,
    /// Cosmetic differences only.
    Warn,
    /// The server did not release its port.
    Socket,
    /// Significant differences.
    Error,
    /// A process ran into its timeout.
    Timeout,
    /// A process aborted (assertion failure).
    Abort,
    /// Too deep recursion.
    Recursion,
    /// A process crashed.
    Segv,
}

impl Severity {
    /// Every severity, in ascending order.
    pub const ALL: [Severity; 9] = [
        Severity::Skip,
        Severity::Ok,
        Severity::Warn,
        Severity::Socket,
        Severity::Error,
        Severity::Timeout,
        Severity::Abort,
        Severity::Recursion,
        Severity::Segv,
    ];

    /// Fold any number of severities into the worst one.
    ///
    /// An empty input aggregates to `Skip`.
    pub fn aggregate<I>(severities: I) -> Severity
    where
        I: IntoIterator<Item = Severity>,
    {
        severities.into_iter().fold(Severity::Skip, Severity::max)
    }

    /// Whether this severity counts as a failed test.
    pub fn is_failure(self) -> bool {
        self >= Severity::Warn
    }

    /// Process-level fault classes that dominate a diff verdict on the
    /// error stream.
    pub fn is_process_fault(self) -> bool {
        matches!(
            self,
            Severity::Socket
                | Severity::Timeout
                | Severity::Abort
                | Severity::Recursion
                | Severity::Segv
        )
    }

    /// Short uppercase name used in logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Skip => "SKIP",
            Severity::Ok => "OK",
            Severity::Warn => "WARN",
            Severity::Socket => "SOCKET",
            Severity::Error => "ERROR",
            Severity::Timeout => "TIMEOUT",
            Severity::Abort => "ABORT",
            Severity::Recursion => "RECURSION",
            Severity::Segv => "SEGV",
        }
    }

    /// Per-stream label for the one-line test report.
    pub fn stream_label(self) -> &'static str {
        match self {
            Severity::Skip => "skip",
            Severity::Ok => "OK",
            Severity::Warn => "minor",
            Severity::Error => "MAJOR",
            Severity::Socket => "SOCKET",
            Severity::Timeout => "TIMEOUT",
            Severity::Abort => "ABORTED",
            Severity::Recursion => "RECURSION",
            Severity::Segv => "CRASHED",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
