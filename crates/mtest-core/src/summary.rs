//! Run-wide aggregation and the closing report.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::classify::StreamVerdicts;
use crate::severity::Severity;

/// Result of one test as it enters the summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestRecord {
    pub dir: String,
    pub name: String,
    pub verdicts: StreamVerdicts,
    pub elapsed_ms: u64,
    /// Skip reason, when skipped.
    pub reason: Option<String>,
}

impl TestRecord {
    pub fn severity(&self) -> Severity {
        self.verdicts.combined()
    }

    /// `dir/name`, or just `name` for the top-level directory.
    pub fn qualified_name(&self) -> String {
        if self.dir.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.dir, self.name)
        }
    }

    /// One-line report of the test: name, elapsed time, then the skip
    /// reason or one label per stream.
    pub fn report_line(&self) -> String {
        let status = match (&self.reason, self.severity()) {
            (Some(reason), Severity::Skip) => format!("skipped {reason}"),
            _ => format!(
                "{:<9} {}",
                self.verdicts.out.stream_label(),
                self.verdicts.err.stream_label()
            ),
        };
        format!(
            "{:<48} {:>8.2}s  {status}",
            self.qualified_name(),
            self.elapsed_ms as f64 / 1000.0
        )
    }
}

/// Order and wording of the report lines.
const REPORT_ORDER: [(Severity, &str); 8] = [
    (Severity::Skip, "could not be executed"),
    (Severity::Warn, "produced slightly different output"),
    (Severity::Socket, "did not properly release socket(s)"),
    (Severity::Timeout, "ran into timeout"),
    (Severity::Abort, "caused an abort (assertion failure)"),
    (Severity::Segv, "resulted in a crash"),
    (Severity::Recursion, "ran into too deep recursion"),
    (Severity::Error, "produced SIGNIFICANTLY different output"),
];

/// Every test of a run, in execution order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub records: Vec<TestRecord>,
    pub display_cap: usize,
}

impl RunSummary {
    pub fn new(display_cap: usize) -> Self {
        RunSummary {
            records: Vec::new(),
            display_cap,
        }
    }

    pub fn record(&mut self, record: TestRecord) {
        self.records.push(record);
    }

    pub fn total(&self) -> usize {
        self.records.len()
    }

    /// Number of tests whose severity is WARN or worse.
    pub fn failed(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.severity().is_failure())
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.severity() == Severity::Skip)
            .count()
    }

    /// Worst severity of the whole run.
    pub fn worst(&self) -> Severity {
        Severity::aggregate(self.records.iter().map(TestRecord::severity))
    }

    /// Test names bucketed by severity.
    pub fn buckets(&self) -> BTreeMap<Severity, Vec<String>> {
        let mut buckets: BTreeMap<Severity, Vec<String>> = BTreeMap::new();
        for r in &self.records {
            buckets
                .entry(r.severity())
                .or_default()
                .push(r.qualified_name());
        }
        buckets
    }

    /// Process exit code: 1 when any test failed.
    pub fn exit_code(&self) -> i32 {
        if self.failed() > 0 {
            1
        } else {
            0
        }
    }

    /// Closing report. Empty when nothing failed or was skipped.
    pub fn render(&self) -> String {
        let buckets = self.buckets();
        let total = self.total();
        let failed = self.failed();
        let skipped = self.skipped();

        let mut how = "";
        let mut what = String::new();
        for (severity, phrase) in REPORT_ORDER {
            let Some(names) = buckets.get(&severity) else {
                continue;
            };
            how = if severity == Severity::Skip {
                ""
            } else if severity == Severity::Warn {
                "slightly"
            } else {
                "SIGNIFICANTLY"
            };
            let _ = writeln!(what, "  {:3} out of {:3} tests {phrase}", names.len(), total);
            let listed = failed < self.display_cap
                && (severity != Severity::Skip || skipped + failed < self.display_cap);
            if listed {
                for name in names {
                    let _ = writeln!(what, "        {name}");
                }
            }
        }

        if failed == 0 {
            return what;
        }
        format!(
            "\n !ERROR:  Testing FAILED {how} ({failed} out of {total} tests failed)\n\n{what}\n"
        )
    }
}
