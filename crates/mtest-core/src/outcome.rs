//! Process-level outcome of one test execution.
//!
//! A test may have two failure sources (its client step and the server it
//! talks to). This module merges their termination causes into a single
//! [`ProcessOutcome`], refines a clean outcome by scanning captured output
//! for crash signatures, and maps the result onto a [`Severity`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::severity::Severity;
use crate::termination::{SignalKind, TerminationCause};

/// Outcome of the process side of a test, before any diff is considered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOutcome {
    Clean,
    Error,
    Signal,
    Socket,
    Timeout,
    Abort,
    Recursion,
    Segfault,
}

/// A user interrupt was observed in one of the merged causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl ProcessOutcome {
    /// Outcome of a single termination cause.
    pub fn from_cause(cause: TerminationCause) -> Result<Self, Interrupted> {
        Ok(match cause {
            TerminationCause::Normal => ProcessOutcome::Clean,
            TerminationCause::ExitError(_) => ProcessOutcome::Error,
            TerminationCause::Signal(SignalKind::Segv | SignalKind::Bus) => {
                ProcessOutcome::Segfault
            }
            TerminationCause::Signal(SignalKind::Abort) => ProcessOutcome::Abort,
            TerminationCause::Signal(SignalKind::Other(_)) => ProcessOutcome::Signal,
            TerminationCause::Timeout => ProcessOutcome::Timeout,
            TerminationCause::Interrupt => return Err(Interrupted),
        })
    }

    /// Merge the client and server causes of one test.
    ///
    /// An interrupt from either side wins outright. Otherwise the first of
    /// timeout, segfault, abort, signal, error found on either side is the
    /// outcome; this fixed order is the client/server tie-break.
    pub fn merge(
        client: Option<TerminationCause>,
        server: Option<TerminationCause>,
    ) -> Result<Self, Interrupted> {
        let client = client.map(Self::from_cause).transpose()?;
        let server = server.map(Self::from_cause).transpose()?;

        const PRECEDENCE: [ProcessOutcome; 5] = [
            ProcessOutcome::Timeout,
            ProcessOutcome::Segfault,
            ProcessOutcome::Abort,
            ProcessOutcome::Signal,
            ProcessOutcome::Error,
        ];
        Ok(PRECEDENCE
            .into_iter()
            .find(|o| client == Some(*o) || server == Some(*o))
            .unwrap_or(ProcessOutcome::Clean))
    }

    /// Refine a clean outcome from the text a script-style test produced.
    ///
    /// Non-clean outcomes are returned unchanged.
    pub fn refine_from_output<'a, I>(self, texts: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        if self != ProcessOutcome::Clean {
            return self;
        }
        let texts: Vec<&str> = texts.into_iter().collect();
        for (pattern, outcome) in output_signatures() {
            if texts.iter().any(|t| t.lines().any(|l| pattern.is_match(l))) {
                return *outcome;
            }
        }
        self
    }

    /// Severity this outcome contributes on its own.
    pub fn severity(self) -> Severity {
        match self {
            ProcessOutcome::Clean => Severity::Ok,
            ProcessOutcome::Error => Severity::Warn,
            ProcessOutcome::Signal => Severity::Error,
            ProcessOutcome::Socket => Severity::Socket,
            ProcessOutcome::Timeout => Severity::Timeout,
            ProcessOutcome::Abort => Severity::Abort,
            ProcessOutcome::Recursion => Severity::Recursion,
            ProcessOutcome::Segfault => Severity::Segv,
        }
    }

    pub fn is_clean(self) -> bool {
        self == ProcessOutcome::Clean
    }
}

/// Crash signatures searched for in script output, in priority order.
fn output_signatures() -> &'static [(Regex, ProcessOutcome)] {
    static SIGNATURES: OnceLock<Vec<(Regex, ProcessOutcome)>> = OnceLock::new();
    SIGNATURES.get_or_init(|| {
        [
            (
                r"^(|[^#]*[\t ])((Memory|Segmentation) [Ff]ault|Bus [Ee]rror|Aborted|Assertion (|.* )failed[:.]|!FATAL: BATSIGabort:)([ \t]|$)",
                ProcessOutcome::Segfault,
            ),
            ("aborted too deep recursion", ProcessOutcome::Recursion),
            (
                r"mal_mapi\.listen:operation failed: bind to stream socket port",
                ProcessOutcome::Socket,
            ),
        ]
        .into_iter()
        .filter_map(|(re, outcome)| Regex::new(re).ok().map(|re| (re, outcome)))
        .collect()
    })
}
