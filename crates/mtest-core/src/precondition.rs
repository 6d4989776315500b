//! Skip preconditions evaluated before a test is run.
//!
//! A skipped test is not a failure; it is reported with severity `SKIP` and
//! one of the reasons below.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use crate::config::{ClientKind, Conditional, RunConfig};
use crate::error::Result;

/// Why a test will not be run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The `.cond` file names a conditional that does not hold.
    ConditionalFails(String),
    /// A negated conditional (`!FLAG`) holds.
    ConditionalHolds(String),
    UnknownConditional(String),
    /// A `THREADS=n`, `THREADS<=n` or `THREADS>=n` constraint failed.
    ThreadCount(String),
    MissingModules(Vec<String>),
    /// Tests named in `.reqtests` did not pass earlier in this run.
    RequiredTestsFailed(Vec<String>),
    ClientUnavailable(ClientKind),
    /// The service port was busy and could not be reassigned.
    PortBusy(u16),
    /// No source file for the test exists.
    SourceMissing,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ConditionalFails(c) => write!(f, "as conditional '{c}' does not hold."),
            SkipReason::ConditionalHolds(c) => write!(f, "as conditional '{c}' holds."),
            SkipReason::UnknownConditional(c) => write!(f, "as conditional '{c}' is unknown."),
            SkipReason::ThreadCount(_) => write!(f, "as number of threads is wrong"),
            SkipReason::MissingModules(m) => write!(
                f,
                "as modules '{}' {} missing.",
                m.join("', '"),
                if m.len() == 1 { "is" } else { "are" }
            ),
            SkipReason::RequiredTestsFailed(t) => write!(
                f,
                "as required test{} '{}' failed.",
                if t.len() == 1 { "" } else { "s" },
                t.join("', '")
            ),
            SkipReason::ClientUnavailable(k) => write!(f, "as the {k:?} client is not available."),
            SkipReason::PortBusy(p) => write!(f, "as port {p} is busy."),
            SkipReason::SourceMissing => write!(f, "as source file not found."),
        }
    }
}

/// What a test needs from its environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct Requirements {
    pub client: Option<ClientKind>,
    /// The test drives an SQL-enabled server, so the `sql` module must exist.
    pub sql_server: bool,
}

/// Run-wide facts the checks are evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct PreconditionContext<'a> {
    pub config: &'a RunConfig,
    /// Modules reported by the server banner.
    pub modules: &'a [String],
    /// Server thread count, when known.
    pub threads: Option<u32>,
    /// Tests that passed earlier in this run.
    pub passed: &'a BTreeSet<String>,
}

impl<'a> PreconditionContext<'a> {
    /// First failing precondition of test `name` in `dir`, if any.
    ///
    /// Order: conditionals, modules, required tests, client availability.
    pub fn check(&self, dir: &Path, name: &str, req: Requirements) -> Result<Option<SkipReason>> {
        if let Some(cond) = read_optional(&dir.join(format!("{name}.cond")))? {
            if let Some(reason) = self.check_conditions(&cond) {
                return Ok(Some(reason));
            }
        }

        let mut missing = Vec::new();
        if let Some(mods) = read_optional(&dir.join(format!("{name}.modules")))? {
            missing.extend(
                entries(&mods)
                    .filter(|m| !self.modules.iter().any(|have| have == *m))
                    .map(str::to_string),
            );
        }
        if req.sql_server && !self.modules.iter().any(|m| m == "sql") {
            missing.push("sql".to_string());
        }
        if !missing.is_empty() {
            return Ok(Some(SkipReason::MissingModules(missing)));
        }

        if let Some(reqs) = read_optional(&dir.join(format!("{name}.reqtests")))? {
            let failed: Vec<String> = entries(&reqs)
                .filter(|t| !self.passed.contains(*t))
                .map(str::to_string)
                .collect();
            if !failed.is_empty() {
                return Ok(Some(SkipReason::RequiredTestsFailed(failed)));
            }
        }

        if let Some(kind) = req.client {
            if self.config.client(kind).is_none() {
                return Ok(Some(SkipReason::ClientUnavailable(kind)));
            }
        }
        Ok(None)
    }

    /// Evaluate a `&`-separated list of conditions.
    pub fn check_conditions(&self, conditions: &str) -> Option<SkipReason> {
        for raw in conditions.split(|c: char| c == '&' || c.is_whitespace()) {
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let (negate, cond) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };

            if let Some(holds) = self.thread_constraint(cond) {
                if holds == negate {
                    return Some(SkipReason::ThreadCount(raw.to_string()));
                }
                continue;
            }

            let Ok(flag) = cond.parse::<Conditional>() else {
                return Some(SkipReason::UnknownConditional(cond.to_string()));
            };
            if self.config.conditional(flag) == negate {
                return Some(if negate {
                    SkipReason::ConditionalHolds(cond.to_string())
                } else {
                    SkipReason::ConditionalFails(cond.to_string())
                });
            }
        }
        None
    }

    /// `Some(holds)` when `cond` is a thread-count constraint.
    fn thread_constraint(&self, cond: &str) -> Option<bool> {
        let threads = self.threads.unwrap_or(0);
        if let Some(n) = cond.strip_prefix("THREADS<=") {
            Some(n.parse::<u32>().map_or(false, |n| threads <= n))
        } else if let Some(n) = cond.strip_prefix("THREADS>=") {
            Some(n.parse::<u32>().map_or(false, |n| threads >= n))
        } else {
            cond.strip_prefix("THREADS=")
                .map(|n| n.parse::<u32>().map_or(false, |n| self.threads == Some(n)))
        }
    }
}

/// Non-empty, non-comment lines of a list file.
fn entries(contents: &str) -> impl Iterator<Item = &str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
