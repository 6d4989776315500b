//! Structured termination causes for supervised child processes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::ExitStatus;

/// Crash-class signal kinds distinguished by the classifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "signo")]
pub enum SignalKind {
    Segv,
    Bus,
    Abort,
    Other(i32),
}

/// Why a child process ended.
///
/// Produced once by the supervisor when the child is reaped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "cause", content = "detail")]
pub enum TerminationCause {
    Normal,
    ExitError(i32),
    Signal(SignalKind),
    Timeout,
    Interrupt,
}

/// Windows: `abort()` exits with code 3.
const WIN_ABORT: i32 = 3;
/// Windows: STATUS_ACCESS_VIOLATION (0xC0000005).
const WIN_ACCESS_VIOLATION: i32 = -1_073_741_819;
/// Windows: STATUS_CONTROL_C_EXIT (0xC000013A).
const WIN_CONTROL_C_EXIT: i32 = -1_073_741_510;

impl TerminationCause {
    /// Interpret an OS exit status.
    ///
    /// `killed` is the supervisor's kill flag: once the watchdog or the
    /// caller has force-killed the process tree the cause is `Timeout`,
    /// whatever the OS reports.
    pub fn from_exit_status(status: ExitStatus, killed: bool) -> Self {
        if killed {
            return TerminationCause::Timeout;
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Self::from_posix(status.code(), status.signal())
        }

        #[cfg(not(unix))]
        {
            Self::from_windows(status.code().unwrap_or(-1))
        }
    }

    /// POSIX mapping from exit code / terminating signal.
    #[cfg(unix)]
    pub fn from_posix(code: Option<i32>, signo: Option<i32>) -> Self {
        use nix::sys::signal::Signal;

        if let Some(signo) = signo {
            return match Signal::try_from(signo) {
                Ok(Signal::SIGSEGV) => TerminationCause::Signal(SignalKind::Segv),
                Ok(Signal::SIGBUS) => TerminationCause::Signal(SignalKind::Bus),
                Ok(Signal::SIGABRT) => TerminationCause::Signal(SignalKind::Abort),
                Ok(Signal::SIGINT) => TerminationCause::Interrupt,
                _ => TerminationCause::Signal(SignalKind::Other(signo)),
            };
        }
        match code {
            Some(0) => TerminationCause::Normal,
            Some(code) => TerminationCause::ExitError(code),
            None => TerminationCause::ExitError(-1),
        }
    }

    /// Windows mapping from the process exit code.
    pub fn from_windows(code: i32) -> Self {
        match code {
            0 => TerminationCause::Normal,
            WIN_ABORT => TerminationCause::Signal(SignalKind::Abort),
            WIN_ACCESS_VIOLATION => TerminationCause::Signal(SignalKind::Segv),
            WIN_CONTROL_C_EXIT => TerminationCause::Interrupt,
            other => TerminationCause::ExitError(other),
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, TerminationCause::Normal)
    }

    /// Line appended to the process's error stream for crash-class causes.
    ///
    /// Timeouts carry no annotation here; the watchdog writes its own marker.
    pub fn annotation(&self) -> Option<String> {
        match self {
            TerminationCause::Signal(SignalKind::Segv) => Some("Segmentation fault".to_string()),
            TerminationCause::Signal(SignalKind::Bus) => Some("Bus error".to_string()),
            TerminationCause::Signal(SignalKind::Abort) => Some("Aborted".to_string()),
            TerminationCause::Signal(SignalKind::Other(n)) => Some(format!("Signal {n}")),
            TerminationCause::Interrupt => Some("Interrupt".to_string()),
            TerminationCause::Normal
            | TerminationCause::ExitError(_)
            | TerminationCause::Timeout => None,
        }
    }
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationCause::Normal => write!(f, "exited normally"),
            TerminationCause::ExitError(code) => write!(f, "exited with code {code}"),
            TerminationCause::Signal(SignalKind::Segv) => write!(f, "segmentation fault"),
            TerminationCause::Signal(SignalKind::Bus) => write!(f, "bus error"),
            TerminationCause::Signal(SignalKind::Abort) => write!(f, "aborted"),
            TerminationCause::Signal(SignalKind::Other(n)) => write!(f, "killed by signal {n}"),
            TerminationCause::Timeout => write!(f, "timed out"),
            TerminationCause::Interrupt => write!(f, "interrupted"),
        }
    }
}
