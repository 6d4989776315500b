//! mtest core library
//!
//! Domain model of the test harness: severities, termination causes,
//! outcome classification, platform description, stable-output resolution,
//! skip preconditions, run configuration and the run summary. Nothing in
//! this crate spawns processes or opens sockets.

pub mod classify;
pub mod config;
pub mod error;
pub mod obs;
pub mod outcome;
pub mod platform;
pub mod precondition;
pub mod severity;
pub mod stable;
pub mod summary;
pub mod telemetry;
pub mod termination;

pub use classify::{
    classify, DiffVerdict, Stream, StreamVerdicts, MAJOR_DIFFS_MARKER, MINOR_DIFFS_MARKER,
    NO_DIFFS_MARKER,
};
pub use config::{
    ClientKind, CommandTemplate, Conditional, PortConfig, PortDiscovery, RunConfig, ServerConfig,
};
pub use error::{BannerError, MtestError, Result};
pub use obs::{
    emit_port_reassigned, emit_process_timeout, emit_run_summary, emit_server_ready,
    emit_server_start_failed, emit_test_finished, emit_test_skipped, emit_test_started, test_span,
};
pub use outcome::{Interrupted, ProcessOutcome};
pub use platform::{local_hostname, HostIdentity, PlatformDescriptor, ServerBanner};
pub use precondition::{PreconditionContext, Requirements, SkipReason};
pub use severity::Severity;
pub use stable::{Resolution, StableOutputResolver};
pub use summary::{RunSummary, TestRecord};
pub use telemetry::init_tracing;
pub use termination::{SignalKind, TerminationCause};

/// Crate version, reported by `mtest --version` and in test headers.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
