//! mtest runner
//!
//! Everything that touches the operating system: process supervision with
//! timeouts and tree kills, TCP port probing and allocation, the server
//! lifecycle, the external diff tool, and the sequential test pipeline.

pub mod diff;
pub mod error;
pub mod interrupt;
pub mod pipeline;
pub mod port;
pub mod process_tree;
pub mod server;
pub mod supervisor;
pub mod testcase;

pub use diff::{
    read_verdict, run_diff, starting_accuracy, CommandDiffTool, DiffRequest, DiffTool,
};
pub use error::{RunnerError, RunnerResult};
pub use interrupt::InterruptSignal;
pub use pipeline::TestRunner;
pub use port::{PortAllocator, PortAssignment, PortCheck, PortLease, ProbeResult, SocketProbe};
pub use process_tree::kill_tree;
#[cfg(unix)]
pub use process_tree::is_alive;
pub use server::{
    liveness_probe, probe_platform, RunningServer, ServerLifecycle, ServerLogs, ServerState,
};
pub use supervisor::{LaunchSpec, OutputSink, ProcessHandle, ProcessSupervisor, StdinSource};
pub use testcase::{ServerKind, TestCase, TestKind, TimeoutBudget};
