//! mtest - acceptance-suite runner
//!
//! The `mtest` command runs database acceptance tests one at a time against
//! a supervised server and compares their output with platform-specific
//! reference files.
//!
//! ## Commands
//!
//! - `run`: run tests from one directory and print the summary
//! - `stable`: show which reference files a test would be compared with
//! - `platform`: probe the server and print the platform descriptor
//! - `port`: pick a free port from the configured range
//!
//! Exit status is 0 when no test failed, 1 when at least one did, and 2
//! when the run could not be carried out at all.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mtest_core::{
    HostIdentity, PlatformDescriptor, RunConfig, StableOutputResolver, Stream, TestRecord,
};
use mtest_runner::{probe_platform, InterruptSignal, PortAllocator, RunnerError, TestRunner};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "mtest")]
#[command(author = "Stevedores Org")]
#[command(version = mtest_core::VERSION)]
#[command(about = "Database acceptance-suite runner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Run configuration (JSON)
    #[arg(short, long, global = true, env = "MTEST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests from a directory
    Run {
        /// Directory holding the tests
        dir: PathBuf,

        /// Test names, run in the given order
        #[arg(required = true)]
        tests: Vec<String>,
    },

    /// Show the reference files a test resolves to on this platform
    Stable {
        /// Test name
        test: String,

        /// Directory holding the test
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Use a saved platform descriptor instead of probing the server
        #[arg(long)]
        platform: Option<PathBuf>,
    },

    /// Probe the server and print the platform descriptor
    Platform {
        /// Also save the descriptor to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Pick a free port from the configured range
    Port,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    mtest_core::init_tracing(cli.json, level);

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Run { dir, tests } => cmd_run(config, &dir, &tests).await,
        Commands::Stable {
            test,
            dir,
            platform,
        } => cmd_stable(config, &test, &dir, platform.as_deref()).await,
        Commands::Platform { output } => cmd_platform(config, output.as_deref()).await,
        Commands::Port => cmd_port(config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("mtest: {e:#}");
            failure_code(&e)
        }
    }
}

/// Exit status of a run that could not be carried out: always 2, logged
/// with whether it was a fatal condition or a user interrupt.
fn failure_code(e: &anyhow::Error) -> ExitCode {
    let runner_errors = || e.chain().filter_map(|c| c.downcast_ref::<RunnerError>());
    let fatal = runner_errors().any(RunnerError::is_fatal);
    let interrupted = runner_errors().any(RunnerError::is_interrupt);
    error!(fatal, interrupted, error = %format!("{e:#}"), "mtest failed");
    ExitCode::from(2)
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    match path {
        Some(p) => RunConfig::load(p)
            .with_context(|| format!("Failed to load configuration from {}", p.display())),
        None => Ok(RunConfig::default()),
    }
}

async fn probe(config: &RunConfig) -> Result<PlatformDescriptor> {
    let interrupt = InterruptSignal::install().context("Failed to listen for interrupts")?;
    let banner = probe_platform(
        &config.server,
        config.ports.port,
        config.timeout(),
        config.process_groups,
        &interrupt,
    )
    .await
    .context("Failed to probe the server platform")?;
    Ok(PlatformDescriptor::new(HostIdentity::detect(), &banner))
}

async fn cmd_run(config: Option<&Path>, dir: &Path, tests: &[String]) -> Result<ExitCode> {
    let config = load_config(config)?;
    let mut runner = TestRunner::bootstrap(config).await?;
    info!(run_id = %runner.run_id(), dir = %dir.display(), "starting run");

    let mut print = |record: &TestRecord| println!("{}", record.report_line());
    let result = runner.run_directory(dir, tests, &mut print).await;

    let summary = runner.finish();
    print!("{}", summary.render());
    result.with_context(|| format!("Run aborted in {}", dir.display()))?;

    Ok(ExitCode::from(summary.exit_code() as u8))
}

async fn cmd_stable(
    config: Option<&Path>,
    test: &str,
    dir: &Path,
    platform: Option<&Path>,
) -> Result<ExitCode> {
    let platform = match platform {
        Some(path) => PlatformDescriptor::load(path)
            .with_context(|| format!("Failed to read platform from {}", path.display()))?,
        None => probe(&load_config(config)?).await?,
    };
    let resolver = StableOutputResolver::new(platform);
    for stream in Stream::BOTH {
        match resolver.best_match(dir, test, stream)? {
            Some(path) => println!("{stream}: {}", path.display()),
            None => println!(
                "{stream}: {} (missing)",
                dir.join(format!("{test}.stable.{stream}")).display()
            ),
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_platform(config: Option<&Path>, output: Option<&Path>) -> Result<ExitCode> {
    let platform = probe(&load_config(config)?).await?;
    println!("{}", serde_json::to_string_pretty(&platform)?);
    if let Some(path) = output {
        platform
            .save(path)
            .with_context(|| format!("Failed to save platform to {}", path.display()))?;
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_port(config: Option<&Path>) -> Result<ExitCode> {
    let config = load_config(config)?;
    let allocator = PortAllocator::from_config(&config);
    let (port, host) = allocator.allocate();
    if port == 0 {
        return Err(RunnerError::PortExhausted {
            low: config.ports.low,
            high: config.ports.high,
            attempts: allocator.attempts(),
        }
        .into());
    }
    println!("{host}:{port}");
    Ok(ExitCode::SUCCESS)
}
