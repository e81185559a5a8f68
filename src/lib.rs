//! # rteval
//!
//! Real-time latency evaluation. rteval puts a system under load (scheduler
//! stress with hackbench, a parallel kernel compile) while latency
//! instruments such as `cyclictest` sample wakeup latency, then reduces the
//! collected histograms to statistics and writes a structured report.
//!
//! ## Architecture Overview
//!
//! - `workload`: the unit lifecycle (setup, build, prepare, ready, run,
//!   cleanup), groups of units and the module registry
//! - `loads`: load generators
//! - `measurement`: measurement profiles and instruments
//! - `histogram`: per-source latency histograms and their statistics
//! - `orchestrator`: the run state machine
//! - `report`, `sysinfo`: the report tree and host inventory
//! - `cli`, `config`: command line, config file and run configuration
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use rteval::config::{HardwareInfo, RunConfig};
//! use rteval::orchestrator::RunOrchestrator;
//! use rteval::workload::ModuleRegistry;
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let hardware = HardwareInfo::detect()?;
//!     let run = Arc::new(RunConfig::new("rteval-20240101-1", &hardware));
//!
//!     let mut orchestrator = RunOrchestrator::new(run, ModuleRegistry::builtin())
//!         .with_loads(vec!["hackbench".to_string()])
//!         .with_measurements(vec!["cyclictest".to_string()]);
//!     let report = orchestrator.run()?;
//!     rteval::report::print_summary(&report);
//!     Ok(())
//! }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("rteval only supports Linux");

/// Command-line interface
///
/// clap derive arguments, the human-readable duration parser and
/// `module.key=value` option parsing.
pub mod cli;

/// Run configuration
///
/// Hardware detection, the JSON config file, per-module option tables and
/// the precedence rules that merge them with the command line.
pub mod config;

pub mod error;

/// Latency histograms
///
/// Per-core and system-wide sample accumulation and the one-time reduction
/// to mean, median, mode, deviation and range.
pub mod histogram;

/// Load generators
///
/// Background workloads that stress the system while latency is measured.
pub mod loads;

pub mod logging;

/// Measurement instruments and profiles
///
/// Instruments are grouped into profiles by whether they run in parallel
/// and whether they want loads running alongside them.
pub mod measurement;

/// Run state machine
///
/// Starts loads and measurement profiles, supervises the measurement window
/// and assembles the final report.
pub mod orchestrator;

/// Child process plumbing shared by loads and instruments
pub mod process;

/// Report tree, summary output and report directories
pub mod report;

/// Host inventory components for the report
pub mod sysinfo;

pub mod utils;

/// Workload lifecycle
///
/// The `Workload` trait each module implements, the worker-thread unit
/// that drives it, groups of units and the registry mapping module names
/// to factories.
pub mod workload;

pub use cli::Args;
pub use config::{HardwareInfo, RunConfig, Settings};
pub use error::{ConfigError, RunError, WorkloadError};
pub use histogram::{LatencyStatistics, RunData};
pub use orchestrator::{InterruptFlags, RunOrchestrator, RunState};
pub use report::ReportNode;
pub use workload::{ModuleRegistry, Workload, WorkloadGroup};

/// The current version of rteval
///
/// Recorded in every report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default measurement duration
    pub const DURATION: Duration = Duration::from_secs(60);

    /// Interval between progress reports while measuring
    ///
    /// Each progress line shows the time remaining and the load average.
    pub const REPORT_INTERVAL: Duration = Duration::from_secs(600);

    /// Directory report directories are created in
    pub const WORKDIR: &str = ".";

    /// Where load source tarballs are looked up
    pub const LOADDIR: &str = "/usr/share/rteval/loadsource";

    /// Build directory name under the work directory
    pub const BUILDDIR_NAME: &str = "rteval-build";

    /// Loads run when neither the command line nor a config file names any
    pub const LOADS: &[&str] = &["hackbench", "kcompile"];

    /// Measurement modules run by default
    pub const MEASUREMENTS: &[&str] = &["cyclictest"];
}
