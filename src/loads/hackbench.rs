//! Scheduler load: repeated `hackbench` runs.
//!
//! Options (`-O hackbench.<key>=<value>` or the `hackbench` config section):
//!
//! | key | default | meaning |
//! |---|---|---|
//! | `binary` | `hackbench` | program name or path |
//! | `jobspercore` | 2 | groups per core |
//! | `loops` | 100 | messages each sender sends |
//! | `datasize` | 100 | bytes per message |

use super::CommandLineLoad;
use crate::error::{ConfigError, WorkloadError};
use crate::process::{self, CommandLine};
use crate::report::ReportNode;
use crate::workload::{ModuleContext, SetupOutcome, Workload};
use nix::sys::signal::Signal;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Minimum memory per core for hackbench to be worth running
pub const MIN_GIB_PER_CORE: f64 = 0.75;

const BACKOFF_START: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

pub struct Hackbench {
    load: CommandLineLoad,
    binary: String,
    jobspercore: usize,
    loops: u64,
    datasize: u64,
    backoff: Option<Duration>,
    retry_at: Option<Instant>,
}

impl Hackbench {
    pub fn new(ctx: &ModuleContext) -> Result<Self, ConfigError> {
        let config = &ctx.config;
        Ok(Self {
            load: CommandLineLoad::new("hackbench", ctx.run.clone(), ctx.timing.grace_period),
            binary: config.get_or("binary", "hackbench".to_string())?,
            jobspercore: config.get_or("jobspercore", 2)?,
            loops: config.get_or("loops", 100)?,
            datasize: config.get_or("datasize", 100)?,
            backoff: None,
            retry_at: None,
        })
    }

    /// Next back-off step after an out-of-memory spawn failure
    fn next_backoff(current: Option<Duration>) -> Duration {
        match current {
            None => BACKOFF_START,
            Some(d) => (d * 2).min(BACKOFF_MAX),
        }
    }
}

impl Workload for Hackbench {
    fn name(&self) -> &str {
        "hackbench"
    }

    fn setup(&mut self) -> Result<SetupOutcome, WorkloadError> {
        let run = self.load.run_config();
        let ratio = run.memory_per_core_gib();
        if ratio < MIN_GIB_PER_CORE {
            return Ok(SetupOutcome::Skip(format!(
                "low memory system ({:.2} GiB/core, need {})",
                ratio, MIN_GIB_PER_CORE
            )));
        }

        let binary = process::find_executable(&self.binary)
            .ok_or_else(|| WorkloadError::setup(format!("{} not found", self.binary)))?;
        let jobs = run.num_cores * self.jobspercore;
        let cmdline = CommandLine::new(binary)
            .arg("-P")
            .arg("-g")
            .arg(jobs.to_string())
            .arg("-l")
            .arg(self.loops.to_string())
            .arg("-s")
            .arg(self.datasize.to_string());
        self.load.set_command(cmdline, jobs);
        Ok(SetupOutcome::Run)
    }

    fn task_step(&mut self) -> Result<(), WorkloadError> {
        if let Some(retry_at) = self.retry_at {
            if Instant::now() < retry_at {
                return Ok(());
            }
            self.retry_at = None;
        }
        match self.load.ensure_running(None) {
            Ok(started) => {
                if started {
                    debug!("hackbench started (launch {})", self.load.launches());
                }
                self.backoff = None;
                Ok(())
            }
            Err(e) if process::is_out_of_memory(&e) => {
                let wait = Self::next_backoff(self.backoff);
                warn!("hackbench could not start (out of memory), retrying in {:?}", wait);
                self.backoff = Some(wait);
                self.retry_at = Some(Instant::now() + wait);
                Ok(())
            }
            Err(e) => Err(WorkloadError::task(format!("cannot start hackbench: {}", e))),
        }
    }

    fn is_alive(&mut self) -> bool {
        // Exits are expected; task_step restarts it.
        true
    }

    fn cleanup(&mut self) -> Result<(), WorkloadError> {
        info!("Stopping hackbench after {} launches", self.load.launches());
        self.load.stop(Signal::SIGKILL)?;
        Ok(())
    }

    fn make_report(&self) -> Option<ReportNode> {
        Some(self.load.make_report())
    }
}
