//! # System Loads
//!
//! Load modules keep the system busy while latency is measured. Each one
//! wraps an external command that is restarted whenever it exits, so a load
//! stays active for the whole measurement window regardless of how long a
//! single invocation takes.
//!
//! This module also holds [`LoadAverage`], the accumulator the orchestrator
//! feeds from `/proc/loadavg` while measuring.

pub mod hackbench;
pub mod kcompile;

use crate::config::RunConfig;
use crate::process::{self, CommandLine, OutputFiles};
use crate::report::ReportNode;
use crate::utils::read_loadavg;
use nix::sys::signal::Signal;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default location of the one-minute load average
pub const LOADAVG_PATH: &str = "/proc/loadavg";

/// Running sum of one-minute load-average samples
///
/// Only the orchestrator thread touches it.
#[derive(Debug, Clone)]
pub struct LoadAverage {
    source: PathBuf,
    sum: f64,
    samples: u64,
}

impl Default for LoadAverage {
    fn default() -> Self {
        Self::new(LOADAVG_PATH)
    }
}

impl LoadAverage {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            sum: 0.0,
            samples: 0,
        }
    }

    /// Read the current load average and add it to the running sum
    pub fn sample(&mut self) {
        match read_loadavg(&self.source) {
            Ok(value) => self.record(value),
            Err(e) => warn!("Cannot read load average from {:?}: {}", self.source, e),
        }
    }

    pub fn record(&mut self, value: f64) {
        self.sum += value;
        self.samples += 1;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Mean of the recorded samples, sampling once if there are none
    pub fn average(&mut self) -> f64 {
        if self.samples == 0 {
            self.sample();
        }
        if self.samples == 0 {
            return 0.0;
        }
        self.sum / self.samples as f64
    }
}

/// Shared plumbing for loads that run a restartable external command
#[derive(Debug)]
pub struct CommandLineLoad {
    name: String,
    run: Arc<RunConfig>,
    grace: Duration,
    cmdline: Option<CommandLine>,
    jobs: usize,
    child: Option<Child>,
    launches: u64,
}

impl CommandLineLoad {
    pub fn new(name: impl Into<String>, run: Arc<RunConfig>, grace: Duration) -> Self {
        Self {
            name: name.into(),
            run,
            grace,
            cmdline: None,
            jobs: 0,
            child: None,
            launches: 0,
        }
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run
    }

    pub fn set_command(&mut self, cmdline: CommandLine, jobs: usize) {
        debug!("{} command: {} ({} jobs)", self.name, cmdline, jobs);
        self.cmdline = Some(cmdline);
        self.jobs = jobs;
    }

    pub fn command(&self) -> Option<&CommandLine> {
        self.cmdline.as_ref()
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// How many times the command has been started
    pub fn launches(&self) -> u64 {
        self.launches
    }

    pub fn is_running(&mut self) -> bool {
        self.child.as_mut().map_or(false, process::is_running)
    }

    /// Start the command unless it is still running; returns whether it was started
    pub fn ensure_running(&mut self, dir: Option<&Path>) -> io::Result<bool> {
        if self.is_running() {
            return Ok(false);
        }
        if let Some(mut finished) = self.child.take() {
            // Reap the previous instance.
            if let Ok(status) = finished.wait() {
                debug!("{} exited: {}", self.name, status);
            }
        }
        let Some(cmdline) = self.cmdline.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no command line", self.name),
            ));
        };
        let output = OutputFiles::for_module(&self.run, &self.name)?;
        let child = process::spawn(cmdline, output, dir)?;
        self.child = Some(child);
        self.launches += 1;
        Ok(true)
    }

    /// Stop the running instance, if any, with `sig` then SIGKILL
    pub fn stop(&mut self, sig: Signal) -> io::Result<()> {
        if let Some(mut child) = self.child.take() {
            debug!("stopping {} (pid {}) with {}", self.name, child.id(), sig);
            process::terminate(&mut child, sig, self.grace)?;
        }
        Ok(())
    }

    /// `command_line` report node
    pub fn make_report(&self) -> ReportNode {
        let node = ReportNode::new("command_line")
            .attr("name", &self.name)
            .attr("run", 1)
            .attr("job_instances", self.jobs);
        match &self.cmdline {
            Some(cmdline) => node.text(cmdline),
            None => node,
        }
    }
}

impl Drop for CommandLineLoad {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
