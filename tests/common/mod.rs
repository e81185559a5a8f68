//! Shared helpers for integration tests: scriptable workloads, a small
//! hardware description and fake executables.

#![allow(dead_code)]

use rteval::config::{HardwareInfo, RunConfig};
use rteval::error::WorkloadError;
use rteval::report::ReportNode;
use rteval::workload::{ModuleInfo, ModuleRegistry, RunTiming, SetupOutcome, Workload};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a scripted workload does wrong, if anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Healthy,
    FailBuild,
    FailTask,
    /// Stops being alive after this many task steps
    FinishAfter(usize),
}

#[derive(Debug, Default)]
pub struct Counters {
    pub steps: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub started: AtomicBool,
}

impl Counters {
    pub fn steps(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

pub struct Scripted {
    name: String,
    behavior: Behavior,
    counters: Arc<Counters>,
}

impl Scripted {
    pub fn boxed(name: &str, behavior: Behavior, counters: &Arc<Counters>) -> Box<dyn Workload> {
        Box::new(Self {
            name: name.to_string(),
            behavior,
            counters: Arc::clone(counters),
        })
    }
}

impl Workload for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self) -> Result<SetupOutcome, WorkloadError> {
        Ok(SetupOutcome::Run)
    }

    fn build(&mut self) -> Result<(), WorkloadError> {
        match self.behavior {
            Behavior::FailBuild => Err(WorkloadError::build("build failed")),
            _ => Ok(()),
        }
    }

    fn task_step(&mut self) -> Result<(), WorkloadError> {
        self.counters.started.store(true, Ordering::SeqCst);
        self.counters.steps.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::FailTask => Err(WorkloadError::task("workload crashed")),
            _ => Ok(()),
        }
    }

    fn is_alive(&mut self) -> bool {
        match self.behavior {
            Behavior::FinishAfter(n) => self.counters.steps() < n,
            _ => true,
        }
    }

    fn cleanup(&mut self) -> Result<(), WorkloadError> {
        self.counters.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn make_report(&self) -> Option<ReportNode> {
        Some(ReportNode::new(self.name.clone()).attr("steps", self.counters.steps()))
    }
}

/// Register a scripted load
pub fn add_load(registry: &mut ModuleRegistry, name: &str, behavior: Behavior) -> Arc<Counters> {
    let counters = Arc::new(Counters::default());
    let shared = Arc::clone(&counters);
    let load_name = name.to_string();
    registry.register_load(name, move |_| Ok(Scripted::boxed(&load_name, behavior, &shared)));
    counters
}

/// Register a scripted measurement
pub fn add_measurement(
    registry: &mut ModuleRegistry,
    name: &str,
    info: ModuleInfo,
    behavior: Behavior,
) -> Arc<Counters> {
    let counters = Arc::new(Counters::default());
    let shared = Arc::clone(&counters);
    let module = name.to_string();
    registry.register_measurement(name, info, move |_| {
        Ok(Scripted::boxed(&module, behavior, &shared))
    });
    counters
}

pub fn hardware() -> HardwareInfo {
    HardwareInfo {
        num_cores: 2,
        memory_kib: 8 * 1024 * 1024,
        numa_nodes: 1,
        cpu_model: "Integration Test CPU".to_string(),
    }
}

pub fn run_config(reportdir: &Path, duration: Duration) -> Arc<RunConfig> {
    let mut run = RunConfig::new(reportdir, &hardware());
    run.duration = duration;
    run.report_interval = Duration::from_millis(500);
    Arc::new(run)
}

pub fn fast_timing() -> RunTiming {
    RunTiming {
        poll_interval: Duration::from_millis(50),
        join_timeout: Duration::from_secs(3),
        step_interval: Duration::from_millis(50),
        loadavg_every: 2,
        grace_period: Duration::from_secs(2),
    }
}

/// Write an executable shell script
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}
