//! # Run Orchestrator
//!
//! Drives one complete rteval run:
//!
//! ```text
//! Idle ─► Preparing ─► LoadsStarting ─► Ready ─► Running ─► Stopping ─► Reporting ─► Done
//!              │              │            │          │           │
//!              └──────────────┴────────────┴──────────┴───────────┴──► Aborted
//! ```
//!
//! For every measurement profile the orchestrator starts the loads (when the
//! profile runs with loads), starts the profile, unleashes both and then
//! polls once per `poll_interval` until the configured duration has elapsed.
//! Each poll checks, in order:
//!
//! 1. SIGTERM: abort. Everything is still stopped, but no report is produced.
//! 2. SIGINT: stop measuring early and report what was collected.
//! 3. The profile is no longer alive: a controlled early stop.
//! 4. Fewer load workers running than were unleashed: `LoadDied`.
//!
//! Profile and loads are always stopped before the run returns, whatever
//! ended the measurement window.

use crate::config::{ModuleConfig, RunConfig};
use crate::error::{RunError, RunResult};
use crate::loads::LoadAverage;
use crate::measurement::{MeasurementModules, MeasurementProfile};
use crate::report::ReportNode;
use crate::sysinfo::SystemInfo;
use crate::utils::{format_duration, format_remaining, running_as_root, split_duration};
use crate::workload::{ModuleContext, ModuleKind, ModuleRegistry, WorkloadGroup};
use crate::VERSION;
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub use crate::workload::RunTiming;

/// Orchestrator states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Preparing,
    LoadsStarting,
    Ready,
    Running,
    Stopping,
    Reporting,
    Done,
    Aborted,
}

/// Interrupt flags set by signal handlers and read by the poll loop
#[derive(Debug, Clone, Default)]
pub struct InterruptFlags {
    pub sigint: Arc<AtomicBool>,
    pub sigterm: Arc<AtomicBool>,
}

impl InterruptFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install SIGINT and SIGTERM handlers that set these flags
    pub fn register(&self) -> std::io::Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.sigint))?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&self.sigterm))?;
        Ok(())
    }

    pub fn interrupted(&self) -> bool {
        self.sigint.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> bool {
        self.sigterm.load(Ordering::SeqCst)
    }

    /// `Terminated` for SIGTERM, `Interrupted` for SIGINT
    pub fn check(&self) -> RunResult<()> {
        if self.terminated() {
            Err(RunError::Terminated)
        } else if self.interrupted() {
            Err(RunError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// How a measurement window ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowEnd {
    Elapsed,
    Interrupted,
    ProfileFinished,
}

/// Top-level driver of a run
pub struct RunOrchestrator {
    run: Arc<RunConfig>,
    registry: ModuleRegistry,
    loads: Vec<String>,
    measurements: Vec<String>,
    module_configs: BTreeMap<String, ModuleConfig>,
    timing: RunTiming,
    flags: InterruptFlags,
    annotation: Option<String>,
    system_info: SystemInfo,
    run_id: String,
    state: RunState,
    started_at: Option<DateTime<Local>>,
    measured: Duration,
    loadavg: LoadAverage,
    profiles: MeasurementModules,
    load_reports: Vec<ReportNode>,
}

impl RunOrchestrator {
    pub fn new(run: Arc<RunConfig>, registry: ModuleRegistry) -> Self {
        Self {
            run,
            registry,
            loads: Vec::new(),
            measurements: Vec::new(),
            module_configs: BTreeMap::new(),
            timing: RunTiming::default(),
            flags: InterruptFlags::new(),
            annotation: None,
            system_info: SystemInfo::new(),
            run_id: uuid::Uuid::new_v4().to_string(),
            state: RunState::Idle,
            started_at: None,
            measured: Duration::ZERO,
            loadavg: LoadAverage::default(),
            profiles: MeasurementModules::new(),
            load_reports: Vec::new(),
        }
    }

    pub fn with_loads(mut self, names: Vec<String>) -> Self {
        self.loads = names;
        self
    }

    pub fn with_measurements(mut self, names: Vec<String>) -> Self {
        self.measurements = names;
        self
    }

    pub fn with_module_configs(mut self, configs: BTreeMap<String, ModuleConfig>) -> Self {
        self.module_configs = configs;
        self
    }

    pub fn with_timing(mut self, timing: RunTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_interrupts(mut self, flags: InterruptFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_annotation(mut self, annotation: Option<String>) -> Self {
        self.annotation = annotation;
        self
    }

    pub fn with_system_info(mut self, info: SystemInfo) -> Self {
        self.system_info = info;
        self
    }

    /// Read load averages from another `/proc/loadavg`-format file
    pub fn with_loadavg_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.loadavg = LoadAverage::new(path);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Total time spent in measurement windows
    pub fn measured(&self) -> Duration {
        self.measured
    }

    fn transition(&mut self, next: RunState) {
        debug!("run state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn context(&self, name: &str) -> ModuleContext {
        ModuleContext {
            run: Arc::clone(&self.run),
            config: self
                .module_configs
                .get(name)
                .cloned()
                .unwrap_or_else(|| ModuleConfig::new(name)),
            timing: self.timing,
        }
    }

    /// Execute the run and return the final report
    ///
    /// On error the orchestrator is left in [`RunState::Aborted`]; all
    /// workloads have been stopped and [`make_report`](Self::make_report)
    /// still returns whatever completed profiles collected.
    pub fn run(&mut self) -> RunResult<ReportNode> {
        self.started_at = Some(Local::now());
        self.transition(RunState::Preparing);
        if let Err(e) = self.prepare() {
            self.transition(RunState::Aborted);
            return Err(e);
        }
        if !running_as_root() {
            warn!("Not running as root; real-time priorities may be unavailable");
        }

        let mut profiles = std::mem::take(&mut self.profiles);
        let mut result = Ok(());
        for profile in profiles.profiles_mut() {
            if self.flags.terminated() {
                warn!("SIGTERM received, aborting run");
                result = Err(RunError::Terminated);
                break;
            }
            if self.flags.interrupted() {
                info!("Interrupted; skipping remaining measurement profiles");
                break;
            }
            result = self.run_profile(profile);
            if result.is_err() {
                break;
            }
        }
        self.profiles = profiles;

        match result {
            Ok(()) => {
                self.transition(RunState::Reporting);
                let report = self.make_report();
                self.transition(RunState::Done);
                info!("Run complete ({} measured)", format_duration(self.measured));
                Ok(report)
            }
            Err(e) => {
                error!("Run aborted: {}", e);
                self.transition(RunState::Aborted);
                Err(e)
            }
        }
    }

    fn prepare(&mut self) -> RunResult<()> {
        self.registry.check(ModuleKind::Load, &self.loads)?;
        self.registry.check(ModuleKind::Measurement, &self.measurements)?;
        if self.measurements.is_empty() {
            return Err(RunError::NoMembers {
                group: ModuleKind::Measurement.to_string(),
            });
        }
        for name in &self.measurements {
            let (info, workload) = self.registry.create_measurement(name, &self.context(name))?;
            debug!(
                "measurement {}: parallel={} with_loads={}",
                name, info.parallel, info.with_loads
            );
            self.profiles.add(info, workload, self.timing)?;
        }
        info!(
            "Prepared {} measurement profile(s), loads: [{}]",
            self.profiles.profiles().len(),
            self.loads.join(", ")
        );
        Ok(())
    }

    /// A fresh load group; `None` for a measurement-only run
    fn build_loads(&self) -> RunResult<Option<WorkloadGroup>> {
        if self.loads.is_empty() {
            return Ok(None);
        }
        let mut group = WorkloadGroup::new(ModuleKind::Load.to_string(), self.timing);
        for name in &self.loads {
            group.add(self.registry.create_load(name, &self.context(name))?)?;
        }
        Ok(Some(group))
    }

    fn run_profile(&mut self, profile: &mut MeasurementProfile) -> RunResult<()> {
        let mut loads = if profile.with_loads() {
            self.build_loads()?
        } else {
            None
        };

        let outcome = self.drive_profile(profile, loads.as_mut());

        self.transition(RunState::Stopping);
        if let Err(e) = profile.stop() {
            warn!("Stopping measurement profile: {}", e);
        }
        if let Some(group) = loads.as_mut() {
            if let Err(e) = group.stop() {
                warn!("Stopping loads: {}", e);
            }
            self.load_reports = group.make_report();
        }
        if !profile.wait_for_completion(Some(self.timing.join_timeout)) {
            warn!("Measurement modules did not complete");
        }
        outcome
    }

    fn drive_profile(
        &mut self,
        profile: &mut MeasurementProfile,
        mut loads: Option<&mut WorkloadGroup>,
    ) -> RunResult<()> {
        let flags = self.flags.clone();
        let started = match loads.as_deref_mut() {
            Some(group) => {
                self.transition(RunState::LoadsStarting);
                match group.start_until(|| flags.check()) {
                    Err(RunError::NoMembers { .. }) => {
                        info!("No loads configured");
                        Ok(())
                    }
                    other => other,
                }
            }
            None => Ok(()),
        }
        .and_then(|()| profile.start_until(|| flags.check()));
        match started {
            Ok(()) => {}
            Err(RunError::Interrupted) => {
                warn!("SIGINT received before measurement started, stopping");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.transition(RunState::Ready);

        let nthreads = loads.as_deref_mut().map_or(0, WorkloadGroup::unleash);
        let unleashed = profile.unleash();
        info!(
            "Unleashed {} load worker(s) and {} measurement module(s)",
            nthreads, unleashed
        );

        self.transition(RunState::Running);
        let end = self.poll_window(profile, loads.as_deref(), nthreads)?;
        match end {
            WindowEnd::Elapsed => info!("Measurement duration reached"),
            WindowEnd::Interrupted => warn!("Measurement interrupted, stopping early"),
            WindowEnd::ProfileFinished => {
                warn!("Measurement modules have stopped; controlled stop")
            }
        }
        Ok(())
    }

    fn poll_window(
        &mut self,
        profile: &mut MeasurementProfile,
        loads: Option<&WorkloadGroup>,
        nthreads: usize,
    ) -> RunResult<WindowEnd> {
        let duration = self.run.duration;
        let report_interval = self.run.report_interval;
        let started = Instant::now();
        let stop_at = started + duration;
        let mut next_report = started + report_interval;
        let mut polls = 0u32;
        info!("Measuring for {}", format_duration(duration));

        let end = loop {
            let remaining = stop_at.saturating_duration_since(Instant::now());
            thread::sleep(self.timing.poll_interval.min(remaining));

            if self.flags.terminated() {
                warn!("SIGTERM received, aborting run");
                self.measured += started.elapsed();
                return Err(RunError::Terminated);
            }
            if self.flags.interrupted() {
                break WindowEnd::Interrupted;
            }
            if !profile.is_alive() {
                break WindowEnd::ProfileFinished;
            }
            if let Some(group) = loads {
                let running = group.running_count();
                if running < nthreads {
                    self.measured += started.elapsed();
                    return Err(RunError::LoadDied {
                        expected: nthreads,
                        observed: running,
                    });
                }
            }

            polls += 1;
            if polls % self.timing.loadavg_every.max(1) == 0 {
                self.loadavg.sample();
            }

            let now = Instant::now();
            if now >= stop_at {
                break WindowEnd::Elapsed;
            }
            if now >= next_report {
                info!(
                    "rteval time remaining: {}, load average {:.2}",
                    format_remaining(stop_at - now),
                    self.loadavg.average()
                );
                next_report += report_interval;
            }
        };
        self.measured += started.elapsed();
        Ok(end)
    }

    /// Assemble the report tree from everything collected so far
    pub fn make_report(&mut self) -> ReportNode {
        let started = self.started_at.unwrap_or_else(Local::now);
        let (days, hours, minutes, seconds) = split_duration(self.measured);
        let mut run_info = ReportNode::new("run_info")
            .attr("date", started.format("%Y-%m-%d"))
            .attr("time", started.format("%H:%M:%S"))
            .attr("days", days)
            .attr("hours", hours)
            .attr("minutes", minutes)
            .attr("seconds", seconds);
        if let Some(annotation) = &self.annotation {
            run_info.push(ReportNode::leaf("annotate", annotation));
        }

        let mut loads = ReportNode::new("loads")
            .attr("load_average", format!("{:.3}", self.loadavg.average()));
        loads.extend(self.load_reports.iter().cloned());

        let mut report = ReportNode::new("rteval")
            .attr("version", VERSION)
            .attr("run_id", &self.run_id)
            .child(run_info);
        report.extend(self.system_info.make_report());
        report.push(loads);
        report.push(self.profiles.make_report());
        report
    }
}
