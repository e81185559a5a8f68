//! Collective lifecycle control for a set of workload units.

use super::{RunTiming, Workload, WorkloadUnit};
use crate::error::{RunError, RunResult};
use crate::report::ReportNode;
use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A set of units of one kind, keyed by name
///
/// Operations apply to every member; iteration follows insertion order only
/// so that logs and reports are stable between runs.
pub struct WorkloadGroup {
    kind: String,
    units: HashMap<String, WorkloadUnit>,
    order: Vec<String>,
    timing: RunTiming,
}

impl WorkloadGroup {
    /// Create an empty group; `kind` names it in logs and errors ("load", "measurement")
    pub fn new(kind: impl Into<String>, timing: RunTiming) -> Self {
        Self {
            kind: kind.into(),
            units: HashMap::new(),
            order: Vec::new(),
            timing,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn timing(&self) -> &RunTiming {
        &self.timing
    }

    pub fn add(&mut self, workload: Box<dyn Workload>) -> RunResult<()> {
        let unit = WorkloadUnit::new(workload);
        let name = unit.name().to_string();
        if self.units.contains_key(&name) {
            return Err(RunError::DuplicateModule {
                group: self.kind.clone(),
                name,
            });
        }
        debug!("Adding {} module {}", self.kind, name);
        self.order.push(name.clone());
        self.units.insert(name, unit);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Member names in the order they were added
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn unit(&self, name: &str) -> Option<&WorkloadUnit> {
        self.units.get(name)
    }

    fn members(&self) -> impl Iterator<Item = &WorkloadUnit> + '_ {
        self.order.iter().filter_map(move |name| self.units.get(name))
    }

    /// Start every worker and wait until each is ready or opted out
    ///
    /// Returns [`RunError::Startup`] as soon as a member reports a runtime
    /// error, rather than waiting on it.
    pub fn start(&mut self) -> RunResult<()> {
        self.start_until(|| Ok(()))
    }

    /// [`start`](Self::start), giving up when `interrupt` returns an error
    ///
    /// `interrupt` is consulted on every ready-wait poll, so a member stuck
    /// in a long build cannot hold off a signal. Members already spawned are
    /// left to [`stop`](Self::stop).
    pub fn start_until(&mut self, interrupt: impl Fn() -> RunResult<()>) -> RunResult<()> {
        if self.is_empty() {
            return Err(RunError::NoMembers {
                group: self.kind.clone(),
            });
        }

        let step = self.timing.step_interval;
        for name in &self.order {
            if let Some(unit) = self.units.get_mut(name) {
                debug!("Starting {} module {}", self.kind, name);
                unit.spawn(step)?;
            }
        }

        info!("Waiting for {} modules to become ready", self.kind);
        let started = Instant::now();
        loop {
            interrupt()?;
            let mut pending = Vec::new();
            for unit in self.members() {
                let state = unit.state();
                if state.has_runtime_error() {
                    return Err(RunError::Startup {
                        group: self.kind.clone(),
                        unit: unit.name().to_string(),
                        reason: state
                            .error_message()
                            .unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
                if state.is_ready() || state.do_not_run() {
                    continue;
                }
                if state.finished() {
                    return Err(RunError::Startup {
                        group: self.kind.clone(),
                        unit: unit.name().to_string(),
                        reason: "exited before becoming ready".to_string(),
                    });
                }
                pending.push(unit.name());
            }
            if pending.is_empty() {
                break;
            }
            debug!("Still waiting for: {}", pending.join(", "));
            thread::sleep(self.timing.poll_interval);
        }
        info!(
            "All {} modules ready after {:.1}s",
            self.kind,
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Tell every ready member to begin work; returns how many were started
    pub fn unleash(&mut self) -> usize {
        let mut count = 0;
        for unit in self.members() {
            let state = unit.state();
            if state.do_not_run() || !state.is_ready() {
                continue;
            }
            unit.request_start();
            count += 1;
        }
        info!("Unleashed {} {} module(s)", count, self.kind);
        count
    }

    /// Unleash a single member by name
    pub fn unleash_one(&self, name: &str) -> bool {
        match self.units.get(name) {
            Some(unit) if unit.state().is_ready() && !unit.state().do_not_run() => {
                unit.request_start();
                true
            }
            _ => false,
        }
    }

    /// Signal stop to every started worker and join each with a bounded wait
    ///
    /// Safe after a failed or partial [`start`](Self::start); join timeouts
    /// are logged, not returned.
    pub fn stop(&mut self) -> RunResult<()> {
        if self.is_empty() {
            return Err(RunError::NoMembers {
                group: self.kind.clone(),
            });
        }
        info!("Stopping {} modules", self.kind);
        for unit in self.members().filter(|u| u.is_spawned()) {
            unit.request_stop();
        }
        let timeout = self.timing.join_timeout;
        for name in &self.order {
            if let Some(unit) = self.units.get_mut(name) {
                if unit.is_spawned() && !unit.join(timeout) {
                    warn!("{} module {} did not stop cleanly", self.kind, name);
                }
            }
        }
        Ok(())
    }

    /// Block until every unleashed member has finished
    ///
    /// Members that were never unleashed count as complete. Returns false if
    /// `timeout` elapsed first.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        for unit in self.members() {
            if !unit.state().start_requested() {
                continue;
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if !unit.wait_finished(remaining) {
                debug!("{} module {} still running", self.kind, unit.name());
                return false;
            }
        }
        true
    }

    /// True while every unleashed member is alive (false if none was unleashed)
    pub fn is_alive(&self) -> bool {
        let mut unleashed = self
            .members()
            .filter(|u| u.state().start_requested())
            .peekable();
        if unleashed.peek().is_none() {
            return false;
        }
        unleashed.all(WorkloadUnit::is_alive)
    }

    /// Number of unleashed members whose workers are still running
    pub fn running_count(&self) -> usize {
        self.members().filter(|u| u.is_alive()).count()
    }

    /// Names of members that ended with a runtime error
    pub fn failed(&self) -> Vec<String> {
        self.members()
            .filter(|u| u.state().has_runtime_error())
            .map(|u| u.name().to_string())
            .collect()
    }

    /// Reports of every member that produced one
    pub fn make_report(&self) -> Vec<ReportNode> {
        self.members().filter_map(WorkloadUnit::make_report).collect()
    }
}

impl Drop for WorkloadGroup {
    fn drop(&mut self) {
        // Wake any worker still parked waiting for start so it can clean up.
        for unit in self.units.values() {
            if unit.is_spawned() && !unit.state().finished() {
                unit.request_stop();
            }
        }
    }
}
