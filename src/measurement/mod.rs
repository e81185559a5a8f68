//! # Measurement Profiles
//!
//! Measurement modules are grouped into profiles by how they may be
//! scheduled ([`ModuleInfo`]): whether they run while the loads are active,
//! and whether they may run alongside each other.
//!
//! A parallel profile behaves exactly like a [`WorkloadGroup`]. A serialized
//! profile runs its members one after another: `unleash` starts only the
//! first member and each liveness check advances to the next member once the
//! current one is no longer alive. The orchestrator drives both kinds through
//! the same `start`/`unleash`/`is_alive`/`stop` calls.

pub mod cyclictest;
pub mod hwlatdetect;
pub mod sysstat;

use crate::error::RunResult;
use crate::report::ReportNode;
use crate::workload::{ModuleInfo, RunTiming, Workload, WorkloadGroup};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{error, info};

/// Measurement modules sharing one scheduling profile
pub struct MeasurementProfile {
    group: WorkloadGroup,
    with_loads: bool,
    run_parallel: bool,
    pending: VecDeque<String>,
}

impl MeasurementProfile {
    pub fn new(with_loads: bool, run_parallel: bool, timing: RunTiming) -> Self {
        Self {
            group: WorkloadGroup::new("measurement", timing),
            with_loads,
            run_parallel,
            pending: VecDeque::new(),
        }
    }

    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            parallel: self.run_parallel,
            with_loads: self.with_loads,
        }
    }

    pub fn with_loads(&self) -> bool {
        self.with_loads
    }

    pub fn run_parallel(&self) -> bool {
        self.run_parallel
    }

    pub fn group(&self) -> &WorkloadGroup {
        &self.group
    }

    pub fn add(&mut self, workload: Box<dyn Workload>) -> RunResult<()> {
        self.group.add(workload)
    }

    pub fn len(&self) -> usize {
        self.group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group.is_empty()
    }

    pub fn start(&mut self) -> RunResult<()> {
        self.group.start()
    }

    pub fn start_until(&mut self, interrupt: impl Fn() -> RunResult<()>) -> RunResult<()> {
        self.group.start_until(interrupt)
    }

    /// Start members; a serialized profile starts only its first runnable member
    pub fn unleash(&mut self) -> usize {
        if self.run_parallel {
            return self.group.unleash();
        }
        self.pending = self
            .group
            .names()
            .iter()
            .filter(|name| {
                self.group
                    .unit(name)
                    .map_or(false, |u| u.state().is_ready() && !u.state().do_not_run())
            })
            .cloned()
            .collect();
        match self.pending.front() {
            Some(first) => {
                info!("Starting serialized measurement {}", first);
                self.group.unleash_one(first);
                1
            }
            None => 0,
        }
    }

    /// Whether measurement is still in progress
    ///
    /// For a serialized profile this also advances to the next member when
    /// the current one has ended. A member that ended with a runtime error is
    /// logged and recorded in the report; the remaining members still run.
    pub fn is_alive(&mut self) -> bool {
        if self.run_parallel {
            return self.group.is_alive();
        }
        while let Some(head) = self.pending.front() {
            let Some(unit) = self.group.unit(head) else {
                self.pending.pop_front();
                continue;
            };
            if !unit.state().start_requested() {
                info!("Starting serialized measurement {}", head);
                unit.request_start();
                return true;
            }
            if unit.is_alive() {
                return true;
            }
            if unit.state().has_runtime_error() {
                error!(
                    "Measurement {} failed: {}",
                    head,
                    unit.state().error_message().unwrap_or_default()
                );
            } else {
                info!("Measurement {} finished", head);
            }
            self.pending.pop_front();
        }
        false
    }

    pub fn running_count(&self) -> usize {
        self.group.running_count()
    }

    pub fn stop(&mut self) -> RunResult<()> {
        self.pending.clear();
        self.group.stop()
    }

    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        self.group.wait_for_completion(timeout)
    }

    /// `profile` node with the members' reports
    pub fn make_report(&self) -> ReportNode {
        let mut node = ReportNode::new("profile")
            .attr("loads", u8::from(self.with_loads))
            .attr("parallel", u8::from(self.run_parallel));
        let failed = self.group.failed();
        if !failed.is_empty() {
            node.set_attr("failed", failed.join(","));
        }
        node.extend(self.group.make_report());
        node
    }
}

/// All measurement profiles of a run, created on demand per [`ModuleInfo`]
#[derive(Default)]
pub struct MeasurementModules {
    profiles: Vec<MeasurementProfile>,
}

impl MeasurementModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a module into the profile matching its scheduling info
    pub fn add(
        &mut self,
        info: ModuleInfo,
        workload: Box<dyn Workload>,
        timing: RunTiming,
    ) -> RunResult<()> {
        let position = self.profiles.iter().position(|p| p.info() == info);
        let profile = match position {
            Some(i) => &mut self.profiles[i],
            None => {
                self.profiles
                    .push(MeasurementProfile::new(info.with_loads, info.parallel, timing));
                let last = self.profiles.len() - 1;
                &mut self.profiles[last]
            }
        };
        profile.add(workload)
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn profiles(&self) -> &[MeasurementProfile] {
        &self.profiles
    }

    pub fn profiles_mut(&mut self) -> &mut [MeasurementProfile] {
        &mut self.profiles
    }

    /// `measurements` node with one `profile` child per profile
    pub fn make_report(&self) -> ReportNode {
        let mut node = ReportNode::new("measurements");
        node.extend(self.profiles.iter().map(MeasurementProfile::make_report));
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::testing::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn timing() -> RunTiming {
        RunTiming {
            poll_interval: Duration::from_millis(20),
            join_timeout: Duration::from_secs(2),
            step_interval: Duration::from_millis(20),
            loadavg_every: 1,
            grace_period: Duration::from_millis(200),
        }
    }

    fn serialized(names: &[&str]) -> (MeasurementProfile, Vec<Arc<Tally>>) {
        let mut profile = MeasurementProfile::new(true, false, timing());
        let mut tallys = Vec::new();
        for name in names {
            let (workload, tally) = FakeWorkload::new(name);
            profile.add(Box::new(workload)).unwrap();
            tallys.push(tally);
        }
        (profile, tallys)
    }

    fn started(profile: &MeasurementProfile, name: &str) -> bool {
        profile.group().unit(name).unwrap().state().start_requested()
    }

    #[test]
    fn test_serialized_profile_runs_members_in_order() {
        let (mut profile, tallys) = serialized(&["first", "second", "third"]);
        profile.start().unwrap();

        assert_eq!(profile.unleash(), 1);
        assert!(started(&profile, "first"));
        assert!(!started(&profile, "second"));
        assert!(profile.is_alive());

        tallys[0].alive.store(false, Ordering::SeqCst);
        assert!(eventually(|| {
            profile.group().unit("first").unwrap().state().finished()
        }));
        assert!(profile.is_alive());
        assert!(started(&profile, "second"));
        assert!(!started(&profile, "third"));

        tallys[1].alive.store(false, Ordering::SeqCst);
        assert!(eventually(|| {
            profile.group().unit("second").unwrap().state().finished()
        }));
        assert!(profile.is_alive());
        assert!(started(&profile, "third"));

        tallys[2].alive.store(false, Ordering::SeqCst);
        assert!(eventually(|| {
            profile.group().unit("third").unwrap().state().finished()
        }));
        assert!(!profile.is_alive());

        profile.stop().unwrap();
        assert!(profile.wait_for_completion(Some(Duration::from_secs(1))));
    }

    #[test]
    fn test_serialized_profile_advances_past_crashed_member() {
        let mut profile = MeasurementProfile::new(false, false, timing());
        profile.add(FakeWorkload::failing("crashy", Fail::Task)).unwrap();
        let (steady, tally) = FakeWorkload::new("steady");
        profile.add(Box::new(steady)).unwrap();
        profile.start().unwrap();

        assert_eq!(profile.unleash(), 1);
        assert!(eventually(|| {
            profile.group().unit("crashy").unwrap().state().finished()
        }));
        assert!(profile.is_alive());
        assert!(started(&profile, "steady"));

        tally.alive.store(false, Ordering::SeqCst);
        assert!(eventually(|| !profile.is_alive()));
        profile.stop().unwrap();

        let report = profile.make_report();
        assert_eq!(report.attribute("failed"), Some("crashy"));
        assert_eq!(report.attribute("parallel"), Some("0"));
        assert_eq!(report.attribute("loads"), Some("0"));
    }

    #[test]
    fn test_parallel_profile_unleashes_everyone() {
        let mut profile = MeasurementProfile::new(true, true, timing());
        profile.add(FakeWorkload::failing("a", Fail::Never)).unwrap();
        profile.add(FakeWorkload::failing("b", Fail::Never)).unwrap();
        profile.start().unwrap();

        assert_eq!(profile.unleash(), 2);
        assert!(profile.is_alive());
        profile.stop().unwrap();
        assert!(!profile.is_alive());
        assert_eq!(profile.make_report().children().len(), 2);
    }

    #[test]
    fn test_modules_are_grouped_by_scheduling_info() {
        let mut modules = MeasurementModules::new();
        let parallel = ModuleInfo {
            parallel: true,
            with_loads: true,
        };
        let exclusive = ModuleInfo {
            parallel: false,
            with_loads: false,
        };
        modules.add(parallel, FakeWorkload::failing("a", Fail::Never), timing()).unwrap();
        modules.add(exclusive, FakeWorkload::failing("b", Fail::Never), timing()).unwrap();
        modules.add(parallel, FakeWorkload::failing("c", Fail::Never), timing()).unwrap();

        assert_eq!(modules.profiles().len(), 2);
        assert_eq!(modules.profiles()[0].len(), 2);
        assert!(!modules.profiles()[1].with_loads());
        assert_eq!(modules.make_report().children().len(), 2);
    }
}
