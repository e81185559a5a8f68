//! # Workload Units
//!
//! A workload is anything that runs alongside the measurement window: a load
//! generator such as `hackbench`, or a measurement instrument such as
//! `cyclictest`. Each one implements the [`Workload`] lifecycle hooks and is
//! driven by a [`WorkloadUnit`], which owns a dedicated worker thread.
//!
//! ## Lifecycle
//!
//! ```text
//! setup ─► build ─► prepare ─► [ready] ─► wait for start ─┐
//!   │                                                    ▼
//!   └─► Skip: do-not-run              task_step ◄─► is_alive
//!                                                        │ stop requested
//!                                                        ▼ or not alive
//!                                                     cleanup ─► [finished]
//! ```
//!
//! The orchestrator thread never calls the hooks directly. It talks to a unit
//! only through [`UnitState`]: the `start`/`stop` requests it sets and the
//! `ready`/`runtime_error`/`do_not_run`/`finished` flags the worker publishes.
//!
//! ## Failure Model
//!
//! An error from any hook ends the worker thread and raises the unit's
//! `runtime_error` flag with the error text. A panic on the worker thread is
//! treated the same way. `finished` is always set once the thread leaves its
//! lifecycle, whichever way it leaves.

pub mod group;
pub mod registry;

pub use group::WorkloadGroup;
pub use registry::{ModuleContext, ModuleInfo, ModuleKind, ModuleRegistry};

use crate::error::WorkloadError;
use crate::report::ReportNode;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// Timing knobs shared by units, groups and the orchestrator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunTiming {
    /// Orchestrator and ready-wait poll interval
    pub poll_interval: Duration,
    /// Bounded wait for a worker thread to exit after stop; must outlast
    /// `grace_period` so a child being terminated is not abandoned
    pub join_timeout: Duration,
    /// Pause between task steps of a running unit
    pub step_interval: Duration,
    /// Sample the load average every this many polls
    pub loadavg_every: u32,
    /// Time a child process gets to exit before it is killed
    pub grace_period: Duration,
}

impl Default for RunTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            join_timeout: Duration::from_secs(8),
            step_interval: Duration::from_secs(1),
            loadavg_every: 5,
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Result of a workload's setup hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Preconditions are met; continue to build
    Run,
    /// Running would be pointless on this system; not an error
    Skip(String),
}

/// Lifecycle hooks implemented by every load and measurement module
///
/// All hooks run on the unit's worker thread. `task_step` must return within
/// a short bounded time; long-running work belongs in a child process that
/// `task_step` starts and `is_alive` checks.
pub trait Workload: Send {
    /// Module name, unique within its group
    fn name(&self) -> &str;

    /// Verify external resources; may decide the unit should not run
    fn setup(&mut self) -> Result<SetupOutcome, WorkloadError> {
        Ok(SetupOutcome::Run)
    }

    /// One-time build step (e.g. compile or unpack)
    fn build(&mut self) -> Result<(), WorkloadError> {
        Ok(())
    }

    /// Allocate per-run resources before the first task step
    fn prepare(&mut self) -> Result<(), WorkloadError> {
        Ok(())
    }

    /// One iteration of work: start or restart the underlying process
    fn task_step(&mut self) -> Result<(), WorkloadError>;

    /// Whether the work is still considered active
    fn is_alive(&mut self) -> bool;

    /// Release per-run resources and finalize report data
    fn cleanup(&mut self) -> Result<(), WorkloadError> {
        Ok(())
    }

    /// Summary of what ran, if anything
    fn make_report(&self) -> Option<ReportNode>;
}

#[derive(Debug, Default)]
struct Signals {
    start_requested: bool,
    stop_requested: bool,
    finished: bool,
}

/// Cross-thread state of one unit
///
/// `start`/`stop` are written by the orchestrator thread, everything else by
/// the unit's worker thread. All three signals are set-once.
#[derive(Debug, Default)]
pub struct UnitState {
    signals: Mutex<Signals>,
    changed: Condvar,
    ready: AtomicBool,
    runtime_error: AtomicBool,
    do_not_run: AtomicBool,
    error: Mutex<Option<String>>,
}

impl UnitState {
    fn update(&self, f: impl FnOnce(&mut Signals)) {
        let mut signals = self.signals.lock();
        f(&mut signals);
        self.changed.notify_all();
    }

    /// Block until `pred` holds or `timeout` elapses; returns the final `pred`
    fn wait_until(&self, pred: impl Fn(&Signals) -> bool, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signals = self.signals.lock();
        while !pred(&signals) {
            match deadline {
                None => self.changed.wait(&mut signals),
                Some(deadline) => {
                    if self.changed.wait_until(&mut signals, deadline).timed_out() {
                        return pred(&signals);
                    }
                }
            }
        }
        true
    }

    pub fn request_start(&self) {
        self.update(|s| s.start_requested = true);
    }

    pub fn request_stop(&self) {
        self.update(|s| s.stop_requested = true);
    }

    fn set_finished(&self) {
        self.update(|s| s.finished = true);
    }

    pub fn start_requested(&self) -> bool {
        self.signals.lock().start_requested
    }

    pub fn stop_requested(&self) -> bool {
        self.signals.lock().stop_requested
    }

    pub fn finished(&self) -> bool {
        self.signals.lock().finished
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn has_runtime_error(&self) -> bool {
        self.runtime_error.load(Ordering::SeqCst)
    }

    pub fn do_not_run(&self) -> bool {
        self.do_not_run.load(Ordering::SeqCst)
    }

    /// Text of the error that ended the worker, if any
    pub fn error_message(&self) -> Option<String> {
        self.error.lock().clone()
    }

    fn fail(&self, message: String) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(message);
        }
        self.runtime_error.store(true, Ordering::SeqCst);
    }
}

/// Sets `finished` however the worker leaves, including by panic
struct FinishGuard<'a> {
    state: &'a UnitState,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("worker thread panicked");
            self.state.fail("worker thread panicked".to_string());
        }
        self.state.set_finished();
    }
}

type SharedWorkload = Arc<Mutex<Box<dyn Workload>>>;

/// A workload together with its worker thread and signals
pub struct WorkloadUnit {
    name: String,
    state: Arc<UnitState>,
    workload: SharedWorkload,
    handle: Option<JoinHandle<()>>,
    spawned: bool,
}

impl WorkloadUnit {
    pub fn new(workload: Box<dyn Workload>) -> Self {
        Self {
            name: workload.name().to_string(),
            state: Arc::new(UnitState::default()),
            workload: Arc::new(Mutex::new(workload)),
            handle: None,
            spawned: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &UnitState {
        &self.state
    }

    /// Whether the worker thread has been started
    pub fn is_spawned(&self) -> bool {
        self.spawned
    }

    /// Start the worker thread; it runs setup through prepare, then waits
    ///
    /// A unit's thread runs at most once; later calls do nothing.
    pub fn spawn(&mut self, step_interval: Duration) -> std::io::Result<()> {
        if self.spawned {
            return Ok(());
        }
        let name = self.name.clone();
        let state = Arc::clone(&self.state);
        let workload = Arc::clone(&self.workload);
        let handle = thread::Builder::new()
            .name(format!("rteval-{}", self.name))
            .spawn(move || run_worker(name, state, workload, step_interval))?;
        self.handle = Some(handle);
        self.spawned = true;
        Ok(())
    }

    pub fn request_start(&self) {
        self.state.request_start();
    }

    pub fn request_stop(&self) {
        self.state.request_stop();
    }

    /// Started, not yet finished and not failed
    pub fn is_alive(&self) -> bool {
        self.state.start_requested() && !self.state.finished() && !self.state.has_runtime_error()
    }

    /// Wait for the worker to leave its lifecycle
    pub fn wait_finished(&self, timeout: Option<Duration>) -> bool {
        self.state.wait_until(|s| s.finished, timeout)
    }

    /// Join the worker thread, waiting at most `timeout`
    ///
    /// A thread that does not finish in time is logged and left running
    /// detached. Returns whether the thread was joined.
    pub fn join(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        if !self.wait_finished(Some(timeout)) {
            warn!(
                "{} did not stop within {:?}; abandoning its worker thread",
                self.name, timeout
            );
            return false;
        }
        if handle.join().is_err() {
            debug!("{} worker thread ended with a panic", self.name);
        }
        true
    }

    /// The workload's report, or `None` for a unit that did not run
    ///
    /// A unit abandoned while still in setup or build holds its workload, so
    /// it is reported as not having run.
    pub fn make_report(&self) -> Option<ReportNode> {
        if self.state.do_not_run() {
            return None;
        }
        if self.spawned && !self.state.is_ready() && !self.state.finished() {
            debug!("{} never became ready; no report", self.name);
            return None;
        }
        self.workload.lock().make_report()
    }
}

fn run_worker(name: String, state: Arc<UnitState>, workload: SharedWorkload, step: Duration) {
    let span = info_span!("workload", unit = %name);
    let _entered = span.enter();
    let _guard = FinishGuard { state: &state };

    if let Err(e) = lifecycle(&name, &state, &workload, step) {
        error!("{} failed: {}", name, e);
        state.fail(e.to_string());
    }
}

fn lifecycle(
    name: &str,
    state: &UnitState,
    workload: &SharedWorkload,
    step: Duration,
) -> Result<(), WorkloadError> {
    debug!("setting up");
    let outcome = workload.lock().setup()?;
    if let SetupOutcome::Skip(reason) = outcome {
        info!("{} will not run: {}", name, reason);
        state.do_not_run.store(true, Ordering::SeqCst);
        return Ok(());
    }

    let result = run_phases(name, state, workload, step);
    debug!("cleaning up");
    if let Err(e) = workload.lock().cleanup() {
        warn!("{} cleanup failed: {}", name, e);
    }
    result
}

fn run_phases(
    name: &str,
    state: &UnitState,
    workload: &SharedWorkload,
    step: Duration,
) -> Result<(), WorkloadError> {
    debug!("building");
    workload.lock().build()?;
    workload.lock().prepare()?;
    state.ready.store(true, Ordering::SeqCst);
    debug!("{} ready, waiting for start", name);

    state.wait_until(|s| s.start_requested || s.stop_requested, None);
    if !state.start_requested() {
        debug!("stopped before start");
        return Ok(());
    }

    debug!("running");
    loop {
        workload.lock().task_step()?;
        if state.stop_requested() {
            debug!("stop requested");
            break;
        }
        if !workload.lock().is_alive() {
            debug!("{} no longer alive", name);
            break;
        }
        state.wait_until(|s| s.stop_requested, Some(step));
    }
    Ok(())
}
