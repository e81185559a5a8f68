mod common;

use common::{add_load, add_measurement, fast_timing, run_config, Behavior};
use rteval::error::RunError;
use rteval::orchestrator::{InterruptFlags, RunOrchestrator, RunState};
use rteval::workload::{ModuleInfo, ModuleRegistry};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

const PARALLEL_WITH_LOADS: ModuleInfo = ModuleInfo {
    parallel: true,
    with_loads: true,
};

const SERIAL_NO_LOADS: ModuleInfo = ModuleInfo {
    parallel: false,
    with_loads: false,
};

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn serialized_profile_runs_members_in_order_and_records_crashes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = ModuleRegistry::new();
    let load = add_load(&mut registry, "spin", Behavior::Healthy);
    let first = add_measurement(&mut registry, "first", SERIAL_NO_LOADS, Behavior::FinishAfter(3));
    let second = add_measurement(&mut registry, "second", SERIAL_NO_LOADS, Behavior::FailTask);

    let mut orchestrator = RunOrchestrator::new(
        run_config(&dir.path().join("rteval-1"), Duration::from_secs(30)),
        registry,
    )
    .with_loads(names(&["spin"]))
    .with_measurements(names(&["first", "second"]))
    .with_timing(fast_timing());

    let started = Instant::now();
    let report = orchestrator.run().expect("run completes");
    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(orchestrator.state(), RunState::Done);

    assert_eq!(first.steps(), 3);
    assert_eq!(second.steps(), 1);
    assert!(!load.started.load(Ordering::SeqCst), "profile runs without loads");

    let profile = report
        .find("measurements")
        .and_then(|m| m.find("profile"))
        .expect("profile node");
    assert_eq!(profile.attribute("parallel"), Some("0"));
    assert_eq!(profile.attribute("loads"), Some("0"));
    assert_eq!(profile.attribute("failed"), Some("second"));
}

#[test]
fn dead_load_aborts_with_partial_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = ModuleRegistry::new();
    add_load(&mut registry, "healthy", Behavior::Healthy);
    add_load(&mut registry, "crashy", Behavior::FailTask);
    let measure = add_measurement(&mut registry, "sampler", PARALLEL_WITH_LOADS, Behavior::Healthy);

    let mut orchestrator = RunOrchestrator::new(
        run_config(&dir.path().join("rteval-1"), Duration::from_secs(30)),
        registry,
    )
    .with_loads(names(&["healthy", "crashy"]))
    .with_measurements(names(&["sampler"]))
    .with_timing(fast_timing());

    match orchestrator.run() {
        Err(RunError::LoadDied { expected, observed }) => {
            assert_eq!(expected, 2);
            assert!(observed < 2);
        }
        other => panic!("expected LoadDied, got {:?}", other.map(|r| r.name().to_string())),
    }
    assert_eq!(orchestrator.state(), RunState::Aborted);
    assert_eq!(measure.cleanups(), 1);

    let partial = orchestrator.make_report();
    let loads = partial.find("loads").expect("loads node");
    assert_eq!(loads.children().len(), 2);
    assert!(partial.find("measurements").and_then(|m| m.find("profile")).is_some());
}

#[test]
fn load_build_failure_is_a_startup_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = ModuleRegistry::new();
    let good = add_load(&mut registry, "good", Behavior::Healthy);
    add_load(&mut registry, "broken", Behavior::FailBuild);
    let measure = add_measurement(&mut registry, "sampler", PARALLEL_WITH_LOADS, Behavior::Healthy);

    let mut orchestrator = RunOrchestrator::new(
        run_config(&dir.path().join("rteval-1"), Duration::from_secs(30)),
        registry,
    )
    .with_loads(names(&["good", "broken"]))
    .with_measurements(names(&["sampler"]))
    .with_timing(fast_timing());

    let started = Instant::now();
    let err = orchestrator.run().expect_err("startup must fail");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(err, RunError::Startup { ref unit, .. } if unit == "broken"));
    assert!(!good.started.load(Ordering::SeqCst));
    assert_eq!(measure.steps(), 0);
}

#[test]
fn sigint_ends_the_window_early_and_still_reports() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = ModuleRegistry::new();
    let load = add_load(&mut registry, "spin", Behavior::Healthy);
    add_measurement(&mut registry, "sampler", PARALLEL_WITH_LOADS, Behavior::Healthy);

    let flags = InterruptFlags::new();
    let mut orchestrator = RunOrchestrator::new(
        run_config(&dir.path().join("rteval-1"), Duration::from_secs(120)),
        registry,
    )
    .with_loads(names(&["spin"]))
    .with_measurements(names(&["sampler"]))
    .with_timing(fast_timing())
    .with_interrupts(flags.clone())
    .with_annotation(Some("interrupted run".to_string()));

    let sigint = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        flags.sigint.store(true, Ordering::SeqCst);
    });
    let started = Instant::now();
    let report = orchestrator.run().expect("graceful stop reports");
    sigint.join().expect("signal thread");

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(orchestrator.state(), RunState::Done);
    assert_eq!(load.cleanups(), 1);
    let run_info = report.find("run_info").expect("run_info");
    assert_eq!(
        run_info.find("annotate").and_then(|a| a.text_value()),
        Some("interrupted run")
    );
}

#[test]
fn sigterm_stops_everything_without_a_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = ModuleRegistry::new();
    let load = add_load(&mut registry, "spin", Behavior::Healthy);
    let measure = add_measurement(&mut registry, "sampler", PARALLEL_WITH_LOADS, Behavior::Healthy);

    let flags = InterruptFlags::new();
    let mut orchestrator = RunOrchestrator::new(
        run_config(&dir.path().join("rteval-1"), Duration::from_secs(120)),
        registry,
    )
    .with_loads(names(&["spin"]))
    .with_measurements(names(&["sampler"]))
    .with_timing(fast_timing())
    .with_interrupts(flags.clone());

    let sigterm = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        flags.sigterm.store(true, Ordering::SeqCst);
    });
    let err = orchestrator.run().expect_err("terminated");
    sigterm.join().expect("signal thread");

    assert!(matches!(err, RunError::Terminated));
    assert_eq!(orchestrator.state(), RunState::Aborted);
    assert_eq!(load.cleanups(), 1);
    assert_eq!(measure.cleanups(), 1);
}
