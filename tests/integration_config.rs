mod common;

use clap::Parser;
use common::hardware;
use rteval::cli::Args;
use rteval::config::{ConfigFile, Settings};
use rteval::error::RunError;
use rteval::orchestrator::{RunOrchestrator, RunState};
use rteval::workload::ModuleRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"{
    "rteval": { "duration": 120, "workdir": "/var/tmp/rt", "logging": true },
    "loads": { "hackbench": "module", "kcompile": "none" },
    "measurement": { "cyclictest": "module" },
    "cyclictest": { "buckets": 3500, "priority": 90 },
    "hackbench": { "jobspercore": 4 }
}"#;

#[test]
fn command_line_overrides_config_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("rteval.json");
    std::fs::write(&path, CONFIG).expect("write config");

    let args = Args::try_parse_from([
        "rteval",
        "-f",
        path.to_str().expect("utf-8 path"),
        "-d",
        "15m",
        "-O",
        "cyclictest.priority=80",
    ])
    .expect("valid arguments");
    let file = ConfigFile::load(&path).expect("config file");
    let settings = Settings::resolve(&args, Some(file)).expect("settings");

    assert_eq!(settings.duration, Duration::from_secs(900));
    assert_eq!(settings.workdir, PathBuf::from("/var/tmp/rt"));
    assert_eq!(settings.builddir, PathBuf::from("/var/tmp/rt/rteval-build"));
    assert!(settings.logging);
    assert_eq!(settings.loads, vec!["hackbench".to_string()]);
    assert_eq!(settings.measurements, vec!["cyclictest".to_string()]);

    let cyclictest = settings.module_config("cyclictest");
    assert_eq!(cyclictest.get("buckets"), Some("3500"));
    assert_eq!(cyclictest.get("priority"), Some("80"));
    assert_eq!(settings.module_config("hackbench").get("jobspercore"), Some("4"));

    let run = settings.run_config(dir.path().join("rteval-20240101-1"), &hardware());
    assert_eq!(run.logdir(), dir.path().join("rteval-20240101-1/logs"));
    assert_eq!(run.duration, Duration::from_secs(900));
}

#[test]
fn unknown_modules_are_rejected_before_anything_starts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let args = Args::try_parse_from(["rteval", "--loads", "stress-ng", "-d", "5s"])
        .expect("valid arguments");
    let settings = Settings::resolve(&args, None).expect("settings");

    let run = Arc::new(settings.run_config(dir.path().join("rteval-1"), &hardware()));
    let mut orchestrator = RunOrchestrator::new(run, ModuleRegistry::builtin())
        .with_loads(settings.loads.clone())
        .with_measurements(settings.measurements.clone())
        .with_module_configs(settings.modules.clone());

    let err = orchestrator.run().expect_err("unknown load");
    assert!(matches!(err, RunError::UnknownModule { ref name, .. } if name == "stress-ng"));
    assert_eq!(orchestrator.state(), RunState::Aborted);
}

#[test]
fn malformed_config_file_is_reported_with_its_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ \"rteval\": ").expect("write config");

    let err = ConfigFile::load(&path).expect_err("malformed");
    assert!(err.to_string().contains("broken.json"));
}
