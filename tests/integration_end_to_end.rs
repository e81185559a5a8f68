mod common;

use common::{fast_timing, hardware, run_config, script};
use rteval::config::ModuleConfig;
use rteval::orchestrator::{RunOrchestrator, RunState};
use rteval::report::{self, ReportWriter};
use rteval::workload::ModuleRegistry;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

/// Emits two histogram lines for two cores every 0.2s until interrupted,
/// appending one mark to `tally` after each pair has been written
fn fake_cyclictest(tally: &Path) -> String {
    format!(
        "trap 'exit 0' INT TERM\n\
         while :; do\n\
           echo \"# Histogram\"\n\
           echo \"1 2 3\"\n\
           echo \"5 1 0\"\n\
           echo pair >> '{}'\n\
           sleep 0.2\n\
         done",
        tally.display()
    )
}

#[test]
fn hackbench_and_cyclictest_produce_a_consistent_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bin = dir.path().join("bin");
    std::fs::create_dir(&bin).expect("bin dir");
    let tally = dir.path().join("histogram-pairs");
    let cyclictest = script(&bin, "cyclictest", &fake_cyclictest(&tally));
    let hackbench = script(&bin, "hackbench", "exec sleep 60");

    let reportdir = report::create_report_dir(
        dir.path(),
        chrono::NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"),
    )
    .expect("report dir");
    assert!(reportdir.ends_with("rteval-20240301-1"));

    let mut modules = BTreeMap::new();
    modules.insert(
        "cyclictest".to_string(),
        ModuleConfig::new("cyclictest").with("binary", cyclictest.to_string_lossy()),
    );
    modules.insert(
        "hackbench".to_string(),
        ModuleConfig::new("hackbench").with("binary", hackbench.to_string_lossy()),
    );

    let run = run_config(&reportdir, Duration::from_secs(3));
    assert_eq!(run.num_cores, hardware().num_cores);
    let mut orchestrator = RunOrchestrator::new(run, ModuleRegistry::builtin())
        .with_loads(vec!["hackbench".to_string()])
        .with_measurements(vec!["cyclictest".to_string()])
        .with_module_configs(modules)
        .with_timing(fast_timing());

    let started = Instant::now();
    let report = orchestrator.run().expect("run completes");
    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(orchestrator.state(), RunState::Done);
    assert_eq!(report.attribute("version"), Some(rteval::VERSION));

    let load = report
        .find("loads")
        .and_then(|l| l.find("command_line"))
        .expect("hackbench report");
    assert_eq!(load.attribute("name"), Some("hackbench"));
    assert_eq!(load.attribute("job_instances"), Some("4"));

    let cyclictest = report
        .find("measurements")
        .and_then(|m| m.find("profile"))
        .and_then(|p| p.find("cyclictest"))
        .expect("cyclictest report");
    let samples = |node: &rteval::ReportNode| -> u64 {
        node.find("statistics")
            .and_then(|s| s.find("samples"))
            .and_then(|s| s.text_value())
            .expect("samples")
            .parse()
            .expect("numeric samples")
    };

    let system = cyclictest.find("system").expect("system aggregate");
    let cores: Vec<_> = cyclictest.find_all("core").collect();
    assert_eq!(cores.len(), 2);
    let system_samples = samples(system);
    let core_samples: u64 = cores.iter().map(|c| samples(c)).sum();
    assert_eq!(system_samples, core_samples);
    // Every tallied pair reached the pipe before the mark was written, and
    // each pair carries six samples.
    let lines = 2 * std::fs::read_to_string(&tally)
        .expect("tally file")
        .lines()
        .count() as u64;
    assert!(lines >= 2, "no histogram lines emitted");
    assert!(
        system_samples >= 2 * lines,
        "{} samples for {} histogram lines",
        system_samples,
        lines
    );

    let writer = ReportWriter::new(&reportdir);
    let path = writer.write(&report).expect("write report");
    let reloaded = report::load_report(&path).expect("reload");
    assert_eq!(reloaded, report);
    report::summarize(&[reportdir]).expect("summarize report dir");
}
