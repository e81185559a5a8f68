//! # cyclictest Measurement
//!
//! Runs `cyclictest` in histogram mode for the whole measurement window and
//! folds its per-thread histograms into one [`RunData`] per core plus a
//! `system` aggregate.
//!
//! ## Output Contract
//!
//! With `-h`, cyclictest writes lines of the form
//!
//! ```text
//! # comment lines start with '#'
//! <latency_us> <count_core0> <count_core1> ... <count_coreN>
//! ```
//!
//! Each count goes into that core's histogram and into the system aggregate.
//! Stdout is consumed by a reader thread so the pipe never fills; the unit's
//! worker thread drains the lines into the accumulators on every task step
//! and once more after the process has exited.
//!
//! ## Options
//!
//! `priority` (95), `buckets` (2000), `distance` (25), `interval` (100),
//! `threads` (one per core when unset), `binary` (`cyclictest`).

use crate::config::RunConfig;
use crate::error::{ConfigError, WorkloadError};
use crate::histogram::{RunData, SourceKind};
use crate::process::{self, CommandLine};
use crate::report::ReportNode;
use crate::workload::{ModuleContext, ModuleInfo, SetupOutcome, Workload};
use crossbeam::channel::{self, Receiver};
use nix::sys::signal::Signal;
use std::io::{BufRead, BufReader};
use std::process::{Child, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// cyclictest runs alongside the loads and next to other parallel instruments
pub const MODULE_INFO: ModuleInfo = ModuleInfo {
    parallel: true,
    with_loads: true,
};

/// One parsed histogram line: latency and one count per measured thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramLine {
    pub index: u64,
    pub counts: Vec<u64>,
}

/// Parse a histogram line; `None` for comments, blank and malformed lines
pub fn parse_histogram_line(line: &str) -> Option<HistogramLine> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.split_whitespace();
    let index = fields.next()?.parse().ok()?;
    let counts = fields
        .map(str::parse)
        .collect::<Result<Vec<u64>, _>>()
        .ok()?;
    Some(HistogramLine { index, counts })
}

pub struct Cyclictest {
    run: Arc<RunConfig>,
    grace: Duration,
    binary: String,
    priority: u32,
    buckets: u64,
    distance: u64,
    interval: u64,
    threads: Option<usize>,
    cmdline: Option<CommandLine>,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    lines: Option<Receiver<String>>,
    cores: Vec<RunData>,
    system: RunData,
    lines_seen: u64,
}

impl Cyclictest {
    pub fn new(ctx: &ModuleContext) -> Result<Self, ConfigError> {
        let config = &ctx.config;
        let run = Arc::clone(&ctx.run);
        let priority = config.get_or("priority", 95)?;
        let threads: Option<usize> = config.get_opt("threads")?;
        let sources = threads.unwrap_or(run.num_cores);

        let cores = (0..sources)
            .map(|i| {
                let mut data = RunData::new(i.to_string(), SourceKind::Core, priority);
                data.set_description(run.cpu_model.clone());
                data
            })
            .collect();
        let mut system = RunData::new("system", SourceKind::System, priority);
        system.set_description(format!("({} cores) {}", run.num_cores, run.cpu_model));

        Ok(Self {
            grace: ctx.timing.grace_period,
            binary: config.get_or("binary", "cyclictest".to_string())?,
            priority,
            buckets: config.get_or("buckets", 2000)?,
            distance: config.get_or("distance", 25)?,
            interval: config.get_or("interval", 100)?,
            threads,
            cmdline: None,
            child: None,
            reader: None,
            lines: None,
            cores,
            system,
            lines_seen: 0,
            run,
        })
    }

    pub fn system(&self) -> &RunData {
        &self.system
    }

    pub fn cores(&self) -> &[RunData] {
        &self.cores
    }

    fn ingest(&mut self, line: &str) {
        let Some(parsed) = parse_histogram_line(line) else {
            if !line.trim_start().starts_with('#') && !line.trim().is_empty() {
                debug!("skipping malformed line: {:?}", line);
            }
            return;
        };
        self.lines_seen += 1;
        for (core, count) in self.cores.iter_mut().zip(parsed.counts) {
            core.bucket(parsed.index, count);
            self.system.bucket(parsed.index, count);
        }
    }

    fn drain(&mut self) {
        let pending: Vec<String> = match &self.lines {
            Some(rx) => rx.try_iter().collect(),
            None => return,
        };
        for line in pending {
            self.ingest(&line);
        }
    }

    fn spawn(&mut self) -> Result<(), WorkloadError> {
        let cmdline = self
            .cmdline
            .as_ref()
            .ok_or_else(|| WorkloadError::task("cyclictest command not prepared"))?;
        info!("Starting {}", cmdline);
        let mut child = cmdline
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkloadError::task("cyclictest stdout not captured"))?;

        let (tx, rx) = channel::unbounded();
        let reader = thread::Builder::new()
            .name("cyclictest-reader".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })?;

        self.child = Some(child);
        self.reader = Some(reader);
        self.lines = Some(rx);
        Ok(())
    }
}

impl Workload for Cyclictest {
    fn name(&self) -> &str {
        "cyclictest"
    }

    fn setup(&mut self) -> Result<SetupOutcome, WorkloadError> {
        let binary = process::find_executable(&self.binary)
            .ok_or_else(|| WorkloadError::setup(format!("{} not found", self.binary)))?;
        let mode = if self.run.numa_nodes > 1 {
            debug!("running in NUMA mode ({} nodes)", self.run.numa_nodes);
            "--numa"
        } else {
            debug!("running in SMP mode");
            "--smp"
        };
        let mut cmdline = CommandLine::new(binary)
            .arg(format!("-i{}", self.interval))
            .arg("-qm")
            .arg(format!("-d{}", self.distance))
            .arg(format!("-h{}", self.buckets))
            .arg(format!("-p{}", self.priority))
            .arg(mode);
        if let Some(threads) = self.threads {
            cmdline = cmdline.arg(format!("-t{}", threads));
        }
        self.cmdline = Some(cmdline);
        Ok(SetupOutcome::Run)
    }

    fn task_step(&mut self) -> Result<(), WorkloadError> {
        if self.child.is_none() {
            self.spawn()?;
        }
        self.drain();
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.child.as_mut().map_or(false, process::is_running)
    }

    fn cleanup(&mut self) -> Result<(), WorkloadError> {
        if let Some(mut child) = self.child.take() {
            // SIGINT makes cyclictest print its histogram and exit.
            process::terminate(&mut child, Signal::SIGINT, self.grace)?;
        }
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("cyclictest output reader panicked");
            }
        }
        self.drain();
        self.lines = None;

        debug!("{} histogram lines collected", self.lines_seen);
        for core in &mut self.cores {
            core.reduce();
        }
        self.system.reduce();
        Ok(())
    }

    fn make_report(&self) -> Option<ReportNode> {
        let mut node = ReportNode::new("cyclictest");
        if let Some(cmdline) = &self.cmdline {
            node.set_attr("command_line", cmdline);
        }
        node.push(self.system.make_report());
        node.extend(self.cores.iter().map(RunData::make_report));
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HardwareInfo, ModuleConfig};
    use crate::workload::RunTiming;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn context(config: ModuleConfig, numa_nodes: usize) -> ModuleContext {
        let hw = HardwareInfo {
            num_cores: 2,
            memory_kib: 4 * 1024 * 1024,
            numa_nodes,
            cpu_model: "Example CPU".to_string(),
        };
        ModuleContext {
            run: Arc::new(RunConfig::new("/tmp/rteval-cyclictest-1", &hw)),
            config,
            timing: RunTiming {
                grace_period: Duration::from_secs(2),
                ..RunTiming::default()
            },
        }
    }

    #[test]
    fn test_parse_histogram_line() {
        assert_eq!(
            parse_histogram_line("000005 000012 000003"),
            Some(HistogramLine {
                index: 5,
                counts: vec![12, 3]
            })
        );
        assert_eq!(parse_histogram_line("# Histogram"), None);
        assert_eq!(parse_histogram_line("   "), None);
        assert_eq!(parse_histogram_line("# Max Latencies: 00012"), None);
        assert_eq!(parse_histogram_line("12 abc"), None);
    }

    #[test]
    fn test_ingest_feeds_cores_and_system() {
        let mut ct = Cyclictest::new(&context(ModuleConfig::new("cyclictest"), 1)).unwrap();
        ct.ingest("# comment");
        ct.ingest("1 2 3");
        ct.ingest("5 1 0");
        ct.ingest("7 4");
        ct.ingest("garbage line");

        assert_eq!(ct.cores()[0].sample_count(), 7);
        assert_eq!(ct.cores()[1].sample_count(), 3);
        assert_eq!(ct.system().sample_count(), 10);
        assert_eq!(ct.system().max(), Some(7));
        assert_eq!(ct.lines_seen, 3);
    }

    #[test]
    fn test_command_line_flags() {
        let config = ModuleConfig::new("cyclictest")
            .with("binary", "/bin/sh")
            .with("buckets", "3500")
            .with("threads", "4");
        let mut ct = Cyclictest::new(&context(config, 2)).unwrap();
        ct.setup().unwrap();

        let cmdline = ct.cmdline.as_ref().unwrap().to_string();
        assert_eq!(cmdline, "/bin/sh -i100 -qm -d25 -h3500 -p95 --numa -t4");
        assert_eq!(ct.cores().len(), 4);
    }

    #[test]
    fn test_missing_binary_is_a_setup_error() {
        let config = ModuleConfig::new("cyclictest").with("binary", "no-such-cyclictest");
        let mut ct = Cyclictest::new(&context(config, 1)).unwrap();
        assert!(matches!(ct.setup(), Err(WorkloadError::Setup(_))));
    }

    #[test]
    fn test_histogram_collected_from_process_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-cyclictest");
        fs::write(
            &script,
            "#!/bin/sh\n\
             trap 'echo \"# Histogram\"; echo \"3 1 2\"; echo \"9 0 1\"; exit 0' INT\n\
             while :; do sleep 0.05; done\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let config =
            ModuleConfig::new("cyclictest").with("binary", script.to_string_lossy().to_string());
        let mut ct = Cyclictest::new(&context(config, 1)).unwrap();
        ct.setup().unwrap();
        ct.task_step().unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(ct.is_alive());

        ct.cleanup().unwrap();
        assert!(!ct.is_alive());
        assert_eq!(ct.system().sample_count(), 4);
        assert_eq!(ct.cores()[1].statistics().range, 6);

        let report = ct.make_report().unwrap();
        assert_eq!(report.children()[0].name(), "system");
        assert_eq!(
            report.children()[0].attribute("description"),
            Some("(2 cores) Example CPU")
        );
        assert_eq!(report.children().len(), 3);
    }
}
