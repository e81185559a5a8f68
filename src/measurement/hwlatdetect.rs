//! # hwlatdetect Measurement
//!
//! Runs the `hwlatdetect` tool once, with no loads and no other measurement
//! active, to catch latencies caused by hardware or firmware (SMIs) rather
//! than by the kernel. The tool exits by itself after `duration` seconds,
//! which ends this member of its serialized profile.
//!
//! The tool's summary goes to `<reportdir>/hwlatdetect.out` and the
//! individual samples to `<reportdir>/hwlatdetect.samples`; both are read
//! back during cleanup. A missing tool is not an error: the module then
//! reports `aborted="1"`.
//!
//! ## Options
//!
//! `threshold` (15 us), `window` (1000000 us), `width` (800000 us),
//! `duration` (15 s), `binary` (`hwlatdetect`).

use crate::config::RunConfig;
use crate::error::{ConfigError, WorkloadError};
use crate::process::{self, CommandLine};
use crate::report::ReportNode;
use crate::workload::{ModuleContext, ModuleInfo, SetupOutcome, Workload};
use nix::sys::signal::Signal;
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Needs the machine to itself: no loads, one instrument at a time
pub const MODULE_INFO: ModuleInfo = ModuleInfo {
    parallel: false,
    with_loads: false,
};

/// One latency above the threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencySample {
    pub timestamp: String,
    /// Microseconds
    pub duration: u64,
}

/// Parse a line of the samples file
///
/// Accepts both `<timestamp>\t<duration>` and the newer
/// `ts: <timestamp>, inner:<us>, outer:<us>` format, where the larger of the
/// inner and outer gap is the duration.
pub fn parse_sample(line: &str) -> Option<LatencySample> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("ts:") {
        let mut fields = rest.split(',');
        let timestamp = fields.next()?.trim().to_string();
        let mut duration = None;
        for field in fields {
            let (key, value) = field.split_once(':')?;
            if matches!(key.trim(), "inner" | "outer") {
                let value: u64 = value.trim().parse().ok()?;
                duration = Some(duration.map_or(value, |d: u64| d.max(value)));
            }
        }
        return Some(LatencySample {
            timestamp,
            duration: duration?,
        });
    }

    let mut fields = line.split_whitespace();
    let timestamp = fields.next()?.to_string();
    let duration = fields.next()?.parse().ok()?;
    Some(LatencySample {
        timestamp,
        duration,
    })
}

/// Totals printed by hwlatdetect when it finishes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub exceeding: Option<u64>,
    /// `None` when the tool reports the maximum as below threshold
    pub max_latency: Option<u64>,
}

pub fn parse_summary(output: &str) -> Summary {
    let mut summary = Summary::default();
    for line in output.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("Samples exceeding threshold:") {
            summary.exceeding = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("Max Latency:") {
            summary.max_latency = rest.trim().trim_end_matches("us").trim().parse().ok();
        }
    }
    summary
}

pub struct HwLatDetect {
    run: Arc<RunConfig>,
    grace: Duration,
    binary: String,
    threshold: u64,
    window: u64,
    width: u64,
    duration: u64,
    cmdline: Option<CommandLine>,
    child: Option<Child>,
    started: bool,
    summary: Summary,
    samples: Vec<LatencySample>,
}

impl HwLatDetect {
    pub fn new(ctx: &ModuleContext) -> Result<Self, ConfigError> {
        let config = &ctx.config;
        Ok(Self {
            run: Arc::clone(&ctx.run),
            grace: ctx.timing.grace_period,
            binary: config.get_or("binary", "hwlatdetect".to_string())?,
            threshold: config.get_or("threshold", 15)?,
            window: config.get_or("window", 1_000_000)?,
            width: config.get_or("width", 800_000)?,
            duration: config.get_or("duration", 15)?,
            cmdline: None,
            child: None,
            started: false,
            summary: Summary::default(),
            samples: Vec::new(),
        })
    }

    fn output_path(&self) -> PathBuf {
        self.run.reportdir.join("hwlatdetect.out")
    }

    fn samples_path(&self) -> PathBuf {
        self.run.reportdir.join("hwlatdetect.samples")
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn samples(&self) -> &[LatencySample] {
        &self.samples
    }

    fn collect(&mut self) -> io::Result<()> {
        match fs::read_to_string(self.output_path()) {
            Ok(output) => self.summary = parse_summary(&output),
            Err(e) if e.kind() == io::ErrorKind::NotFound => debug!("no hwlatdetect output"),
            Err(e) => return Err(e),
        }
        match fs::read_to_string(self.samples_path()) {
            Ok(samples) => self.samples = samples.lines().filter_map(parse_sample).collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => debug!("no samples recorded"),
            Err(e) => return Err(e),
        }
        info!(
            "{} samples above {}us, {} exceeding",
            self.samples.len(),
            self.threshold,
            self.summary
                .exceeding
                .map_or_else(|| "unknown".to_string(), |n| n.to_string())
        );
        Ok(())
    }
}

impl Workload for HwLatDetect {
    fn name(&self) -> &str {
        "hwlatdetect"
    }

    fn setup(&mut self) -> Result<SetupOutcome, WorkloadError> {
        let Some(binary) = process::find_executable(&self.binary) else {
            warn!("{} not found; hwlatdetect will not run", self.binary);
            return Ok(SetupOutcome::Run);
        };
        self.cmdline = Some(
            CommandLine::new(binary)
                .arg(format!("--threshold={}", self.threshold))
                .arg(format!("--window={}", self.window))
                .arg(format!("--width={}", self.width))
                .arg(format!("--duration={}", self.duration))
                .arg(format!("--report={}", self.samples_path().display())),
        );
        Ok(SetupOutcome::Run)
    }

    fn prepare(&mut self) -> Result<(), WorkloadError> {
        if self.cmdline.is_some() {
            fs::create_dir_all(&self.run.reportdir)?;
        }
        Ok(())
    }

    fn task_step(&mut self) -> Result<(), WorkloadError> {
        if self.started {
            return Ok(());
        }
        let Some(cmdline) = &self.cmdline else {
            return Ok(());
        };
        info!("Starting {}", cmdline);
        let output = File::create(self.output_path())?;
        let child = cmdline
            .to_command()
            .stdin(Stdio::null())
            .stdout(output)
            .stderr(Stdio::null())
            .spawn()?;
        self.child = Some(child);
        self.started = true;
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.child.as_mut().map_or(false, process::is_running)
    }

    fn cleanup(&mut self) -> Result<(), WorkloadError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = process::terminate(&mut child, Signal::SIGINT, self.grace)?;
        debug!("hwlatdetect exited: {}", status);
        self.collect()?;
        Ok(())
    }

    fn make_report(&self) -> Option<ReportNode> {
        let mut node = ReportNode::new("hwlatdetect").attr("format", "1.0");
        let Some(cmdline) = &self.cmdline else {
            node.set_attr("aborted", 1);
            return Some(node);
        };
        node.set_attr("command_line", cmdline);
        node.push(
            ReportNode::new("run_params")
                .attr("threshold", self.threshold)
                .attr("window", self.window)
                .attr("width", self.width)
                .attr("duration", self.duration),
        );

        let mut samples = ReportNode::new("samples").attr("count", self.samples.len());
        if let Some(exceeding) = self.summary.exceeding {
            samples.set_attr("exceeding", exceeding);
        }
        if let Some(max) = self.summary.max_latency {
            samples.set_attr("max_latency", max);
        }
        samples.extend(self.samples.iter().map(|s| {
            ReportNode::new("sample")
                .attr("timestamp", &s.timestamp)
                .attr("duration", s.duration)
        }));
        node.push(samples);
        Some(node)
    }
}
