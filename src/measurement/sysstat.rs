//! # sysstat Measurement
//!
//! Records system activity with `sadc` into
//! `<reportdir>/sysstat/sysstat.dat` while the loads run, for inspection
//! with `sar -f` afterwards. Every task step appends one sample; the run is
//! bracketed by "rteval started" and "rteval stopped" comment records.
//!
//! Options: `binary` (default: the first `sadc` found in the usual sysstat
//! install locations, then on `PATH`).

use crate::config::RunConfig;
use crate::error::{ConfigError, WorkloadError};
use crate::process::{self, CommandLine};
use crate::report::ReportNode;
use crate::workload::{ModuleContext, ModuleInfo, SetupOutcome, Workload};
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cheap enough to run next to the loads and the other instruments
pub const MODULE_INFO: ModuleInfo = ModuleInfo {
    parallel: true,
    with_loads: true,
};

const SADC_LOCATIONS: &[&str] = &[
    "/usr/lib64/sa/sadc",
    "/usr/lib/sa/sadc",
    "/usr/lib/sysstat/sadc",
    "sadc",
];

pub struct Sysstat {
    run: Arc<RunConfig>,
    binary: Option<String>,
    sadc: Option<PathBuf>,
    started: bool,
    entries: u64,
}

impl Sysstat {
    pub fn new(ctx: &ModuleContext) -> Result<Self, ConfigError> {
        Ok(Self {
            run: Arc::clone(&ctx.run),
            binary: ctx.config.get_opt("binary")?,
            sadc: None,
            started: false,
            entries: 0,
        })
    }

    fn datadir(&self) -> PathBuf {
        self.run.reportdir.join("sysstat")
    }

    fn datafile(&self) -> PathBuf {
        self.datadir().join("sysstat.dat")
    }

    /// Records written to the data file so far
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Run sadc once with `args` followed by the data file
    ///
    /// A non-zero exit is logged and the record is not counted.
    fn record(&mut self, args: &[&str]) -> Result<(), WorkloadError> {
        let sadc = self
            .sadc
            .clone()
            .ok_or_else(|| WorkloadError::task("sadc was not located"))?;
        let cmdline = args
            .iter()
            .fold(CommandLine::new(sadc), |cmd, arg| cmd.arg(*arg))
            .arg(self.datafile().to_string_lossy());
        let status = cmdline
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            self.entries += 1;
        } else {
            warn!("{} failed: {}", cmdline, status);
        }
        Ok(())
    }
}

impl Workload for Sysstat {
    fn name(&self) -> &str {
        "sysstat"
    }

    fn setup(&mut self) -> Result<SetupOutcome, WorkloadError> {
        let found = match &self.binary {
            Some(binary) => process::find_executable(binary),
            None => SADC_LOCATIONS
                .iter()
                .find_map(|candidate| process::find_executable(candidate)),
        };
        let sadc = found.ok_or_else(|| WorkloadError::setup("sadc not found (is sysstat installed?)"))?;
        debug!("using {}", sadc.display());
        self.sadc = Some(sadc);
        Ok(SetupOutcome::Run)
    }

    fn prepare(&mut self) -> Result<(), WorkloadError> {
        fs::create_dir_all(self.datadir())?;
        Ok(())
    }

    fn task_step(&mut self) -> Result<(), WorkloadError> {
        if !self.started {
            self.record(&["-S", "XALL", "-C", "rteval started"])?;
            self.started = true;
        }
        self.record(&["-S", "XALL", "1", "1"])
    }

    fn is_alive(&mut self) -> bool {
        true
    }

    fn cleanup(&mut self) -> Result<(), WorkloadError> {
        if self.started {
            self.record(&["-S", "XALL", "-C", "rteval stopped"])?;
        }
        debug!("{} sysstat records written", self.entries);
        Ok(())
    }

    fn make_report(&self) -> Option<ReportNode> {
        let mut node = ReportNode::new("sysstat").attr("num_entries", self.entries);
        if let Some(sadc) = &self.sadc {
            node.set_attr("command_line", sadc.display());
        }
        let bytes = fs::metadata(self.datafile()).map_or(0, |m| m.len());
        node.push(
            ReportNode::new("data")
                .attr("contents", "sysstat/sar binary data")
                .attr("file", "sysstat/sysstat.dat")
                .attr("bytes", bytes),
        );
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HardwareInfo, ModuleConfig};
    use crate::workload::RunTiming;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn context(reportdir: &Path, config: ModuleConfig) -> ModuleContext {
        let hw = HardwareInfo {
            num_cores: 2,
            memory_kib: 4 * 1024 * 1024,
            numa_nodes: 1,
            cpu_model: "Example CPU".to_string(),
        };
        ModuleContext {
            run: Arc::new(RunConfig::new(reportdir, &hw)),
            config,
            timing: RunTiming::default(),
        }
    }

    fn fake_sadc(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-sadc");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_records_are_bracketed_by_comments() {
        let dir = tempfile::tempdir().unwrap();
        // Append the arguments to the data file, which is the last argument.
        let sadc = fake_sadc(dir.path(), "for last; do :; done\necho \"$*\" >> \"$last\"");
        let reportdir = dir.path().join("rteval-20240101-1");
        let config = ModuleConfig::new("sysstat").with("binary", sadc.to_string_lossy());
        let mut sysstat = Sysstat::new(&context(&reportdir, config)).unwrap();

        sysstat.setup().unwrap();
        sysstat.prepare().unwrap();
        for _ in 0..3 {
            sysstat.task_step().unwrap();
            assert!(sysstat.is_alive());
        }
        sysstat.cleanup().unwrap();
        assert_eq!(sysstat.entries(), 5);

        let data = fs::read_to_string(reportdir.join("sysstat/sysstat.dat")).unwrap();
        let records: Vec<_> = data.lines().collect();
        assert_eq!(records.len(), 5);
        assert!(records[0].starts_with("-S XALL -C rteval started"));
        assert!(records[1].starts_with("-S XALL 1 1"));
        assert!(records[4].starts_with("-S XALL -C rteval stopped"));

        let report = sysstat.make_report().unwrap();
        assert_eq!(report.attribute("num_entries"), Some("5"));
        let bytes: u64 = report
            .find("data")
            .and_then(|d| d.attribute("bytes"))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(bytes, data.len() as u64);
    }

    #[test]
    fn test_failed_records_are_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let sadc = fake_sadc(dir.path(), "exit 1");
        let config = ModuleConfig::new("sysstat").with("binary", sadc.to_string_lossy());
        let mut sysstat = Sysstat::new(&context(&dir.path().join("rteval-1"), config)).unwrap();

        sysstat.setup().unwrap();
        sysstat.prepare().unwrap();
        sysstat.task_step().unwrap();
        sysstat.cleanup().unwrap();
        assert_eq!(sysstat.entries(), 0);
    }

    #[test]
    fn test_missing_sadc_is_a_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModuleConfig::new("sysstat").with("binary", "no-such-sadc");
        let mut sysstat = Sysstat::new(&context(dir.path(), config)).unwrap();
        assert!(matches!(sysstat.setup(), Err(WorkloadError::Setup(_))));
    }
}
