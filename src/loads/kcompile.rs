//! Kernel compile load.
//!
//! Unpacks a `linux-*` source tarball from the load source directory into the
//! build directory, configures it once with `allmodconfig`, then keeps a
//! parallel `make` running for the whole measurement window.
//!
//! Options: `tarball` (file name in the source directory), `jobspercore`
//! (default 1), `make` and `tar` (program names or paths). `binary` is
//! accepted in place of `make`.

use super::CommandLineLoad;
use crate::error::{ConfigError, WorkloadError};
use crate::process::{self, CommandLine, OutputFiles};
use crate::report::ReportNode;
use crate::workload::{ModuleContext, SetupOutcome, Workload};
use nix::sys::signal::Signal;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info};

const KERNEL_PREFIX: &str = "linux-";

pub struct Kcompile {
    load: CommandLineLoad,
    tarball: Option<String>,
    jobspercore: usize,
    make: String,
    tar: String,
    make_path: Option<PathBuf>,
    source_dir: Option<PathBuf>,
}

impl Kcompile {
    pub fn new(ctx: &ModuleContext) -> Result<Self, ConfigError> {
        let config = &ctx.config;
        Ok(Self {
            load: CommandLineLoad::new("kcompile", ctx.run.clone(), ctx.timing.grace_period),
            tarball: config.get_opt("tarball")?,
            jobspercore: config.get_or("jobspercore", 1)?,
            make: match config.get_opt("make")? {
                Some(make) => make,
                None => config.get_or("binary", "make".to_string())?,
            },
            tar: config.get_or("tar", "tar".to_string())?,
            make_path: None,
            source_dir: None,
        })
    }

    fn find_tarball(&self, srcdir: &Path) -> Result<PathBuf, WorkloadError> {
        if let Some(name) = &self.tarball {
            let path = srcdir.join(name);
            if !path.is_file() {
                return Err(WorkloadError::setup(format!(
                    "tarball {} does not exist",
                    path.display()
                )));
            }
            return Ok(path);
        }
        first_kernel_entry(srcdir, |p| p.is_file()).ok_or_else(|| {
            WorkloadError::setup(format!("no kernel tarballs found in {}", srcdir.display()))
        })
    }

    fn unpack(&self, tarball: &Path, builddir: &Path) -> Result<(), WorkloadError> {
        let tar = process::find_executable(&self.tar)
            .ok_or_else(|| WorkloadError::setup(format!("{} not found", self.tar)))?;
        let name = tarball.to_string_lossy();
        let mut cmdline = CommandLine::new(tar)
            .arg("-C")
            .arg(builddir.to_string_lossy())
            .arg("-x");
        if name.ends_with(".bz2") {
            cmdline = cmdline.arg("-j");
        } else if name.ends_with(".gz") {
            cmdline = cmdline.arg("-z");
        } else if name.ends_with(".xz") {
            cmdline = cmdline.arg("-J");
        }
        let cmdline = cmdline.arg("-f").arg(name.into_owned());

        info!("Unpacking {} into {}", tarball.display(), builddir.display());
        let status = cmdline
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(WorkloadError::setup(format!(
                "unpacking {} failed: {}",
                tarball.display(),
                status
            )));
        }
        Ok(())
    }

    /// Jobs for the main `make`: full multiplier only with more than 1 GiB per core
    fn job_count(&self) -> usize {
        let run = self.load.run_config();
        let ratio = run.memory_per_core_gib();
        if ratio > 1.0 {
            run.num_cores * self.jobspercore
        } else {
            debug!("Low memory system ({:.2} GiB/core); one job per core", ratio);
            run.num_cores
        }
    }
}

/// First entry of `dir` named `linux-*` that satisfies `accept`
fn first_kernel_entry(dir: &Path, accept: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(KERNEL_PREFIX))
        .map(|e| e.path())
        .filter(|p| accept(p))
        .collect();
    entries.sort();
    entries.into_iter().next()
}

impl Workload for Kcompile {
    fn name(&self) -> &str {
        "kcompile"
    }

    fn setup(&mut self) -> Result<SetupOutcome, WorkloadError> {
        let make = process::find_executable(&self.make)
            .ok_or_else(|| WorkloadError::setup(format!("{} not found", self.make)))?;
        self.make_path = Some(make);

        let run = self.load.run_config();
        let builddir = run.builddir.clone();
        let srcdir = run.srcdir.clone();
        fs::create_dir_all(&builddir)?;

        let mut kdir = first_kernel_entry(&builddir, |p| p.is_dir());
        if kdir.is_none() {
            let tarball = self.find_tarball(&srcdir)?;
            self.unpack(&tarball, &builddir)?;
            kdir = first_kernel_entry(&builddir, |p| p.is_dir());
        }
        let kdir = kdir.ok_or_else(|| {
            WorkloadError::setup(format!(
                "cannot find kernel directory in {}",
                builddir.display()
            ))
        })?;
        debug!("kernel source in {}", kdir.display());
        self.source_dir = Some(kdir);
        Ok(SetupOutcome::Run)
    }

    fn build(&mut self) -> Result<(), WorkloadError> {
        let (Some(make), Some(dir)) = (&self.make_path, &self.source_dir) else {
            return Err(WorkloadError::build("setup did not locate make and sources"));
        };
        let cmdline = CommandLine::new(make)
            .arg("-C")
            .arg(dir.to_string_lossy())
            .arg("mrproper")
            .arg("allmodconfig");

        info!("Configuring kernel tree: {}", cmdline);
        let output = OutputFiles::for_module(self.load.run_config(), "kcompile-build")?;
        let status = cmdline
            .to_command()
            .stdin(Stdio::null())
            .stdout(output.stdout)
            .stderr(output.stderr)
            .status()?;
        if !status.success() {
            return Err(WorkloadError::build(format!("kcompile setup failed: {}", status)));
        }
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), WorkloadError> {
        let (Some(make), Some(dir)) = (&self.make_path, &self.source_dir) else {
            return Err(WorkloadError::build("setup did not locate make and sources"));
        };
        let jobs = self.job_count();
        let cmdline = CommandLine::new(make)
            .arg("-C")
            .arg(dir.to_string_lossy())
            .arg(format!("-j{}", jobs));
        self.load.set_command(cmdline, jobs);
        Ok(())
    }

    fn task_step(&mut self) -> Result<(), WorkloadError> {
        if self.load.ensure_running(None)? {
            debug!("kicked off kcompile (launch {})", self.load.launches());
        }
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        true
    }

    fn cleanup(&mut self) -> Result<(), WorkloadError> {
        self.load.stop(Signal::SIGTERM)?;
        Ok(())
    }

    fn make_report(&self) -> Option<ReportNode> {
        Some(self.load.make_report())
    }
}
