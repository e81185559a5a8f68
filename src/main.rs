//! # rteval - Main Entry Point
//!
//! 1. **Parse arguments**: clap derive, see [`rteval::cli::Args`]
//! 2. **Summarize mode**: with `-Z`, print summaries of existing reports and exit
//! 3. **Resolve configuration**: defaults, then the config file, then the command line
//! 4. **Create the report directory** and initialize logging into it
//! 5. **Run**: loads and measurements under the orchestrator
//! 6. **Report**: write `summary.json` and print the latency summary
//!
//! ## Exit Codes
//!
//! - `0`: the run completed (also after SIGINT, which stops early but reports)
//! - `1`: the run failed; a partial report is written when possible
//! - `2`: the run was terminated by SIGTERM; no report is written

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use rteval::{
    cli::Args,
    config::{ConfigFile, HardwareInfo, Settings},
    error::RunError,
    logging,
    orchestrator::{InterruptFlags, RunOrchestrator},
    report::{self, ReportWriter},
    sysinfo::SystemInfo,
    workload::ModuleRegistry,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    if !args.summarize.is_empty() {
        let _guard = logging::init(args.verbose, args.debug, None)?;
        report::summarize(&args.summarize)?;
        return Ok(ExitCode::SUCCESS);
    }

    let file = args.config.as_deref().map(ConfigFile::load).transpose()?;
    let settings = Settings::resolve(&args, file)?;
    let hardware = HardwareInfo::detect()?;

    let reportdir = report::create_report_dir(&settings.workdir, Local::now().date_naive())?;
    let run = Arc::new(settings.run_config(reportdir.clone(), &hardware));
    let logdir = settings.logging.then(|| run.logdir());
    let _guard = logging::init(args.verbose, args.debug, logdir.as_deref())?;

    info!("Starting rteval {}", rteval::VERSION);
    info!(
        "{} cores, {:.2} GiB memory, {} NUMA node(s), {}",
        hardware.num_cores,
        run.memory_gib(),
        hardware.numa_nodes,
        hardware.cpu_model
    );
    info!("Report directory: {:?}", reportdir);

    let flags = InterruptFlags::new();
    flags.register()?;

    let mut orchestrator = RunOrchestrator::new(Arc::clone(&run), ModuleRegistry::builtin())
        .with_loads(settings.loads.clone())
        .with_measurements(settings.measurements.clone())
        .with_module_configs(settings.modules.clone())
        .with_interrupts(flags)
        .with_annotation(args.annotate.clone())
        .with_system_info(SystemInfo::standard(&hardware));

    let writer = ReportWriter::new(&reportdir);
    match orchestrator.run() {
        Ok(report) => {
            writer.write(&report)?;
            report::print_summary(&report);
            Ok(ExitCode::SUCCESS)
        }
        Err(RunError::Terminated) => {
            warn!("Run terminated; no report written");
            Ok(ExitCode::from(2))
        }
        Err(e) => {
            error!("rteval failed: {}", e);
            match writer.write(&orchestrator.make_report()) {
                Ok(path) => warn!("Partial report written to {:?}", path),
                Err(write_err) => error!("Could not write partial report: {:#}", write_err),
            }
            Ok(ExitCode::FAILURE)
        }
    }
}
