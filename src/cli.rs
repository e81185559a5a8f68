use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// rteval - evaluate real-time latency of a system under load
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Measurement duration (e.g. 90, 30s, 15m, 2h, 1d)
    #[clap(short = 'd', long, value_parser = parse_duration, help_heading = "Core Options")]
    pub duration: Option<Duration>,

    /// Working directory; report directories are created here
    #[clap(short = 'w', long, help_heading = "Core Options")]
    pub workdir: Option<PathBuf>,

    /// Directory holding load source tarballs
    #[clap(short = 'l', long, help_heading = "Core Options")]
    pub loaddir: Option<PathBuf>,

    /// Directory loads build in (default: <workdir>/rteval-build)
    #[clap(long, help_heading = "Core Options")]
    pub builddir: Option<PathBuf>,

    /// JSON configuration file
    #[clap(short = 'f', long = "config")]
    pub config: Option<PathBuf>,

    /// Load modules to run (default: hackbench kcompile); give no names for a measurement-only run
    #[clap(long, num_args = 0..)]
    pub loads: Option<Vec<String>>,

    /// Measurement modules to run (default: cyclictest)
    #[clap(long, num_args = 1..)]
    pub measurements: Option<Vec<String>>,

    /// Per-module option, repeatable (e.g. -O cyclictest.buckets=3500)
    #[clap(short = 'O', long = "module-option", value_parser = parse_module_option)]
    pub module_options: Vec<ModuleOption>,

    /// Write module output and a run log under <reportdir>/logs
    #[clap(short = 'L', long)]
    pub logging: bool,

    /// Verbose output
    #[clap(short = 'v', long)]
    pub verbose: bool,

    /// Debug output
    #[clap(short = 'D', long)]
    pub debug: bool,

    /// Seconds between progress reports while measuring
    #[clap(long)]
    pub report_interval: Option<u64>,

    /// Free-form annotation stored in the report
    #[clap(short = 'a', long)]
    pub annotate: Option<String>,

    /// Print summaries of existing reports (summary.json or report directories) and exit
    #[clap(short = 'Z', long, num_args = 1..)]
    pub summarize: Vec<PathBuf>,
}

/// A `module.key=value` option from the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleOption {
    pub module: String,
    pub key: String,
    pub value: String,
}

fn parse_module_option(s: &str) -> Result<ModuleOption, String> {
    let malformed = || crate::error::ConfigError::MalformedOption(s.to_string()).to_string();
    let (path, value) = s.split_once('=').ok_or_else(malformed)?;
    let (module, key) = path.split_once('.').ok_or_else(malformed)?;
    let (module, key) = (module.trim(), key.trim());
    if module.is_empty() || key.is_empty() {
        return Err(malformed());
    }
    Ok(ModuleOption {
        module: module.to_string(),
        key: key.to_string(),
        value: value.trim().to_string(),
    })
}

/// Parse duration from string (e.g., "90", "10s", "5m", "1h", "2d")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim().to_ascii_lowercase();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, multiplier) = if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1.0)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60.0)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3600.0)
    } else if let Some(stripped) = s.strip_suffix('d') {
        (stripped, 86400.0)
    } else {
        (s.as_str(), 1.0) // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    Duration::try_from_secs_f64(num * multiplier).map_err(|_| format!("Invalid duration: {}", s))
}
