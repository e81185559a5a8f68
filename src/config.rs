//! # Run Configuration
//!
//! Configuration is resolved once at startup into two kinds of values:
//!
//! - [`RunConfig`]: the shared run parameters every module sees (directories,
//!   hardware facts, duration, logging). It is built once, wrapped in an
//!   `Arc` and handed to each module factory.
//! - [`ModuleConfig`]: a flat key/value map of options for one module.
//!
//! Values come from three layers, later layers overriding earlier ones:
//! built-in defaults, an optional JSON config file, then the command line.
//!
//! ## Config File Layout
//!
//! ```json
//! {
//!   "rteval": { "duration": 3600, "report_interval": 300 },
//!   "loads": { "hackbench": "module", "kcompile": "module" },
//!   "measurement": { "cyclictest": "module" },
//!   "cyclictest": { "buckets": 3500, "priority": 99 }
//! }
//! ```

use crate::cli::{Args, ModuleOption};
use crate::defaults;
use crate::error::ConfigError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Shared, read-only parameters for a single run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub workdir: PathBuf,
    pub reportdir: PathBuf,
    pub builddir: PathBuf,
    /// Directory holding load source tarballs
    pub srcdir: PathBuf,
    pub num_cores: usize,
    pub memory_kib: u64,
    pub numa_nodes: usize,
    pub cpu_model: String,
    pub duration: Duration,
    /// Send module output to files under `<reportdir>/logs`
    pub logging: bool,
    pub report_interval: Duration,
}

impl RunConfig {
    /// Run parameters with built-in defaults for the given report directory
    pub fn new(reportdir: impl Into<PathBuf>, hardware: &HardwareInfo) -> Self {
        let reportdir = reportdir.into();
        let workdir = reportdir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(defaults::WORKDIR));
        Self {
            builddir: workdir.join(defaults::BUILDDIR_NAME),
            workdir,
            reportdir,
            srcdir: PathBuf::from(defaults::LOADDIR),
            num_cores: hardware.num_cores,
            memory_kib: hardware.memory_kib,
            numa_nodes: hardware.numa_nodes,
            cpu_model: hardware.cpu_model.clone(),
            duration: defaults::DURATION,
            logging: false,
            report_interval: defaults::REPORT_INTERVAL,
        }
    }

    pub fn logdir(&self) -> PathBuf {
        self.reportdir.join("logs")
    }

    pub fn memory_gib(&self) -> f64 {
        self.memory_kib as f64 / (1024.0 * 1024.0)
    }

    pub fn memory_per_core_gib(&self) -> f64 {
        self.memory_gib() / self.num_cores.max(1) as f64
    }
}

/// Hardware facts detected from `/proc` and `/sys`
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareInfo {
    pub num_cores: usize,
    pub memory_kib: u64,
    pub numa_nodes: usize,
    pub cpu_model: String,
}

impl HardwareInfo {
    pub fn detect() -> Result<Self, ConfigError> {
        let cpuinfo = fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
        let num_cores = match count_processors(&cpuinfo) {
            0 => num_cpus::get(),
            n => n,
        };
        let meminfo = fs::read_to_string("/proc/meminfo")
            .map_err(|e| ConfigError::Detection(format!("memory size: {}", e)))?;
        let memory_kib = parse_mem_total(&meminfo)
            .ok_or_else(|| ConfigError::Detection("memory size: no MemTotal".to_string()))?;
        let numa_nodes = count_numa_nodes(Path::new("/sys/devices/system/node"));
        let cpu_model = parse_cpu_model(&cpuinfo).unwrap_or_else(|| "unknown".to_string());

        debug!(
            "Detected {} cores, {} KiB memory, {} NUMA nodes",
            num_cores, memory_kib, numa_nodes
        );
        Ok(Self {
            num_cores,
            memory_kib,
            numa_nodes,
            cpu_model,
        })
    }
}

/// Number of `processor` entries in `/proc/cpuinfo` text
pub fn count_processors(cpuinfo: &str) -> usize {
    cpuinfo
        .lines()
        .filter(|line| {
            line.split(':')
                .next()
                .map_or(false, |key| key.trim() == "processor")
        })
        .count()
}

/// First `model name` in `/proc/cpuinfo` text
pub fn parse_cpu_model(cpuinfo: &str) -> Option<String> {
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "model name").then(|| value.trim().to_string())
    })
}

/// `MemTotal` in KiB from `/proc/meminfo` text
pub fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

fn count_numa_nodes(sysfs: &Path) -> usize {
    let nodes = fs::read_dir(sysfs)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .and_then(|name| name.strip_prefix("node"))
                        .map_or(false, |id| {
                            !id.is_empty() && id.chars().all(|c| c.is_ascii_digit())
                        })
                })
                .count()
        })
        .unwrap_or(0);
    nodes.max(1)
}

/// Options for one module, stored as strings and parsed on access
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleConfig {
    name: String,
    values: BTreeMap<String, String>,
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Builder form of [`set`](Self::set)
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Parse an optional value
    pub fn get_opt<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    section: self.name.clone(),
                    key: key.to_string(),
                    value: raw.clone(),
                }),
        }
    }

    /// Parse a value, falling back to `default` when the key is absent
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.get_opt(key)?.unwrap_or(default))
    }

    fn merge_json(&mut self, section: &serde_json::Map<String, Value>) {
        for (key, value) in section {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.set(key.clone(), text);
        }
    }
}

/// `[rteval]` section of the config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RtevalSection {
    /// Seconds
    pub duration: Option<u64>,
    pub workdir: Option<PathBuf>,
    pub srcdir: Option<PathBuf>,
    pub builddir: Option<PathBuf>,
    pub logging: Option<bool>,
    /// Seconds
    pub report_interval: Option<u64>,
}

/// JSON config file contents
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub rteval: RtevalSection,
    /// Load module name to `"module"` (enabled) or anything else (disabled)
    pub loads: BTreeMap<String, String>,
    pub measurement: BTreeMap<String, String>,
    /// Per-module option sections
    #[serde(flatten)]
    pub modules: BTreeMap<String, serde_json::Map<String, Value>>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn enabled(section: &BTreeMap<String, String>) -> Option<Vec<String>> {
        if section.is_empty() {
            return None;
        }
        Some(
            section
                .iter()
                .filter(|(_, kind)| kind.eq_ignore_ascii_case("module"))
                .map(|(name, _)| name.clone())
                .collect(),
        )
    }
}

/// Fully resolved settings, before the report directory exists
#[derive(Debug, Clone)]
pub struct Settings {
    pub workdir: PathBuf,
    pub srcdir: PathBuf,
    pub builddir: PathBuf,
    pub duration: Duration,
    pub logging: bool,
    pub report_interval: Duration,
    pub loads: Vec<String>,
    pub measurements: Vec<String>,
    pub modules: BTreeMap<String, ModuleConfig>,
}

impl Settings {
    /// Layer defaults, the optional config file and command-line arguments
    pub fn resolve(args: &Args, file: Option<ConfigFile>) -> Result<Self, ConfigError> {
        let file = file.unwrap_or_default();
        let section = &file.rteval;

        let workdir = args
            .workdir
            .clone()
            .or_else(|| section.workdir.clone())
            .unwrap_or_else(|| PathBuf::from(defaults::WORKDIR));
        let srcdir = args
            .loaddir
            .clone()
            .or_else(|| section.srcdir.clone())
            .unwrap_or_else(|| PathBuf::from(defaults::LOADDIR));
        let builddir = args
            .builddir
            .clone()
            .or_else(|| section.builddir.clone())
            .unwrap_or_else(|| workdir.join(defaults::BUILDDIR_NAME));
        let duration = args
            .duration
            .or_else(|| section.duration.map(Duration::from_secs))
            .unwrap_or(defaults::DURATION);
        let report_interval = args
            .report_interval
            .or(section.report_interval)
            .map(Duration::from_secs)
            .unwrap_or(defaults::REPORT_INTERVAL);
        let logging = args.logging || section.logging.unwrap_or(false);

        let loads = args
            .loads
            .clone()
            .or_else(|| ConfigFile::enabled(&file.loads))
            .unwrap_or_else(|| defaults::LOADS.iter().map(|s| s.to_string()).collect());
        let measurements = args
            .measurements
            .clone()
            .or_else(|| ConfigFile::enabled(&file.measurement))
            .unwrap_or_else(|| {
                defaults::MEASUREMENTS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });

        let mut modules: BTreeMap<String, ModuleConfig> = BTreeMap::new();
        for (name, section) in &file.modules {
            modules
                .entry(name.clone())
                .or_insert_with(|| ModuleConfig::new(name.clone()))
                .merge_json(section);
        }
        for ModuleOption { module, key, value } in &args.module_options {
            if !loads.contains(module) && !measurements.contains(module) {
                warn!("Option {}.{} given for a module that is not enabled", module, key);
            }
            modules
                .entry(module.clone())
                .or_insert_with(|| ModuleConfig::new(module.clone()))
                .set(key.clone(), value.clone());
        }

        if duration.is_zero() {
            return Err(ConfigError::InvalidValue {
                section: "rteval".to_string(),
                key: "duration".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(Self {
            workdir,
            srcdir,
            builddir,
            duration,
            logging,
            report_interval,
            loads,
            measurements,
            modules,
        })
    }

    /// Options for a module; empty when nothing was configured
    pub fn module_config(&self, name: &str) -> ModuleConfig {
        self.modules
            .get(name)
            .cloned()
            .unwrap_or_else(|| ModuleConfig::new(name))
    }

    pub fn run_config(&self, reportdir: PathBuf, hardware: &HardwareInfo) -> RunConfig {
        RunConfig {
            workdir: self.workdir.clone(),
            reportdir,
            builddir: self.builddir.clone(),
            srcdir: self.srcdir.clone(),
            num_cores: hardware.num_cores,
            memory_kib: hardware.memory_kib,
            numa_nodes: hardware.numa_nodes,
            cpu_model: hardware.cpu_model.clone(),
            duration: self.duration,
            logging: self.logging,
            report_interval: self.report_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["rteval"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_module_config_typed_access() {
        let config = ModuleConfig::new("cyclictest")
            .with("buckets", "3500")
            .with("priority", "high");

        assert_eq!(config.get_or("buckets", 2000u64).unwrap(), 3500);
        assert_eq!(config.get_or("distance", 25u64).unwrap(), 25);
        assert_eq!(config.get_opt::<u32>("threads").unwrap(), None);

        let err = config.get_or("priority", 95u32).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "priority"));
    }

    #[test]
    fn test_defaults_without_file_or_flags() {
        let settings = Settings::resolve(&args(&[]), None).unwrap();

        assert_eq!(settings.duration, defaults::DURATION);
        assert_eq!(settings.loads, vec!["hackbench", "kcompile"]);
        assert_eq!(settings.measurements, vec!["cyclictest"]);
        assert_eq!(
            settings.builddir,
            PathBuf::from(defaults::WORKDIR).join(defaults::BUILDDIR_NAME)
        );
        assert!(!settings.logging);
    }

    #[test]
    fn test_command_line_overrides_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rteval.json");
        fs::write(
            &path,
            r#"{
                "rteval": {"duration": 120, "report_interval": 30, "logging": true},
                "loads": {"hackbench": "module", "kcompile": "none"},
                "cyclictest": {"buckets": 3500, "priority": "90"}
            }"#,
        )
        .unwrap();
        let file = ConfigFile::load(&path).unwrap();

        let settings =
            Settings::resolve(&args(&["-d", "5m", "-O", "cyclictest.priority=99"]), Some(file))
                .unwrap();

        assert_eq!(settings.duration, Duration::from_secs(300));
        assert_eq!(settings.report_interval, Duration::from_secs(30));
        assert!(settings.logging);
        assert_eq!(settings.loads, vec!["hackbench"]);

        let cyclictest = settings.module_config("cyclictest");
        assert_eq!(cyclictest.get("buckets"), Some("3500"));
        assert_eq!(cyclictest.get("priority"), Some("99"));
        assert_eq!(settings.module_config("hackbench").get("jobspercore"), None);
    }

    #[test]
    fn test_unreadable_config_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            ConfigFile::load(&path),
            Err(ConfigError::File { .. })
        ));
        assert!(ConfigFile::load(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn test_proc_parsers() {
        let cpuinfo = "processor\t: 0\nmodel name\t: Example CPU @ 2.0GHz\n\n\
                       processor\t: 1\nmodel name\t: Example CPU @ 2.0GHz\n";
        assert_eq!(count_processors(cpuinfo), 2);
        assert_eq!(
            parse_cpu_model(cpuinfo).as_deref(),
            Some("Example CPU @ 2.0GHz")
        );

        let meminfo = "MemTotal:       16318480 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(16318480));
        assert_eq!(parse_mem_total("MemFree: 1 kB\n"), None);
    }

    #[test]
    fn test_memory_per_core() {
        let hw = HardwareInfo {
            num_cores: 4,
            memory_kib: 8 * 1024 * 1024,
            numa_nodes: 1,
            cpu_model: "test".to_string(),
        };
        let run = RunConfig::new("/tmp/rteval-20240101-1", &hw);
        assert_eq!(run.memory_per_core_gib(), 2.0);
        assert_eq!(run.logdir(), PathBuf::from("/tmp/rteval-20240101-1/logs"));
        assert_eq!(run.workdir, PathBuf::from("/tmp"));
    }
}
