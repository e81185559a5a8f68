//! # System Inventory
//!
//! Describes the host a run was made on. Each concern is an independent
//! [`ReportSource`] component; [`SystemInfo`] aggregates whatever components
//! it is given. A component that fails is logged and left out of the report.

use crate::config::{count_processors, parse_cpu_model, parse_mem_total, HardwareInfo};
use crate::report::ReportNode;
use crate::utils::format_kib;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::warn;

/// Something that can describe part of the system as a report node
pub trait ReportSource {
    fn name(&self) -> &str;
    fn report(&self) -> io::Result<ReportNode>;
}

/// Kernel identity from `uname` and the PREEMPT_RT marker
pub struct KernelInfo {
    realtime_flag: PathBuf,
}

impl Default for KernelInfo {
    fn default() -> Self {
        Self {
            realtime_flag: PathBuf::from("/sys/kernel/realtime"),
        }
    }
}

impl KernelInfo {
    fn is_realtime(&self, version: &str) -> bool {
        let flagged = fs::read_to_string(&self.realtime_flag)
            .map(|s| s.trim() == "1")
            .unwrap_or(false);
        flagged || version.contains("PREEMPT_RT") || version.contains("PREEMPT RT")
    }
}

impl ReportSource for KernelInfo {
    fn name(&self) -> &str {
        "kernel"
    }

    fn report(&self) -> io::Result<ReportNode> {
        let uts = nix::sys::utsname::uname().map_err(io::Error::from)?;
        let version = uts.version().to_string_lossy().into_owned();
        Ok(ReportNode::new("kernel")
            .attr("sysname", uts.sysname().to_string_lossy())
            .attr("hostname", uts.nodename().to_string_lossy())
            .attr("release", uts.release().to_string_lossy())
            .attr("machine", uts.machine().to_string_lossy())
            .attr("realtime", u8::from(self.is_realtime(&version)))
            .text(version))
    }
}

/// Processor count and model
pub struct CpuInfo {
    cpuinfo: PathBuf,
}

impl CpuInfo {
    pub fn new(cpuinfo: impl Into<PathBuf>) -> Self {
        Self {
            cpuinfo: cpuinfo.into(),
        }
    }
}

impl Default for CpuInfo {
    fn default() -> Self {
        Self::new("/proc/cpuinfo")
    }
}

impl ReportSource for CpuInfo {
    fn name(&self) -> &str {
        "cpu"
    }

    fn report(&self) -> io::Result<ReportNode> {
        let text = fs::read_to_string(&self.cpuinfo)?;
        Ok(ReportNode::new("cpu")
            .attr("cores", count_processors(&text))
            .attr(
                "model",
                parse_cpu_model(&text).unwrap_or_else(|| "unknown".to_string()),
            ))
    }
}

/// Installed memory and NUMA layout
pub struct MemoryInfo {
    meminfo: PathBuf,
    numa_nodes: usize,
}

impl MemoryInfo {
    pub fn new(meminfo: impl Into<PathBuf>, numa_nodes: usize) -> Self {
        Self {
            meminfo: meminfo.into(),
            numa_nodes,
        }
    }
}

impl ReportSource for MemoryInfo {
    fn name(&self) -> &str {
        "memory"
    }

    fn report(&self) -> io::Result<ReportNode> {
        let text = fs::read_to_string(&self.meminfo)?;
        let total = parse_mem_total(&text).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "MemTotal missing from meminfo")
        })?;
        Ok(ReportNode::new("memory")
            .attr("numa_nodes", self.numa_nodes)
            .child(
                ReportNode::leaf("memory_size", total)
                    .attr("unit", "KiB")
                    .attr("human", format_kib(total)),
            ))
    }
}

/// Current and available clock sources
pub struct ClockSourceInfo {
    dir: PathBuf,
}

impl ClockSourceInfo {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Default for ClockSourceInfo {
    fn default() -> Self {
        Self::new("/sys/devices/system/clocksource/clocksource0")
    }
}

impl ReportSource for ClockSourceInfo {
    fn name(&self) -> &str {
        "clocksource"
    }

    fn report(&self) -> io::Result<ReportNode> {
        let read = |file: &str| -> io::Result<String> {
            Ok(fs::read_to_string(self.dir.join(file))?.trim().to_string())
        };
        let current = read("current_clocksource")?;
        let available = read("available_clocksource").unwrap_or_default();
        Ok(ReportNode::new("clocksource")
            .attr("current", current)
            .attr("available", available))
    }
}

/// Aggregate of inventory components
#[derive(Default)]
pub struct SystemInfo {
    components: Vec<Box<dyn ReportSource>>,
}

impl SystemInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel, CPU, memory and clock source components for this host
    pub fn standard(hardware: &HardwareInfo) -> Self {
        let mut info = Self::new();
        info.add(KernelInfo::default());
        info.add(CpuInfo::default());
        info.add(MemoryInfo::new("/proc/meminfo", hardware.numa_nodes));
        info.add(ClockSourceInfo::default());
        info
    }

    pub fn add(&mut self, component: impl ReportSource + 'static) {
        self.components.push(Box::new(component));
    }

    /// Report nodes of every component that could be read
    pub fn make_report(&self) -> Vec<ReportNode> {
        self.components
            .iter()
            .filter_map(|c| match c.report() {
                Ok(node) => Some(node),
                Err(e) => {
                    warn!("Skipping {} inventory: {}", c.name(), e);
                    None
                }
            })
            .collect()
    }
}
