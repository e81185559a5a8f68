//! # Module Registry
//!
//! Maps module names to factories. Loads and measurement instruments are
//! selected by name from the command line or config file; the registry is
//! the only place those names are resolved to code.
//!
//! ```rust
//! use rteval::workload::ModuleRegistry;
//!
//! let registry = ModuleRegistry::builtin();
//! assert!(registry.load_names().contains(&"hackbench"));
//! assert!(registry.measurement_info("cyclictest").is_some());
//! ```

use super::{RunTiming, Workload};
use crate::config::{ModuleConfig, RunConfig};
use crate::error::{ConfigError, RunError, RunResult};
use crate::{loads, measurement};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything a factory needs to construct one module
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub run: Arc<RunConfig>,
    pub config: ModuleConfig,
    pub timing: RunTiming,
}

/// How a measurement module may be scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleInfo {
    /// May run concurrently with other measurement modules
    pub parallel: bool,
    /// Should run while the loads are active
    pub with_loads: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Load,
    Measurement,
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleKind::Load => write!(f, "load"),
            ModuleKind::Measurement => write!(f, "measurement"),
        }
    }
}

/// Factory building a workload from its context
pub type WorkloadFactory =
    Box<dyn Fn(&ModuleContext) -> Result<Box<dyn Workload>, ConfigError> + Send + Sync>;

struct MeasurementEntry {
    info: ModuleInfo,
    factory: WorkloadFactory,
}

/// Name-to-factory registry for load and measurement modules
#[derive(Default)]
pub struct ModuleRegistry {
    loads: BTreeMap<String, WorkloadFactory>,
    measurements: BTreeMap<String, MeasurementEntry>,
}

impl ModuleRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in modules
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_load("hackbench", |ctx| {
            Ok(Box::new(loads::hackbench::Hackbench::new(ctx)?) as Box<dyn Workload>)
        });
        registry.register_load("kcompile", |ctx| {
            Ok(Box::new(loads::kcompile::Kcompile::new(ctx)?) as Box<dyn Workload>)
        });
        registry.register_measurement(
            "cyclictest",
            measurement::cyclictest::MODULE_INFO,
            |ctx| {
                Ok(Box::new(measurement::cyclictest::Cyclictest::new(ctx)?) as Box<dyn Workload>)
            },
        );
        registry.register_measurement(
            "hwlatdetect",
            measurement::hwlatdetect::MODULE_INFO,
            |ctx| {
                Ok(Box::new(measurement::hwlatdetect::HwLatDetect::new(ctx)?) as Box<dyn Workload>)
            },
        );
        registry.register_measurement("sysstat", measurement::sysstat::MODULE_INFO, |ctx| {
            Ok(Box::new(measurement::sysstat::Sysstat::new(ctx)?) as Box<dyn Workload>)
        });
        registry
    }

    /// Add or replace a load module
    pub fn register_load<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ModuleContext) -> Result<Box<dyn Workload>, ConfigError> + Send + Sync + 'static,
    {
        self.loads.insert(name.into(), Box::new(factory));
    }

    /// Add or replace a measurement module
    pub fn register_measurement<F>(&mut self, name: impl Into<String>, info: ModuleInfo, factory: F)
    where
        F: Fn(&ModuleContext) -> Result<Box<dyn Workload>, ConfigError> + Send + Sync + 'static,
    {
        self.measurements.insert(
            name.into(),
            MeasurementEntry {
                info,
                factory: Box::new(factory),
            },
        );
    }

    pub fn load_names(&self) -> Vec<&str> {
        self.loads.keys().map(String::as_str).collect()
    }

    pub fn measurement_names(&self) -> Vec<&str> {
        self.measurements.keys().map(String::as_str).collect()
    }

    pub fn measurement_info(&self, name: &str) -> Option<ModuleInfo> {
        self.measurements.get(name).map(|e| e.info)
    }

    /// Fail with [`RunError::UnknownModule`] for any name not registered
    pub fn check(&self, kind: ModuleKind, names: &[String]) -> RunResult<()> {
        for name in names {
            let known = match kind {
                ModuleKind::Load => self.loads.contains_key(name),
                ModuleKind::Measurement => self.measurements.contains_key(name),
            };
            if !known {
                return Err(RunError::UnknownModule {
                    kind: kind.to_string(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn create_load(&self, name: &str, ctx: &ModuleContext) -> RunResult<Box<dyn Workload>> {
        let factory = self.loads.get(name).ok_or_else(|| RunError::UnknownModule {
            kind: ModuleKind::Load.to_string(),
            name: name.to_string(),
        })?;
        Ok(factory(ctx)?)
    }

    pub fn create_measurement(
        &self,
        name: &str,
        ctx: &ModuleContext,
    ) -> RunResult<(ModuleInfo, Box<dyn Workload>)> {
        let entry = self
            .measurements
            .get(name)
            .ok_or_else(|| RunError::UnknownModule {
                kind: ModuleKind::Measurement.to_string(),
                name: name.to_string(),
            })?;
        Ok((entry.info, (entry.factory)(ctx)?))
    }
}
