//! Engine Configuration
//!
//! Global resource ceilings and run options, read from the `config:` block of
//! a pipeline file and optionally overridden from the command line.
//!
//! ```yaml
//! config:
//!   max_attempts: 3
//!   budget:
//!     mem_mb: 64000
//!     threads: 16
//! ```

use std::path::PathBuf;

use log::debug;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Default retry ceiling when neither the pipeline nor the template sets one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Directory (relative to the working directory) for engine-owned files.
pub const ENGINE_DIR: &str = ".rulerunner";

/// Total physical memory of this machine in MB, read once.
static SYSTEM_MEMORY_MB: Lazy<u64> = Lazy::new(|| {
    let mut system = System::new();
    system.refresh_memory();
    let mb = system.total_memory() / (1024 * 1024);
    debug!("Detected {} MB of system memory", mb);
    mb.max(1)
});

/// Global ceilings on concurrently admitted resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    #[serde(default = "default_mem_mb")]
    pub mem_mb: u64,
    #[serde(default = "default_threads")]
    pub threads: u32,
    /// Per-job wall-time ceiling in minutes, if any.
    #[serde(default)]
    pub runtime_min: Option<u64>,
}

fn default_mem_mb() -> u64 {
    *SYSTEM_MEMORY_MB
}

fn default_threads() -> u32 {
    u32::try_from(num_cpus::get()).unwrap_or(u32::MAX).max(1)
}

impl ResourceBudget {
    pub fn new(mem_mb: u64, threads: u32) -> Self {
        Self {
            mem_mb,
            threads,
            runtime_min: None,
        }
    }

    /// Budget sized to the current machine.
    pub fn detect() -> Self {
        Self::new(default_mem_mb(), default_threads())
    }
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self::detect()
    }
}

/// Options controlling one engine run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub budget: ResourceBudget,

    /// Engine-wide retry ceiling; templates may override it.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Directory all relative job paths resolve against.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Log commands instead of running them.
    #[serde(default)]
    pub dry_run: bool,

    /// Cancel pending work that only feeds permanently failed jobs.
    #[serde(default = "default_true")]
    pub cancel_doomed_branches: bool,

    /// Ignore freshness and rerun every job in the graph.
    #[serde(default)]
    pub force: bool,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            budget: ResourceBudget::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            working_dir: default_working_dir(),
            dry_run: false,
            cancel_doomed_branches: true,
            force: false,
        }
    }
}

impl EngineConfig {
    /// Directory for default job logs.
    pub fn log_dir(&self) -> PathBuf {
        self.working_dir.join(ENGINE_DIR).join("logs")
    }

    /// Directory for shadow working directories.
    pub fn shadow_dir(&self) -> PathBuf {
        self.working_dir.join(ENGINE_DIR).join("shadow")
    }

    /// Directory for generated job scripts.
    pub fn script_dir(&self) -> PathBuf {
        self.working_dir.join(ENGINE_DIR).join("scripts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert!(config.cancel_doomed_branches);
        assert!(!config.dry_run);
        assert!(config.budget.mem_mb >= 1);
        assert!(config.budget.threads >= 1);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: EngineConfig =
            serde_yaml::from_str("budget: {mem_mb: 16000}\nmax_attempts: 5").unwrap();
        assert_eq!(config.budget.mem_mb, 16000);
        assert!(config.budget.threads >= 1);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.working_dir, PathBuf::from("."));
    }

    #[test]
    fn test_engine_dirs() {
        let config = EngineConfig {
            working_dir: PathBuf::from("/data/run"),
            ..EngineConfig::default()
        };
        assert_eq!(config.log_dir(), PathBuf::from("/data/run/.rulerunner/logs"));
        assert_eq!(config.shadow_dir(), PathBuf::from("/data/run/.rulerunner/shadow"));
    }
}
