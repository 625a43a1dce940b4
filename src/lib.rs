//! RuleRunner - Rule-Based Genomics Workflow Engine
//!
//! Resolves requested output files into a graph of jobs from wildcard rule
//! templates and a sample sheet, then runs that graph under a memory and
//! thread budget. Failed jobs are retried with escalated resources; jobs
//! whose outputs are already fresh are skipped.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`workflow`]: Patterns, sample universe, rule templates, and graph building
//! - [`execution`]: Scheduler, retry controller, task executors, and run reports
//! - [`monitoring`]: Execution timeline and Gantt charts
//! - [`config`]: Engine options and resource budget
//! - [`error`]: Error types for every layer
//!
//! # Example
//!
//! ```rust,no_run
//! use rulerunner::execution::Engine;
//! use rulerunner::load_pipeline;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load rules, samples and default targets from YAML
//!     let pipeline = load_pipeline("pipeline.yaml")?;
//!
//!     // Build the job graph and run it
//!     let engine = Engine::new(pipeline);
//!     let report = engine.run(&["calls/S1.vcf", "calls/S2.vcf"])?;
//!
//!     if !report.success() {
//!         eprintln!("{}", report.render_summary());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use config::{EngineConfig, ResourceBudget};
pub use error::{ConfigError, EngineError, GraphError, JobFailure};
pub use execution::engine::Engine;
pub use execution::report::RunReport;
pub use workflow::parser::{load_pipeline, Pipeline};
pub use workflow::RuleTemplate;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "RuleRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "RuleRunner");
    }

    #[test]
    fn test_module_exports_template() {
        let template = RuleTemplate::new("align", "bwa mem {input} > {output}");
        assert_eq!(template.id, "align");
        assert_eq!(template.executor.command, "bwa mem {input} > {output}");
    }

    #[test]
    fn test_default_config_export() {
        let config = EngineConfig::default();
        assert_eq!(config.max_attempts, config::DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
