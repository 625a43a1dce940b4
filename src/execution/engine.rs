//! Workflow Execution Engine
//!
//! Entry point tying the pieces together:
//! - Resolves requested targets into a job graph
//! - Runs the graph on a tokio runtime through the scheduler
//! - Builds the run report

use std::sync::Arc;

use log::info;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::workflow::graph::{GraphBuilder, JobGraph};
use crate::workflow::parser::Pipeline;

use super::executor::{ShellExecutor, TaskExecutor};
use super::report::RunReport;
use super::scheduler::Scheduler;

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use rulerunner::execution::Engine;
/// use rulerunner::load_pipeline;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = load_pipeline("pipeline.yaml")?;
///     let mut engine = Engine::new(pipeline);
///     engine.config_mut().budget.threads = 8;
///
///     let report = engine.run(&["calls/S1.vcf"])?;
///     println!("{}", report.render_summary());
///     Ok(())
/// }
/// ```
pub struct Engine {
    pipeline: Pipeline,
    executor: Arc<dyn TaskExecutor>,
}

impl Engine {
    /// Creates an engine that runs jobs through `bash`.
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            executor: Arc::new(ShellExecutor::new()),
        }
    }

    /// Replaces the task executor.
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &EngineConfig {
        &self.pipeline.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.pipeline.config
    }

    /// Resolves targets into a job graph without running anything.
    ///
    /// Falls back to the pipeline's default targets when `targets` is empty.
    pub fn plan<S: AsRef<str>>(&self, targets: &[S]) -> Result<JobGraph, EngineError> {
        let targets: Vec<String> = if targets.is_empty() {
            self.pipeline.targets.clone()
        } else {
            targets.iter().map(|t| t.as_ref().to_string()).collect()
        };
        if targets.is_empty() {
            return Err(EngineError::NoTargets);
        }

        let config = &self.pipeline.config;
        let graph = GraphBuilder::new(&self.pipeline.registry, &self.pipeline.universe, &config.working_dir)
            .force(config.force)
            .build(&targets)?;
        Ok(graph)
    }

    /// Builds the graph and runs it to completion.
    ///
    /// Job failures do not make this return `Err`; they show up in the
    /// report. Errors are reserved for graph construction problems and
    /// engine faults.
    pub async fn execute<S: AsRef<str>>(&self, targets: &[S]) -> Result<RunReport, EngineError> {
        let graph = self.plan(targets)?;
        let config = &self.pipeline.config;

        info!(
            "Starting execution ({} jobs, max attempts: {}, dry run: {})",
            graph.len(),
            config.max_attempts,
            config.dry_run
        );

        let result = Scheduler::new(graph, config, Arc::clone(&self.executor))
            .run()
            .await?;
        let report = RunReport::from_run(&result.graph, &result.timeline, config.dry_run);

        info!(
            "Run finished: {} executed, {} up to date, {} failed, {} cancelled",
            report.summary.executed,
            report.summary.up_to_date,
            report.summary.failed,
            report.summary.cancelled
        );
        Ok(report)
    }

    /// Blocking wrapper around [`Engine::execute`] on a fresh runtime.
    pub fn run<S: AsRef<str>>(&self, targets: &[S]) -> Result<RunReport, EngineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(EngineError::Runtime)?;
        runtime.block_on(self.execute(targets))
    }
}
