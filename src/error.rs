//! Error Types
//!
//! Every layer of the engine reports failures through its own error enum:
//!
//! - Construction-time errors ([`PatternError`], [`UniverseError`],
//!   [`RegistryError`], [`GraphError`], [`ConfigError`]) abort a run before
//!   any job executes.
//! - Execution-time errors ([`JobFailure`], [`ExecutorError`]) stay local to
//!   one job and travel along graph edges only.

use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::workflow::validator::ValidationError;

/// Errors raised while compiling or rendering a wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern '{pattern}' has unbalanced braces")]
    Unbalanced { pattern: String },

    #[error("pattern '{pattern}' contains an empty placeholder")]
    EmptyPlaceholder { pattern: String },

    #[error("pattern '{pattern}' places two wildcards next to each other")]
    AdjacentPlaceholders { pattern: String },

    #[error("pattern '{pattern}' needs wildcard '{{{name}}}' but the binding has no value for it")]
    MissingWildcard { pattern: String, name: String },

    #[error("value '{value}' for wildcard '{name}' is empty or contains '/'")]
    InvalidValue { name: String, value: String },
}

/// Errors raised while building or querying the sample universe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UniverseError {
    #[error("sample sheet row {row}: required column '{column}' is missing or null")]
    MissingColumn { row: usize, column: String },

    #[error("sample sheet row {row}: column '{column}' must be a scalar value")]
    NonScalar { row: usize, column: String },

    #[error("sample sheet row {row}: identifier '{value}' is empty or contains '/'")]
    InvalidIdentifier { row: usize, value: String },

    #[error("run '{run}' of sample '{sample}' is listed twice")]
    DuplicateRun { sample: String, run: String },

    #[error("unknown sample '{0}'")]
    UnknownSample(String),

    #[error("sample '{sample}' has no run '{run}'")]
    UnknownRun { sample: String, run: String },

    #[error("run '{run}' of sample '{sample}' has no '{column}' file")]
    MissingFile {
        sample: String,
        run: String,
        column: String,
    },

    #[error("binding {binding} lacks the '{name}' wildcard needed to consult the sample universe")]
    UnboundWildcard { binding: String, name: String },
}

/// Errors raised while registering rule templates.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("rule template '{0}' is registered twice")]
    DuplicateTemplate(String),

    #[error("rule '{template}' references unknown rule '{rule}'")]
    UnknownReference { template: String, rule: String },

    #[error("rule '{template}' references output {index} of rule '{rule}', which has only {available}")]
    OutputOutOfRange {
        template: String,
        rule: String,
        index: usize,
        available: usize,
    },

    #[error("invalid rule templates:\n{}", format_validation(.0))]
    Validation(Vec<ValidationError>),
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fatal errors raised while resolving targets into a job graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("'{path}' can be produced by more than one rule: {}", .candidates.join(", "))]
    AmbiguousProducer {
        path: String,
        candidates: Vec<String>,
    },

    #[error("no rule produces '{path}' and the file does not exist{}", required_by_suffix(.required_by))]
    NoProducer {
        path: String,
        required_by: Option<String>,
    },

    #[error("cyclic dependency: {}", .chain.join(" -> "))]
    CycleDetected { chain: Vec<String> },

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Universe(#[from] UniverseError),
}

fn required_by_suffix(required_by: &Option<String>) -> String {
    match required_by {
        Some(job) => format!(" (required by {})", job),
        None => String::new(),
    }
}

/// Why a single job did not succeed.
///
/// Retryable failures go back through the retry controller; the rest are
/// terminal for the job they are attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    #[error("command exited with status {}", display_code(.code))]
    NonZeroExit { code: Option<i32>, log: PathBuf },

    #[error("declared outputs missing or empty after success: {}", display_paths(.paths))]
    MissingOutput { paths: Vec<PathBuf> },

    #[error("executor crashed: {message}")]
    ExecutorCrashed { message: String },

    #[error("requested {requested_mem_mb} MB / {requested_threads} threads exceeds the budget of {budget_mem_mb} MB / {budget_threads} threads")]
    BudgetUnsatisfiable {
        requested_mem_mb: u64,
        requested_threads: u32,
        budget_mem_mb: u64,
        budget_threads: u32,
    },

    #[error("command template error: {message}")]
    CommandTemplate { message: String },

    #[error("upstream job {job} failed")]
    UpstreamFailed { job: String },

    #[error("cancelled: no remaining consumer needs this job")]
    Cancelled,
}

impl JobFailure {
    /// Returns true if another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NonZeroExit { .. } | Self::MissingOutput { .. } | Self::ExecutorCrashed { .. }
        )
    }
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised by a task executor while running one job.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("I/O error while running job: {0}")]
    Io(#[from] io::Error),

    #[error("shadow directory setup failed for '{path}': {source}")]
    Shadow { path: PathBuf, source: io::Error },
}

/// Errors raised while loading a pipeline definition.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse pipeline YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("rule '{rule}': {source}")]
    Pattern { rule: String, source: PatternError },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Universe(#[from] UniverseError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Top-level errors returned by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("no targets requested and the pipeline defines no default targets")]
    NoTargets,

    #[error("failed to start async runtime: {0}")]
    Runtime(io::Error),

    #[error("job {job}: illegal state transition {from} -> {to}")]
    InvalidTransition {
        job: String,
        from: String,
        to: String,
    },

    #[error("completion channel closed while {running} jobs were still running")]
    ChannelClosed { running: usize },

    #[error("failed to write report '{path}': {source}")]
    Report { path: PathBuf, source: io::Error },
}
