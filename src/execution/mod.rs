//! Workflow Execution Module
//!
//! Runs a resolved job graph under a global resource budget, retrying
//! failed attempts with escalated resources.
//!
//! # Architecture
//!
//! - [`engine`]: Entry point from pipeline and targets to run report
//! - [`scheduler`]: Admission loop that owns the job graph
//! - [`retry`]: Retry decisions and failure propagation
//! - [`executor`]: Command rendering and the shell task executor
//! - [`report`]: Per-target outcomes of a finished run

pub mod engine;
pub mod executor;
pub mod report;
pub mod retry;
pub mod scheduler;

pub use engine::Engine;
pub use executor::{
    render_command, verify_outputs, CommandContext, ExecutionOutcome, JobRequest, ShellExecutor,
    TaskExecutor,
};
pub use report::{JobReport, RunReport, RunSummary, TargetReport, TargetStatus};
pub use retry::{cancel_doomed, propagate_failure, FailureResolution, RetryController};
pub use scheduler::{ScheduleResult, Scheduler};
