//! Run Report
//!
//! Summarizes a finished run: for every requested target whether it was
//! produced, already up to date, or failed, with the chain of failures
//! leading back to the root cause.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use colored::Colorize;
use serde::Serialize;

use crate::error::{EngineError, JobFailure};
use crate::monitoring::ExecutionTimeline;
use crate::workflow::graph::{AttemptRecord, JobGraph, JobId, JobState};
use crate::workflow::resources::ResourceRequest;

/// Outcome for one requested target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetStatus {
    Produced,
    UpToDate,
    /// Reasons from the target's own job back to the root cause.
    Failed { reasons: Vec<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub path: PathBuf,
    /// Label of the producing job, if any.
    pub job: Option<String>,
    #[serde(flatten)]
    pub status: TargetStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub label: String,
    pub template: String,
    pub state: JobState,
    pub up_to_date: bool,
    pub attempts: usize,
    pub resources: Option<ResourceRequest>,
    pub failure: Option<JobFailure>,
    pub history: Vec<AttemptRecord>,
    pub duration_ms: Option<u128>,
    pub log: PathBuf,
}

/// Job counts by final state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub executed: usize,
    pub up_to_date: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub duration_ms: u128,
    pub dry_run: bool,
    pub summary: RunSummary,
    pub targets: Vec<TargetReport>,
    pub jobs: Vec<JobReport>,
    #[serde(skip)]
    pub gantt_chart: String,
}

impl RunReport {
    /// Builds the report from the final graph.
    pub fn from_run(graph: &JobGraph, timeline: &ExecutionTimeline, dry_run: bool) -> Self {
        let durations = timeline.get_durations();
        let by_label: HashMap<String, JobId> =
            graph.jobs().iter().map(|j| (j.label(), j.id)).collect();

        let targets = graph
            .targets()
            .iter()
            .map(|target| {
                let Some(id) = target.producer else {
                    return TargetReport {
                        path: target.path.clone(),
                        job: None,
                        status: TargetStatus::UpToDate,
                    };
                };
                let job = graph.job(id);
                let status = match job.state {
                    JobState::Succeeded if job.up_to_date => TargetStatus::UpToDate,
                    JobState::Succeeded => TargetStatus::Produced,
                    _ => TargetStatus::Failed {
                        reasons: reason_chain(graph, &by_label, id),
                    },
                };
                TargetReport {
                    path: target.path.clone(),
                    job: Some(job.label()),
                    status,
                }
            })
            .collect();

        let mut summary = RunSummary {
            total: graph.len(),
            ..RunSummary::default()
        };
        let jobs = graph
            .jobs()
            .iter()
            .map(|job| {
                match job.state {
                    JobState::Succeeded if job.up_to_date => summary.up_to_date += 1,
                    JobState::Succeeded => summary.executed += 1,
                    JobState::Cancelled => summary.cancelled += 1,
                    _ => summary.failed += 1,
                }
                let label = job.label();
                JobReport {
                    duration_ms: durations.get(&label).copied(),
                    label,
                    template: job.template.id.clone(),
                    state: job.state,
                    up_to_date: job.up_to_date,
                    attempts: job.history.len(),
                    resources: job.resources,
                    failure: job.failure.clone(),
                    history: job.history.clone(),
                    log: job.log.clone(),
                }
            })
            .collect();

        Self {
            started_at: timeline.started_at(),
            finished_at: Local::now(),
            duration_ms: timeline.elapsed().as_millis(),
            dry_run,
            summary,
            targets,
            jobs,
            gantt_chart: timeline.gantt_chart(),
        }
    }

    /// Returns true if every target was produced or already up to date.
    pub fn success(&self) -> bool {
        self.failed_targets().next().is_none()
    }

    pub fn failed_targets(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets
            .iter()
            .filter(|t| matches!(t.status, TargetStatus::Failed { .. }))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes the report as JSON.
    pub fn write(&self, path: &Path) -> Result<(), EngineError> {
        let report_error = |source: std::io::Error| EngineError::Report {
            path: path.to_path_buf(),
            source,
        };
        let json = self
            .to_json()
            .map_err(|e| report_error(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(report_error)?;
            }
        }
        fs::write(path, json).map_err(report_error)
    }

    /// Terminal summary, one line per target.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{} jobs: {} executed, {} up to date, {} failed, {} cancelled ({} ms)\n",
            self.summary.total,
            self.summary.executed,
            self.summary.up_to_date,
            self.summary.failed,
            self.summary.cancelled,
            self.duration_ms
        ));

        for target in &self.targets {
            let path = target.path.display().to_string();
            match &target.status {
                TargetStatus::Produced => {
                    out.push_str(&format!("  {} {}\n", "produced  ".green(), path));
                }
                TargetStatus::UpToDate => {
                    out.push_str(&format!("  {} {}\n", "up to date".cyan(), path));
                }
                TargetStatus::Failed { reasons } => {
                    out.push_str(&format!("  {} {}\n", "FAILED    ".red().bold(), path));
                    for reason in reasons {
                        out.push_str(&format!("      {}\n", reason.dimmed()));
                    }
                }
            }
        }
        out
    }
}

/// Follows `UpstreamFailed` links from `id` to the root cause.
fn reason_chain(graph: &JobGraph, by_label: &HashMap<String, JobId>, id: JobId) -> Vec<String> {
    let mut reasons = Vec::new();
    let mut current = Some(id);

    while let Some(id) = current.take() {
        if reasons.len() > graph.len() {
            break;
        }
        let job = graph.job(id);
        match &job.failure {
            Some(failure) => {
                reasons.push(format!("{}: {}", job.label(), failure));
                if let JobFailure::UpstreamFailed { job: upstream } = failure {
                    current = by_label.get(upstream).copied();
                }
            }
            None => reasons.push(format!("{}: not run ({})", job.label(), job.state)),
        }
    }

    reasons
}
