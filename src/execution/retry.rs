//! Retry Controller
//!
//! Decides what happens to a job after a failed attempt: another attempt
//! with freshly negotiated resources, or permanent failure. Permanent
//! failures travel along consumer edges as `UpstreamFailed`; work that only
//! fed failed jobs is cancelled.

use std::collections::{BTreeSet, HashSet};

use log::{info, warn};

use crate::error::{EngineError, JobFailure};
use crate::workflow::graph::{JobGraph, JobId, JobState};

/// Result of handling one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureResolution {
    /// The job is ready again for the given attempt.
    Retry { attempt: u32 },
    /// The job failed for good.
    Permanent {
        /// Consumers failed with `UpstreamFailed`.
        upstream_failed: Vec<JobId>,
        /// Pending or ready ancestors nobody needs any more.
        cancelled: Vec<JobId>,
    },
}

#[derive(Debug, Clone)]
pub struct RetryController {
    default_max_attempts: u32,
    cancel_doomed: bool,
}

impl RetryController {
    pub fn new(default_max_attempts: u32, cancel_doomed: bool) -> Self {
        Self {
            default_max_attempts: default_max_attempts.max(1),
            cancel_doomed,
        }
    }

    /// Attempt ceiling for a job: the template's override or the engine default.
    pub fn max_attempts(&self, graph: &JobGraph, id: JobId) -> u32 {
        graph
            .job(id)
            .template
            .max_attempts
            .unwrap_or(self.default_max_attempts)
            .max(1)
    }

    /// Returns true if the failure should lead to another attempt.
    pub fn should_retry(&self, graph: &JobGraph, id: JobId, failure: &JobFailure) -> bool {
        failure.is_retryable() && graph.job(id).attempt < self.max_attempts(graph, id)
    }

    /// Applies a failure to the graph.
    pub fn handle_failure(
        &self,
        graph: &mut JobGraph,
        id: JobId,
        failure: JobFailure,
    ) -> Result<FailureResolution, EngineError> {
        record_attempt_failure(graph, id, &failure);

        if self.should_retry(graph, id, &failure) {
            graph.transition(id, JobState::FailedRetryable)?;
            let job = graph.job_mut(id);
            warn!(
                "{} failed on attempt {}/{}: {}; retrying",
                job.label(),
                job.attempt,
                job.template.max_attempts.unwrap_or(self.default_max_attempts),
                failure
            );
            job.attempt += 1;
            job.resources = None;
            let attempt = job.attempt;
            graph.transition(id, JobState::Ready)?;
            return Ok(FailureResolution::Retry { attempt });
        }

        warn!("{} failed permanently: {}", graph.job(id).label(), failure);
        graph.transition(id, JobState::FailedPermanent)?;
        graph.job_mut(id).failure = Some(failure);

        let upstream_failed = propagate_failure(graph, id)?;
        let cancelled = if self.cancel_doomed {
            let mut roots = vec![id];
            roots.extend(upstream_failed.iter().copied());
            cancel_doomed(graph, &roots)?
        } else {
            Vec::new()
        };

        Ok(FailureResolution::Permanent {
            upstream_failed,
            cancelled,
        })
    }
}

fn record_attempt_failure(graph: &mut JobGraph, id: JobId, failure: &JobFailure) {
    let job = graph.job_mut(id);
    let attempt = job.attempt;
    if let Some(record) = job.history.last_mut() {
        if record.attempt == attempt {
            record.failure = Some(failure.clone());
        }
    }
}

/// Fails every transitive consumer of a permanently failed job.
///
/// Each consumer records the label of one failed direct producer, so reasons
/// can be followed back to the root cause.
pub fn propagate_failure(graph: &mut JobGraph, id: JobId) -> Result<Vec<JobId>, EngineError> {
    let mut failed = Vec::new();

    // Ids are topological, so producers are always settled first.
    for consumer in graph.transitive_consumers(id) {
        if graph.job(consumer).state.is_terminal() {
            continue;
        }
        let cause = graph
            .job(consumer)
            .producers
            .iter()
            .copied()
            .find(|&p| graph.job(p).state == JobState::FailedPermanent)
            .unwrap_or(id);
        let cause_label = graph.job(cause).label();

        graph.transition(consumer, JobState::FailedPermanent)?;
        graph.job_mut(consumer).failure = Some(JobFailure::UpstreamFailed { job: cause_label });
        failed.push(consumer);
    }

    if !failed.is_empty() {
        info!(
            "{} downstream jobs of {} will not run",
            failed.len(),
            graph.job(id).label()
        );
    }
    Ok(failed)
}

/// Cancels pending or ready ancestors of `roots` that no live job needs.
///
/// An ancestor is cancelled when every one of its consumers has failed or
/// been cancelled and none of its outputs is a requested target.
pub fn cancel_doomed(graph: &mut JobGraph, roots: &[JobId]) -> Result<Vec<JobId>, EngineError> {
    let targets: HashSet<JobId> = graph.targets().iter().filter_map(|t| t.producer).collect();
    let mut queue: BTreeSet<JobId> = roots
        .iter()
        .flat_map(|&r| graph.job(r).producers.iter().copied())
        .collect();
    let mut cancelled = Vec::new();

    // Highest id first: consumers are settled before their producers.
    while let Some(candidate) = queue.pop_last() {
        let job = graph.job(candidate);
        if !matches!(job.state, JobState::Pending | JobState::Ready) || targets.contains(&candidate) {
            continue;
        }
        let doomed = job.consumers.iter().all(|&c| {
            matches!(
                graph.job(c).state,
                JobState::FailedPermanent | JobState::Cancelled
            )
        });
        if !doomed {
            continue;
        }

        graph.transition(candidate, JobState::Cancelled)?;
        let job = graph.job_mut(candidate);
        job.failure = Some(JobFailure::Cancelled);
        info!("Cancelled {}: no remaining consumer", job.label());
        queue.extend(job.producers.iter().copied());
        cancelled.push(candidate);
    }

    cancelled.sort_unstable();
    Ok(cancelled)
}
