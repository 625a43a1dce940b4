//! Job Scheduler
//!
//! Single decision loop that owns the job graph:
//! - Promotes jobs whose producers all succeeded to the ready set
//! - Admits ready jobs in creation order while memory and threads allow
//! - Dispatches each attempt to a blocking worker
//! - Applies completions delivered over a channel
//!
//! Only this loop mutates job state. Workers report outcomes and nothing else.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::config::EngineConfig;
use crate::error::{EngineError, JobFailure};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::graph::{AttemptRecord, JobGraph, JobId, JobState};
use crate::workflow::resources::{measure_inputs, ResourceContext, ResourceNegotiator, ResourceRequest};

use super::executor::{render_command, verify_outputs, CommandContext, ExecutionOutcome, JobRequest, TaskExecutor};
use super::retry::{FailureResolution, RetryController};

/// Result of one attempt, sent from a worker back to the loop.
#[derive(Debug)]
struct Completion {
    job: JobId,
    attempt: u32,
    result: Result<ExecutionOutcome, JobFailure>,
}

/// Graph and timeline after the loop finished.
#[derive(Debug)]
pub struct ScheduleResult {
    pub graph: JobGraph,
    pub timeline: ExecutionTimeline,
}

pub struct Scheduler {
    graph: JobGraph,
    negotiator: ResourceNegotiator,
    retry: RetryController,
    executor: Arc<dyn TaskExecutor>,
    working_dir: PathBuf,
    dry_run: bool,
    /// Ordered by job id, so admission is FIFO in creation order.
    ready: BTreeSet<JobId>,
    available_mem_mb: u64,
    available_threads: u32,
    running: usize,
    timeline: ExecutionTimeline,
}

impl Scheduler {
    pub fn new(graph: JobGraph, config: &EngineConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            graph,
            negotiator: ResourceNegotiator::new(config.budget.clone()),
            retry: RetryController::new(config.max_attempts, config.cancel_doomed_branches),
            executor,
            working_dir: config.working_dir.clone(),
            dry_run: config.dry_run,
            ready: BTreeSet::new(),
            available_mem_mb: config.budget.mem_mb,
            available_threads: config.budget.threads,
            running: 0,
            timeline: ExecutionTimeline::new(),
        }
    }

    /// Runs every schedulable job to a terminal state.
    pub async fn run(mut self) -> Result<ScheduleResult, EngineError> {
        let (tx, mut rx) = unbounded_channel::<Completion>();

        for id in 0..self.graph.len() {
            self.promote(id)?;
        }
        info!(
            "Scheduling {} jobs ({} ready, budget {} MB / {} threads{})",
            self.graph.len() - self.graph.count(JobState::Succeeded),
            self.ready.len(),
            self.available_mem_mb,
            self.available_threads,
            if self.dry_run { ", dry run" } else { "" }
        );

        loop {
            let admitted = self.admit(&tx)?;

            if self.running == 0 {
                if admitted > 0 {
                    continue;
                }
                if !self.ready.is_empty() {
                    warn!("{} ready jobs could not be admitted", self.ready.len());
                }
                break;
            }

            let completion = rx.recv().await.ok_or(EngineError::ChannelClosed {
                running: self.running,
            })?;
            self.complete(completion)?;
        }

        Ok(ScheduleResult {
            graph: self.graph,
            timeline: self.timeline,
        })
    }

    /// Moves `id` to the ready set if it is pending and all producers succeeded.
    fn promote(&mut self, id: JobId) -> Result<(), EngineError> {
        if self.graph.job(id).state == JobState::Pending && self.graph.producers_succeeded(id) {
            self.graph.transition(id, JobState::Ready)?;
            self.ready.insert(id);
        }
        Ok(())
    }

    /// Admits every ready job that fits, in id order. Returns how many started.
    fn admit(&mut self, tx: &UnboundedSender<Completion>) -> Result<usize, EngineError> {
        let mut admitted = 0;
        let candidates: Vec<JobId> = self.ready.iter().copied().collect();

        for id in candidates {
            if !self.ready.contains(&id) {
                continue;
            }

            let cached = self.graph.job(id).resources;
            let request = match cached {
                Some(request) => request,
                None => match self.negotiate(id) {
                    Ok(request) => request,
                    Err(failure) => {
                        self.fail_before_dispatch(id, failure)?;
                        continue;
                    }
                },
            };

            if request.mem_mb > self.available_mem_mb || request.threads > self.available_threads {
                debug!(
                    "{} waits for resources ({}; available {} MB / {} threads)",
                    self.graph.job(id).label(),
                    request,
                    self.available_mem_mb,
                    self.available_threads
                );
                continue;
            }

            let command = {
                let job = self.graph.job(id);
                render_command(&job.template.executor.command, &CommandContext::for_job(job, &request))
            };
            let command = match command {
                Ok(command) => command,
                Err(failure) => {
                    self.fail_before_dispatch(id, failure)?;
                    continue;
                }
            };

            self.ready.remove(&id);
            self.dispatch(id, request, command, tx)?;
            admitted += 1;
        }

        Ok(admitted)
    }

    /// Computes resources for the job's current attempt, once per attempt.
    fn negotiate(&mut self, id: JobId) -> Result<ResourceRequest, JobFailure> {
        let job = self.graph.job(id);
        let input_mb = measure_inputs(&self.working_dir, &job.inputs);
        let ctx = ResourceContext {
            binding: &job.binding,
            attempt: job.attempt,
            input_mb,
        };
        let request = self.negotiator.negotiate(&job.template.resources, &ctx)?;
        self.graph.job_mut(id).resources = Some(request);
        Ok(request)
    }

    fn dispatch(
        &mut self,
        id: JobId,
        request: ResourceRequest,
        command: String,
        tx: &UnboundedSender<Completion>,
    ) -> Result<(), EngineError> {
        self.graph.transition(id, JobState::Running)?;
        let job = self.graph.job_mut(id);
        job.history.push(AttemptRecord {
            attempt: job.attempt,
            resources: request,
            failure: None,
        });
        let label = job.label();
        let attempt = job.attempt;
        let job_request = JobRequest::new(job, command, request, &self.working_dir);

        self.available_mem_mb -= request.mem_mb;
        self.available_threads -= request.threads;
        self.running += 1;
        self.timeline.add_event(&label, attempt, EventType::Started);

        if self.dry_run {
            info!("[DRY RUN] {} ({}): {}", label, request, job_request.command);
            let outcome = ExecutionOutcome {
                exit_code: Some(0),
                outputs: job_request.outputs.clone(),
                log: job_request.log.clone(),
            };
            return self.complete(Completion {
                job: id,
                attempt,
                result: Ok(outcome),
            });
        }

        info!("Starting {} (attempt {}, {})", label, attempt, request);

        let executor = Arc::clone(&self.executor);
        let tx = tx.clone();
        tokio::spawn(async move {
            let joined = tokio::task::spawn_blocking(move || executor.execute(&job_request)).await;
            let result = match joined {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(e)) => Err(JobFailure::ExecutorCrashed {
                    message: e.to_string(),
                }),
                Err(e) => Err(JobFailure::ExecutorCrashed {
                    message: e.to_string(),
                }),
            };
            if tx.send(Completion { job: id, attempt, result }).is_err() {
                error!("Failed to deliver completion for {}", label);
            }
        });

        Ok(())
    }

    fn complete(&mut self, completion: Completion) -> Result<(), EngineError> {
        let id = completion.job;
        self.running -= 1;

        let job = self.graph.job(id);
        if job.attempt != completion.attempt || job.state != JobState::Running {
            warn!(
                "Ignoring stale completion for {} attempt {}",
                job.label(),
                completion.attempt
            );
            return Ok(());
        }
        if let Some(request) = job.resources {
            self.available_mem_mb += request.mem_mb;
            self.available_threads += request.threads;
        }

        let result = completion.result.and_then(|outcome| {
            if !outcome.success() {
                return Err(JobFailure::NonZeroExit {
                    code: outcome.exit_code,
                    log: outcome.log,
                });
            }
            if self.dry_run {
                Ok(())
            } else {
                verify_outputs(&self.working_dir, &job.outputs)
            }
        });

        let label = job.label();
        match result {
            Ok(()) => {
                info!("{} completed", label);
                self.graph.transition(id, JobState::Succeeded)?;
                self.timeline.add_event(&label, completion.attempt, EventType::Completed);
                let consumers = self.graph.job(id).consumers.clone();
                for consumer in consumers {
                    self.promote(consumer)?;
                }
            }
            Err(failure) => {
                error!("{} failed: {}", label, failure);
                self.timeline.add_event(&label, completion.attempt, EventType::Failed);
                self.apply_failure(id, failure)?;
            }
        }
        Ok(())
    }

    fn fail_before_dispatch(&mut self, id: JobId, failure: JobFailure) -> Result<(), EngineError> {
        error!("{} cannot run: {}", self.graph.job(id).label(), failure);
        self.ready.remove(&id);
        self.apply_failure(id, failure)
    }

    fn apply_failure(&mut self, id: JobId, failure: JobFailure) -> Result<(), EngineError> {
        match self.retry.handle_failure(&mut self.graph, id, failure)? {
            FailureResolution::Retry { .. } => {
                self.ready.insert(id);
            }
            FailureResolution::Permanent { cancelled, .. } => {
                for job in cancelled {
                    self.ready.remove(&job);
                    let job = self.graph.job(job);
                    self.timeline.add_event(job.label(), job.attempt, EventType::Cancelled);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceBudget;
    use crate::error::ExecutorError;
    use crate::workflow::graph::GraphBuilder;
    use crate::workflow::model::{FanInScope, RuleTemplate};
    use crate::workflow::registry::TemplateRegistry;
    use crate::workflow::resources::{Formula, ResourceFormulas, ResourceSpec};
    use crate::workflow::universe::SampleUniverse;
    use crate::workflow::wildcards::WildcardBinding;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    type Behaviour = dyn Fn(&JobRequest) -> bool + Send + Sync;

    /// Writes declared outputs unless `fails` says otherwise, and records calls.
    struct MockExecutor {
        fails: Box<Behaviour>,
        calls: Mutex<Vec<(String, u32, u64)>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl MockExecutor {
        fn new(fails: impl Fn(&JobRequest) -> bool + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                fails: Box::new(fails),
                calls: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
            })
        }

        fn succeeding() -> Arc<Self> {
            Self::new(|_| false)
        }

        fn calls(&self) -> Vec<(String, u32, u64)> {
            self.calls.lock().unwrap().clone()
        }

        fn called(&self, template: &str) -> bool {
            self.calls().iter().any(|(label, _, _)| label.starts_with(template))
        }
    }

    impl TaskExecutor for MockExecutor {
        fn execute(&self, request: &JobRequest) -> Result<ExecutionOutcome, ExecutorError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push((
                request.label.clone(),
                request.attempt,
                request.resources.mem_mb,
            ));
            std::thread::sleep(self.delay);

            let failed = (self.fails)(request);
            if !failed {
                for output in &request.outputs {
                    let path = request.working_dir.join(output);
                    std::fs::create_dir_all(path.parent().unwrap())?;
                    std::fs::write(path, request.label.as_bytes())?;
                }
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            Ok(ExecutionOutcome {
                exit_code: Some(if failed { 1 } else { 0 }),
                outputs: request.outputs.clone(),
                log: request.log.clone(),
            })
        }
    }

    fn config(dir: &TempDir, mem_mb: u64, threads: u32) -> EngineConfig {
        EngineConfig {
            budget: ResourceBudget::new(mem_mb, threads),
            working_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        }
    }

    fn templates(mem: ResourceSpec) -> Vec<RuleTemplate> {
        vec![
            RuleTemplate::new("T1", "touch {output}")
                .with_output("out/{sample}/{run}/x")
                .unwrap()
                .with_resources(mem),
            RuleTemplate::new("T2", "cat {input} > {output}")
                .with_fan_in("out/{sample}/{run}/x", FanInScope::RunsOfSample)
                .unwrap()
                .with_output("out/{sample}/merged")
                .unwrap(),
        ]
    }

    fn build(dir: &TempDir, templates: Vec<RuleTemplate>, universe: &SampleUniverse, targets: &[&str]) -> JobGraph {
        let registry = TemplateRegistry::new(templates).unwrap();
        GraphBuilder::new(&registry, universe, dir.path())
            .build(targets)
            .unwrap()
    }

    fn s1() -> SampleUniverse {
        SampleUniverse::new()
            .with_run("S1", "R1")
            .unwrap()
            .with_run("S1", "R2")
            .unwrap()
    }

    /// Treats every output as a directory and fills it with a report.
    struct MakesDir;

    impl TaskExecutor for MakesDir {
        fn execute(&self, request: &JobRequest) -> Result<ExecutionOutcome, ExecutorError> {
            for output in &request.outputs {
                let path = request.working_dir.join(output);
                std::fs::create_dir_all(&path)?;
                std::fs::write(path.join("report.html"), "<html/>")?;
            }
            Ok(ExecutionOutcome {
                exit_code: Some(0),
                outputs: request.outputs.clone(),
                log: request.log.clone(),
            })
        }
    }

    fn t1_failing(request: &JobRequest) -> bool {
        request.template == "T1" && request.binding.get("run") == Some("R1")
    }

    #[tokio::test]
    async fn test_fan_in_runs_after_children() {
        let dir = tempdir().unwrap();
        let graph = build(&dir, templates(ResourceSpec::default()), &s1(), &["out/S1/merged"]);
        let executor = MockExecutor::succeeding();

        let result = Scheduler::new(graph, &config(&dir, 8000, 4), executor.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(result.graph.count(JobState::Succeeded), 3);
        let calls = executor.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].0, "T2(sample=S1)");
        assert!(dir.path().join("out/S1/merged").exists());
    }

    #[tokio::test]
    async fn test_directory_output_verifies() {
        let dir = tempdir().unwrap();
        let fastqc = RuleTemplate::new("fastqc", "fastqc -o {output}")
            .with_output("qc/{sample}_fastqc")
            .unwrap();
        let universe = SampleUniverse::new().with_run("S1", "R1").unwrap();
        let graph = build(&dir, vec![fastqc], &universe, &["qc/S1_fastqc"]);

        let result = Scheduler::new(graph, &config(&dir, 8000, 4), Arc::new(MakesDir))
            .run()
            .await
            .unwrap();

        let job = result.graph.job(0);
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.history.len(), 1);
        assert!(job.failure.is_none());
        assert!(dir.path().join("qc/S1_fastqc/report.html").exists());
    }

    #[tokio::test]
    async fn test_retry_escalates_memory() {
        let dir = tempdir().unwrap();
        let spec = ResourceSpec::Formulas(ResourceFormulas {
            mem_mb: Formula::per_attempt(4000),
            ..ResourceFormulas::default()
        });
        let graph = build(&dir, templates(spec), &s1(), &["out/S1/R1/x"]);
        let executor = MockExecutor::new(|r| r.attempt == 1);

        let result = Scheduler::new(graph, &config(&dir, 16000, 4), executor.clone())
            .run()
            .await
            .unwrap();

        let mems: Vec<u64> = executor.calls().iter().map(|c| c.2).collect();
        assert_eq!(mems, vec![4000, 8000]);
        let job = result.graph.job(0);
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempt, 2);
        assert!(job.history[0].failure.is_some());
        assert!(job.history[1].failure.is_none());
    }

    #[tokio::test]
    async fn test_always_failing_job_negotiates_once_per_attempt() {
        let dir = tempdir().unwrap();
        let negotiations = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&negotiations);
        let spec = ResourceSpec::custom(move |ctx| {
            let mem_mb = 1000 * u64::from(ctx.attempt);
            if ctx.binding.get("run") == Some("R1") {
                seen.lock().unwrap().push(mem_mb);
            }
            ResourceRequest {
                mem_mb,
                runtime_min: 10,
                threads: 1,
            }
        });
        let graph = build(&dir, templates(spec), &s1(), &["out/S1/merged"]);
        let executor = MockExecutor::new(t1_failing);

        let result = Scheduler::new(graph, &config(&dir, 8000, 1), executor.clone())
            .run()
            .await
            .unwrap();

        let r1 = result
            .graph
            .find("T1", &WildcardBinding::new().with("sample", "S1").with("run", "R1"))
            .unwrap();
        assert_eq!(r1.state, JobState::FailedPermanent);
        assert_eq!(r1.attempt, 3);

        let attempts: Vec<u32> = executor
            .calls()
            .iter()
            .filter(|c| c.0 == r1.label())
            .map(|c| c.1)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);

        // The fan-in consumer never reached its executor.
        assert!(!executor.called("T2"));
        let merge = result
            .graph
            .find("T2", &WildcardBinding::new().with("sample", "S1"))
            .unwrap();
        assert_eq!(merge.state, JobState::FailedPermanent);
        assert!(matches!(merge.failure, Some(JobFailure::UpstreamFailed { .. })));

        assert_eq!(*negotiations.lock().unwrap(), vec![1000, 2000, 3000]);
    }

    #[tokio::test]
    async fn test_partial_failure_isolation() {
        let dir = tempdir().unwrap();
        let universe = s1().with_run("S2", "R1").unwrap();
        let graph = build(
            &dir,
            templates(ResourceSpec::default()),
            &universe,
            &["out/S1/merged", "out/S2/merged"],
        );
        let executor = MockExecutor::new(|r| r.template == "T1" && r.binding.get("sample") == Some("S1"));

        let mut cfg = config(&dir, 8000, 2);
        cfg.max_attempts = 1;
        let result = Scheduler::new(graph, &cfg, executor.clone()).run().await.unwrap();

        let s2 = result
            .graph
            .find("T2", &WildcardBinding::new().with("sample", "S2"))
            .unwrap();
        assert_eq!(s2.state, JobState::Succeeded);
        let s1 = result
            .graph
            .find("T2", &WildcardBinding::new().with("sample", "S1"))
            .unwrap();
        assert_eq!(s1.state, JobState::FailedPermanent);
        assert!(dir.path().join("out/S2/merged").exists());
    }

    #[tokio::test]
    async fn test_budget_unsatisfiable_never_dispatched() {
        let dir = tempdir().unwrap();
        let spec = ResourceSpec::Formulas(ResourceFormulas {
            mem_mb: Formula::flat(10_000),
            ..ResourceFormulas::default()
        });
        let graph = build(&dir, templates(spec), &s1(), &["out/S1/merged"]);
        let executor = MockExecutor::succeeding();

        let result = Scheduler::new(graph, &config(&dir, 4000, 4), executor.clone())
            .run()
            .await
            .unwrap();

        assert!(executor.calls().is_empty());
        assert!(matches!(
            result.graph.job(0).failure,
            Some(JobFailure::BudgetUnsatisfiable { .. })
        ));
        // The sibling only fed the failed merge, so it is cancelled instead.
        assert_eq!(result.graph.count(JobState::FailedPermanent), 2);
        assert_eq!(result.graph.count(JobState::Cancelled), 1);
    }

    #[tokio::test]
    async fn test_thread_budget_limits_concurrency() {
        let dir = tempdir().unwrap();
        let spec = ResourceSpec::Formulas(ResourceFormulas {
            threads: 2,
            ..ResourceFormulas::default()
        });
        let graph = build(&dir, templates(spec), &s1(), &["out/S1/R1/x", "out/S1/R2/x"]);
        let executor = Arc::new(MockExecutor {
            fails: Box::new(|_| false),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });

        let result = Scheduler::new(graph, &config(&dir, 8000, 3), executor.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(result.graph.count(JobState::Succeeded), 2);
        assert_eq!(executor.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_output_is_retried() {
        let dir = tempdir().unwrap();
        let graph = build(&dir, templates(ResourceSpec::default()), &s1(), &["out/S1/R1/x"]);

        struct Forgetful(AtomicUsize);
        impl TaskExecutor for Forgetful {
            fn execute(&self, request: &JobRequest) -> Result<ExecutionOutcome, ExecutorError> {
                if self.0.fetch_add(1, Ordering::SeqCst) > 0 {
                    let path = request.working_dir.join(&request.outputs[0]);
                    std::fs::create_dir_all(path.parent().unwrap())?;
                    std::fs::write(path, "ok")?;
                }
                Ok(ExecutionOutcome {
                    exit_code: Some(0),
                    outputs: vec![],
                    log: request.log.clone(),
                })
            }
        }

        let result = Scheduler::new(graph, &config(&dir, 8000, 1), Arc::new(Forgetful(AtomicUsize::new(0))))
            .run()
            .await
            .unwrap();
        let job = result.graph.job(0);
        assert_eq!(job.state, JobState::Succeeded);
        assert!(matches!(
            job.history[0].failure,
            Some(JobFailure::MissingOutput { .. })
        ));
    }

    #[tokio::test]
    async fn test_panicking_executor_is_crash() {
        let dir = tempdir().unwrap();
        let graph = build(&dir, templates(ResourceSpec::default()), &s1(), &["out/S1/R1/x"]);

        struct Panics;
        impl TaskExecutor for Panics {
            fn execute(&self, _: &JobRequest) -> Result<ExecutionOutcome, ExecutorError> {
                panic!("executor bug");
            }
        }

        let mut cfg = config(&dir, 8000, 1);
        cfg.max_attempts = 2;
        let result = Scheduler::new(graph, &cfg, Arc::new(Panics)).run().await.unwrap();
        let job = result.graph.job(0);
        assert_eq!(job.state, JobState::FailedPermanent);
        assert_eq!(job.attempt, 2);
        assert!(matches!(job.failure, Some(JobFailure::ExecutorCrashed { .. })));
    }

    #[tokio::test]
    async fn test_command_template_error_is_permanent() {
        let dir = tempdir().unwrap();
        let broken = RuleTemplate::new("broken", "echo {params.missing} > {output}")
            .with_output("b/{name}.txt")
            .unwrap();
        let graph = build(&dir, vec![broken], &SampleUniverse::new(), &["b/x.txt"]);
        let executor = MockExecutor::succeeding();

        let result = Scheduler::new(graph, &config(&dir, 8000, 1), executor.clone())
            .run()
            .await
            .unwrap();
        assert!(executor.calls().is_empty());
        assert!(matches!(
            result.graph.job(0).failure,
            Some(JobFailure::CommandTemplate { .. })
        ));
    }

    #[tokio::test]
    async fn test_dry_run_skips_executor() {
        let dir = tempdir().unwrap();
        let graph = build(&dir, templates(ResourceSpec::default()), &s1(), &["out/S1/merged"]);
        let executor = MockExecutor::succeeding();

        let mut cfg = config(&dir, 8000, 1);
        cfg.dry_run = true;
        let result = Scheduler::new(graph, &cfg, executor.clone()).run().await.unwrap();

        assert!(executor.calls().is_empty());
        assert_eq!(result.graph.count(JobState::Succeeded), 3);
        assert!(!dir.path().join("out/S1/merged").exists());
        assert_eq!(result.timeline.spans().len(), 3);
    }

    #[tokio::test]
    async fn test_up_to_date_jobs_are_not_rerun() {
        let dir = tempdir().unwrap();
        let graph = build(&dir, templates(ResourceSpec::default()), &s1(), &["out/S1/merged"]);
        let executor = MockExecutor::succeeding();
        Scheduler::new(graph, &config(&dir, 8000, 2), executor.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(executor.calls().len(), 3);

        let graph = build(&dir, templates(ResourceSpec::default()), &s1(), &["out/S1/merged"]);
        let again = MockExecutor::succeeding();
        let result = Scheduler::new(graph, &config(&dir, 8000, 2), again.clone())
            .run()
            .await
            .unwrap();
        assert!(again.calls().is_empty());
        assert!(result.graph.jobs().iter().all(|j| j.up_to_date));
    }
}
