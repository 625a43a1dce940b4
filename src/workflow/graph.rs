//! Job Graph Construction
//!
//! Resolves requested target files into the minimal acyclic graph of jobs
//! needed to produce them, by goal-directed backward chaining:
//!
//! 1. Find the unique enabled template whose output matches a required path.
//! 2. Instantiate it under the matched binding (memoized per template and
//!    binding, so shared producers become one node).
//! 3. Resolve its inputs the same way, on an explicit work stack; fan-in
//!    inputs expand over child bindings drawn from the sample universe.
//!
//! Jobs are created after all of their producers, so job ids form a
//! topological order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::ENGINE_DIR;
use crate::error::{EngineError, GraphError, JobFailure, UniverseError};

use super::model::{FanInScope, RuleTemplate};
use super::registry::{ResolvedInput, TemplateRegistry, Topology};
use super::resources::ResourceRequest;
use super::universe::SampleUniverse;
use super::wildcards::{WildcardBinding, RUN_WILDCARD, SAMPLE_WILDCARD};

/// Chain length after which resolution is treated as cyclic.
const MAX_DEPTH: usize = 256;

/// Index of a job inside its graph; also its creation order.
pub type JobId = usize;

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for producers.
    Pending,
    /// All producers succeeded; waiting for admission.
    Ready,
    /// Dispatched to an executor.
    Running,
    Succeeded,
    /// Failed, another attempt will follow.
    FailedRetryable,
    /// Failed for good; consumers will never run.
    FailedPermanent,
    /// Dropped because nothing still needs its outputs.
    Cancelled,
}

impl JobState {
    /// Returns true if the job will never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedPermanent | Self::Cancelled)
    }

    /// Returns true if the transition `self -> next` is legal.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, FailedPermanent)
                | (Pending, Cancelled)
                | (Ready, Running)
                | (Ready, FailedPermanent)
                | (Ready, Cancelled)
                | (Running, Succeeded)
                | (Running, FailedRetryable)
                | (Running, FailedPermanent)
                | (FailedRetryable, Ready)
                | (FailedRetryable, FailedPermanent)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::FailedRetryable => "failed-retryable",
            Self::FailedPermanent => "failed-permanent",
            Self::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// What happened on one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub resources: ResourceRequest,
    pub failure: Option<JobFailure>,
}

/// A template bound to one wildcard binding.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub template: Arc<RuleTemplate>,
    pub binding: WildcardBinding,
    /// Input paths relative to the working directory.
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub log: PathBuf,
    /// Current attempt, starting at 1.
    pub attempt: u32,
    pub state: JobState,
    /// Resources negotiated for the current attempt.
    pub resources: Option<ResourceRequest>,
    pub history: Vec<AttemptRecord>,
    pub failure: Option<JobFailure>,
    /// Outputs were already fresh when the graph was built.
    pub up_to_date: bool,
    pub producers: Vec<JobId>,
    pub consumers: Vec<JobId>,
}

impl Job {
    /// Human-readable identity, e.g. `align(run=R1,sample=S1)`.
    pub fn label(&self) -> String {
        job_label(&self.template.id, &self.binding)
    }
}

fn job_label(template: &str, binding: &WildcardBinding) -> String {
    if binding.is_empty() {
        template.to_string()
    } else {
        format!("{}({})", template, binding)
    }
}

/// A requested file and the job producing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub path: PathBuf,
    /// `None` if the file is a pre-supplied input with no producer.
    pub producer: Option<JobId>,
}

/// Directed acyclic graph of jobs.
#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    jobs: Vec<Job>,
    targets: Vec<Target>,
    index: HashMap<(String, WildcardBinding), JobId>,
}

impl JobGraph {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// All jobs in creation (topological) order.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: JobId) -> &Job {
        &self.jobs[id]
    }

    pub(crate) fn job_mut(&mut self, id: JobId) -> &mut Job {
        &mut self.jobs[id]
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Finds the job for a (template, binding) pair.
    pub fn find(&self, template: &str, binding: &WildcardBinding) -> Option<&Job> {
        self.index
            .get(&(template.to_string(), binding.clone()))
            .map(|&id| &self.jobs[id])
    }

    /// Number of jobs currently in `state`.
    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    /// Returns true if every producer of `id` has succeeded.
    pub fn producers_succeeded(&self, id: JobId) -> bool {
        self.jobs[id]
            .producers
            .iter()
            .all(|&p| self.jobs[p].state == JobState::Succeeded)
    }

    /// Every job reachable from `id` along consumer edges.
    pub fn transitive_consumers(&self, id: JobId) -> Vec<JobId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<JobId> = self.jobs[id].consumers.iter().copied().collect();
        let mut order = Vec::new();

        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            order.push(next);
            queue.extend(self.jobs[next].consumers.iter().copied());
        }

        order.sort_unstable();
        order
    }

    /// Moves a job to a new state, rejecting illegal transitions.
    pub(crate) fn transition(&mut self, id: JobId, next: JobState) -> Result<JobState, EngineError> {
        let job = &mut self.jobs[id];
        let previous = job.state;
        if !previous.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                job: job.label(),
                from: previous.to_string(),
                to: next.to_string(),
            });
        }
        debug!("{}: {} -> {}", job.label(), previous, next);
        job.state = next;
        Ok(previous)
    }
}

/// Builds a [`JobGraph`] from target paths.
pub struct GraphBuilder<'a> {
    registry: &'a TemplateRegistry,
    universe: &'a SampleUniverse,
    base_dir: PathBuf,
    topology: Topology,
    force: bool,
    jobs: Vec<Job>,
    memo: HashMap<(usize, WildcardBinding), JobId>,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder. Template and input conditions are evaluated here,
    /// once, against `base_dir`.
    pub fn new(
        registry: &'a TemplateRegistry,
        universe: &'a SampleUniverse,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        let base_dir = base_dir.into();
        let topology = registry.resolve_topology(&base_dir);
        Self {
            registry,
            universe,
            base_dir,
            topology,
            force: false,
            jobs: Vec::new(),
            memo: HashMap::new(),
        }
    }

    /// Ignore existing outputs and schedule every job.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Resolves the targets into a job graph.
    ///
    /// Fails without side effects on the first ambiguous, missing or cyclic
    /// requirement.
    pub fn build<S: AsRef<str>>(mut self, targets: &[S]) -> Result<JobGraph, GraphError> {
        info!("Resolving {} targets", targets.len());

        let mut resolved = Vec::with_capacity(targets.len());
        for target in targets {
            let path = normalize(target.as_ref());
            let producer = self.resolve(&path)?;
            resolved.push(Target {
                path: PathBuf::from(path),
                producer,
            });
        }

        let mut index = HashMap::new();
        for ((template, binding), &id) in &self.memo {
            let id_key = self.registry.templates()[*template].id.clone();
            index.insert((id_key, binding.clone()), id);
        }

        let mut graph = JobGraph {
            jobs: self.jobs,
            targets: resolved,
            index,
        };
        mark_up_to_date(&mut graph, &self.base_dir, self.force);

        info!(
            "Job graph: {} jobs ({} up to date)",
            graph.len(),
            graph.jobs.iter().filter(|j| j.up_to_date).count()
        );
        Ok(graph)
    }

    /// Finds or creates the producer of `path`, with everything upstream of it.
    ///
    /// Resolution walks an explicit stack of partially built jobs, so chain
    /// length is bounded by `MAX_DEPTH` and not by the thread's stack.
    /// Returns `None` for existing files no template produces.
    fn resolve(&mut self, path: &str) -> Result<Option<JobId>, GraphError> {
        let (index, binding) = match self.requirement(path, None)? {
            Requirement::Source => return Ok(None),
            Requirement::Built(id) => return Ok(Some(id)),
            Requirement::Instantiate(index, binding) => (index, binding),
        };

        let mut stack = vec![self.open_frame(index, binding, &[])?];
        let mut resolved = None;

        while let Some(mut frame) = stack.pop() {
            if let Some(path) = frame.paths.get(frame.next).cloned() {
                frame.next += 1;
                match self.requirement(&path, Some(frame.label.as_str()))? {
                    Requirement::Source => stack.push(frame),
                    Requirement::Built(id) => {
                        frame.add_producer(id);
                        stack.push(frame);
                    }
                    Requirement::Instantiate(index, binding) => {
                        stack.push(frame);
                        let child = self.open_frame(index, binding, &stack)?;
                        stack.push(child);
                    }
                }
                continue;
            }

            let id = self.finish(frame)?;
            match stack.last_mut() {
                Some(parent) => parent.add_producer(id),
                None => resolved = Some(id),
            }
        }

        Ok(resolved)
    }

    /// Looks up the unique producer of `path` without building anything.
    fn requirement(&self, path: &str, required_by: Option<&str>) -> Result<Requirement, GraphError> {
        let mut producers = self.registry.producers_of(path, &self.topology);

        if producers.len() > 1 {
            return Err(GraphError::AmbiguousProducer {
                path: path.to_string(),
                candidates: producers
                    .iter()
                    .map(|(_, m)| job_label(&m.template.id, &m.binding))
                    .collect(),
            });
        }

        let Some((index, matched)) = producers.pop() else {
            if self.base_dir.join(path).exists() {
                debug!("'{}' is a source file", path);
                return Ok(Requirement::Source);
            }
            return Err(GraphError::NoProducer {
                path: path.to_string(),
                required_by: required_by.map(str::to_string),
            });
        };

        match self.memo.get(&(index, matched.binding.clone())) {
            Some(&id) => Ok(Requirement::Built(id)),
            None => Ok(Requirement::Instantiate(index, matched.binding)),
        }
    }

    /// Starts a job whose inputs still need resolving.
    ///
    /// `stack` holds the jobs currently being built; meeting one of them
    /// again is a cycle.
    fn open_frame(
        &self,
        index: usize,
        binding: WildcardBinding,
        stack: &[Frame],
    ) -> Result<Frame, GraphError> {
        let template = Arc::clone(&self.registry.templates()[index]);
        let label = job_label(&template.id, &binding);
        let key = (index, binding);

        if let Some(start) = stack.iter().position(|f| f.key == key) {
            return Err(GraphError::CycleDetected {
                chain: chain_of(&stack[start..], &label),
            });
        }
        if stack.len() >= MAX_DEPTH {
            warn!("Dependency chain deeper than {} jobs at {}", MAX_DEPTH, label);
            return Err(GraphError::CycleDetected {
                chain: chain_of(stack, &label),
            });
        }

        let paths = self.input_paths(index, &key.1, &label)?;
        Ok(Frame {
            key,
            template,
            label,
            paths,
            next: 0,
            producers: Vec::new(),
        })
    }

    /// Creates the job for a frame whose inputs are all resolved.
    fn finish(&mut self, frame: Frame) -> Result<JobId, GraphError> {
        let Frame {
            key,
            template,
            label,
            paths,
            producers,
            ..
        } = frame;

        let outputs = template
            .outputs
            .iter()
            .map(|p| p.render(&key.1).map(PathBuf::from))
            .collect::<Result<Vec<_>, _>>()?;

        let log = match &template.log {
            Some(pattern) => PathBuf::from(pattern.render(&key.1)?),
            None => PathBuf::from(ENGINE_DIR)
                .join("logs")
                .join(&template.id)
                .join(format!("{}.log", key.1.slug())),
        };

        let id = self.jobs.len();
        for &producer in &producers {
            self.jobs[producer].consumers.push(id);
        }

        debug!(
            "Job {} {}: {} inputs, {} producers",
            id,
            label,
            paths.len(),
            producers.len()
        );

        self.jobs.push(Job {
            id,
            template,
            binding: key.1.clone(),
            inputs: paths.into_iter().map(PathBuf::from).collect(),
            outputs,
            log,
            attempt: 1,
            state: JobState::Pending,
            resources: None,
            history: Vec::new(),
            failure: None,
            up_to_date: false,
            producers,
            consumers: Vec::new(),
        });
        self.memo.insert(key, id);
        Ok(id)
    }

    /// Renders the enabled inputs of a template, normalized and deduplicated.
    fn input_paths(
        &self,
        index: usize,
        binding: &WildcardBinding,
        label: &str,
    ) -> Result<Vec<String>, GraphError> {
        let mut rendered: Vec<String> = Vec::new();

        for (position, input) in self.registry.inputs(index).iter().enumerate() {
            if !self.topology.input_enabled(index, position) {
                continue;
            }
            match input {
                ResolvedInput::Pattern(pattern) => rendered.push(pattern.render(binding)?),
                ResolvedInput::FanIn { pattern, over } => {
                    let children = self.child_bindings(binding, *over)?;
                    if children.is_empty() {
                        warn!("{}: fan-in over {:?} has no children", label, over);
                    }
                    for child in children {
                        let mut merged = binding.clone();
                        for (name, value) in child.iter() {
                            merged.insert(name, value);
                        }
                        rendered.push(pattern.render(&merged)?);
                    }
                }
                ResolvedInput::SampleFile { column } => {
                    let sample = bound(binding, SAMPLE_WILDCARD)?;
                    let run = bound(binding, RUN_WILDCARD)?;
                    rendered.push(self.universe.run_file(sample, run, column)?.to_string());
                }
            }
        }

        let mut seen = HashSet::new();
        Ok(rendered
            .iter()
            .map(|path| normalize(path))
            .filter(|path| seen.insert(path.clone()))
            .collect())
    }

    fn child_bindings(
        &self,
        binding: &WildcardBinding,
        over: FanInScope,
    ) -> Result<Vec<WildcardBinding>, UniverseError> {
        match over {
            FanInScope::RunsOfSample => {
                let sample = bound(binding, SAMPLE_WILDCARD)?;
                self.universe.run_bindings_of(sample)
            }
            FanInScope::AllSamples => Ok(self.universe.sample_bindings()),
            FanInScope::AllRuns => Ok(self.universe.all_run_bindings()),
        }
    }
}

/// A job under construction during resolution.
struct Frame {
    key: (usize, WildcardBinding),
    template: Arc<RuleTemplate>,
    label: String,
    paths: Vec<String>,
    /// Index of the next path to resolve.
    next: usize,
    producers: Vec<JobId>,
}

impl Frame {
    fn add_producer(&mut self, id: JobId) {
        if !self.producers.contains(&id) {
            self.producers.push(id);
        }
    }
}

enum Requirement {
    /// An existing file with no producer.
    Source,
    Built(JobId),
    Instantiate(usize, WildcardBinding),
}

fn chain_of(frames: &[Frame], closing: &str) -> Vec<String> {
    frames
        .iter()
        .map(|f| f.label.clone())
        .chain(std::iter::once(closing.to_string()))
        .collect()
}

fn bound<'b>(binding: &'b WildcardBinding, name: &str) -> Result<&'b str, UniverseError> {
    binding.get(name).ok_or_else(|| UniverseError::UnboundWildcard {
        binding: binding.to_string(),
        name: name.to_string(),
    })
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim();
    trimmed.strip_prefix("./").unwrap_or(trimmed).to_string()
}

/// Marks jobs whose outputs are already fresh as succeeded.
///
/// A job is up to date when every output exists and is non-empty, no input
/// is newer than its oldest output, and all of its producers are up to date.
fn mark_up_to_date(graph: &mut JobGraph, base_dir: &Path, force: bool) {
    if force {
        return;
    }
    for id in 0..graph.jobs.len() {
        let producers_fresh = graph.jobs[id]
            .producers
            .iter()
            .all(|&p| graph.jobs[p].up_to_date);
        let job = &graph.jobs[id];
        if producers_fresh && outputs_fresh(base_dir, &job.inputs, &job.outputs) {
            debug!("{} is up to date", job.label());
            let job = &mut graph.jobs[id];
            job.up_to_date = true;
            job.state = JobState::Succeeded;
        }
    }
}

/// Outputs that are missing or empty. Directories count as present.
pub fn missing_outputs(base_dir: &Path, outputs: &[PathBuf]) -> Vec<PathBuf> {
    outputs
        .iter()
        .filter(|o| {
            match fs::metadata(base_dir.join(o)) {
                Ok(meta) => !meta.is_dir() && meta.len() == 0,
                Err(_) => true,
            }
        })
        .cloned()
        .collect()
}

fn outputs_fresh(base_dir: &Path, inputs: &[PathBuf], outputs: &[PathBuf]) -> bool {
    if outputs.is_empty() || !missing_outputs(base_dir, outputs).is_empty() {
        return false;
    }

    let modified = |p: &PathBuf| -> Option<SystemTime> {
        fs::metadata(base_dir.join(p)).ok().and_then(|m| m.modified().ok())
    };

    let newest_input = inputs.iter().filter_map(modified).max();
    let oldest_output = outputs.iter().filter_map(modified).min();

    match (newest_input, oldest_output) {
        (Some(input_time), Some(output_time)) => input_time <= output_time,
        (None, Some(_)) => true,
        _ => false,
    }
}
