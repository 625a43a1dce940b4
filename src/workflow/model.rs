//! Rule Template Data Model
//!
//! A rule template is a parameterized job description. Its output patterns
//! decide which files it can produce; its input declarations decide which
//! files a job instantiated from it needs.
//!
//! # Example YAML Format
//!
//! ```yaml
//! rules:
//!   - id: trim
//!     input:
//!       - sample_file: fq1
//!     output: trimmed/{sample}/{run}.fq.gz
//!     threads: 4
//!     resources:
//!       mem_mb: { base: 4000, backoff: linear }
//!     command: fastp -i {input} -o {output} -w {threads}
//!
//!   - id: merge
//!     input:
//!       - fan_in: trimmed/{sample}/{run}.fq.gz
//!         over: runs_of_sample
//!     output: merged/{sample}.fq.gz
//!     command: cat {input} > {output}
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::resources::ResourceSpec;
use super::wildcards::{Pattern, RUN_WILDCARD, SAMPLE_WILDCARD};

/// How a fan-in input enumerates its child bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FanInScope {
    /// One child per run of the job's own sample.
    #[default]
    RunsOfSample,
    /// One child per sample in the universe.
    AllSamples,
    /// One child per (sample, run) pair in the universe.
    AllRuns,
}

impl FanInScope {
    /// Wildcards each child binding adds on top of the parent binding.
    pub fn child_wildcards(&self) -> &'static [&'static str] {
        match self {
            Self::RunsOfSample => &[RUN_WILDCARD],
            Self::AllSamples => &[SAMPLE_WILDCARD],
            Self::AllRuns => &[SAMPLE_WILDCARD, RUN_WILDCARD],
        }
    }

    /// Wildcards the parent binding must already carry.
    pub fn parent_wildcards(&self) -> &'static [&'static str] {
        match self {
            Self::RunsOfSample => &[SAMPLE_WILDCARD],
            Self::AllSamples | Self::AllRuns => &[],
        }
    }
}

/// One input requirement of a rule template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSpec {
    /// A path rendered with the job's own binding.
    Pattern(Pattern),
    /// One path per child binding enumerated from the sample universe.
    FanIn { pattern: Pattern, over: FanInScope },
    /// A per-run file reference from the sample sheet.
    SampleFile { column: String },
    /// Output `output` of another rule; resolved to a pattern at registration.
    RuleOutput { rule: String, output: usize },
}

impl InputSpec {
    /// Returns the pattern behind this input, if it has one.
    pub fn pattern(&self) -> Option<&Pattern> {
        match self {
            Self::Pattern(p) | Self::FanIn { pattern: p, .. } => Some(p),
            Self::SampleFile { .. } | Self::RuleOutput { .. } => None,
        }
    }
}

/// A build-time condition, evaluated once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Holds if the path exists when the graph is built.
    PathExists(PathBuf),
}

impl Condition {
    /// Evaluates the condition relative to `base_dir`.
    pub fn holds(&self, base_dir: &Path) -> bool {
        match self {
            Self::PathExists(path) => base_dir.join(path).exists(),
        }
    }
}

/// An input requirement together with its optional condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDecl {
    pub spec: InputSpec,
    pub when: Option<Condition>,
}

impl From<InputSpec> for InputDecl {
    fn from(spec: InputSpec) -> Self {
        Self { spec, when: None }
    }
}

/// The command a job runs, with named parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    /// Command template; see [`crate::execution::executor::render_command`].
    pub command: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// A parameterized job description.
#[derive(Debug, Clone)]
pub struct RuleTemplate {
    pub id: String,
    pub inputs: Vec<InputDecl>,
    pub outputs: Vec<Pattern>,
    pub resources: ResourceSpec,
    pub executor: ExecutorSpec,
    /// Run jobs in a private working directory.
    pub shadow: bool,
    pub log: Option<Pattern>,
    /// Overrides the engine-wide retry ceiling.
    pub max_attempts: Option<u32>,
    /// The template is only a producer when this holds.
    pub when: Option<Condition>,
}

impl RuleTemplate {
    /// Creates a template with a command and default resources.
    ///
    /// # Example
    ///
    /// ```
    /// use rulerunner::workflow::RuleTemplate;
    ///
    /// let template = RuleTemplate::new("align", "bwa mem ref.fa {input} > {output}")
    ///     .with_input("trimmed/{sample}/{run}.fq.gz")
    ///     .unwrap()
    ///     .with_output("mapped/{sample}/{run}.bam")
    ///     .unwrap();
    /// assert_eq!(template.outputs.len(), 1);
    /// ```
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            resources: ResourceSpec::default(),
            executor: ExecutorSpec {
                command: command.into().trim().to_string(),
                params: BTreeMap::new(),
            },
            shadow: false,
            log: None,
            max_attempts: None,
            when: None,
        }
    }

    /// Adds an input pattern rendered with the job's own binding.
    pub fn with_input(mut self, pattern: &str) -> Result<Self, crate::error::PatternError> {
        self.inputs
            .push(InputSpec::Pattern(Pattern::parse(pattern)?).into());
        Ok(self)
    }

    /// Adds a fan-in input.
    pub fn with_fan_in(
        mut self,
        pattern: &str,
        over: FanInScope,
    ) -> Result<Self, crate::error::PatternError> {
        self.inputs.push(
            InputSpec::FanIn {
                pattern: Pattern::parse(pattern)?,
                over,
            }
            .into(),
        );
        Ok(self)
    }

    /// Adds an arbitrary input declaration.
    pub fn with_input_decl(mut self, decl: InputDecl) -> Self {
        self.inputs.push(decl);
        self
    }

    /// Adds an output pattern.
    pub fn with_output(mut self, pattern: &str) -> Result<Self, crate::error::PatternError> {
        self.outputs.push(Pattern::parse(pattern)?);
        Ok(self)
    }

    /// Sets the log pattern.
    pub fn with_log(mut self, pattern: &str) -> Result<Self, crate::error::PatternError> {
        self.log = Some(Pattern::parse(pattern)?);
        Ok(self)
    }

    pub fn with_resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.executor.params.insert(name.into(), value.into());
        self
    }

    pub fn with_shadow(mut self, shadow: bool) -> Self {
        self.shadow = shadow;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.when = Some(condition);
        self
    }

    /// Wildcard names shared by the output patterns.
    pub fn output_wildcards(&self) -> BTreeSet<String> {
        self.outputs
            .iter()
            .flat_map(|p| p.wildcard_names())
            .map(str::to_string)
            .collect()
    }

    /// Returns true if any input fans in over the sample universe.
    pub fn is_fan_in(&self) -> bool {
        self.inputs
            .iter()
            .any(|d| matches!(d.spec, InputSpec::FanIn { .. }))
    }
}
