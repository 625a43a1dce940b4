//! Pipeline Parser
//!
//! Loads a pipeline definition from YAML: engine configuration, the sample
//! sheet, rule templates and default targets.
//!
//! ```yaml
//! config:
//!   max_attempts: 3
//!   budget: { mem_mb: 32000, threads: 8 }
//!
//! samples:
//!   required_files: [fq1]
//!   rows:
//!     - { sample: S1, run: R1, fq1: raw/S1_R1.fq.gz }
//!     - { sample: S1, run: R2, fq1: raw/S1_R2.fq.gz }
//!
//! rules:
//!   - id: trim
//!     input:
//!       - sample_file: fq1
//!     output: trimmed/{sample}/{run}.fq.gz
//!     command: fastp -i {input} -o {output}
//!
//! targets:
//!   - trimmed/S1/R1.fq.gz
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

use crate::config::EngineConfig;
use crate::error::{ConfigError, PatternError};

use super::model::{Condition, ExecutorSpec, FanInScope, InputDecl, InputSpec, RuleTemplate};
use super::registry::TemplateRegistry;
use super::resources::{ResourceFormulas, ResourceSpec};
use super::universe::{SampleSchema, SampleUniverse};
use super::wildcards::Pattern;

/// Everything needed to build and run a job graph.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub config: EngineConfig,
    pub universe: SampleUniverse,
    pub registry: TemplateRegistry,
    /// Default targets, used when none are given on the command line.
    pub targets: Vec<String>,
}

impl Pipeline {
    /// Assembles a pipeline from parts built in code.
    pub fn new(registry: TemplateRegistry, universe: SampleUniverse, config: EngineConfig) -> Self {
        Self {
            config,
            universe,
            registry,
            targets: Vec::new(),
        }
    }

    pub fn with_targets<S: Into<String>>(mut self, targets: impl IntoIterator<Item = S>) -> Self {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineFile {
    #[serde(default)]
    config: EngineConfig,
    #[serde(default)]
    samples: SamplesDef,
    #[serde(default)]
    rules: Vec<RuleDef>,
    #[serde(default, deserialize_with = "one_or_many")]
    targets: Vec<String>,
}

/// Sample sheet rows, inline or in a separate YAML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SamplesDef {
    #[serde(default)]
    rows: Vec<BTreeMap<String, Value>>,
    /// YAML file holding a list of rows, relative to the pipeline file.
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    required_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDef {
    id: String,
    command: String,
    #[serde(default, deserialize_with = "one_or_many")]
    input: Vec<InputDef>,
    #[serde(default, deserialize_with = "one_or_many")]
    output: Vec<String>,
    /// Shorthand for `resources.threads`.
    #[serde(default)]
    threads: Option<u32>,
    #[serde(default)]
    resources: Option<ResourceFormulas>,
    #[serde(default)]
    params: BTreeMap<String, String>,
    #[serde(default)]
    shadow: bool,
    #[serde(default)]
    log: Option<String>,
    #[serde(default)]
    max_attempts: Option<u32>,
    #[serde(default)]
    when: Option<Condition>,
}

/// An input is either a bare pattern or a map naming its kind.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputDef {
    Path(String),
    Detailed(InputFields),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InputFields {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    fan_in: Option<String>,
    #[serde(default)]
    over: Option<FanInScope>,
    #[serde(default)]
    sample_file: Option<String>,
    #[serde(default)]
    rule: Option<String>,
    #[serde(default)]
    output: Option<usize>,
    #[serde(default)]
    when: Option<Condition>,
}

/// Deserializes a single value or a list of values into a `Vec`.
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

impl InputDef {
    fn into_decl(self, rule: &str) -> Result<InputDecl, ConfigError> {
        let fields = match self {
            InputDef::Path(raw) => {
                return Ok(InputDecl::from(InputSpec::Pattern(parse_pattern(rule, &raw)?)));
            }
            InputDef::Detailed(fields) => fields,
        };

        let kinds = [
            fields.path.is_some(),
            fields.fan_in.is_some(),
            fields.sample_file.is_some(),
            fields.rule.is_some(),
        ];
        if kinds.iter().filter(|&&k| k).count() != 1 {
            return Err(ConfigError::Invalid(format!(
                "rule '{}': each input needs exactly one of 'path', 'fan_in', 'sample_file' or 'rule'",
                rule
            )));
        }
        if fields.over.is_some() && fields.fan_in.is_none() {
            return Err(ConfigError::Invalid(format!(
                "rule '{}': 'over' is only valid on fan_in inputs",
                rule
            )));
        }

        let spec = if let Some(raw) = fields.path {
            InputSpec::Pattern(parse_pattern(rule, &raw)?)
        } else if let Some(raw) = fields.fan_in {
            InputSpec::FanIn {
                pattern: parse_pattern(rule, &raw)?,
                over: fields.over.unwrap_or_default(),
            }
        } else if let Some(column) = fields.sample_file {
            InputSpec::SampleFile { column }
        } else {
            InputSpec::RuleOutput {
                rule: fields.rule.unwrap_or_default(),
                output: fields.output.unwrap_or(0),
            }
        };

        Ok(InputDecl {
            spec,
            when: fields.when,
        })
    }
}

impl RuleDef {
    fn into_template(self) -> Result<RuleTemplate, ConfigError> {
        let id = self.id.trim().to_string();

        let inputs = self
            .input
            .into_iter()
            .map(|def| def.into_decl(&id))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = self
            .output
            .iter()
            .map(|raw| parse_pattern(&id, raw))
            .collect::<Result<Vec<_>, _>>()?;
        let log = self.log.as_deref().map(|raw| parse_pattern(&id, raw)).transpose()?;

        let mut formulas = self.resources.unwrap_or_default();
        if let Some(threads) = self.threads {
            formulas.threads = threads;
        }

        Ok(RuleTemplate {
            id,
            inputs,
            outputs,
            resources: ResourceSpec::Formulas(formulas),
            executor: ExecutorSpec {
                command: self.command.trim().to_string(),
                params: self.params,
            },
            shadow: self.shadow,
            log,
            max_attempts: self.max_attempts,
            when: self.when,
        })
    }
}

fn parse_pattern(rule: &str, raw: &str) -> Result<Pattern, ConfigError> {
    Pattern::parse(raw.trim()).map_err(|source: PatternError| ConfigError::Pattern {
        rule: rule.to_string(),
        source,
    })
}

/// Parses a pipeline from YAML text.
///
/// `base_dir` is where a separate sample sheet path is resolved from.
pub fn parse_pipeline(yaml: &str, base_dir: &Path) -> Result<Pipeline, ConfigError> {
    let file: PipelineFile = serde_yaml::from_str(yaml)?;

    info!(
        "Parsed {} rules, {} default targets",
        file.rules.len(),
        file.targets.len()
    );

    let mut rows = file.samples.rows;
    if let Some(path) = &file.samples.path {
        let path = base_dir.join(path);
        debug!("Reading sample sheet from {}", path.display());
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let extra: Vec<BTreeMap<String, Value>> = serde_yaml::from_str(&content)?;
        rows.extend(extra);
    }

    let schema = SampleSchema {
        required_files: file.samples.required_files,
    };
    let universe = SampleUniverse::from_rows(&rows, &schema)?;

    let templates = file
        .rules
        .into_iter()
        .map(RuleDef::into_template)
        .collect::<Result<Vec<_>, _>>()?;
    let registry = TemplateRegistry::new(templates)?;

    if file.config.max_attempts == 0 {
        return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
    }
    if file.config.budget.threads == 0 || file.config.budget.mem_mb == 0 {
        return Err(ConfigError::Invalid(
            "budget mem_mb and threads must be positive".into(),
        ));
    }

    Ok(Pipeline {
        config: file.config,
        universe,
        registry,
        targets: file.targets,
    })
}

/// Loads a pipeline from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use rulerunner::workflow::load_pipeline;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = load_pipeline("pipeline.yaml")?;
///     println!("Loaded {} rules", pipeline.registry.len());
///     Ok(())
/// }
/// ```
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<Pipeline, ConfigError> {
    let path = path.as_ref();
    info!("Loading pipeline from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("YAML content loaded ({} bytes)", content.len());

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_pipeline(&content, base_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::resources::Backoff;
    use tempfile::tempdir;

    const PIPELINE: &str = r#"
config:
  max_attempts: 4
  budget: { mem_mb: 16000, threads: 8 }

samples:
  required_files: [fq1]
  rows:
    - { sample: S1, run: R1, fq1: raw/S1_R1.fq }
    - { sample: S1, run: R2, fq1: raw/S1_R2.fq }

rules:
  - id: trim
    input:
      - sample_file: fq1
    output: trimmed/{sample}/{run}.fq
    threads: 2
    resources:
      mem_mb: { base: 4000, backoff: linear }
    command: fastp -i {input} -o {output} -w {threads}

  - id: merge
    input:
      - fan_in: trimmed/{sample}/{run}.fq
        over: runs_of_sample
      - path: qc/{sample}.kraken
        when: { path_exists: db/kraken }
    output:
      - merged/{sample}.fq
    log: logs/merge/{sample}.log
    max_attempts: 2
    command: cat {input} > {output}

targets: merged/S1.fq
"#;

    #[test]
    fn test_parse_pipeline() {
        let pipeline = parse_pipeline(PIPELINE, Path::new(".")).unwrap();

        assert_eq!(pipeline.config.max_attempts, 4);
        assert_eq!(pipeline.config.budget.mem_mb, 16000);
        assert_eq!(pipeline.targets, vec!["merged/S1.fq"]);
        assert_eq!(pipeline.universe.run_count(), 2);
        assert_eq!(pipeline.registry.len(), 2);

        let trim = pipeline.registry.get("trim").unwrap();
        match &trim.resources {
            ResourceSpec::Formulas(f) => {
                assert_eq!(f.threads, 2);
                assert_eq!(f.mem_mb.base, 4000);
                assert_eq!(f.mem_mb.backoff, Backoff::Linear);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(trim.inputs[0].spec, InputSpec::SampleFile { .. }));

        let merge = pipeline.registry.get("merge").unwrap();
        assert!(matches!(
            merge.inputs[0].spec,
            InputSpec::FanIn {
                over: FanInScope::RunsOfSample,
                ..
            }
        ));
        assert_eq!(
            merge.inputs[1].when,
            Some(Condition::PathExists(PathBuf::from("db/kraken")))
        );
        assert_eq!(merge.max_attempts, Some(2));
        assert_eq!(merge.log.as_ref().unwrap().as_str(), "logs/merge/{sample}.log");
    }

    #[test]
    fn test_rule_reference_input() {
        let yaml = r#"
rules:
  - id: align
    input: { rule: trim }
    output: mapped/{sample}/{run}.bam
    command: bwa mem {input} > {output}
  - id: trim
    input: raw/{sample}/{run}.fq
    output: trimmed/{sample}/{run}.fq
    command: fastp -i {input} -o {output}
"#;
        let pipeline = parse_pipeline(yaml, Path::new(".")).unwrap();
        let align = pipeline.registry.get("align").unwrap();
        match &align.inputs[0].spec {
            InputSpec::Pattern(p) => assert_eq!(p.as_str(), "trimmed/{sample}/{run}.fq"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_input_with_two_kinds_rejected() {
        let yaml = r#"
rules:
  - id: bad
    input:
      - path: a/{sample}
        sample_file: fq1
    output: b/{sample}
    command: cp {input} {output}
"#;
        let err = parse_pipeline(yaml, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_bad_pattern_names_rule() {
        let yaml = r#"
rules:
  - id: broken
    output: out/{sample
    command: touch {output}
"#;
        match parse_pipeline(yaml, Path::new(".")).unwrap_err() {
            ConfigError::Pattern { rule, .. } => assert_eq!(rule, "broken"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sample_sheet_from_file() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("samples.yaml"),
            "- { sample: A, run: L1 }\n- { sample: B, run: L1 }\n",
        )
        .unwrap();
        let pipeline_path = dir.path().join("pipeline.yaml");
        std::fs::write(
            &pipeline_path,
            "samples:\n  path: samples.yaml\nrules: []\n",
        )
        .unwrap();

        let pipeline = load_pipeline(&pipeline_path).unwrap();
        assert_eq!(pipeline.universe.sample_count(), 2);
        assert!(pipeline.registry.is_empty());
    }

    #[test]
    fn test_duplicate_run_rejected() {
        let yaml = r#"
samples:
  rows:
    - { sample: S1, run: R1 }
    - { sample: S1, run: R1 }
"#;
        let err = parse_pipeline(yaml, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::Universe(_)));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let err = parse_pipeline("config: { max_attempts: 0 }", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_pipeline_file_not_found() {
        let err = load_pipeline("/nonexistent/path/pipeline.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_pipeline_invalid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "this is not valid yaml: [[[").unwrap();
        assert!(matches!(load_pipeline(&path).unwrap_err(), ConfigError::Yaml(_)));
    }
}
