//! Template Registry
//!
//! Holds the immutable set of rule templates and a compiled output matcher
//! that answers "which templates can produce this path, under which binding?"
//! without ad hoc string substitution at graph-build time.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::error::RegistryError;

use super::model::{FanInScope, InputSpec, RuleTemplate};
use super::validator::validate_templates;
use super::wildcards::{Pattern, WildcardBinding};

/// One template able to produce a requested path.
#[derive(Debug, Clone)]
pub struct ProducerMatch {
    pub template: Arc<RuleTemplate>,
    pub binding: WildcardBinding,
}

/// An input declaration with rule references replaced by patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedInput {
    Pattern(Pattern),
    FanIn { pattern: Pattern, over: FanInScope },
    SampleFile { column: String },
}

impl From<ResolvedInput> for InputSpec {
    fn from(input: ResolvedInput) -> Self {
        match input {
            ResolvedInput::Pattern(pattern) => InputSpec::Pattern(pattern),
            ResolvedInput::FanIn { pattern, over } => InputSpec::FanIn { pattern, over },
            ResolvedInput::SampleFile { column } => InputSpec::SampleFile { column },
        }
    }
}

/// An output pattern compiled for matching.
#[derive(Debug, Clone)]
struct OutputMatcher {
    template: usize,
    pattern: Pattern,
}

/// The set of templates enabled for one run.
///
/// Conditions are evaluated exactly once when the topology is resolved; the
/// graph builder never re-checks the filesystem for them.
#[derive(Debug, Clone)]
pub struct Topology {
    enabled_templates: Vec<bool>,
    /// Per template, per input: whether the input is enabled.
    enabled_inputs: Vec<Vec<bool>>,
}

impl Topology {
    pub fn template_enabled(&self, index: usize) -> bool {
        self.enabled_templates.get(index).copied().unwrap_or(false)
    }

    pub fn input_enabled(&self, template: usize, input: usize) -> bool {
        self.enabled_inputs
            .get(template)
            .and_then(|inputs| inputs.get(input))
            .copied()
            .unwrap_or(false)
    }
}

/// Immutable registry of rule templates.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: Vec<Arc<RuleTemplate>>,
    /// Per template, inputs in declaration order.
    inputs: Vec<Vec<ResolvedInput>>,
    by_id: HashMap<String, usize>,
    /// Matchers keyed by the literal prefix of their output pattern.
    matchers: BTreeMap<String, Vec<OutputMatcher>>,
}

impl TemplateRegistry {
    /// Validates and registers a template set.
    ///
    /// References to other rules' outputs are resolved into patterns here,
    /// so registered templates only carry concrete input declarations.
    pub fn new(templates: Vec<RuleTemplate>) -> Result<Self, RegistryError> {
        validate_templates(&templates).map_err(RegistryError::Validation)?;

        let mut by_id = HashMap::new();
        for (index, template) in templates.iter().enumerate() {
            if by_id.insert(template.id.clone(), index).is_some() {
                return Err(RegistryError::DuplicateTemplate(template.id.clone()));
            }
        }

        let inputs = resolve_references(&templates, &by_id)?;
        let mut resolved = templates;
        for (template, resolved_inputs) in resolved.iter_mut().zip(&inputs) {
            for (decl, input) in template.inputs.iter_mut().zip(resolved_inputs) {
                decl.spec = input.clone().into();
            }
        }
        // Referenced outputs now sit in plain patterns; check their wildcards.
        validate_templates(&resolved).map_err(RegistryError::Validation)?;

        let templates: Vec<Arc<RuleTemplate>> = resolved.into_iter().map(Arc::new).collect();

        let mut matchers: BTreeMap<String, Vec<OutputMatcher>> = BTreeMap::new();
        for (index, template) in templates.iter().enumerate() {
            for pattern in &template.outputs {
                matchers
                    .entry(pattern.literal_prefix().to_string())
                    .or_default()
                    .push(OutputMatcher {
                        template: index,
                        pattern: pattern.clone(),
                    });
            }
        }

        info!(
            "Registered {} rule templates ({} output patterns)",
            templates.len(),
            matchers.values().map(Vec::len).sum::<usize>()
        );

        Ok(Self {
            templates,
            inputs,
            by_id,
            matchers,
        })
    }

    /// Gets a template by id.
    pub fn get(&self, id: &str) -> Option<&Arc<RuleTemplate>> {
        self.by_id.get(id).map(|&index| &self.templates[index])
    }

    /// Index of a template by id.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    pub fn templates(&self) -> &[Arc<RuleTemplate>] {
        &self.templates
    }

    /// Resolved inputs of the template at `index`.
    pub fn inputs(&self, index: usize) -> &[ResolvedInput] {
        self.inputs.get(index).map_or(&[], Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Evaluates every template and input condition once.
    pub fn resolve_topology(&self, base_dir: &Path) -> Topology {
        let mut enabled_templates = Vec::with_capacity(self.templates.len());
        let mut enabled_inputs = Vec::with_capacity(self.templates.len());

        for template in &self.templates {
            let enabled = template.when.as_ref().map_or(true, |c| c.holds(base_dir));
            if !enabled {
                info!("Rule '{}' disabled by its condition", template.id);
            }
            enabled_templates.push(enabled);

            let inputs: Vec<bool> = template
                .inputs
                .iter()
                .map(|decl| decl.when.as_ref().map_or(true, |c| c.holds(base_dir)))
                .collect();
            for (index, enabled) in inputs.iter().enumerate() {
                if !enabled {
                    debug!("Rule '{}': input {} disabled by its condition", template.id, index);
                }
            }
            enabled_inputs.push(inputs);
        }

        Topology {
            enabled_templates,
            enabled_inputs,
        }
    }

    /// Finds every enabled template whose outputs match `path`.
    ///
    /// A template matching through several outputs under the same binding
    /// is reported once.
    pub fn producers_of(&self, path: &str, topology: &Topology) -> Vec<(usize, ProducerMatch)> {
        let mut found: Vec<(usize, ProducerMatch)> = Vec::new();

        for (prefix, matchers) in &self.matchers {
            if !path.starts_with(prefix.as_str()) {
                continue;
            }
            for matcher in matchers {
                if !topology.template_enabled(matcher.template) {
                    continue;
                }
                let Some(binding) = matcher.pattern.matches(path) else {
                    continue;
                };
                let duplicate = found
                    .iter()
                    .any(|(index, m)| *index == matcher.template && m.binding == binding);
                if !duplicate {
                    found.push((
                        matcher.template,
                        ProducerMatch {
                            template: Arc::clone(&self.templates[matcher.template]),
                            binding,
                        },
                    ));
                }
            }
        }

        found.sort_by_key(|(index, _)| *index);
        found
    }
}

fn resolve_references(
    templates: &[RuleTemplate],
    by_id: &HashMap<String, usize>,
) -> Result<Vec<Vec<ResolvedInput>>, RegistryError> {
    templates
        .iter()
        .map(|template| {
            template
                .inputs
                .iter()
                .map(|decl| resolve_input(template, &decl.spec, templates, by_id))
                .collect()
        })
        .collect()
}

fn resolve_input(
    template: &RuleTemplate,
    spec: &InputSpec,
    templates: &[RuleTemplate],
    by_id: &HashMap<String, usize>,
) -> Result<ResolvedInput, RegistryError> {
    match spec {
        InputSpec::Pattern(pattern) => Ok(ResolvedInput::Pattern(pattern.clone())),
        InputSpec::FanIn { pattern, over } => Ok(ResolvedInput::FanIn {
            pattern: pattern.clone(),
            over: *over,
        }),
        InputSpec::SampleFile { column } => Ok(ResolvedInput::SampleFile {
            column: column.clone(),
        }),
        InputSpec::RuleOutput { rule, output } => {
            resolve_reference(template, rule, *output, templates, by_id)
        }
    }
}

fn resolve_reference(
    template: &RuleTemplate,
    rule: &str,
    output: usize,
    templates: &[RuleTemplate],
    by_id: &HashMap<String, usize>,
) -> Result<ResolvedInput, RegistryError> {
    let target = by_id
        .get(rule)
        .map(|&index| &templates[index])
        .ok_or_else(|| RegistryError::UnknownReference {
            template: template.id.clone(),
            rule: rule.to_string(),
        })?;
    let pattern = target
        .outputs
        .get(output)
        .ok_or_else(|| RegistryError::OutputOutOfRange {
            template: template.id.clone(),
            rule: rule.to_string(),
            index: output,
            available: target.outputs.len(),
        })?
        .clone();
    debug!(
        "Rule '{}': resolved reference to {}[{}] as '{}'",
        template.id, rule, output, pattern
    );
    Ok(ResolvedInput::Pattern(pattern))
}
