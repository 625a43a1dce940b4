//! Rule Template Validation
//!
//! Checks run before a template set is accepted into a registry:
//! - Template field validation (ids, commands, outputs)
//! - Wildcard consistency between inputs, outputs and logs
//! - Fan-in scope requirements
//!
//! All errors are collected so one pass reports every problem.

use std::collections::{BTreeSet, HashSet};

use log::{debug, info, warn};
use thiserror::Error;

use super::model::{InputSpec, RuleTemplate};
use super::wildcards::{RUN_WILDCARD, SAMPLE_WILDCARD};

/// A single problem with a rule template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("rule has an empty or whitespace-only id")]
    EmptyId,

    #[error("duplicate rule id '{0}'")]
    DuplicateId(String),

    #[error("rule '{0}' has no command")]
    EmptyCommand(String),

    #[error("rule '{0}' declares no outputs")]
    NoOutputs(String),

    #[error("rule '{rule}': output '{output}' uses wildcards {found:?} but other outputs use {expected:?}")]
    InconsistentOutputs {
        rule: String,
        output: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("rule '{rule}': '{pattern}' uses wildcard '{{{name}}}' which the outputs do not bind")]
    UnboundWildcard {
        rule: String,
        pattern: String,
        name: String,
    },

    #[error("rule '{rule}': {what} requires the outputs to bind '{{{name}}}'")]
    MissingScopeWildcard {
        rule: String,
        what: String,
        name: String,
    },

    #[error("rule '{0}' requests zero threads")]
    ZeroThreads(String),

    #[error("rule '{0}' allows zero attempts")]
    ZeroAttempts(String),
}

/// Validates one template in isolation.
fn validate_template(template: &RuleTemplate) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if template.id.trim().is_empty() {
        errors.push(ValidationError::EmptyId);
        return errors;
    }
    let rule = template.id.clone();

    if template.executor.command.trim().is_empty() {
        errors.push(ValidationError::EmptyCommand(rule.clone()));
    }

    if template.outputs.is_empty() {
        errors.push(ValidationError::NoOutputs(rule.clone()));
        return errors;
    }

    // Every output must bind the same wildcards, otherwise a job could not
    // render all of its outputs from the binding of one match.
    let expected: BTreeSet<&str> = template.outputs[0].wildcard_names().into_iter().collect();
    for output in &template.outputs[1..] {
        let found: BTreeSet<&str> = output.wildcard_names().into_iter().collect();
        if found != expected {
            errors.push(ValidationError::InconsistentOutputs {
                rule: rule.clone(),
                output: output.to_string(),
                expected: expected.iter().map(|s| s.to_string()).collect(),
                found: found.iter().map(|s| s.to_string()).collect(),
            });
        }
    }

    let bound: HashSet<&str> = expected.iter().copied().collect();

    for decl in &template.inputs {
        match &decl.spec {
            InputSpec::Pattern(pattern) => {
                for name in pattern.wildcard_names() {
                    if !bound.contains(name) {
                        errors.push(ValidationError::UnboundWildcard {
                            rule: rule.clone(),
                            pattern: pattern.to_string(),
                            name: name.to_string(),
                        });
                    }
                }
            }
            InputSpec::FanIn { pattern, over } => {
                for name in over.parent_wildcards() {
                    if !bound.contains(name) {
                        errors.push(ValidationError::MissingScopeWildcard {
                            rule: rule.clone(),
                            what: format!("fan-in over {:?}", over),
                            name: name.to_string(),
                        });
                    }
                }
                let children = over.child_wildcards();
                for name in pattern.wildcard_names() {
                    if !bound.contains(name) && !children.contains(&name) {
                        errors.push(ValidationError::UnboundWildcard {
                            rule: rule.clone(),
                            pattern: pattern.to_string(),
                            name: name.to_string(),
                        });
                    }
                }
                if !pattern.has_wildcards() {
                    warn!(
                        "Rule '{}': fan-in pattern '{}' has no wildcards; every child maps to the same file",
                        rule, pattern
                    );
                }
            }
            InputSpec::SampleFile { column } => {
                for name in [SAMPLE_WILDCARD, RUN_WILDCARD] {
                    if !bound.contains(name) {
                        errors.push(ValidationError::MissingScopeWildcard {
                            rule: rule.clone(),
                            what: format!("sample sheet column '{}'", column),
                            name: name.to_string(),
                        });
                    }
                }
            }
            // Checked once the referenced rule is known.
            InputSpec::RuleOutput { .. } => {}
        }
    }

    if let Some(log) = &template.log {
        for name in log.wildcard_names() {
            if !bound.contains(name) {
                errors.push(ValidationError::UnboundWildcard {
                    rule: rule.clone(),
                    pattern: log.to_string(),
                    name: name.to_string(),
                });
            }
        }
    }

    if let super::resources::ResourceSpec::Formulas(formulas) = &template.resources {
        if formulas.threads == 0 {
            errors.push(ValidationError::ZeroThreads(rule.clone()));
        }
    }

    if template.max_attempts == Some(0) {
        errors.push(ValidationError::ZeroAttempts(rule.clone()));
    }

    if template.inputs.is_empty() {
        debug!("Rule '{}' is a source rule (no inputs)", rule);
    }

    errors
}

/// Validates a whole template set.
///
/// Returns every error found, or `Ok(())` if the set is consistent.
/// Cross-rule references are checked separately by the registry.
pub fn validate_templates(templates: &[RuleTemplate]) -> Result<(), Vec<ValidationError>> {
    info!("Validating {} rule templates", templates.len());

    let mut errors = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for template in templates {
        if !template.id.trim().is_empty() && !seen.insert(template.id.as_str()) {
            errors.push(ValidationError::DuplicateId(template.id.clone()));
        }
        errors.extend(validate_template(template));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{FanInScope, InputDecl};
    use crate::workflow::resources::{ResourceFormulas, ResourceSpec};

    fn per_run() -> RuleTemplate {
        RuleTemplate::new("trim", "fastp -i {input} -o {output}")
            .with_input("raw/{sample}/{run}.fq")
            .unwrap()
            .with_output("trimmed/{sample}/{run}.fq")
            .unwrap()
    }

    #[test]
    fn test_valid_template_set() {
        let merge = RuleTemplate::new("merge", "cat {input} > {output}")
            .with_fan_in("trimmed/{sample}/{run}.fq", FanInScope::RunsOfSample)
            .unwrap()
            .with_output("merged/{sample}.fq")
            .unwrap();
        assert!(validate_templates(&[per_run(), merge]).is_ok());
    }

    #[test]
    fn test_duplicate_ids() {
        let errors = validate_templates(&[per_run(), per_run()]).unwrap_err();
        assert!(errors.contains(&ValidationError::DuplicateId("trim".into())));
    }

    #[test]
    fn test_empty_command_and_outputs() {
        let template = RuleTemplate::new("empty", "   ");
        let errors = validate_templates(&[template]).unwrap_err();
        assert!(errors.contains(&ValidationError::EmptyCommand("empty".into())));
        assert!(errors.contains(&ValidationError::NoOutputs("empty".into())));
    }

    #[test]
    fn test_unbound_input_wildcard() {
        let template = RuleTemplate::new("align", "bwa")
            .with_input("trimmed/{sample}/{run}.fq")
            .unwrap()
            .with_output("mapped/{sample}.bam")
            .unwrap();
        let errors = validate_templates(&[template]).unwrap_err();
        assert!(matches!(
            &errors[0],
            ValidationError::UnboundWildcard { name, .. } if name == "run"
        ));
    }

    #[test]
    fn test_inconsistent_outputs() {
        let template = RuleTemplate::new("split", "split")
            .with_output("a/{sample}.txt")
            .unwrap()
            .with_output("b/{sample}/{run}.txt")
            .unwrap();
        let errors = validate_templates(&[template]).unwrap_err();
        assert!(matches!(errors[0], ValidationError::InconsistentOutputs { .. }));
    }

    #[test]
    fn test_fan_in_requires_sample_wildcard() {
        let template = RuleTemplate::new("merge", "cat")
            .with_fan_in("trimmed/{sample}/{run}.fq", FanInScope::RunsOfSample)
            .unwrap()
            .with_output("merged/all.fq")
            .unwrap();
        let errors = validate_templates(&[template]).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::MissingScopeWildcard { name, .. } if name == "sample")));
    }

    #[test]
    fn test_all_samples_fan_in_is_valid_without_wildcards() {
        let template = RuleTemplate::new("report", "multiqc")
            .with_fan_in("calls/{sample}.vcf", FanInScope::AllSamples)
            .unwrap()
            .with_output("report/multiqc.html")
            .unwrap();
        assert!(validate_templates(&[template]).is_ok());
    }

    #[test]
    fn test_sample_file_requires_run_binding() {
        let template = RuleTemplate::new("trim", "fastp")
            .with_input_decl(InputDecl::from(InputSpec::SampleFile {
                column: "fq1".into(),
            }))
            .with_output("trimmed/{sample}.fq")
            .unwrap();
        let errors = validate_templates(&[template]).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::MissingScopeWildcard { name, .. } if name == "run")));
    }

    #[test]
    fn test_zero_threads_and_attempts() {
        let template = per_run()
            .with_resources(ResourceSpec::Formulas(ResourceFormulas {
                threads: 0,
                ..ResourceFormulas::default()
            }))
            .with_max_attempts(0);
        let errors = validate_templates(&[template]).unwrap_err();
        assert!(errors.contains(&ValidationError::ZeroThreads("trim".into())));
        assert!(errors.contains(&ValidationError::ZeroAttempts("trim".into())));
    }

    #[test]
    fn test_log_wildcards_checked() {
        let template = per_run().with_log("logs/{sample}/{lane}.log").unwrap();
        let errors = validate_templates(&[template]).unwrap_err();
        assert!(matches!(
            &errors[0],
            ValidationError::UnboundWildcard { name, .. } if name == "lane"
        ));
    }
}
