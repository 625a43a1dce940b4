//! Resource Negotiation
//!
//! Computes the concrete resources for one dispatch attempt of a job from its
//! wildcard binding, attempt number and input sizes. Evaluation is pure: the
//! same context always yields the same request.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::ResourceBudget;
use crate::error::JobFailure;

use super::wildcards::WildcardBinding;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Resources requested for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub mem_mb: u64,
    pub runtime_min: u64,
    pub threads: u32,
}

impl fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} MB, {} min, {} threads",
            self.mem_mb, self.runtime_min, self.threads
        )
    }
}

/// Everything a resource function may look at.
#[derive(Debug, Clone, Copy)]
pub struct ResourceContext<'a> {
    pub binding: &'a WildcardBinding,
    pub attempt: u32,
    /// Total size of all resolved inputs, in megabytes.
    pub input_mb: f64,
}

/// How a value grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same value on every attempt.
    #[default]
    Fixed,
    /// `value * attempt`
    Linear,
    /// `value * 2^(attempt - 1)`
    Doubling,
}

impl Backoff {
    fn factor(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed => 1,
            Self::Linear => u64::from(attempt),
            Self::Doubling => 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX),
        }
    }
}

/// `ceil(base + per_input_mb * input_mb) * backoff(attempt)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "FormulaDef")]
pub struct Formula {
    pub base: u64,
    pub per_input_mb: f64,
    pub backoff: Backoff,
}

impl Formula {
    /// A value that never changes.
    pub fn flat(base: u64) -> Self {
        Self {
            base,
            per_input_mb: 0.0,
            backoff: Backoff::Fixed,
        }
    }

    /// A value scaled by the attempt number.
    pub fn per_attempt(base: u64) -> Self {
        Self {
            base,
            per_input_mb: 0.0,
            backoff: Backoff::Linear,
        }
    }

    /// A value growing with the total input size.
    pub fn per_input(base: u64, per_input_mb: f64) -> Self {
        Self {
            base,
            per_input_mb,
            backoff: Backoff::Fixed,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn evaluate(&self, attempt: u32, input_mb: f64) -> u64 {
        let scaled = self.base as f64 + self.per_input_mb.max(0.0) * input_mb.max(0.0);
        (scaled.ceil() as u64).saturating_mul(self.backoff.factor(attempt))
    }
}

/// YAML form: either a bare number or a full formula.
#[derive(Deserialize)]
#[serde(untagged)]
enum FormulaDef {
    Flat(u64),
    Full {
        base: u64,
        #[serde(default)]
        per_input_mb: f64,
        #[serde(default)]
        backoff: Backoff,
    },
}

impl From<FormulaDef> for Formula {
    fn from(def: FormulaDef) -> Self {
        match def {
            FormulaDef::Flat(base) => Formula::flat(base),
            FormulaDef::Full {
                base,
                per_input_mb,
                backoff,
            } => Formula {
                base,
                per_input_mb,
                backoff,
            },
        }
    }
}

/// Declarative per-template resource formulas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceFormulas {
    #[serde(default = "default_mem")]
    pub mem_mb: Formula,
    #[serde(default = "default_runtime")]
    pub runtime_min: Formula,
    #[serde(default = "default_threads")]
    pub threads: u32,
}

fn default_mem() -> Formula {
    Formula::flat(1000)
}

fn default_runtime() -> Formula {
    Formula::flat(60)
}

fn default_threads() -> u32 {
    1
}

impl Default for ResourceFormulas {
    fn default() -> Self {
        Self {
            mem_mb: default_mem(),
            runtime_min: default_runtime(),
            threads: default_threads(),
        }
    }
}

/// Signature of a custom resource function.
pub type ResourceFn = dyn Fn(&ResourceContext<'_>) -> ResourceRequest + Send + Sync;

/// A template's resource function.
#[derive(Clone)]
pub enum ResourceSpec {
    Formulas(ResourceFormulas),
    /// A caller-supplied pure function.
    Custom(Arc<ResourceFn>),
}

impl ResourceSpec {
    /// Wraps a custom function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&ResourceContext<'_>) -> ResourceRequest + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Evaluates the spec for one attempt.
    pub fn evaluate(&self, ctx: &ResourceContext<'_>) -> ResourceRequest {
        match self {
            Self::Formulas(f) => ResourceRequest {
                mem_mb: f.mem_mb.evaluate(ctx.attempt, ctx.input_mb),
                runtime_min: f.runtime_min.evaluate(ctx.attempt, ctx.input_mb),
                threads: f.threads.max(1),
            },
            Self::Custom(f) => {
                let mut request = f(ctx);
                request.threads = request.threads.max(1);
                request
            }
        }
    }
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self::Formulas(ResourceFormulas::default())
    }
}

impl fmt::Debug for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Formulas(formulas) => f.debug_tuple("Formulas").field(formulas).finish(),
            Self::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

impl From<ResourceFormulas> for ResourceSpec {
    fn from(formulas: ResourceFormulas) -> Self {
        Self::Formulas(formulas)
    }
}

/// Sums the on-disk size of the given inputs, in megabytes.
///
/// Missing files count as zero (they only occur in dry runs).
pub fn measure_inputs(base_dir: &Path, inputs: &[PathBuf]) -> f64 {
    let bytes: u64 = inputs
        .iter()
        .filter_map(|p| std::fs::metadata(base_dir.join(p)).ok())
        .map(|m| m.len())
        .sum();
    bytes as f64 / BYTES_PER_MB
}

/// Turns resource specs into admissible requests under a global budget.
#[derive(Debug, Clone)]
pub struct ResourceNegotiator {
    budget: ResourceBudget,
}

impl ResourceNegotiator {
    pub fn new(budget: ResourceBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &ResourceBudget {
        &self.budget
    }

    /// Computes the request for the next dispatch attempt.
    ///
    /// A request above the budget on the first attempt can never be admitted
    /// and fails with [`JobFailure::BudgetUnsatisfiable`]. On later attempts,
    /// escalated memory and runtime are clamped to the ceiling instead.
    pub fn negotiate(
        &self,
        spec: &ResourceSpec,
        ctx: &ResourceContext<'_>,
    ) -> Result<ResourceRequest, JobFailure> {
        let mut request = spec.evaluate(ctx);
        debug!(
            "Negotiated resources for [{}] attempt {}: {}",
            ctx.binding, ctx.attempt, request
        );

        let over_memory = request.mem_mb > self.budget.mem_mb;
        let over_threads = request.threads > self.budget.threads;

        if over_threads || (over_memory && ctx.attempt <= 1) {
            return Err(JobFailure::BudgetUnsatisfiable {
                requested_mem_mb: request.mem_mb,
                requested_threads: request.threads,
                budget_mem_mb: self.budget.mem_mb,
                budget_threads: self.budget.threads,
            });
        }

        if over_memory {
            warn!(
                "Escalated memory request of {} MB exceeds the budget; clamping to {} MB",
                request.mem_mb, self.budget.mem_mb
            );
            request.mem_mb = self.budget.mem_mb;
        }

        if let Some(limit) = self.budget.runtime_min {
            if request.runtime_min > limit {
                if ctx.attempt <= 1 {
                    return Err(JobFailure::BudgetUnsatisfiable {
                        requested_mem_mb: request.mem_mb,
                        requested_threads: request.threads,
                        budget_mem_mb: self.budget.mem_mb,
                        budget_threads: self.budget.threads,
                    });
                }
                request.runtime_min = limit;
            }
        }

        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(binding: &WildcardBinding, attempt: u32, input_mb: f64) -> ResourceContext<'_> {
        ResourceContext {
            binding,
            attempt,
            input_mb,
        }
    }

    fn budget(mem_mb: u64, threads: u32) -> ResourceBudget {
        ResourceBudget {
            mem_mb,
            threads,
            runtime_min: None,
        }
    }

    #[test]
    fn test_flat_formula() {
        assert_eq!(Formula::flat(2000).evaluate(1, 0.0), 2000);
        assert_eq!(Formula::flat(2000).evaluate(3, 500.0), 2000);
    }

    #[test]
    fn test_per_attempt_formula() {
        let formula = Formula::per_attempt(4000);
        assert_eq!(formula.evaluate(1, 0.0), 4000);
        assert_eq!(formula.evaluate(2, 0.0), 8000);
        assert_eq!(formula.evaluate(3, 0.0), 12000);
    }

    #[test]
    fn test_doubling_formula() {
        let formula = Formula::flat(1000).with_backoff(Backoff::Doubling);
        assert_eq!(formula.evaluate(1, 0.0), 1000);
        assert_eq!(formula.evaluate(3, 0.0), 4000);
    }

    #[test]
    fn test_per_input_formula() {
        let formula = Formula::per_input(1000, 2.0);
        assert_eq!(formula.evaluate(1, 250.0), 1500);
        assert_eq!(formula.evaluate(1, 0.4), 1001);
    }

    #[test]
    fn test_spec_is_pure() {
        let spec = ResourceSpec::Formulas(ResourceFormulas {
            mem_mb: Formula::per_attempt(4000),
            runtime_min: Formula::per_input(10, 0.5),
            threads: 4,
        });
        let binding = WildcardBinding::new().with("sample", "S1");
        let a = spec.evaluate(&ctx(&binding, 2, 100.0));
        let b = spec.evaluate(&ctx(&binding, 2, 100.0));
        assert_eq!(a, b);
        assert_eq!(a.mem_mb, 8000);
        assert_eq!(a.runtime_min, 60);
        assert_eq!(a.threads, 4);
    }

    #[test]
    fn test_custom_spec_sees_binding() {
        let spec = ResourceSpec::custom(|ctx| ResourceRequest {
            mem_mb: if ctx.binding.get("sample") == Some("big") { 9000 } else { 1000 },
            runtime_min: 5,
            threads: 0,
        });
        let big = WildcardBinding::new().with("sample", "big");
        let request = spec.evaluate(&ctx(&big, 1, 0.0));
        assert_eq!(request.mem_mb, 9000);
        assert_eq!(request.threads, 1);
    }

    #[test]
    fn test_negotiate_unsatisfiable_first_attempt() {
        let negotiator = ResourceNegotiator::new(budget(8000, 4));
        let spec = ResourceSpec::Formulas(ResourceFormulas {
            mem_mb: Formula::flat(16000),
            ..ResourceFormulas::default()
        });
        let binding = WildcardBinding::new();
        let err = negotiator.negotiate(&spec, &ctx(&binding, 1, 0.0)).unwrap_err();
        assert!(matches!(err, JobFailure::BudgetUnsatisfiable { .. }));
    }

    #[test]
    fn test_negotiate_too_many_threads() {
        let negotiator = ResourceNegotiator::new(budget(8000, 2));
        let spec = ResourceSpec::Formulas(ResourceFormulas {
            threads: 8,
            ..ResourceFormulas::default()
        });
        let binding = WildcardBinding::new();
        assert!(negotiator.negotiate(&spec, &ctx(&binding, 1, 0.0)).is_err());
    }

    #[test]
    fn test_negotiate_clamps_escalation() {
        let negotiator = ResourceNegotiator::new(budget(10000, 4));
        let spec = ResourceSpec::Formulas(ResourceFormulas {
            mem_mb: Formula::per_attempt(4000),
            ..ResourceFormulas::default()
        });
        let binding = WildcardBinding::new();
        let third = negotiator.negotiate(&spec, &ctx(&binding, 3, 0.0)).unwrap();
        assert_eq!(third.mem_mb, 10000);
    }

    #[test]
    fn test_measure_inputs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 1024 * 1024]).unwrap();
        let mb = measure_inputs(dir.path(), &[PathBuf::from("a"), PathBuf::from("missing")]);
        assert!((mb - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_formula_yaml_forms() {
        let flat: Formula = serde_yaml::from_str("3000").unwrap();
        assert_eq!(flat, Formula::flat(3000));

        let full: Formula = serde_yaml::from_str("{base: 4000, backoff: linear}").unwrap();
        assert_eq!(full, Formula::per_attempt(4000));
    }
}
