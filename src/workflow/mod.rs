//! Workflow Definition Module
//!
//! Provides the data structures that describe a pipeline and the resolution
//! of requested target files into a job graph.
//!
//! # Structure
//!
//! - [`wildcards`]: Path patterns with `{name}` placeholders and bindings
//! - [`universe`]: The sample and run set of one invocation
//! - [`model`]: Rule templates and their input declarations
//! - [`validator`]: Consistency checks on template sets
//! - [`registry`]: Immutable template set with a compiled output matcher
//! - [`parser`]: YAML pipeline loading
//! - [`graph`]: Backward chaining from targets to a job graph
//! - [`resources`]: Per-attempt resource negotiation

pub mod graph;
pub mod model;
pub mod parser;
pub mod registry;
pub mod resources;
pub mod universe;
pub mod validator;
pub mod wildcards;

pub use graph::{GraphBuilder, Job, JobGraph, JobId, JobState, Target};
pub use model::{Condition, FanInScope, InputDecl, InputSpec, RuleTemplate};
pub use parser::{load_pipeline, parse_pipeline, Pipeline};
pub use registry::TemplateRegistry;
pub use resources::{
    Backoff, Formula, ResourceFormulas, ResourceNegotiator, ResourceRequest, ResourceSpec,
};
pub use universe::{SampleSchema, SampleUniverse};
pub use wildcards::{Pattern, WildcardBinding};
