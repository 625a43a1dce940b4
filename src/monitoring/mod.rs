//! Run Monitoring Module
//!
//! Records when job attempts start and finish, for Gantt charts and the
//! timing section of run reports.

pub mod timeline;

pub use timeline::{AttemptSpan, EventType, ExecutionTimeline, TimelineEvent};
