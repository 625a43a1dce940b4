//! Execution Timeline
//!
//! Tracks job attempt start/end times for run reports and Gantt charts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Attempt dispatched to an executor
    Started,
    /// Attempt succeeded
    Completed,
    /// Attempt failed
    Failed,
    /// Job dropped before running
    Cancelled,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Job label
    pub job: String,
    pub attempt: u32,
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: Instant,
    /// Wall-clock time, for reports
    pub wall_time: DateTime<Local>,
}

/// Start and end of one attempt, relative to the timeline start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSpan {
    pub job: String,
    pub attempt: u32,
    pub start: Duration,
    pub end: Duration,
    pub outcome: EventType,
}

/// Tracks the execution timeline of a run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
    started_at: DateTime<Local>,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
            started_at: Local::now(),
        }
    }

    /// Records an event for one attempt of a job.
    pub fn add_event(&mut self, job: impl Into<String>, attempt: u32, event_type: EventType) {
        self.events.push(TimelineEvent {
            job: job.into(),
            attempt,
            event_type,
            timestamp: Instant::now(),
            wall_time: Local::now(),
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Wall-clock time the timeline was created.
    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Pairs start and end events into spans, ordered by start time.
    pub fn spans(&self) -> Vec<AttemptSpan> {
        let mut starts: HashMap<(&str, u32), Duration> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time);
            let key = (event.job.as_str(), event.attempt);
            match event.event_type {
                EventType::Started => {
                    starts.insert(key, offset);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.remove(&key) {
                        spans.push(AttemptSpan {
                            job: event.job.clone(),
                            attempt: event.attempt,
                            start,
                            end: offset,
                            outcome: event.event_type,
                        });
                    }
                }
                EventType::Cancelled => {}
            }
        }

        spans.sort_by_key(|s| s.start);
        spans
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each attempt is a bar; failed attempts are drawn with `x`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for span in self.spans() {
            let start = span.start.as_millis();
            let end = span.end.as_millis();
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end.saturating_sub(start)) as f64 * scale).max(1.0) as usize;

            let mark = if span.outcome == EventType::Failed { "x" } else { "#" };
            let mut bar = " ".repeat(start_pos);
            bar.push_str(&mark.repeat(width));

            let name = if span.attempt > 1 {
                format!("{} #{}", span.job, span.attempt)
            } else {
                span.job.clone()
            };
            output.push_str(&format!(
                "{} |{}| ({} ms)\n",
                truncate(&name, 24),
                bar,
                end.saturating_sub(start)
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns total run time per job in milliseconds, summed over attempts.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        let mut durations: HashMap<String, u128> = HashMap::new();
        for span in self.spans() {
            *durations.entry(span.job).or_insert(0) += span.end.saturating_sub(span.start).as_millis();
        }
        durations
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a string to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
