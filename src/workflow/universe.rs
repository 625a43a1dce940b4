//! Sample Universe
//!
//! The read-only mapping of sample → ordered runs that drives fan-out
//! (one job per run) and fan-in (one input per enumerated child).
//!
//! Rows arrive already tabular (one row per run) and are checked against a
//! [`SampleSchema`] before any graph construction happens.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::UniverseError;

use super::wildcards::{is_valid_value, WildcardBinding, RUN_WILDCARD, SAMPLE_WILDCARD};

/// One run of a sample with its file references (e.g. `fq1`, `fq2`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run: String,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

/// A sample and its runs, in sheet order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEntry {
    pub sample: String,
    pub runs: Vec<RunRecord>,
}

/// Columns a sample sheet must provide for every row.
///
/// `sample` and `run` are always required; `required_files` lists the
/// per-run file columns that must also be present and non-null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSchema {
    #[serde(default)]
    pub required_files: Vec<String>,
}

impl SampleSchema {
    pub fn new(required_files: &[&str]) -> Self {
        Self {
            required_files: required_files.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// The fixed set of samples and runs for one pipeline invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SampleUniverse {
    samples: Vec<SampleEntry>,
}

impl SampleUniverse {
    /// Creates an empty universe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a run without file references. Samples keep first-seen order.
    ///
    /// # Example
    ///
    /// ```
    /// use rulerunner::workflow::SampleUniverse;
    ///
    /// let universe = SampleUniverse::new()
    ///     .with_run("S1", "R1")
    ///     .unwrap()
    ///     .with_run("S1", "R2")
    ///     .unwrap();
    /// assert_eq!(universe.runs("S1").unwrap().len(), 2);
    /// ```
    pub fn with_run(mut self, sample: &str, run: &str) -> Result<Self, UniverseError> {
        self.add_run(sample, RunRecord {
            run: run.to_string(),
            files: BTreeMap::new(),
        })?;
        Ok(self)
    }

    /// Adds a run record to a sample, creating the sample if needed.
    pub fn add_run(&mut self, sample: &str, record: RunRecord) -> Result<(), UniverseError> {
        let position = self.samples.iter().position(|s| s.sample == sample);
        let entry = match position {
            Some(index) => &mut self.samples[index],
            None => {
                self.samples.push(SampleEntry {
                    sample: sample.to_string(),
                    runs: Vec::new(),
                });
                let last = self.samples.len() - 1;
                &mut self.samples[last]
            }
        };

        if entry.runs.iter().any(|r| r.run == record.run) {
            return Err(UniverseError::DuplicateRun {
                sample: sample.to_string(),
                run: record.run,
            });
        }
        entry.runs.push(record);
        Ok(())
    }

    /// Builds a universe from sample sheet rows, validating each against the schema.
    pub fn from_rows(
        rows: &[BTreeMap<String, Value>],
        schema: &SampleSchema,
    ) -> Result<Self, UniverseError> {
        let mut universe = Self::new();

        for (index, row) in rows.iter().enumerate() {
            let row_number = index + 1;
            let sample = required_scalar(row, SAMPLE_WILDCARD, row_number)?;
            let run = required_scalar(row, RUN_WILDCARD, row_number)?;

            for id in [&sample, &run] {
                if !is_valid_value(id) {
                    return Err(UniverseError::InvalidIdentifier {
                        row: row_number,
                        value: id.clone(),
                    });
                }
            }

            for column in &schema.required_files {
                required_scalar(row, column, row_number)?;
            }

            let mut files = BTreeMap::new();
            for (column, value) in row {
                if column == SAMPLE_WILDCARD || column == RUN_WILDCARD {
                    continue;
                }
                if let Some(text) = scalar_text(value) {
                    files.insert(column.clone(), text);
                } else if !value.is_null() {
                    return Err(UniverseError::NonScalar {
                        row: row_number,
                        column: column.clone(),
                    });
                }
            }

            debug!("Sample sheet row {}: {}/{}", row_number, sample, run);
            universe.add_run(&sample, RunRecord { run, files })?;
        }

        info!(
            "Sample universe: {} samples, {} runs",
            universe.samples.len(),
            universe.run_count()
        );
        Ok(universe)
    }

    /// Returns every sample in sheet order.
    pub fn samples(&self) -> impl Iterator<Item = &SampleEntry> {
        self.samples.iter()
    }

    /// Returns the runs of one sample.
    pub fn runs(&self, sample: &str) -> Option<&[RunRecord]> {
        self.samples
            .iter()
            .find(|s| s.sample == sample)
            .map(|s| s.runs.as_slice())
    }

    /// Looks up a per-run file reference.
    pub fn run_file(&self, sample: &str, run: &str, column: &str) -> Result<&str, UniverseError> {
        let runs = self
            .runs(sample)
            .ok_or_else(|| UniverseError::UnknownSample(sample.to_string()))?;
        let record = runs
            .iter()
            .find(|r| r.run == run)
            .ok_or_else(|| UniverseError::UnknownRun {
                sample: sample.to_string(),
                run: run.to_string(),
            })?;
        record
            .files
            .get(column)
            .map(String::as_str)
            .ok_or_else(|| UniverseError::MissingFile {
                sample: sample.to_string(),
                run: run.to_string(),
                column: column.to_string(),
            })
    }

    /// Bindings `{sample}` for every sample.
    pub fn sample_bindings(&self) -> Vec<WildcardBinding> {
        self.samples
            .iter()
            .map(|s| WildcardBinding::new().with(SAMPLE_WILDCARD, s.sample.as_str()))
            .collect()
    }

    /// Bindings `{sample, run}` for every run of one sample.
    pub fn run_bindings_of(&self, sample: &str) -> Result<Vec<WildcardBinding>, UniverseError> {
        let runs = self
            .runs(sample)
            .ok_or_else(|| UniverseError::UnknownSample(sample.to_string()))?;
        Ok(runs
            .iter()
            .map(|r| {
                WildcardBinding::new()
                    .with(SAMPLE_WILDCARD, sample)
                    .with(RUN_WILDCARD, r.run.as_str())
            })
            .collect())
    }

    /// Bindings `{sample, run}` for every run in the universe.
    pub fn all_run_bindings(&self) -> Vec<WildcardBinding> {
        self.samples
            .iter()
            .flat_map(|s| {
                s.runs.iter().map(move |r| {
                    WildcardBinding::new()
                        .with(SAMPLE_WILDCARD, s.sample.as_str())
                        .with(RUN_WILDCARD, r.run.as_str())
                })
            })
            .collect()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn run_count(&self) -> usize {
        self.samples.iter().map(|s| s.runs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn required_scalar(
    row: &BTreeMap<String, Value>,
    column: &str,
    row_number: usize,
) -> Result<String, UniverseError> {
    let value = row.get(column).filter(|v| !v.is_null()).ok_or_else(|| {
        UniverseError::MissingColumn {
            row: row_number,
            column: column.to_string(),
        }
    })?;

    let text = scalar_text(value).ok_or_else(|| UniverseError::NonScalar {
        row: row_number,
        column: column.to_string(),
    })?;

    if text.trim().is_empty() {
        return Err(UniverseError::MissingColumn {
            row: row_number,
            column: column.to_string(),
        });
    }
    Ok(text.trim().to_string())
}
