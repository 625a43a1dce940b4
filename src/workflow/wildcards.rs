//! Wildcard Patterns and Bindings
//!
//! A pattern such as `mapped/{sample}/{run}.bam` is compiled once into a
//! sequence of literal and placeholder segments. Compiled patterns can:
//!
//! - match a concrete path and recover the [`WildcardBinding`]
//! - render a concrete path from a binding
//!
//! Placeholder values are non-empty and never contain `/`, so a placeholder
//! always stays within one path component.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PatternError;

/// Wildcard name bound to a sample identifier.
pub const SAMPLE_WILDCARD: &str = "sample";

/// Wildcard name bound to a run identifier.
pub const RUN_WILDCARD: &str = "run";

/// Concrete values for the placeholders of one job.
///
/// Two bindings are equal iff every placeholder value matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WildcardBinding(BTreeMap<String, String>);

impl WildcardBinding {
    /// Creates an empty binding.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Returns a copy of this binding with one more value set.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Sets a value, replacing any previous one.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Gets the value bound to `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns a filesystem-safe rendering with keys in sorted order, e.g.
    /// `run-R1_sample-S1`.
    pub fn slug(&self) -> String {
        if self.0.is_empty() {
            return "all".to_string();
        }
        self.0
            .iter()
            .map(|(k, v)| format!("{}-{}", k, v))
            .collect::<Vec<_>>()
            .join("_")
    }
}

impl fmt::Display for WildcardBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// One compiled piece of a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A compiled file-path pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Compiles a pattern string.
    ///
    /// # Example
    ///
    /// ```
    /// use rulerunner::workflow::wildcards::Pattern;
    ///
    /// let pattern = Pattern::parse("reads/{sample}.fastq").unwrap();
    /// assert_eq!(pattern.wildcard_names(), vec!["sample"]);
    /// ```
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars();

        while let Some(ch) = chars.next() {
            match ch {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        if inner == '{' {
                            return Err(PatternError::Unbalanced {
                                pattern: raw.to_string(),
                            });
                        }
                        name.push(inner);
                    }
                    if !closed {
                        return Err(PatternError::Unbalanced {
                            pattern: raw.to_string(),
                        });
                    }
                    let name = name.trim().to_string();
                    if name.is_empty() {
                        return Err(PatternError::EmptyPlaceholder {
                            pattern: raw.to_string(),
                        });
                    }
                    if literal.is_empty() && matches!(segments.last(), Some(Segment::Placeholder(_))) {
                        return Err(PatternError::AdjacentPlaceholders {
                            pattern: raw.to_string(),
                        });
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name));
                }
                '}' => {
                    return Err(PatternError::Unbalanced {
                        pattern: raw.to_string(),
                    })
                }
                _ => literal.push(ch),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Returns the pattern text as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns true if the pattern contains at least one placeholder.
    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Placeholder(_)))
    }

    /// Returns the distinct placeholder names in order of first appearance.
    pub fn wildcard_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Placeholder(name) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Returns the literal text before the first placeholder.
    ///
    /// Used as the index key for output matching.
    pub fn literal_prefix(&self) -> &str {
        match self.segments.first() {
            Some(Segment::Literal(text)) => text,
            _ => "",
        }
    }

    /// Renders a concrete path by substituting every placeholder.
    ///
    /// Extra values in the binding are ignored.
    pub fn render(&self, binding: &WildcardBinding) -> Result<String, PatternError> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = binding.get(name).ok_or_else(|| PatternError::MissingWildcard {
                        pattern: self.raw.clone(),
                        name: name.clone(),
                    })?;
                    if !is_valid_value(value) {
                        return Err(PatternError::InvalidValue {
                            name: name.clone(),
                            value: value.to_string(),
                        });
                    }
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }

    /// Matches a concrete path against this pattern.
    ///
    /// Returns the binding of every placeholder on success. A placeholder
    /// that appears more than once must bind the same value each time.
    pub fn matches(&self, path: &str) -> Option<WildcardBinding> {
        let mut binding = WildcardBinding::new();
        if match_segments(&self.segments, path, &mut binding) {
            Some(binding)
        } else {
            None
        }
    }
}

impl TryFrom<String> for Pattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.raw
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Returns true if `value` may be bound to a placeholder.
pub fn is_valid_value(value: &str) -> bool {
    !value.is_empty() && !value.contains('/')
}

fn match_segments(segments: &[Segment], rest: &str, binding: &mut WildcardBinding) -> bool {
    let Some((first, tail)) = segments.split_first() else {
        return rest.is_empty();
    };

    match first {
        Segment::Literal(text) => match rest.strip_prefix(text.as_str()) {
            Some(remaining) => match_segments(tail, remaining, binding),
            None => false,
        },
        Segment::Placeholder(name) => {
            if let Some(bound) = binding.get(name).map(str::to_string) {
                return match rest.strip_prefix(bound.as_str()) {
                    Some(remaining) if !bound.is_empty() => match_segments(tail, remaining, binding),
                    _ => false,
                };
            }

            // Candidate values stop at the first '/'.
            let limit = rest.find('/').unwrap_or(rest.len());
            for end in (1..=limit).filter(|end| rest.is_char_boundary(*end)) {
                binding.insert(name.clone(), &rest[..end]);
                if match_segments(tail, &rest[end..], binding) {
                    return true;
                }
            }
            binding.0.remove(name);
            false
        }
    }
}
