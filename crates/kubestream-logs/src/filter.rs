use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;

use kubestream_types::{LogRecord, Payload};

use crate::error::ValidationError;

/// Outcome of running a record through the filter pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
    /// The record is the cursor: everything from here on was already delivered
    Boundary,
}

/// Compiled filter for log records
#[derive(Clone, Default)]
pub struct RecordFilter {
    /// Regex pattern (if any)
    regex: Option<Regex>,

    /// Original pattern string
    pattern: String,

    /// Level tags to include (`None` = all)
    levels: Option<HashSet<String>>,

    /// Reject plain text payloads
    structured_only: bool,

    /// Id of the oldest record the client already has
    cursor: Option<u32>,
}

impl RecordFilter {
    /// A filter that accepts every record
    pub fn new() -> Self {
        Self::default()
    }

    /// Match record content against `pattern`
    ///
    /// Smart case: an all-lowercase pattern matches case-insensitively.
    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, ValidationError> {
        self.regex = if pattern.is_empty() {
            None
        } else if pattern == pattern.to_lowercase() {
            Some(Regex::new(&format!("(?i){}", pattern))?)
        } else {
            Some(Regex::new(pattern)?)
        };
        self.pattern = pattern.to_string();
        Ok(self)
    }

    /// Only keep records whose level tag is in `levels`; an empty set keeps nothing
    pub fn with_levels<I, L>(mut self, levels: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.levels = Some(levels.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_structured_only(mut self, structured_only: bool) -> Self {
        self.structured_only = structured_only;
        self
    }

    pub fn with_cursor(mut self, cursor: Option<u32>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Run the full pipeline: structure, content, level, cursor
    pub fn evaluate(&self, record: &LogRecord) -> Verdict {
        if !self.passes_structure(record) || !self.matches_content(record) {
            return Verdict::Reject;
        }

        match self.cursor {
            Some(id) if record.id == id => Verdict::Boundary,
            _ => Verdict::Accept,
        }
    }

    /// Structured-only stage on its own
    pub fn passes_structure(&self, record: &LogRecord) -> bool {
        !self.structured_only || record.payload.is_structured()
    }

    /// Regex and level stages, as applied to live and backfilled records
    pub fn matches_content(&self, record: &LogRecord) -> bool {
        if let Some(re) = &self.regex {
            if !payload_matches(re, &record.payload) {
                return false;
            }
        }

        match &self.levels {
            Some(levels) => levels.contains(&record.level),
            None => true,
        }
    }

    /// Get the original pattern
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Check if filter has a text pattern
    pub fn has_pattern(&self) -> bool {
        self.regex.is_some()
    }

    pub fn cursor(&self) -> Option<u32> {
        self.cursor
    }
}

impl std::fmt::Debug for RecordFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordFilter")
            .field("pattern", &self.pattern)
            .field("levels", &self.levels)
            .field("structured_only", &self.structured_only)
            .field("cursor", &self.cursor)
            .finish()
    }
}

fn payload_matches(re: &Regex, payload: &Payload) -> bool {
    match payload {
        Payload::Text(line) => re.is_match(line),
        Payload::Structured(value) => value_matches(re, value),
    }
}

/// Search every leaf of a structured document
fn value_matches(re: &Regex, value: &Value) -> bool {
    match value {
        Value::String(s) => re.is_match(s),
        Value::Number(n) => re.is_match(&n.to_string()),
        Value::Bool(b) => re.is_match(if *b { "true" } else { "false" }),
        Value::Array(items) => items.iter().any(|v| value_matches(re, v)),
        Value::Object(fields) => fields.values().any(|v| value_matches(re, v)),
        Value::Null => false,
    }
}
