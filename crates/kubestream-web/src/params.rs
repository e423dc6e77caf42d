//! Query string parsing shared by the log routes
//!
//! Flags are presence based: `?stdout&stderr` selects both streams whatever
//! their values. `levels` may repeat.

use chrono::{DateTime, Utc};

use kubestream_logs::{RangeQuery, RecordFilter, SessionOptions, StdSelector, ValidationError};

use crate::state::StreamSettings;

/// Raw query parameters of a log request
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pairs: Vec<(String, String)>,
}

impl LogQuery {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    fn has(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn selector(&self) -> StdSelector {
        let mut selector = StdSelector::NONE;
        if self.has("stdout") {
            selector = selector | StdSelector::STDOUT;
        }
        if self.has("stderr") {
            selector = selector | StdSelector::STDERR;
        }
        selector
    }

    /// Content, level and structured-only stages
    ///
    /// Levels are always explicit here: a request without `levels` keeps no
    /// records unless it asks for `everything`.
    pub fn record_filter(&self) -> Result<RecordFilter, ValidationError> {
        let mut filter = RecordFilter::new()
            .with_levels(self.all("levels"))
            .with_structured_only(self.has("jsonOnly"));

        if let Some(pattern) = self.get("filter").filter(|p| !p.is_empty()) {
            filter = filter.with_pattern(pattern)?;
        }
        Ok(filter)
    }

    /// Cursor of the previous page; 0 means there is none
    pub fn last_seen_id(&self) -> Result<Option<u32>, ValidationError> {
        let id = self
            .get("lastSeenId")
            .map(|raw| {
                raw.parse::<u32>()
                    .map_err(|_| ValidationError::InvalidCursor(raw.to_string()))
            })
            .transpose()?;
        Ok(id.filter(|id| *id != 0))
    }

    /// `minimum` within `0..=capacity`, 0 when absent
    pub fn minimum(&self, capacity: usize) -> Result<usize, ValidationError> {
        let Some(raw) = self.get("minimum") else {
            return Ok(0);
        };

        let out_of_range = || ValidationError::MinimumOutOfRange {
            value: raw.to_string(),
            max: capacity,
        };
        let value = raw.parse::<i64>().map_err(|_| out_of_range())?;
        usize::try_from(value)
            .ok()
            .filter(|v| *v <= capacity)
            .ok_or_else(out_of_range)
    }

    fn timestamp(&self, field: &'static str) -> Result<DateTime<Utc>, ValidationError> {
        let raw = self.get(field).unwrap_or_default();
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| ValidationError::InvalidTimestamp {
                field,
                value: raw.to_string(),
            })
    }

    /// Build a historical query; selector and bounds are validated up front
    pub fn range_query(&self, capacity: usize) -> Result<RangeQuery, ValidationError> {
        let selector = self.selector();
        if selector.is_empty() {
            return Err(ValidationError::SelectorRequired);
        }

        let everything = self.has("everything");
        let (from, to) = if everything {
            // Replaced by the source's lifetime
            let now = Utc::now();
            (now, now)
        } else {
            (self.timestamp("from")?, self.timestamp("to")?)
        };

        let mut query = RangeQuery::new(from, to, selector);
        query.minimum = self.minimum(capacity)?;
        query.filter = self.record_filter()?.with_cursor(self.last_seen_id()?);
        query.everything = everything;
        Ok(query)
    }

    /// Options of a live session
    pub fn session_options(
        &self,
        settings: &StreamSettings,
    ) -> Result<SessionOptions, ValidationError> {
        let selector = self.selector();
        if selector.is_empty() {
            return Err(ValidationError::SelectorRequired);
        }

        Ok(SessionOptions::new(selector)
            .with_filter(self.record_filter()?)
            .with_heartbeat(settings.heartbeat)
            .with_backfill(settings.backfill))
    }
}
