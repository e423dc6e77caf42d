use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::hash::{DefaultHasher, Hash, Hasher};

use kubestream_types::{LogLevel, LogRecord, Payload, SourceKey, StdStream};

/// Field names commonly holding the level of a structured line
const LEVEL_FIELDS: [&str; 8] = [
    "level",
    "lvl",
    "severity",
    "log.level",
    "loglevel",
    "log_level",
    "Level",
    "LEVEL",
];

/// Level keywords in precedence order, upper case
const LEVEL_WORDS: [(&str, LogLevel); 10] = [
    ("FATAL", LogLevel::Fatal),
    ("PANIC", LogLevel::Fatal),
    ("CRITICAL", LogLevel::Fatal),
    ("ERROR", LogLevel::Error),
    ("ERR", LogLevel::Error),
    ("WARNING", LogLevel::Warn),
    ("WARN", LogLevel::Warn),
    ("INFO", LogLevel::Info),
    ("DEBUG", LogLevel::Debug),
    ("TRACE", LogLevel::Trace),
];

/// Turns raw container log lines into records
pub struct LogParser;

impl LogParser {
    /// Parse a raw line as printed with a leading RFC 3339 timestamp
    ///
    /// Lines without a timestamp are stamped with the current time.
    pub fn parse(raw: &str, source: &SourceKey, stream: StdStream) -> LogRecord {
        let (timestamp, content) = Self::extract_timestamp(raw);
        let timestamp = timestamp.unwrap_or_else(Utc::now);

        let (payload, level) = match Self::try_parse_json(content) {
            Some(fields) => {
                let level = Self::level_from_json(&fields);
                (Payload::Structured(Value::Object(fields)), level)
            }
            None => (
                Payload::Text(content.to_string()),
                Self::level_from_text(content),
            ),
        };

        LogRecord {
            id: Self::record_id(&timestamp, content),
            timestamp,
            level: level.as_tag().to_string(),
            stream,
            payload,
            source_id: source.id.clone(),
            host: source.host.clone(),
        }
    }

    /// Stable id for a line: the same line fetched twice gets the same id
    fn record_id(timestamp: &DateTime<Utc>, content: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        timestamp.timestamp_nanos_opt().hash(&mut hasher);
        content.hash(&mut hasher);
        hasher.finish() as u32
    }

    /// Split a `2024-01-15T10:30:00.123456789Z` prefix off the line
    fn extract_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
        let (prefix, rest) = raw.split_once(' ').unwrap_or((raw, ""));
        match Self::parse_timestamp(prefix) {
            Some(ts) => (Some(ts), rest.trim_start()),
            None => (None, raw),
        }
    }

    fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
        // Shortest RFC 3339 form is 20 chars
        if s.len() < 20 || !s.as_bytes()[0].is_ascii_digit() {
            return None;
        }
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    fn try_parse_json(content: &str) -> Option<Map<String, Value>> {
        let trimmed = content.trim();
        if !trimmed.starts_with('{') {
            return None;
        }

        match serde_json::from_str(trimmed).ok()? {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    fn level_from_json(fields: &Map<String, Value>) -> LogLevel {
        for field in LEVEL_FIELDS {
            match fields.get(field) {
                Some(Value::String(s)) => return LogLevel::parse(s),
                // Numeric levels as used by pino and bunyan
                Some(Value::Number(n)) => {
                    if let Some(num) = n.as_u64() {
                        return match num {
                            0..=10 => LogLevel::Trace,
                            11..=20 => LogLevel::Debug,
                            21..=30 => LogLevel::Info,
                            31..=40 => LogLevel::Warn,
                            41..=50 => LogLevel::Error,
                            _ => LogLevel::Fatal,
                        };
                    }
                }
                _ => {}
            }
        }

        LogLevel::Unknown
    }

    /// Look for `[LEVEL]`, `LEVEL:`, ` LEVEL ` or a leading `LEVEL`
    fn level_from_text(content: &str) -> LogLevel {
        let upper = content.to_uppercase();

        for (word, level) in LEVEL_WORDS {
            if upper.contains(&format!("[{}]", word)) || upper.contains(&format!("{}:", word)) {
                return level;
            }
        }

        for (word, level) in LEVEL_WORDS {
            if upper.contains(&format!(" {} ", word)) {
                return level;
            }
        }

        let trimmed = upper.trim_start();
        LEVEL_WORDS
            .iter()
            .find(|(word, _)| trimmed.starts_with(word))
            .map(|(_, level)| *level)
            .unwrap_or(LogLevel::Unknown)
    }
}
