//! Shared types for kubestream
//!
//! This crate contains data structures used across multiple kubestream crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::BitOr;

/// Label carrying the service name of a source
pub const SERVICE_LABEL: &str = "app.kubernetes.io/name";

/// Label carrying the stack (application) a source belongs to
pub const STACK_LABEL: &str = "app.kubernetes.io/part-of";

/// Label carrying an explicit display group
pub const GROUP_LABEL: &str = "kubestream.io/group";

// ============================================================================
// Source Types
// ============================================================================

/// Identity of a source: ids are only unique within a host
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey {
    pub host: String,
    pub id: String,
}

impl SourceKey {
    pub fn new(host: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host, self.id)
    }
}

/// Lifecycle state of a source
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Pending,
    Running,
    Stopped,
    Failed,
    #[default]
    Unknown,
}

impl From<&str> for SourceState {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pending" | "created" => Self::Pending,
            "running" => Self::Running,
            "succeeded" | "stopped" | "exited" => Self::Stopped,
            "failed" | "dead" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// A log producing unit as reported by discovery
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub host: String,
    pub name: String,
    pub state: SourceState,
    pub created: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub group: Option<String>,
    pub labels: HashMap<String, String>,
}

impl SourceDescriptor {
    /// Create a running descriptor created and started at `created`
    pub fn new(host: impl Into<String>, id: impl Into<String>, created: DateTime<Utc>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            host: host.into(),
            state: SourceState::Running,
            created,
            started_at: created,
            group: None,
            labels: HashMap::new(),
        }
    }

    pub fn key(&self) -> SourceKey {
        SourceKey::new(self.host.clone(), self.id.clone())
    }

    pub fn is_running(&self) -> bool {
        self.state == SourceState::Running
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Selects which sources feed a live session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourcePredicate {
    /// A single source on a host
    Id(SourceKey),
    /// Several sources on the same host
    Ids { host: String, ids: HashSet<String> },
    /// Running sources carrying the service label
    Service(String),
    /// Running sources in a display group
    Group(String),
    /// Running sources carrying the stack label
    Stack(String),
}

impl SourcePredicate {
    pub fn matches(&self, source: &SourceDescriptor) -> bool {
        match self {
            Self::Id(key) => source.id == key.id && source.host == key.host,
            Self::Ids { host, ids } => ids.contains(&source.id) && &source.host == host,
            Self::Service(service) => {
                source.is_running() && source.label(SERVICE_LABEL) == Some(service.as_str())
            }
            Self::Group(group) => source.is_running() && source.group.as_ref() == Some(group),
            Self::Stack(stack) => {
                source.is_running() && source.label(STACK_LABEL) == Some(stack.as_str())
            }
        }
    }
}

/// Source lifecycle change pushed to live sessions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceEventKind {
    SourceStarted,
    SourceStopped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub name: SourceEventKind,
    pub source: String,
    pub host: String,
}

impl SourceEvent {
    pub fn started(key: &SourceKey) -> Self {
        Self {
            name: SourceEventKind::SourceStarted,
            source: key.id.clone(),
            host: key.host.clone(),
        }
    }

    pub fn stopped(key: &SourceKey) -> Self {
        Self {
            name: SourceEventKind::SourceStopped,
            source: key.id.clone(),
            host: key.host.clone(),
        }
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// Output stream a record was written to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    #[default]
    Stdout,
    Stderr,
}

/// Bitmask of output streams requested by a client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct StdSelector(u8);

impl StdSelector {
    pub const NONE: Self = Self(0);
    pub const STDOUT: Self = Self(1);
    pub const STDERR: Self = Self(2);
    pub const ALL: Self = Self(3);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn includes(&self, stream: StdStream) -> bool {
        let bit = match stream {
            StdStream::Stdout => Self::STDOUT.0,
            StdStream::Stderr => Self::STDERR.0,
        };
        self.0 & bit != 0
    }
}

impl BitOr for StdSelector {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    #[default]
    Unknown,
}

impl LogLevel {
    /// Parse log level from common spellings
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" | "trc" | "trce" => Self::Trace,
            "debug" | "dbg" | "debg" => Self::Debug,
            "info" | "inf" | "information" => Self::Info,
            "warn" | "warning" | "wrn" => Self::Warn,
            "error" | "err" | "erro" => Self::Error,
            "fatal" | "panic" | "critical" | "crit" | "ftl" => Self::Fatal,
            _ => Self::Unknown,
        }
    }

    /// Wire tag carried by records and used by level filters
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
            Self::Unknown => "unknown",
        }
    }
}

/// Record payload: raw line or parsed document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Structured(serde_json::Value),
}

impl Payload {
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Structured(_))
    }
}

/// A single log record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Identifier, unique within the owning source
    pub id: u32,

    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// Severity tag, see [`LogLevel::as_tag`]
    pub level: String,

    pub stream: StdStream,

    #[serde(rename = "message")]
    pub payload: Payload,

    #[serde(rename = "source")]
    pub source_id: String,

    pub host: String,
}

impl LogRecord {
    /// Create a plain text stdout record
    pub fn text(
        source: &SourceKey,
        id: u32,
        timestamp: DateTime<Utc>,
        level: &str,
        line: impl Into<String>,
    ) -> Self {
        Self {
            id,
            timestamp,
            level: level.to_string(),
            stream: StdStream::Stdout,
            payload: Payload::Text(line.into()),
            source_id: source.id.clone(),
            host: source.host.clone(),
        }
    }

    pub fn source_key(&self) -> SourceKey {
        SourceKey::new(self.host.clone(), self.source_id.clone())
    }
}

// ============================================================================
// Search Types
// ============================================================================

/// Resume point for paging backwards through history
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchCursor {
    /// Oldest record already delivered to the client
    pub last_seen_id: Option<u32>,

    /// Window covered by the search that produced this cursor
    pub scanned_from: Option<DateTime<Utc>>,
    pub scanned_to: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor::new("default", "web-1", Utc.timestamp_opt(0, 0).unwrap())
    }

    #[test]
    fn test_selector_bits() {
        let both = StdSelector::STDOUT | StdSelector::STDERR;
        assert_eq!(both, StdSelector::ALL);
        assert!(both.includes(StdStream::Stderr));
        assert!(!StdSelector::STDOUT.includes(StdStream::Stderr));
        assert!(StdSelector::NONE.is_empty());
    }

    #[test]
    fn test_predicate_id_requires_host() {
        let source = descriptor();
        assert!(SourcePredicate::Id(SourceKey::new("default", "web-1")).matches(&source));
        assert!(!SourcePredicate::Id(SourceKey::new("other", "web-1")).matches(&source));
    }

    #[test]
    fn test_label_predicates_require_running() {
        let mut source = descriptor()
            .with_label(SERVICE_LABEL, "web")
            .with_label(STACK_LABEL, "shop");
        source.group = Some("frontend".to_string());

        assert!(SourcePredicate::Service("web".into()).matches(&source));
        assert!(SourcePredicate::Stack("shop".into()).matches(&source));
        assert!(SourcePredicate::Group("frontend".into()).matches(&source));

        source.state = SourceState::Stopped;
        assert!(!SourcePredicate::Service("web".into()).matches(&source));
        assert!(!SourcePredicate::Group("frontend".into()).matches(&source));
    }

    #[test]
    fn test_record_serializes_payload_untagged() {
        let key = SourceKey::new("default", "web-1");
        let mut record = LogRecord::text(&key, 7, Utc.timestamp_opt(1, 5).unwrap(), "info", "hi");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["message"], "hi");
        assert_eq!(json["source"], "web-1");
        assert_eq!(json["stream"], "stdout");

        record.payload = Payload::Structured(serde_json::json!({"msg": "hi"}));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["message"]["msg"], "hi");
    }

    #[test]
    fn test_event_tag() {
        let event = SourceEvent::started(&SourceKey::new("default", "web-1"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "source-started");
    }
}
