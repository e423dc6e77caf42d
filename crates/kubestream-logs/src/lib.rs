//! Log delivery engine for kubestream
//!
//! This crate provides record filtering, historical range search, backfill,
//! and the live session multiplexer. Backends plug in through the
//! [`LogSource`] and [`MembershipTracker`] traits.

mod backfill;
mod buffer;
mod error;
mod filter;
pub mod memory;
mod multiplex;
mod parser;
mod range;
mod source;
mod stream;
mod widen;

pub use backfill::{BackfillOptions, MIN_BACKFILL_WINDOW, run_backfill};
pub use buffer::RingBuffer;
pub use error::{SearchError, SourceError, ValidationError};
pub use filter::{RecordFilter, Verdict};
pub use multiplex::{
    DEFAULT_HEARTBEAT, LiveMultiplexer, SessionEvent, SessionOptions, SessionSummary,
};
pub use parser::LogParser;
pub use range::{
    CURSOR_MARGIN_MS, DEFAULT_BUFFER_CAPACITY, MIN_STEP_SECS, RangeQuery, RangeResult,
    RangeSearcher,
};
pub use source::{LogSource, MembershipTracker, TailExit, deliver};
pub use stream::{LogStreamManager, TailOutcome};
pub use widen::{BackwardWindow, WindowProbe, Widening, widen_backward};

// Re-export types used in our public API
pub use kubestream_types::{
    LogLevel, LogRecord, Payload, SearchCursor, SourceDescriptor, SourceEvent, SourceEventKind,
    SourceKey, SourcePredicate, SourceState, StdSelector, StdStream,
};
