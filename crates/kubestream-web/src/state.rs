//! Shared handler state.

use std::sync::Arc;
use std::time::Duration;

use kubestream_logs::{BackfillOptions, DEFAULT_BUFFER_CAPACITY, DEFAULT_HEARTBEAT};

/// Tuning shared by every request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSettings {
    /// Interval between heartbeats of live sessions
    pub heartbeat: Duration,

    /// Backfill of filtered live sessions
    pub backfill: BackfillOptions,

    /// Records a range query keeps; also the largest accepted `minimum`
    pub buffer_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            backfill: BackfillOptions::default(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// State handed to every handler
pub struct AppState<S> {
    pub sources: Arc<S>,
    pub settings: StreamSettings,
}

impl<S> AppState<S> {
    pub fn new(sources: Arc<S>, settings: StreamSettings) -> Self {
        Self { sources, settings }
    }
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            sources: Arc::clone(&self.sources),
            settings: self.settings,
        }
    }
}
