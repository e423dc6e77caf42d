use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::error;

use kubestream_types::{LogRecord, SourceDescriptor, SourceKey, StdSelector};

use crate::error::SourceError;
use crate::source::{LogSource, TailExit};

/// How a tail task finished
#[derive(Debug)]
pub struct TailOutcome {
    pub key: SourceKey,
    pub exit: Result<TailExit, SourceError>,
}

/// Manages live tails of many sources, one task per source
pub struct LogStreamManager<S> {
    source: Arc<S>,

    selector: StdSelector,

    /// Where every tail pushes its records
    live_tx: mpsc::Sender<LogRecord>,

    /// Parent of every tail's token
    cancel: CancellationToken,

    /// Tails never start before this instant
    since_floor: Option<DateTime<Utc>>,

    tasks: JoinSet<TailOutcome>,

    /// Sources currently followed
    active: HashMap<SourceKey, AbortHandle>,

    /// Source of each running task, to report tasks that panicked
    keys: HashMap<Id, SourceKey>,
}

impl<S: LogSource> LogStreamManager<S> {
    pub fn new(
        source: Arc<S>,
        selector: StdSelector,
        live_tx: mpsc::Sender<LogRecord>,
        cancel: CancellationToken,
        since_floor: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            source,
            selector,
            live_tx,
            cancel,
            since_floor,
            tasks: JoinSet::new(),
            active: HashMap::new(),
            keys: HashMap::new(),
        }
    }

    /// Start following a source; false if it is already followed
    pub fn start(&mut self, descriptor: SourceDescriptor) -> bool {
        let key = descriptor.key();
        if self.active.contains_key(&key) {
            return false;
        }

        let since = match self.since_floor {
            Some(floor) => floor.max(descriptor.started_at),
            None => descriptor.started_at,
        };
        let source = Arc::clone(&self.source);
        let selector = self.selector;
        let tx = self.live_tx.clone();
        let cancel = self.cancel.child_token();

        let handle = self.tasks.spawn(async move {
            let exit = source.tail(&descriptor, since, selector, tx, cancel).await;
            TailOutcome {
                key: descriptor.key(),
                exit,
            }
        });
        self.keys.insert(handle.id(), key.clone());
        self.active.insert(key, handle);
        true
    }

    /// Wait for the next tail to finish; `None` when nothing is running
    ///
    /// A tail that panicked is reported as a tail error of its source.
    pub async fn next_finished(&mut self) -> Option<TailOutcome> {
        loop {
            let (id, outcome) = match self.tasks.join_next_with_id().await? {
                Ok(finished) => finished,
                Err(err) => {
                    let id = err.id();
                    let Some(key) = self.keys.get(&id).cloned() else {
                        continue;
                    };
                    if err.is_panic() {
                        error!(source = %key, error = %err, "tail task panicked");
                    }
                    let exit = Err(SourceError::tail(&key, err));
                    (id, TailOutcome { key, exit })
                }
            };
            self.keys.remove(&id);
            self.active.remove(&outcome.key);
            return Some(outcome);
        }
    }

    pub fn is_following(&self, key: &SourceKey) -> bool {
        self.active.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Get the number of active tails
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Cancel every tail and wait for them to wind down
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.tasks.shutdown().await;
        self.active.clear();
        self.keys.clear();
    }
}

impl<S> Drop for LogStreamManager<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
